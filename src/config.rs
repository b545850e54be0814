//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `MAESTRO__*` 覆盖（双下划线表示嵌套，如 `MAESTRO__ORCHESTRATOR__MAX_REPLANS=5`）。

use std::path::PathBuf;

use serde::Deserialize;

use crate::execution::classifier::KeywordTables;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub transport: TransportSection,
    #[serde(default)]
    pub boundaries: BoundariesSection,
    #[serde(default)]
    pub loop_guard: LoopGuardSection,
    #[serde(default)]
    pub classifier: ClassifierSection,
}

/// [orchestrator] 段：尝试上限、重新规划、超时
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorSection {
    /// 单步尝试硬上限，到达即强制完成
    #[serde(default = "default_max_attempts_per_step")]
    pub max_attempts_per_step: u32,
    #[serde(default = "default_max_replans")]
    pub max_replans: u32,
    /// 连续多少个步骤被强制完成后自动请求重新规划；0 表示关闭
    #[serde(default)]
    pub replan_after_forced_steps: u32,
    /// 同一次派发收到的过期回复上限，超出后按空回复处理
    #[serde(default = "default_max_stale_responses")]
    pub max_stale_responses: u32,
    #[serde(default = "default_agent_timeout_secs")]
    pub agent_timeout_secs: u64,
    #[serde(default = "default_planner_timeout_secs")]
    pub planner_timeout_secs: u64,
}

fn default_max_attempts_per_step() -> u32 {
    10
}

fn default_max_replans() -> u32 {
    3
}

fn default_max_stale_responses() -> u32 {
    3
}

fn default_agent_timeout_secs() -> u64 {
    300
}

fn default_planner_timeout_secs() -> u64 {
    120
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_attempts_per_step: default_max_attempts_per_step(),
            max_replans: default_max_replans(),
            replan_after_forced_steps: 0,
            max_stale_responses: default_max_stale_responses(),
            agent_timeout_secs: default_agent_timeout_secs(),
            planner_timeout_secs: default_planner_timeout_secs(),
        }
    }
}

/// [transport] 段：与智能体 / 规划器通信失败时的重试退避
#[derive(Debug, Clone, Deserialize)]
pub struct TransportSection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    8000
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// [boundaries] 段：每步动作数 / 时间上限，按步骤标题关键词收紧
#[derive(Debug, Clone, Deserialize)]
pub struct BoundariesSection {
    #[serde(default = "default_max_actions")]
    pub default_max_actions: u32,
    #[serde(default = "default_time_limit_secs")]
    pub default_time_limit_secs: u64,
    /// 按顺序匹配，第一个命中的档位生效
    #[serde(default = "default_profiles")]
    pub profiles: Vec<BoundaryProfile>,
}

/// 步骤类型档位：标题包含任一关键词即采用该档位的上限
#[derive(Debug, Clone, Deserialize)]
pub struct BoundaryProfile {
    pub name: String,
    pub keywords: Vec<String>,
    pub max_actions: u32,
    pub time_limit_secs: u64,
}

fn default_max_actions() -> u32 {
    5
}

fn default_time_limit_secs() -> u64 {
    300
}

fn profile(name: &str, keywords: &[&str], max_actions: u32, time_limit_secs: u64) -> BoundaryProfile {
    BoundaryProfile {
        name: name.to_string(),
        keywords: keywords.iter().map(|k| k.to_string()).collect(),
        max_actions,
        time_limit_secs,
    }
}

fn default_profiles() -> Vec<BoundaryProfile> {
    vec![
        profile("browse", &["访问", "浏览", "browse", "visit", "find"], 4, 180),
        profile("read", &["阅读", "read", "information"], 3, 120),
        profile("generate", &["生成", "generate", "image"], 1, 60),
        profile("create", &["创建", "create", "write"], 2, 180),
    ]
}

impl Default for BoundariesSection {
    fn default() -> Self {
        Self {
            default_max_actions: default_max_actions(),
            default_time_limit_secs: default_time_limit_secs(),
            profiles: default_profiles(),
        }
    }
}

/// [loop_guard] 段：重复访问 / 连续重复 / 往返循环阈值
#[derive(Debug, Clone, Deserialize)]
pub struct LoopGuardSection {
    /// 同一目标在一个步骤内访问超过该次数即阻断
    #[serde(default = "default_max_target_visits")]
    pub max_target_visits: u32,
    /// 与最近 N 个动作完全相同即阻断
    #[serde(default = "default_max_consecutive_repeats")]
    pub max_consecutive_repeats: u32,
    /// A/B 往返出现的轮数
    #[serde(default = "default_alternating_cycle_repeats")]
    pub alternating_cycle_repeats: u32,
    /// 利用率达到该比例时给出 warn
    #[serde(default = "default_warn_utilization")]
    pub warn_utilization: f64,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// 重复回复文本的正则
    #[serde(default = "default_repetitive_text_patterns")]
    pub repetitive_text_patterns: Vec<String>,
}

fn default_max_target_visits() -> u32 {
    2
}

fn default_max_consecutive_repeats() -> u32 {
    2
}

fn default_alternating_cycle_repeats() -> u32 {
    3
}

fn default_warn_utilization() -> f64 {
    0.8
}

fn default_history_limit() -> usize {
    50
}

fn default_repetitive_text_patterns() -> Vec<String> {
    vec![
        r"(?is)click(?:ed)?\s+.*了解更多.*click(?:ed)?\s+.*了解更多".into(),
        r"(?is)(点击了?\s*.{0,20}了解更多).*点击了?\s*.{0,20}了解更多".into(),
        r"(?is)hover(?:ed)?\s+over\s+.*hover(?:ed)?\s+over\s+".into(),
        r"(?is)(?:same|identical)\s+page\s+again".into(),
    ]
}

impl Default for LoopGuardSection {
    fn default() -> Self {
        Self {
            max_target_visits: default_max_target_visits(),
            max_consecutive_repeats: default_max_consecutive_repeats(),
            alternating_cycle_repeats: default_alternating_cycle_repeats(),
            warn_utilization: default_warn_utilization(),
            history_limit: default_history_limit(),
            repetitive_text_patterns: default_repetitive_text_patterns(),
        }
    }
}

/// [classifier] 段：级联阈值与可注入的关键词表
#[derive(Debug, Clone, Deserialize)]
pub struct ClassifierSection {
    #[serde(default = "default_boundary_attempts")]
    pub boundary_attempts: u32,
    #[serde(default = "default_research_boundary_attempts")]
    pub research_boundary_attempts: u32,
    #[serde(default = "default_fallback_attempts")]
    pub fallback_attempts: u32,
    /// 语义评分中「足够长」的字符数
    #[serde(default = "default_semantic_min_chars")]
    pub semantic_min_chars: usize,
    /// 语义评分阈值（十分制，7 即 0.7）
    #[serde(default = "default_semantic_threshold")]
    pub semantic_threshold: u32,
    #[serde(default)]
    pub keywords: KeywordTables,
}

fn default_boundary_attempts() -> u32 {
    5
}

fn default_research_boundary_attempts() -> u32 {
    3
}

fn default_fallback_attempts() -> u32 {
    10
}

fn default_semantic_min_chars() -> usize {
    100
}

fn default_semantic_threshold() -> u32 {
    7
}

impl Default for ClassifierSection {
    fn default() -> Self {
        Self {
            boundary_attempts: default_boundary_attempts(),
            research_boundary_attempts: default_research_boundary_attempts(),
            fallback_attempts: default_fallback_attempts(),
            semantic_min_chars: default_semantic_min_chars(),
            semantic_threshold: default_semantic_threshold(),
            keywords: KeywordTables::default(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 MAESTRO__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 MAESTRO__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("MAESTRO")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
