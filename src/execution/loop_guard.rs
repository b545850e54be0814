//! 防循环：统计每个步骤的动作、目标访问与往返模式，给出逐级升高的信号
//!
//! none → warn → block → force_complete。状态覆盖整个运行，跨步骤重访同一目标也会被提示。
//! 自身从不报错；force_complete 交给步骤追踪器走正常的强制完成路径。

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::{BoundariesSection, LoopGuardSection};

/// 信号等级，按严重程度排序
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    None,
    Warn,
    Block,
    ForceComplete,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::None => "none",
            Severity::Warn => "warn",
            Severity::Block => "block",
            Severity::ForceComplete => "force_complete",
        }
    }
}

/// 智能体执行的动作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Click,
    Visit,
    Type,
    Hover,
    Scroll,
    Search,
    Other,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Click => "click",
            ActionType::Visit => "visit",
            ActionType::Type => "type",
            ActionType::Hover => "hover",
            ActionType::Scroll => "scroll",
            ActionType::Search => "search",
            ActionType::Other => "other",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一个动作：类型 + 目标（URL 或元素描述）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentAction {
    pub action_type: ActionType,
    pub target: String,
}

impl AgentAction {
    pub fn new(action_type: ActionType, target: impl Into<String>) -> Self {
        Self {
            action_type,
            target: target.into(),
        }
    }
}

/// should_block 的结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GuardDecision {
    pub blocked: bool,
    pub severity: Severity,
    pub reason: String,
}

impl GuardDecision {
    fn new(severity: Severity, reason: impl Into<String>) -> Self {
        Self {
            blocked: severity >= Severity::Block,
            severity,
            reason: reason.into(),
        }
    }

    pub fn none() -> Self {
        Self::new(Severity::None, "")
    }
}

/// 动作历史中的一条
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub step_index: usize,
    pub action_type: ActionType,
    /// 规范化后的目标
    pub target: String,
    pub at: DateTime<Utc>,
    pub severity: Severity,
}

impl ActionRecord {
    fn signature(&self) -> String {
        signature(self.action_type, &self.target)
    }
}

/// 单个步骤内的计数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepGuard {
    pub started_at: DateTime<Utc>,
    pub max_actions: u32,
    pub time_limit_secs: u64,
    pub action_count: u32,
    /// 阻断次数与重复回复文本次数之和
    pub repetition_signals: u32,
    /// 动作签名 → 本步骤内出现次数
    pub repetition_counts: BTreeMap<String, u32>,
}

/// 可序列化的防循环状态
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoopGuardState {
    /// 整个运行中出现过的动作签名
    pub visited_targets: BTreeSet<String>,
    pub steps: BTreeMap<usize, StepGuard>,
    pub action_history: VecDeque<ActionRecord>,
}

fn signature(action_type: ActionType, normalized_target: &str) -> String {
    format!("{}:{}", action_type.as_str(), normalized_target)
}

static TRACKING_PARAM: OnceLock<Option<Regex>> = OnceLock::new();
static EXTRACTORS: OnceLock<Vec<(ActionType, Regex)>> = OnceLock::new();

fn tracking_param() -> Option<&'static Regex> {
    TRACKING_PARAM
        .get_or_init(|| Regex::new(r"(?i)[?&](?:utm_[^&#]*|ref=[^&#]*)").ok())
        .as_ref()
}

fn extractors() -> &'static [(ActionType, Regex)] {
    EXTRACTORS.get_or_init(|| {
        [
            (ActionType::Click, r#"(?i)clicked\s+(?:on\s+)?["'“「]([^"'”」]+)["'”」]"#),
            (ActionType::Click, r#"点击了?\s*["“「『]([^"”」』]+)["”」』]"#),
            (ActionType::Visit, r"(?i)(?:visited|navigated to|went to|opened)\s+(https?://\S+)"),
            (ActionType::Visit, r"访问了?\s*(https?://\S+)"),
            (ActionType::Type, r#"(?i)typed\s+["'“]([^"'”]+)["'”]"#),
            (ActionType::Type, r#"输入了?\s*["“「]([^"”」]+)["”」]"#),
            (ActionType::Hover, r#"(?i)hovered\s+over\s+["'“]([^"'”]+)["'”]"#),
        ]
        .into_iter()
        .filter_map(|(kind, pattern)| Regex::new(pattern).ok().map(|re| (kind, re)))
        .collect()
    })
}

/// URL 规范化：去掉片段与 utm_* / ref= 跟踪参数，小写，去尾部斜杠
pub fn normalize_url(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches(['.', ',', ';', ')', '。', '，']);
    let without_fragment = trimmed.split('#').next().unwrap_or(trimmed);
    let mut cleaned = match tracking_param() {
        Some(re) => re.replace_all(without_fragment, "").into_owned(),
        None => without_fragment.to_string(),
    };
    if !cleaned.contains('?') {
        if let Some(pos) = cleaned.find('&') {
            cleaned.replace_range(pos..pos + 1, "?");
        }
    }
    cleaned.to_lowercase().trim_end_matches('/').to_string()
}

/// 目标规范化：URL 走 normalize_url，元素描述折叠空白并小写
pub fn normalize_target(action_type: ActionType, target: &str) -> String {
    let target = target.trim();
    if action_type == ActionType::Visit || target.contains("://") {
        return normalize_url(target);
    }
    target
        .trim_matches(|c| matches!(c, '"' | '\'' | '“' | '”' | '「' | '」'))
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// 从自由文本中还原动作（点击 / 访问 / 输入 / 悬停），按出现顺序返回
pub fn extract_actions(text: &str) -> Vec<AgentAction> {
    let mut found: Vec<(usize, AgentAction)> = Vec::new();
    for (kind, re) in extractors() {
        for caps in re.captures_iter(text) {
            if let Some(m) = caps.get(1) {
                found.push((m.start(), AgentAction::new(*kind, m.as_str())));
            }
        }
    }
    found.sort_by_key(|(pos, _)| *pos);
    found.into_iter().map(|(_, action)| action).collect()
}

/// A/B/A/B… 往返：尾部 2×repeats 个签名两两交替
fn alternating_cycle(signatures: &[String], repeats: u32) -> bool {
    let window = (repeats as usize) * 2;
    if repeats == 0 || signatures.len() < window {
        return false;
    }
    let tail = &signatures[signatures.len() - window..];
    let (a, b) = (&tail[0], &tail[1]);
    a != b
        && tail
            .iter()
            .enumerate()
            .all(|(i, s)| if i % 2 == 0 { s == a } else { s == b })
}

/// 防循环守卫
#[derive(Debug, Clone)]
pub struct LoopGuard {
    config: LoopGuardSection,
    default_max_actions: u32,
    default_time_limit_secs: u64,
    repetitive_text: Vec<Regex>,
    state: LoopGuardState,
}

impl LoopGuard {
    pub fn new(config: LoopGuardSection, boundaries: &BoundariesSection) -> Self {
        let repetitive_text = config
            .repetitive_text_patterns
            .iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!(pattern = %p, error = %e, "invalid repetitive text pattern ignored");
                    None
                }
            })
            .collect();
        Self {
            config,
            default_max_actions: boundaries.default_max_actions,
            default_time_limit_secs: boundaries.default_time_limit_secs,
            repetitive_text,
            state: LoopGuardState::default(),
        }
    }

    pub fn state(&self) -> &LoopGuardState {
        &self.state
    }

    pub fn restore(&mut self, state: LoopGuardState) {
        self.state = state;
    }

    /// 新任务开始
    pub fn reset(&mut self) {
        self.state = LoopGuardState::default();
    }

    /// 重新规划：从 `step_index` 起的步骤将被重新生成，丢弃它们的计数与历史
    pub fn reset_steps_from(&mut self, step_index: usize) {
        self.state.steps.retain(|idx, _| *idx < step_index);
        self.state.action_history.retain(|r| r.step_index < step_index);
    }

    /// 步骤开始：登记该步骤的动作 / 时间上限（已登记则保留原计数）
    pub fn begin_step(&mut self, step_index: usize, max_actions: u32, time_limit_secs: u64, now: DateTime<Utc>) {
        self.state.steps.entry(step_index).or_insert_with(|| StepGuard {
            started_at: now,
            max_actions,
            time_limit_secs,
            action_count: 0,
            repetition_signals: 0,
            repetition_counts: BTreeMap::new(),
        });
    }

    pub fn actions_in_step(&self, step_index: usize) -> u32 {
        self.state.steps.get(&step_index).map(|s| s.action_count).unwrap_or(0)
    }

    pub fn repetition_signals(&self, step_index: usize) -> u32 {
        self.state
            .steps
            .get(&step_index)
            .map(|s| s.repetition_signals)
            .unwrap_or(0)
    }

    /// 最近访问过的目标（去重，最新在前），用于提示智能体不要重复
    pub fn recent_targets(&self, limit: usize) -> Vec<String> {
        let mut seen = BTreeSet::new();
        self.state
            .action_history
            .iter()
            .rev()
            .filter(|r| seen.insert(r.signature()))
            .take(limit)
            .map(|r| format!("{} {}", r.action_type, r.target))
            .collect()
    }

    /// 回复文本本身呈现重复模式时计入重复信号
    pub fn note_repetitive_text(&mut self, step_index: usize, text: &str) -> bool {
        if !self.repetitive_text.iter().any(|re| re.is_match(text)) {
            return false;
        }
        if let Some(step) = self.state.steps.get_mut(&step_index) {
            step.repetition_signals += 1;
        }
        true
    }

    /// 评估一个（已发生的）动作并记入历史
    pub fn should_block(
        &mut self,
        step_index: usize,
        action_type: ActionType,
        target: &str,
        now: DateTime<Utc>,
    ) -> GuardDecision {
        let normalized = normalize_target(action_type, target);
        let sig = signature(action_type, &normalized);

        let previous: Vec<String> = self
            .state
            .action_history
            .iter()
            .filter(|r| r.step_index == step_index)
            .map(ActionRecord::signature)
            .collect();
        let seen_in_earlier_step = self.state.visited_targets.contains(&sig)
            && self
                .state
                .action_history
                .iter()
                .any(|r| r.step_index != step_index && r.signature() == sig);

        let (default_max, default_limit) = (self.default_max_actions, self.default_time_limit_secs);
        let step = self.state.steps.entry(step_index).or_insert_with(|| StepGuard {
            started_at: now,
            max_actions: default_max,
            time_limit_secs: default_limit,
            action_count: 0,
            repetition_signals: 0,
            repetition_counts: BTreeMap::new(),
        });
        step.action_count += 1;
        let visits = {
            let count = step.repetition_counts.entry(sig.clone()).or_insert(0);
            *count += 1;
            *count
        };

        let consecutive_window = self.config.max_consecutive_repeats as usize;
        let consecutive = consecutive_window > 0
            && previous.len() >= consecutive_window
            && previous[previous.len() - consecutive_window..]
                .iter()
                .all(|s| *s == sig);
        let mut with_current = previous;
        with_current.push(sig.clone());
        let cycle = alternating_cycle(&with_current, self.config.alternating_cycle_repeats);

        let elapsed = (now - step.started_at).num_milliseconds().max(0) as f64 / 1000.0;
        let limit = step.time_limit_secs as f64;
        let max_actions = step.max_actions.max(1);
        let max_visits = self.config.max_target_visits.max(1);

        let decision = if step.action_count >= max_actions {
            GuardDecision::new(
                Severity::ForceComplete,
                format!("action budget reached ({}/{})", step.action_count, max_actions),
            )
        } else if elapsed > limit {
            GuardDecision::new(
                Severity::ForceComplete,
                format!("step running for {:.0}s, limit {}s", elapsed, step.time_limit_secs),
            )
        } else if visits > self.config.max_target_visits {
            GuardDecision::new(
                Severity::Block,
                format!("{} '{}' repeated {} times in this step", action_type, normalized, visits),
            )
        } else if consecutive {
            GuardDecision::new(
                Severity::Block,
                format!("same action {} '{}' repeated back to back", action_type, normalized),
            )
        } else if cycle {
            GuardDecision::new(Severity::Block, "alternating between the same two actions")
        } else {
            let utilization = [
                visits as f64 / max_visits as f64,
                step.action_count as f64 / max_actions as f64,
                if limit > 0.0 { elapsed / limit } else { 0.0 },
            ]
            .into_iter()
            .fold(0.0_f64, f64::max);
            if utilization >= self.config.warn_utilization {
                GuardDecision::new(
                    Severity::Warn,
                    format!("{:.0}% of a loop threshold used, wrap up soon", utilization * 100.0),
                )
            } else if seen_in_earlier_step {
                GuardDecision::new(
                    Severity::Warn,
                    format!("{} '{}' was already done in an earlier step", action_type, normalized),
                )
            } else {
                GuardDecision::none()
            }
        };

        if decision.severity == Severity::Block {
            step.repetition_signals += 1;
        }

        self.state.visited_targets.insert(sig);
        self.state.action_history.push_back(ActionRecord {
            step_index,
            action_type,
            target: normalized,
            at: now,
            severity: decision.severity,
        });
        while self.state.action_history.len() > self.config.history_limit.max(1) {
            self.state.action_history.pop_front();
        }
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn guard() -> LoopGuard {
        LoopGuard::new(LoopGuardSection::default(), &BoundariesSection::default())
    }

    #[test]
    fn test_repeated_click_escalates() {
        let mut g = guard();
        let now = Utc::now();
        g.begin_step(0, 5, 300, now);
        let severities: Vec<Severity> = (0..5)
            .map(|_| g.should_block(0, ActionType::Click, "了解更多", now).severity)
            .collect();
        assert_eq!(severities[0], Severity::None);
        assert_eq!(severities[1], Severity::Warn);
        assert_eq!(severities[2], Severity::Block);
        assert_eq!(severities[3], Severity::Block);
        assert_eq!(severities[4], Severity::ForceComplete);
        assert_eq!(g.actions_in_step(0), 5);
        assert_eq!(g.repetition_signals(0), 2);
    }

    #[test]
    fn test_block_sets_blocked_flag() {
        let mut g = guard();
        let now = Utc::now();
        for _ in 0..2 {
            g.should_block(0, ActionType::Click, "Buy", now);
        }
        let d = g.should_block(0, ActionType::Click, "buy", now);
        assert!(d.blocked);
        assert!(d.reason.contains("buy"));
    }

    #[test]
    fn test_time_limit_forces_completion() {
        let mut g = guard();
        let start = Utc::now();
        g.begin_step(0, 5, 120, start);
        let d = g.should_block(0, ActionType::Scroll, "down", start + Duration::seconds(121));
        assert_eq!(d.severity, Severity::ForceComplete);
    }

    #[test]
    fn test_distinct_actions_warn_near_budget() {
        let mut g = guard();
        let now = Utc::now();
        g.begin_step(0, 5, 300, now);
        let targets = ["a", "b", "c", "d"];
        let severities: Vec<Severity> = targets
            .iter()
            .map(|t| g.should_block(0, ActionType::Click, t, now).severity)
            .collect();
        assert_eq!(severities, vec![Severity::None, Severity::None, Severity::None, Severity::Warn]);
    }

    #[test]
    fn test_alternating_cycle_blocks() {
        let mut config = LoopGuardSection::default();
        config.max_target_visits = 10;
        config.alternating_cycle_repeats = 2;
        let mut g = LoopGuard::new(config, &BoundariesSection::default());
        let now = Utc::now();
        g.begin_step(0, 20, 300, now);
        g.should_block(0, ActionType::Click, "next", now);
        g.should_block(0, ActionType::Click, "prev", now);
        g.should_block(0, ActionType::Click, "next", now);
        let d = g.should_block(0, ActionType::Click, "prev", now);
        assert_eq!(d.severity, Severity::Block);
    }

    #[test]
    fn test_cross_step_revisit_warns() {
        let mut g = guard();
        let now = Utc::now();
        g.begin_step(0, 5, 300, now);
        g.should_block(0, ActionType::Visit, "https://Example.com/page", now);
        g.begin_step(1, 5, 300, now);
        let d = g.should_block(1, ActionType::Visit, "https://example.com/page?utm_source=x", now);
        assert_eq!(d.severity, Severity::Warn);
        assert!(d.reason.contains("earlier step"));
    }

    #[test]
    fn test_reset_steps_from() {
        let mut g = guard();
        let now = Utc::now();
        g.should_block(0, ActionType::Click, "x", now);
        g.should_block(1, ActionType::Click, "y", now);
        g.reset_steps_from(1);
        assert_eq!(g.actions_in_step(0), 1);
        assert_eq!(g.actions_in_step(1), 0);
        assert!(g.state().action_history.iter().all(|r| r.step_index == 0));
    }

    #[test]
    fn test_history_is_bounded() {
        let mut config = LoopGuardSection::default();
        config.history_limit = 3;
        let mut g = LoopGuard::new(config, &BoundariesSection::default());
        let now = Utc::now();
        for i in 0..6 {
            g.should_block(i, ActionType::Click, "x", now);
        }
        assert_eq!(g.state().action_history.len(), 3);
    }

    #[test]
    fn test_normalize_url() {
        assert_eq!(
            normalize_url("https://Shop.com/Item?utm_source=ad&id=3#reviews"),
            "https://shop.com/item?id=3"
        );
        assert_eq!(normalize_url("https://shop.com/item?id=3&ref=home"), "https://shop.com/item?id=3");
        assert_eq!(normalize_url("https://shop.com/"), "https://shop.com");
    }

    #[test]
    fn test_normalize_element_target() {
        assert_eq!(normalize_target(ActionType::Click, "  “了解   更多” "), "了解 更多");
        assert_eq!(normalize_target(ActionType::Click, "Learn  More"), "learn more");
    }

    #[test]
    fn test_extract_actions_in_order() {
        let text = "I visited https://te720.com/products. Then I clicked \"Specs\" and 点击了「了解更多」.";
        let actions = extract_actions(text);
        assert_eq!(actions.len(), 3);
        assert_eq!(actions[0].action_type, ActionType::Visit);
        assert_eq!(normalize_url(&actions[0].target), "https://te720.com/products");
        assert_eq!(actions[1], AgentAction::new(ActionType::Click, "Specs"));
        assert_eq!(actions[2], AgentAction::new(ActionType::Click, "了解更多"));
    }

    #[test]
    fn test_repetitive_text_counts_signal() {
        let mut g = guard();
        let now = Utc::now();
        g.begin_step(0, 5, 300, now);
        assert!(g.note_repetitive_text(0, "I clicked 了解更多, then clicked 了解更多 again"));
        assert!(!g.note_repetitive_text(0, "Read the spec sheet"));
        assert_eq!(g.repetition_signals(0), 1);
    }

    #[test]
    fn test_state_round_trip() {
        let mut g = guard();
        let now = Utc::now();
        g.should_block(0, ActionType::Click, "x", now);
        let json = serde_json::to_string(g.state()).unwrap();
        let back: LoopGuardState = serde_json::from_str(&json).unwrap();
        assert_eq!(&back, g.state());
    }
}
