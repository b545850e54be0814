//! 完成判定：从智能体的自由文本回复判断当前步骤是否完成
//!
//! 判定是一张有序规则表，按顺序求值、首个命中即返回：
//! 显式完成信号 → 明确未完成话术 → 角色行为启发 → 语义打分 → 可恢复错误 → 边界放宽 → 兜底推进。
//! 分类器没有内部可变状态，相同输入永远得到相同结果。关键词表可通过配置注入。

use serde::{Deserialize, Serialize};

use crate::config::ClassifierSection;
use crate::execution::tokenizer::title_overlap;
use crate::plan::AgentRole;

/// 命中的判定策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStrategy {
    ExplicitSignal,
    DefiniteIncomplete,
    RoleBehavior,
    SemanticAnalysis,
    ErrorRecovery,
    BoundaryAdaptation,
    FallbackProgression,
    InsufficientEvidence,
}

impl CompletionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionStrategy::ExplicitSignal => "explicit_signal",
            CompletionStrategy::DefiniteIncomplete => "definite_incomplete",
            CompletionStrategy::RoleBehavior => "role_behavior",
            CompletionStrategy::SemanticAnalysis => "semantic_analysis",
            CompletionStrategy::ErrorRecovery => "error_recovery",
            CompletionStrategy::BoundaryAdaptation => "boundary_adaptation",
            CompletionStrategy::FallbackProgression => "fallback_progression",
            CompletionStrategy::InsufficientEvidence => "insufficient_evidence",
        }
    }
}

/// 判定结果；confidence 仅用于日志，不参与决策
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Classification {
    pub is_complete: bool,
    pub confidence: f64,
    pub strategy: CompletionStrategy,
    pub evidence: String,
}

/// 级联各层使用的关键词表（中英文混合，匹配时统一小写）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeywordTables {
    /// 规范的完成标记，含各角色专用短语
    pub explicit_signals: Vec<String>,
    /// 通用助手式话术：出现即判定未完成
    pub incomplete_patterns: Vec<String>,
    /// 浏览成功的动作词
    pub navigation_terms: Vec<String>,
    /// 与任务领域相关的内容词
    pub domain_terms: Vec<String>,
    pub image_done_terms: Vec<String>,
    pub document_done_terms: Vec<String>,
    /// 具体细节类词汇
    pub concrete_terms: Vec<String>,
    /// 承上启下类词汇
    pub transition_terms: Vec<String>,
    pub error_terms: Vec<String>,
    pub recovery_terms: Vec<String>,
}

fn words(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for KeywordTables {
    fn default() -> Self {
        Self {
            explicit_signals: words(&[
                "✅ 当前步骤已完成",
                "当前步骤已完成",
                "✅ step completed",
                "step completed",
                "图像生成任务已完成",
                "图像已成功生成",
                "image generation task completed",
                "文档创建任务已完成",
                "document creation task completed",
            ]),
            incomplete_patterns: words(&[
                "我理解您需要",
                "我可以帮助您",
                "我将帮助您",
                "让我为您",
                "请提供更多信息",
                "需要一些详细信息",
                "请问您",
                "i understand you",
                "i can help you",
                "i will help you",
                "let me help you",
                "could you provide more details",
                "could you clarify",
                "can you provide more",
            ]),
            navigation_terms: words(&[
                "successfully accessed",
                "visited",
                "navigated",
                "clicked",
                "browsed",
                "opened the page",
                "访问了",
                "已访问",
                "点击了",
                "浏览了",
                "打开了",
            ]),
            domain_terms: words(&[
                "product",
                "specification",
                "specs",
                "features",
                "price",
                "产品",
                "规格",
                "参数",
                "特点",
                "功能",
                "价格",
                "型号",
            ]),
            image_done_terms: words(&[
                "successfully generated",
                "image generated",
                "generated image",
                "图像已生成",
                "已生成图像",
                "图片已生成",
            ]),
            document_done_terms: words(&[
                "file saved",
                "saved to",
                "created file",
                "document created",
                "已保存",
                "文件已创建",
                "文档已生成",
            ]),
            concrete_terms: words(&[
                "specifications",
                "features",
                "details",
                "information",
                "data",
                "specs",
                "规格",
                "特点",
                "信息",
                "数据",
                "参数",
            ]),
            transition_terms: words(&[
                "next",
                "subsequent",
                "continue",
                "proceed",
                "下一步",
                "后续",
                "继续",
            ]),
            error_terms: words(&[
                "error",
                "timeout",
                "timed out",
                "failed",
                "exception",
                "错误",
                "超时",
                "失败",
            ]),
            recovery_terms: words(&[
                "however",
                "managed to",
                "still",
                "nevertheless",
                "但是",
                "不过",
                "仍然",
                "成功",
            ]),
        }
    }
}

impl KeywordTables {
    fn lowercased(mut self) -> Self {
        for table in [
            &mut self.explicit_signals,
            &mut self.incomplete_patterns,
            &mut self.navigation_terms,
            &mut self.domain_terms,
            &mut self.image_done_terms,
            &mut self.document_done_terms,
            &mut self.concrete_terms,
            &mut self.transition_terms,
            &mut self.error_terms,
            &mut self.recovery_terms,
        ] {
            for word in table.iter_mut() {
                *word = word.to_lowercase();
            }
            table.retain(|w| !w.trim().is_empty());
        }
        self
    }
}

/// 单次判定的输入
#[derive(Debug)]
struct ClassificationInput<'a> {
    role: AgentRole,
    text: &'a str,
    lower: String,
    title: &'a str,
    attempts: u32,
}

/// 规则命中时的裁决
struct Verdict {
    is_complete: bool,
    confidence: f64,
    evidence: String,
}

impl Verdict {
    fn complete(confidence: f64, evidence: impl Into<String>) -> Option<Self> {
        Some(Self {
            is_complete: true,
            confidence,
            evidence: evidence.into(),
        })
    }
}

type Rule = fn(&CompletionClassifier, &ClassificationInput<'_>) -> Option<Verdict>;

/// 规则表：顺序即优先级
const CASCADE: [(CompletionStrategy, Rule); 7] = [
    (CompletionStrategy::ExplicitSignal, explicit_signal as Rule),
    (CompletionStrategy::DefiniteIncomplete, definite_incomplete as Rule),
    (CompletionStrategy::RoleBehavior, role_behavior as Rule),
    (CompletionStrategy::SemanticAnalysis, semantic_analysis as Rule),
    (CompletionStrategy::ErrorRecovery, error_recovery as Rule),
    (CompletionStrategy::BoundaryAdaptation, boundary_adaptation as Rule),
    (CompletionStrategy::FallbackProgression, fallback_progression as Rule),
];

fn first_match<'t>(table: &'t [String], lower: &str) -> Option<&'t str> {
    table.iter().find(|k| lower.contains(k.as_str())).map(String::as_str)
}

fn explicit_signal(c: &CompletionClassifier, input: &ClassificationInput<'_>) -> Option<Verdict> {
    let signal = first_match(&c.tables.explicit_signals, &input.lower)?;
    Verdict::complete(0.95, format!("explicit completion signal: {signal}"))
}

fn definite_incomplete(c: &CompletionClassifier, input: &ClassificationInput<'_>) -> Option<Verdict> {
    let pattern = first_match(&c.tables.incomplete_patterns, &input.lower)?;
    Some(Verdict {
        is_complete: false,
        confidence: 0.0,
        evidence: format!("assistant filler, not a result: {pattern}"),
    })
}

fn role_behavior(c: &CompletionClassifier, input: &ClassificationInput<'_>) -> Option<Verdict> {
    let t = &c.tables;
    match input.role {
        AgentRole::WebSurfer | AgentRole::FileSurfer => {
            let domain = first_match(&t.domain_terms, &input.lower)?;
            if let Some(nav) = first_match(&t.navigation_terms, &input.lower) {
                return Verdict::complete(0.8, format!("navigation '{nav}' with content '{domain}'"));
            }
            if input.attempts >= c.config.research_boundary_attempts {
                return Verdict::complete(
                    0.6,
                    format!("content '{domain}' after {} attempts", input.attempts),
                );
            }
            None
        }
        AgentRole::ImageGenerator => {
            let term = first_match(&t.image_done_terms, &input.lower)?;
            Verdict::complete(0.8, format!("image delivered: {term}"))
        }
        AgentRole::Coder => {
            let term = first_match(&t.document_done_terms, &input.lower)?;
            Verdict::complete(0.7, format!("document delivered: {term}"))
        }
    }
}

/// 十分制打分，避免浮点阈值比较的误差
fn semantic_points(c: &CompletionClassifier, input: &ClassificationInput<'_>) -> u32 {
    let t = &c.tables;
    let mut points = 0;
    if input.text.chars().count() >= c.config.semantic_min_chars {
        points += 2;
    }
    if first_match(&t.concrete_terms, &input.lower).is_some() {
        points += 3;
    }
    if first_match(&t.transition_terms, &input.lower).is_some() {
        points += 2;
    }
    points += (title_overlap(input.title, input.text) as u32).min(3);
    points
}

fn semantic_analysis(c: &CompletionClassifier, input: &ClassificationInput<'_>) -> Option<Verdict> {
    let points = semantic_points(c, input);
    if points >= c.config.semantic_threshold {
        return Verdict::complete(0.7, format!("semantic score {:.1}", points as f64 / 10.0));
    }
    None
}

fn error_recovery(c: &CompletionClassifier, input: &ClassificationInput<'_>) -> Option<Verdict> {
    let error = first_match(&c.tables.error_terms, &input.lower)?;
    let recovery = first_match(&c.tables.recovery_terms, &input.lower)?;
    Verdict::complete(0.6, format!("error '{error}' with recovery '{recovery}'"))
}

fn boundary_adaptation(c: &CompletionClassifier, input: &ClassificationInput<'_>) -> Option<Verdict> {
    let research = input.role.is_research() && input.attempts >= c.config.research_boundary_attempts;
    if input.attempts >= c.config.boundary_attempts || research {
        return Verdict::complete(0.5, format!("boundary reached after {} attempts", input.attempts));
    }
    None
}

fn fallback_progression(c: &CompletionClassifier, input: &ClassificationInput<'_>) -> Option<Verdict> {
    if input.attempts >= c.config.fallback_attempts {
        return Verdict::complete(0.4, format!("forced progression after {} attempts", input.attempts));
    }
    None
}

/// 完成判定器：持有阈值与（已小写化的）关键词表
#[derive(Debug, Clone)]
pub struct CompletionClassifier {
    config: ClassifierSection,
    tables: KeywordTables,
}

impl CompletionClassifier {
    pub fn new(config: ClassifierSection) -> Self {
        let tables = config.keywords.clone().lowercased();
        Self { config, tables }
    }

    pub fn tables(&self) -> &KeywordTables {
        &self.tables
    }

    /// 对一条回复求值：规则表中第一个命中的规则决定结果
    pub fn classify(
        &self,
        role: AgentRole,
        response_text: &str,
        step_title: &str,
        attempt_count: u32,
    ) -> Classification {
        let input = ClassificationInput {
            role,
            text: response_text,
            lower: response_text.to_lowercase(),
            title: step_title,
            attempts: attempt_count,
        };
        for (strategy, rule) in CASCADE.iter() {
            if let Some(verdict) = rule(self, &input) {
                return Classification {
                    is_complete: verdict.is_complete,
                    confidence: verdict.confidence,
                    strategy: *strategy,
                    evidence: verdict.evidence,
                };
            }
        }
        Classification {
            is_complete: false,
            confidence: 0.0,
            strategy: CompletionStrategy::InsufficientEvidence,
            evidence: "no completion evidence yet".to_string(),
        }
    }
}

impl Default for CompletionClassifier {
    fn default() -> Self {
        Self::new(ClassifierSection::default())
    }
}
