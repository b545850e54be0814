//! 步骤执行追踪：每个步骤一个状态机
//!
//! not_started → in_progress → {completed | failed | skipped}，只能前进；
//! 附带尝试计数、起始时间、完成证据与质量分。边界越界永远不会变成错误，只会强制完成。

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::BoundariesSection;
use crate::execution::excerpt;
use crate::execution::tokenizer::{contains_cjk, title_overlap, tokenize_to_set};

/// 完成证据中用于质量加分的显式完成短语
const QUALITY_MARKERS: &[&str] = &[
    "✅",
    "当前步骤已完成",
    "步骤完成",
    "任务已完成",
    "step completed",
    "task completed",
];

/// 单条证据保留的最大字符数
const MAX_EVIDENCE_CHARS: usize = 2000;
/// 尝试记录只保留最近几条，供跟进指令引用
const MAX_ATTEMPT_NOTES: usize = 5;

/// 步骤状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    NotStarted,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    /// 终态：completed / failed / skipped
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped)
    }
}

/// 完成方式：决定质量分的基础系数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionKind {
    /// 分类器判定完成
    Normal,
    /// 动作数 / 重复等边界触发
    Boundary,
    /// 尝试次数到达硬上限
    Forced,
    /// 仅因时间上限触发
    Timeout,
}

impl CompletionKind {
    pub fn multiplier(&self) -> f64 {
        match self {
            CompletionKind::Normal => 1.0,
            CompletionKind::Boundary => 0.8,
            CompletionKind::Forced => 0.6,
            CompletionKind::Timeout => 0.5,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionKind::Normal => "normal",
            CompletionKind::Boundary => "boundary",
            CompletionKind::Forced => "forced",
            CompletionKind::Timeout => "timeout",
        }
    }
}

/// 某个步骤生效的执行边界
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepBoundaries {
    /// 命中的档位名；未命中为 "default"
    pub profile: String,
    pub max_actions: u32,
    pub time_limit_secs: u64,
}

/// 单步执行状态（首次成为当前步骤时惰性创建，整个运行期间不销毁）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecutionState {
    pub status: StepStatus,
    pub attempt_count: u32,
    pub start_time: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub completion_evidence: Vec<String>,
    pub quality_score: f64,
    pub completion_kind: Option<CompletionKind>,
    pub agent_name: String,
    pub title: String,
    pub boundaries: StepBoundaries,
    /// 最近几次回复的摘录，跟进指令里提示智能体不要重复劳动
    #[serde(default)]
    pub attempt_notes: Vec<String>,
    #[serde(default)]
    pub failure_reason: Option<String>,
}

/// 边界检查结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BoundaryViolations {
    pub max_actions_exceeded: bool,
    pub time_limit_exceeded: bool,
    pub repetition_detected: bool,
    pub should_force_complete: bool,
}

impl BoundaryViolations {
    /// 只有时间超限时按 timeout 完成，其余按 boundary
    pub fn completion_kind(&self) -> CompletionKind {
        if self.time_limit_exceeded && !self.max_actions_exceeded && !self.repetition_detected {
            CompletionKind::Timeout
        } else {
            CompletionKind::Boundary
        }
    }

    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        if self.max_actions_exceeded {
            parts.push("max actions reached");
        }
        if self.time_limit_exceeded {
            parts.push("time limit exceeded");
        }
        if self.repetition_detected {
            parts.push("repetition detected");
        }
        parts.join(", ")
    }
}

/// 步骤执行追踪器：按步骤索引保存状态
#[derive(Debug, Clone)]
pub struct StepExecutionTracker {
    states: BTreeMap<usize, StepExecutionState>,
    config: BoundariesSection,
}

impl StepExecutionTracker {
    pub fn new(config: BoundariesSection) -> Self {
        Self {
            states: BTreeMap::new(),
            config,
        }
    }

    /// 从快照恢复
    pub fn restore(config: BoundariesSection, states: BTreeMap<usize, StepExecutionState>) -> Self {
        Self { states, config }
    }

    pub fn states(&self) -> &BTreeMap<usize, StepExecutionState> {
        &self.states
    }

    pub fn get(&self, step_index: usize) -> Option<&StepExecutionState> {
        self.states.get(&step_index)
    }

    /// 未创建的步骤视为 not_started
    pub fn status(&self, step_index: usize) -> StepStatus {
        self.states
            .get(&step_index)
            .map(|s| s.status)
            .unwrap_or(StepStatus::NotStarted)
    }

    /// 按标题匹配档位，得到该步骤的动作 / 时间上限。
    /// 英文关键词按整词匹配（"read" 不命中 "already"），中文关键词按子串匹配。
    pub fn boundaries_for(&self, title: &str) -> StepBoundaries {
        let lower = title.to_lowercase();
        let tokens = tokenize_to_set(title);
        let matches = |keyword: &String| {
            let keyword = keyword.to_lowercase();
            if contains_cjk(&keyword) {
                lower.contains(&keyword)
            } else {
                tokens.contains(&keyword)
            }
        };
        self.config
            .profiles
            .iter()
            .find(|p| p.keywords.iter().any(|k| matches(k)))
            .map(|p| StepBoundaries {
                profile: p.name.clone(),
                max_actions: p.max_actions,
                time_limit_secs: p.time_limit_secs,
            })
            .unwrap_or_else(|| StepBoundaries {
                profile: "default".to_string(),
                max_actions: self.config.default_max_actions,
                time_limit_secs: self.config.default_time_limit_secs,
            })
    }

    /// 幂等：仅在状态不存在时创建
    pub fn initialize(&mut self, step_index: usize, agent_name: &str, title: &str) -> &StepExecutionState {
        let boundaries = self.boundaries_for(title);
        self.states
            .entry(step_index)
            .or_insert_with(|| StepExecutionState {
                status: StepStatus::NotStarted,
                attempt_count: 0,
                start_time: None,
                completed_at: None,
                completion_evidence: Vec::new(),
                quality_score: 0.0,
                completion_kind: None,
                agent_name: agent_name.to_string(),
                title: title.to_string(),
                boundaries,
                attempt_notes: Vec::new(),
                failure_reason: None,
            })
    }

    /// 进入执行：重置尝试计数并记录起始时间；终态步骤静默忽略
    pub fn mark_in_progress(&mut self, step_index: usize, now: DateTime<Utc>) -> bool {
        let Some(state) = self.states.get_mut(&step_index) else {
            warn!(step = step_index + 1, "mark_in_progress on uninitialized step");
            return false;
        };
        if state.status.is_terminal() {
            return false;
        }
        state.status = StepStatus::InProgress;
        state.attempt_count = 0;
        state.start_time = Some(now);
        state.attempt_notes.clear();
        true
    }

    /// 步骤重新规划后沿用同一索引：更新角色与标题，边界按新标题重算
    pub fn reassign(&mut self, step_index: usize, agent_name: &str, title: &str) {
        let boundaries = self.boundaries_for(title);
        if let Some(state) = self.states.get_mut(&step_index) {
            if state.status.is_terminal() {
                return;
            }
            state.agent_name = agent_name.to_string();
            state.title = title.to_string();
            state.boundaries = boundaries;
        }
    }

    /// 记录一次回复，返回新的尝试次数；非执行中的步骤不计数
    pub fn record_attempt(&mut self, step_index: usize, evidence_text: &str) -> u32 {
        let Some(state) = self.states.get_mut(&step_index) else {
            return 0;
        };
        if state.status != StepStatus::InProgress {
            warn!(
                step = step_index + 1,
                status = ?state.status,
                "attempt recorded against a step that is not in progress"
            );
            return state.attempt_count;
        }
        state.attempt_count += 1;
        if !evidence_text.trim().is_empty() {
            state.attempt_notes.push(excerpt(evidence_text, 300));
            if state.attempt_notes.len() > MAX_ATTEMPT_NOTES {
                state.attempt_notes.remove(0);
            }
        }
        state.attempt_count
    }

    /// 标记完成并计算质量分；重复调用为 no-op，返回 false 并告警
    pub fn mark_completed(
        &mut self,
        step_index: usize,
        evidence: &str,
        kind: CompletionKind,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(state) = self.states.get_mut(&step_index) else {
            warn!(step = step_index + 1, "mark_completed on uninitialized step");
            return false;
        };
        if state.status.is_terminal() {
            warn!(
                step = step_index + 1,
                status = ?state.status,
                "step already finished, ignoring duplicate completion"
            );
            return false;
        }
        if !evidence.trim().is_empty() {
            state.completion_evidence.push(excerpt(evidence, MAX_EVIDENCE_CHARS));
        }
        state.quality_score = quality_score(state, evidence, kind, now);
        state.status = StepStatus::Completed;
        state.completion_kind = Some(kind);
        state.completed_at = Some(now);
        info!(
            step = step_index + 1,
            kind = kind.as_str(),
            attempts = state.attempt_count,
            quality = state.quality_score,
            "step completed"
        );
        true
    }

    pub fn mark_failed(&mut self, step_index: usize, reason: &str) -> bool {
        match self.states.get_mut(&step_index) {
            Some(state) if !state.status.is_terminal() => {
                state.status = StepStatus::Failed;
                state.failure_reason = Some(reason.to_string());
                true
            }
            _ => false,
        }
    }

    pub fn mark_skipped(&mut self, step_index: usize) -> bool {
        match self.states.get_mut(&step_index) {
            Some(state) if !state.status.is_terminal() => {
                state.status = StepStatus::Skipped;
                true
            }
            _ => false,
        }
    }

    /// 纯读取：给定已执行动作数与重复信号数，判断是否越界
    pub fn boundary_violations(
        &self,
        step_index: usize,
        actions_taken: u32,
        repetition_signals: u32,
        now: DateTime<Utc>,
    ) -> BoundaryViolations {
        let Some(state) = self.states.get(&step_index) else {
            return BoundaryViolations::default();
        };
        let max_actions_exceeded = actions_taken >= state.boundaries.max_actions;
        let time_limit_exceeded = state
            .start_time
            .map(|start| (now - start).num_seconds() > state.boundaries.time_limit_secs as i64)
            .unwrap_or(false);
        let repetition_detected = repetition_signals > 2;
        BoundaryViolations {
            max_actions_exceeded,
            time_limit_exceeded,
            repetition_detected,
            should_force_complete: max_actions_exceeded || time_limit_exceeded || repetition_detected,
        }
    }

    /// 所有步骤的完成证据，按步骤顺序
    pub fn collected_evidence(&self) -> Vec<String> {
        self.states
            .iter()
            .flat_map(|(idx, state)| {
                state
                    .completion_evidence
                    .iter()
                    .map(move |e| format!("[步骤 {} · {}] {}", idx + 1, state.title, e))
            })
            .collect()
    }
}

fn quality_score(
    state: &StepExecutionState,
    evidence: &str,
    kind: CompletionKind,
    now: DateTime<Utc>,
) -> f64 {
    let mut score = kind.multiplier();
    let lower = evidence.to_lowercase();
    if QUALITY_MARKERS.iter().any(|m| lower.contains(m)) {
        score += 0.3;
    }
    score += (0.1 * title_overlap(&state.title, evidence) as f64).min(0.4);

    if let Some(start) = state.start_time {
        let elapsed = (now - start).num_milliseconds().max(0) as f64 / 1000.0;
        let limit = state.boundaries.time_limit_secs as f64;
        if elapsed < limit * 0.3 {
            score *= 0.9;
        } else if elapsed > limit * 0.8 {
            score *= 0.8;
        }
    }
    score.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn tracker() -> StepExecutionTracker {
        StepExecutionTracker::new(BoundariesSection::default())
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let mut t = tracker();
        t.initialize(0, "web_surfer", "Step A");
        t.mark_in_progress(0, Utc::now());
        t.record_attempt(0, "x");
        let state = t.initialize(0, "coder_agent", "Other");
        assert_eq!(state.agent_name, "web_surfer");
        assert_eq!(state.attempt_count, 1);
    }

    #[test]
    fn test_mark_in_progress_resets_attempts() {
        let mut t = tracker();
        t.initialize(0, "web_surfer", "Step A");
        assert!(t.mark_in_progress(0, Utc::now()));
        assert_eq!(t.record_attempt(0, "a"), 1);
        assert_eq!(t.record_attempt(0, "b"), 2);
        assert!(t.mark_in_progress(0, Utc::now()));
        assert_eq!(t.get(0).unwrap().attempt_count, 0);
    }

    #[test]
    fn test_mark_in_progress_noop_after_completion() {
        let mut t = tracker();
        t.initialize(0, "web_surfer", "Step A");
        let now = Utc::now();
        t.mark_in_progress(0, now);
        t.record_attempt(0, "done");
        assert!(t.mark_completed(0, "done", CompletionKind::Normal, now));
        assert!(!t.mark_in_progress(0, now));
        assert_eq!(t.status(0), StepStatus::Completed);
        assert_eq!(t.get(0).unwrap().attempt_count, 1);
    }

    #[test]
    fn test_double_completion_is_noop() {
        let mut t = tracker();
        t.initialize(0, "web_surfer", "Step A");
        let now = Utc::now();
        t.mark_in_progress(0, now);
        assert!(t.mark_completed(0, "first", CompletionKind::Normal, now));
        let before = t.get(0).unwrap().clone();
        assert!(!t.mark_completed(0, "second", CompletionKind::Forced, now));
        assert_eq!(t.get(0).unwrap(), &before);
    }

    #[test]
    fn test_status_only_moves_forward() {
        let mut t = tracker();
        t.initialize(0, "web_surfer", "Step A");
        t.mark_in_progress(0, Utc::now());
        assert!(t.mark_failed(0, "gave up"));
        assert!(!t.mark_skipped(0));
        assert!(!t.mark_completed(0, "late", CompletionKind::Normal, Utc::now()));
        assert_eq!(t.status(0), StepStatus::Failed);
    }

    #[test]
    fn test_record_attempt_ignored_when_not_in_progress() {
        let mut t = tracker();
        t.initialize(0, "web_surfer", "Step A");
        assert_eq!(t.record_attempt(0, "early"), 0);
        assert_eq!(t.record_attempt(7, "missing"), 0);
    }

    #[test]
    fn test_boundary_profiles() {
        let t = tracker();
        let browse = t.boundaries_for("访问官网并浏览产品页");
        assert_eq!((browse.max_actions, browse.time_limit_secs), (4, 180));
        let read = t.boundaries_for("Read the manual");
        assert_eq!((read.max_actions, read.time_limit_secs), (3, 120));
        let plain = t.boundaries_for("Summarize results");
        assert_eq!(plain.profile, "default");
        assert_eq!((plain.max_actions, plain.time_limit_secs), (5, 300));
    }

    #[test]
    fn test_boundary_keywords_match_whole_words() {
        let t = tracker();
        assert_eq!(t.boundaries_for("Spread the thread already").profile, "default");
        assert_eq!(t.boundaries_for("Rewrite the summary").profile, "default");
        assert_eq!(t.boundaries_for("Write the summary").profile, "create");
        assert_eq!(t.boundaries_for("Find the vendor page").profile, "browse");
        assert_eq!(t.boundaries_for("生成产品图像").profile, "generate");
    }

    #[test]
    fn test_boundary_violations() {
        let mut t = tracker();
        t.initialize(0, "coder_agent", "Summarize results");
        let start = Utc::now();
        t.mark_in_progress(0, start);

        let ok = t.boundary_violations(0, 2, 0, start + Duration::seconds(10));
        assert!(!ok.should_force_complete);

        let actions = t.boundary_violations(0, 5, 0, start + Duration::seconds(10));
        assert!(actions.max_actions_exceeded && actions.should_force_complete);
        assert_eq!(actions.completion_kind(), CompletionKind::Boundary);

        let time = t.boundary_violations(0, 0, 0, start + Duration::seconds(301));
        assert!(time.time_limit_exceeded && time.should_force_complete);
        assert_eq!(time.completion_kind(), CompletionKind::Timeout);

        let rep = t.boundary_violations(0, 0, 3, start + Duration::seconds(1));
        assert!(rep.repetition_detected && rep.should_force_complete);
    }

    #[test]
    fn test_quality_score_ordering() {
        let mut t = tracker();
        let now = Utc::now();
        for i in 0..2 {
            t.initialize(i, "web_surfer", "Collect camera specs");
            t.mark_in_progress(i, now - Duration::seconds(150));
        }
        t.mark_completed(0, "✅ 当前步骤已完成: camera specs collected", CompletionKind::Normal, now);
        t.mark_completed(1, "still looking", CompletionKind::Forced, now);
        let normal = t.get(0).unwrap().quality_score;
        let forced = t.get(1).unwrap().quality_score;
        assert!(normal > forced);
        assert!((0.0..=1.0).contains(&normal));
        assert!((forced - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_collected_evidence_in_step_order() {
        let mut t = tracker();
        let now = Utc::now();
        for (i, title) in [(1usize, "B"), (0, "A")] {
            t.initialize(i, "web_surfer", title);
            t.mark_in_progress(i, now);
            t.mark_completed(i, &format!("evidence {title}"), CompletionKind::Normal, now);
        }
        let evidence = t.collected_evidence();
        assert_eq!(evidence.len(), 2);
        assert!(evidence[0].contains("evidence A"));
        assert!(evidence[1].contains("evidence B"));
    }
}
