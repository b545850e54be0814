//! 运行状态：阶段、结果与可持久化快照
//!
//! 快照包含计划、当前步骤索引、全部步骤状态、全局上下文与防循环状态，重启后可原样恢复。

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::execution::{GlobalContext, LoopGuardState, StepExecutionState};
use crate::plan::Plan;

/// 运行阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    /// 等待规划器给出计划
    Planning,
    Executing,
    /// 传输失败后暂停，可再次驱动以恢复
    Paused,
    Finalized,
    Cancelled,
}

impl RunPhase {
    /// 还能继续驱动
    pub fn is_resumable(&self) -> bool {
        matches!(self, RunPhase::Planning | RunPhase::Executing | RunPhase::Paused)
    }
}

/// 一次运行的结束方式（都不是错误）
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed { final_answer: String },
    /// 重新规划次数耗尽，给出尽力而为的答案
    BestEffort { final_answer: String, reason: String },
    /// 用户取消，基于已有证据的部分答案
    Cancelled { partial_answer: String },
}

impl RunOutcome {
    pub fn answer(&self) -> &str {
        match self {
            RunOutcome::Completed { final_answer } | RunOutcome::BestEffort { final_answer, .. } => final_answer,
            RunOutcome::Cancelled { partial_answer } => partial_answer,
        }
    }
}

/// 可持久化的运行快照
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: String,
    pub task: String,
    pub phase: RunPhase,
    pub plan: Option<Plan>,
    pub current_step_idx: usize,
    pub replan_count: u32,
    #[serde(default)]
    pub forced_streak: u32,
    pub steps: BTreeMap<usize, StepExecutionState>,
    pub context: GlobalContext,
    pub loop_guard: LoopGuardState,
    #[serde(default)]
    pub final_answer: Option<String>,
    pub saved_at: DateTime<Utc>,
}

impl RunSnapshot {
    /// 序列化为不透明字节串
    pub fn to_blob(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_blob(blob: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(blob)
    }
}
