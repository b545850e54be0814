//! 编排过程事件：供前端流式展示步骤进度

use serde::Serialize;

use crate::execution::{CompletionKind, Severity};
use crate::plan::AgentRole;

/// 可序列化为 JSON 的过程事件；step 均为从 1 开始的序号
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    /// 计划已接受
    PlanAccepted { steps: usize },
    StepStarted {
        step: usize,
        title: String,
        agent: AgentRole,
    },
    /// 指令已派发；resend 表示收到过期回复后重发同一条指令
    Dispatched {
        step: usize,
        agent: AgentRole,
        attempt: u32,
        resend: bool,
    },
    /// 回复被丢弃（步骤索引不符或步骤已结束）
    ResponseDiscarded { tagged_step: usize, current_step: usize },
    /// 防循环信号（warn / block / force_complete）
    LoopSignal {
        step: usize,
        severity: Severity,
        reason: String,
    },
    StepCompleted {
        step: usize,
        kind: CompletionKind,
        quality_score: f64,
        strategy: Option<String>,
    },
    Replanned {
        reason: String,
        replan_count: u32,
        kept_steps: usize,
        total_steps: usize,
    },
    /// 传输失败后的恢复动作
    TransportRecovery { stage: String, action: String, error: String },
    FinalAnswer { text: String },
    /// 运行暂停（唯一的致命路径）
    Paused { reason: String },
    Cancelled,
}
