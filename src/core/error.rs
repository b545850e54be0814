//! 编排错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：传输失败时决定 RetryAfter / Degrade / Pause。
//! 分类、防循环、步骤追踪层面的情况都在循环内部消化，不会变成错误。

use std::time::Duration;

use thiserror::Error;

use crate::core::state::RunPhase;
use crate::plan::AgentRole;

/// 与外部协作方（智能体、规划器、答案合成）通信时的失败
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connection(String),

    /// 对方明确拒绝（如参数非法），重试没有意义
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransportError::Rejected(_))
    }
}

/// 传播到调用方的错误：只有基础设施失败与调用方误用
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// 重试与降级均失败，运行已暂停
    #[error("agent {role} is unavailable at step {step}: {cause}")]
    AgentUnavailable {
        role: AgentRole,
        /// 从 1 开始的步骤序号
        step: usize,
        cause: TransportError,
        partial_evidence: Vec<String>,
    },

    #[error("planner is unavailable: {cause}")]
    PlannerUnavailable {
        cause: TransportError,
        partial_evidence: Vec<String>,
    },

    #[error("final answer synthesis is unavailable: {cause}")]
    SynthesisUnavailable {
        cause: TransportError,
        partial_evidence: Vec<String>,
    },

    #[error("run is {0:?} and cannot be driven further")]
    InvalidPhase(RunPhase),
}

impl OrchestratorError {
    /// 暂停前已收集到的证据
    pub fn partial_evidence(&self) -> &[String] {
        match self {
            OrchestratorError::AgentUnavailable { partial_evidence, .. }
            | OrchestratorError::PlannerUnavailable { partial_evidence, .. }
            | OrchestratorError::SynthesisUnavailable { partial_evidence, .. } => partial_evidence,
            OrchestratorError::InvalidPhase(_) => &[],
        }
    }

    /// 面向用户的说明：原因 + 已获得的部分结果
    pub fn user_message(&self) -> String {
        let evidence = self.partial_evidence();
        if evidence.is_empty() {
            return format!("运行已暂停：{self}");
        }
        format!("运行已暂停：{self}\n已获得的部分结果：\n{}", evidence.join("\n"))
    }
}

/// 恢复引擎根据传输失败给出的建议动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 等待后原样重试
    RetryAfter(Duration),
    /// 改发一次简化的非结构化请求
    Degrade,
    /// 放弃，暂停运行并通知用户
    Pause(String),
}
