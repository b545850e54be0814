//! Maestro - 多智能体任务编排器
//!
//! 模块划分：
//! - **plan**: 计划与步骤模型、智能体角色
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **execution**: 步骤追踪、完成判定、角色分配、防循环、全局上下文与指令合成
//! - **agents**: 智能体 / 规划器 / 答案合成的边界 trait 与 Mock 实现
//! - **core**: 主控循环、错误与恢复、会话监管、运行快照与持久化
//! - **observability**: 日志初始化

pub mod agents;
pub mod config;
pub mod core;
pub mod execution;
pub mod observability;
pub mod plan;

pub use crate::core::{Collaborators, OrchestrationLoop, OrchestratorError, RunOutcome};
pub use plan::{AgentRole, Plan, Step};
