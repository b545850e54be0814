//! 执行层：步骤追踪、完成判定、角色分配、防循环、全局上下文与指令合成
//!
//! 这里全部是同步、无 I/O 的决策逻辑，由 core::orchestrator 的异步外壳驱动。

pub mod allocator;
pub mod classifier;
pub mod context;
pub mod instruction;
pub mod loop_guard;
pub mod tokenizer;
pub mod tracker;

pub use allocator::AgentAllocator;
pub use classifier::{Classification, CompletionClassifier, CompletionStrategy, KeywordTables};
pub use context::GlobalContext;
pub use instruction::{FollowUp, InstructionBuilder};
pub use loop_guard::{ActionType, AgentAction, GuardDecision, LoopGuard, LoopGuardState, Severity};
pub use tracker::{
    BoundaryViolations, CompletionKind, StepBoundaries, StepExecutionState, StepExecutionTracker, StepStatus,
};

/// 按字符截断，超出部分以省略号结尾
pub(crate) fn excerpt(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push('…');
    out
}
