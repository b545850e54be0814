//! 核心编排层：错误与恢复、运行状态与持久化、会话监管、过程事件、主控循环

pub mod error;
pub mod events;
pub mod orchestrator;
pub mod persistence;
pub mod recovery;
pub mod session_supervisor;
pub mod state;

pub use error::{OrchestratorError, RecoveryAction, TransportError};
pub use events::OrchestratorEvent;
pub use orchestrator::{Collaborators, OrchestrationLoop, StepDecision};
pub use persistence::RunStatePersistence;
pub use recovery::RecoveryEngine;
pub use session_supervisor::SessionSupervisor;
pub use state::{RunOutcome, RunPhase, RunSnapshot};
