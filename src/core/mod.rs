//! 核心层：错误分类、取消、重试策略、会话状态、主控编排

pub mod cancel;
pub mod error;
pub mod orchestrator;
pub mod retry;
pub mod state;

pub use cancel::{ensure_active, run_cancelable, Cancelled};
pub use error::{format_for_user, ErrorKind, PipelineError};
pub use orchestrator::{Orchestrator, OrchestratorSettings, TurnRequest, CANCELLED_REPLY};
pub use retry::{attempt_with_feedback, AttemptContext, Attempted, RetryError, RetryPolicy};
pub use state::{
    FilterHint, HintOperator, SessionMetadata, SessionState, TriageContext, TurnPhase, TurnResult,
    TurnStatus,
};
