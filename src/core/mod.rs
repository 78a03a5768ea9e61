//! 核心层：错误与恢复、交互状态机、会话监管、优雅关闭、运行时装配

pub mod builder;
pub mod error;
pub mod recovery;
pub mod session_supervisor;
pub mod shutdown;
pub mod state;

pub use builder::{Runtime, RuntimeBuilder};
pub use error::{OrchestratorError, RecoveryAction};
pub use recovery::{RecoveryEngine, RecoveryStage};
pub use session_supervisor::{SessionHandle, SessionSupervisor};
pub use shutdown::{run_with_graceful_shutdown, ShutdownManager, ShutdownReason};
pub use state::{DispatchState, StateTrace};
