pub mod control;
pub mod guard;
pub mod shutdown;
pub mod state;

pub use control::{Orchestrator, RunSummary, StopReason};
pub use guard::StateStore;
pub use shutdown::{Shutdown, request_stop};
pub use state::{OrchestratorState, RetryInfo, Warning, WarningKind, WorkerSlot};
