//! `engine` crate: the trigger-propagation executor for workflow graphs,
//! with run control, checkpointing and loop bookkeeping.

pub mod checkpoint;
pub mod config;
pub mod control;
pub mod error;
pub mod executor;
pub mod loops;

pub use checkpoint::Checkpoint;
pub use config::{EndPolicy, ExecutorConfig, SyncFailurePolicy};
pub use control::RunStatus;
pub use error::EngineError;
pub use executor::{DebugEvent, ExecutionOutcome, WorkflowExecutor};
pub use loops::LoopIndex;
