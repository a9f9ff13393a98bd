//! Orchestration layer: the run-state machine, the execution
//! collaborator contract, and the per-project coordinator actor that
//! serializes every mutation.

pub mod coordinator;
pub mod executor;
pub mod orchestrator;

pub use coordinator::{EngineCommand, EngineHandle, ProjectCoordinator, RunStatus, TaskUpdate};
pub use executor::{
    CommandMap, ExecutionOutcome, ExecutionReport, InstantExecutor, ShellExecutor, TaskExecutor,
};
pub use orchestrator::{EngineEvent, Orchestrator, RunState};
