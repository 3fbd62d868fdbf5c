pub mod audit;
pub mod config;
pub mod drift;
pub mod errors;
pub mod gates;
pub mod locks;
pub mod orchestrator;
pub mod phase;
pub mod project;
pub mod telemetry;

pub use errors::{LockError, StateMachineError};
pub use orchestrator::{StateMachine, TransitionOutcome, build_state_machine};
pub use phase::{Phase, TransitionAction};
pub use project::ProjectState;
