pub mod adapter;
pub mod coordinator;

pub use adapter::{AbortResult, EngineAdapter, EngineError, GovernedResult, ResumeResult};
pub use coordinator::{CoordinatorOptions, RunCoordinator};
