pub mod config;
pub mod engine;

pub use config::{AuditLevel, CostControls, GovernanceConfig, GovernanceError, PolicyKind};
pub use engine::{evaluate, PolicyEvaluation, PolicyViolation, ReasonCode, Verdict};
