use crate::artifact::{ArtifactError, RunStatus};
use crate::audit::{AuditError, AuditRecord};
use crate::governance::GovernanceError;
use crate::workflow::{ValidationResult, WorkflowError};
use serde::Serialize;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
    #[error("workflow validation failed: {}", errors.join("; "))]
    Validation { errors: Vec<String> },
    #[error(transparent)]
    Governance(#[from] GovernanceError),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error(transparent)]
    Audit(#[from] AuditError),
    #[error("run `{run_id}` is not awaiting approval (status is {status})")]
    NotAwaitingApproval { run_id: String, status: RunStatus },
    #[error("run `{run_id}` has no step `{step_id}` to resume from")]
    UnknownStep { run_id: String, step_id: String },
    #[error("run `{run_id}` cannot be resumed while its status is {status}")]
    NotResumable { run_id: String, status: RunStatus },
}

impl EngineError {
    /// Exit code for the operator CLI: 2 for configuration problems the
    /// operator fixes before a run exists, 1 for everything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Workflow(_) | Self::Validation { .. } | Self::Governance(_) => 2,
            _ => 1,
        }
    }

    pub fn fix_hint(&self) -> Option<String> {
        match self {
            Self::Workflow(err) => err.fix_hint(),
            Self::Governance(err) => err.fix_hint(),
            Self::Artifact(err) => err.fix_hint(),
            Self::Validation { .. } => Some(
                "Fix: correct the listed validation errors, then re-run `bcce workflow validate`"
                    .to_string(),
            ),
            Self::UnknownStep { run_id, .. } => Some(format!(
                "Fix: inspect `bcce workflow status {run_id}` for the list of step ids"
            )),
            _ => None,
        }
    }
}

/// The outcome of a governed execution: final status plus everything an
/// external consumer needs to audit the run without reading the run
/// directory.
#[derive(Debug, Clone, Serialize)]
pub struct GovernedResult {
    pub status: RunStatus,
    pub run_id: String,
    pub workflow_name: String,
    pub applied_policies: Vec<String>,
    pub compliant: bool,
    pub audit_trail: Vec<AuditRecord>,
    pub execution: serde_json::Value,
    pub errors: Vec<String>,
}

pub type ResumeResult = GovernedResult;

#[derive(Debug, Clone, Serialize)]
pub struct AbortResult {
    pub run_id: String,
    pub status: RunStatus,
    pub reason: String,
}

/// The façade shared by every workflow engine that wants this governance
/// wrapper. Adapters never reorder steps and never mutate the workflow
/// definition; the run coordinator is the reference implementation.
pub trait EngineAdapter {
    fn execute_with_governance(&self, workflow_path: &Path) -> Result<GovernedResult, EngineError>;

    fn validate(&self, workflow_path: &Path) -> Result<ValidationResult, EngineError>;

    fn resume(&self, run_id: &str, from_step: Option<&str>) -> Result<ResumeResult, EngineError>;

    fn abort(&self, run_id: &str, reason: &str) -> Result<AbortResult, EngineError>;
}
