pub mod agent;
pub mod apply_diff;
pub mod cmd;
pub mod patch;
pub mod process;
pub mod prompt;

use crate::artifact::ArtifactStore;
use crate::governance::GovernanceConfig;
use crate::workflow::{AgentPolicy, Step, StepKind, WorkflowDefinition};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

pub use process::{SpawnOutcome, SupervisedCommand, SupervisedExit, TRUNCATION_MARKER};

pub const METRICS_FILE: &str = "metrics.json";
pub const ERROR_FILE: &str = "error.txt";
pub const OUTPUT_FILE: &str = "output.txt";

const DEFAULT_CMD_TIMEOUT_SECONDS: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeStatus {
    Completed,
    Failed,
    PendingApproval,
}

/// The normalized result every executor returns. Executors never propagate
/// errors across this boundary; anything that goes wrong becomes a failed
/// outcome with a diagnostic.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub status: OutcomeStatus,
    pub exit_code: Option<i32>,
    pub output: String,
    pub error: Option<String>,
    pub artifacts_written: Vec<String>,
    pub timed_out: bool,
    pub security_violation: bool,
}

impl StepOutcome {
    pub fn completed(exit_code: Option<i32>, output: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Completed,
            exit_code,
            output: output.into(),
            error: None,
            artifacts_written: Vec::new(),
            timed_out: false,
            security_violation: false,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Failed,
            exit_code: None,
            output: String::new(),
            error: Some(error.into()),
            artifacts_written: Vec::new(),
            timed_out: false,
            security_violation: false,
        }
    }

    pub fn pending_approval(reason: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::PendingApproval,
            exit_code: None,
            output: reason.into(),
            error: None,
            artifacts_written: Vec::new(),
            timed_out: false,
            security_violation: false,
        }
    }

    pub fn with_artifacts(mut self, artifacts: Vec<String>) -> Self {
        self.artifacts_written = artifacts;
        self
    }

    pub fn security(mut self) -> Self {
        self.security_violation = true;
        self
    }
}

/// Everything an executor needs from the coordinator for one step.
pub struct ExecutionContext<'a> {
    pub store: &'a ArtifactStore,
    pub workflow: &'a WorkflowDefinition,
    pub workflow_dir: &'a Path,
    pub governance: &'a GovernanceConfig,
    pub approval_granted: bool,
    pub model_cli: &'a str,
    /// Seconds left in the tightest applicable run-level budget, if any.
    pub run_seconds_remaining: Option<u64>,
    pub cancel: &'a AtomicBool,
}

impl ExecutionContext<'_> {
    /// The effective hard timeout for a step: the step's own budget where
    /// one exists (agent policy, or the workflow env ceiling for commands),
    /// clamped by whatever remains of the run budget.
    pub fn step_timeout(&self, policy: Option<&AgentPolicy>) -> Duration {
        let mut seconds = match policy {
            Some(policy) => policy.timeout_seconds,
            None => self
                .workflow
                .env
                .max_runtime_seconds
                .unwrap_or(DEFAULT_CMD_TIMEOUT_SECONDS),
        };
        if let Some(remaining) = self.run_seconds_remaining {
            seconds = seconds.min(remaining.max(1));
        }
        Duration::from_secs(seconds.max(1))
    }

    /// Commands allowed for `cmd` steps: the workflow-level list plus the
    /// governance-level list.
    pub fn command_allowlist(&self) -> Vec<&str> {
        self.workflow
            .command_allowlist
            .iter()
            .map(String::as_str)
            .chain(self.governance.command_allowlist.iter().map(String::as_str))
            .collect()
    }
}

/// Executes `custom` steps registered by an embedding application.
pub trait CustomExecutor: Send + Sync {
    fn execute(&self, step: &Step, payload: &Value, ctx: &ExecutionContext<'_>) -> StepOutcome;
}

#[derive(Default)]
pub struct ExecutorRegistry {
    custom: BTreeMap<String, Box<dyn CustomExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, runner: impl Into<String>, executor: Box<dyn CustomExecutor>) {
        self.custom.insert(runner.into(), executor);
    }

    pub fn get(&self, runner: &str) -> Option<&dyn CustomExecutor> {
        self.custom.get(runner).map(Box::as_ref)
    }
}

/// Dispatch one step to its executor. The step directory has already been
/// opened by the coordinator via `begin_step`.
pub fn execute_step(
    step: &Step,
    ctx: &ExecutionContext<'_>,
    registry: &ExecutorRegistry,
) -> StepOutcome {
    match &step.kind {
        StepKind::Prompt(payload) => prompt::execute(step, payload, ctx),
        StepKind::Cmd(payload) => cmd::execute(step, payload, ctx),
        StepKind::Agent(payload) => agent::execute(step, payload, ctx),
        StepKind::ApplyDiff(payload) => apply_diff::execute(step, payload, ctx),
        StepKind::Custom(payload) => match registry.get(&payload.runner) {
            Some(executor) => executor.execute(step, &payload.payload, ctx),
            None => write_failure(
                ctx,
                step.id.as_str(),
                format!(
                    "no custom executor registered for runner `{}`",
                    payload.runner
                ),
            ),
        },
    }
}

/// Record a failure diagnostic as `error.txt` and return the failed
/// outcome. Falls back to the outcome alone if even that write fails.
pub(crate) fn write_failure(
    ctx: &ExecutionContext<'_>,
    step_id: &str,
    error: String,
) -> StepOutcome {
    let mut artifacts = Vec::new();
    if ctx
        .store
        .write_step_file(step_id, ERROR_FILE, error.as_bytes())
        .is_ok()
    {
        artifacts.push(ERROR_FILE.to_string());
    }
    StepOutcome::failed(error).with_artifacts(artifacts)
}
