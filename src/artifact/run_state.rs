use crate::workflow::WorkflowDefinition;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Paused,
    Blocked,
    PendingApproval,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Paused => "paused",
            Self::Blocked => "blocked",
            Self::PendingApproval => "pending-approval",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Blocked)
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Running, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Paused)
                | (Self::Running, Self::PendingApproval)
                | (Self::PendingApproval, Self::Running)
                | (Self::PendingApproval, Self::Blocked)
                | (Self::Paused, Self::Running)
                | (Self::Paused, Self::Failed)
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn is_settled(self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub step_id: String,
    pub status: StepStatus,
    #[serde(default)]
    pub start_time: Option<i64>,
    #[serde(default)]
    pub end_time: Option<i64>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl StepResult {
    pub fn pending(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Pending,
            start_time: None,
            end_time: None,
            exit_code: None,
            output: None,
            error: None,
        }
    }
}

/// The state-machine memento for one run: everything needed to resume after
/// a crash, including the workflow itself and where its relative paths
/// resolve from.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunState {
    pub run_id: String,
    pub workflow: WorkflowDefinition,
    pub workflow_source_dir: PathBuf,
    pub current_step_index: usize,
    pub start_time: i64,
    #[serde(default)]
    pub end_time: Option<i64>,
    pub status: RunStatus,
    #[serde(default)]
    pub approval_granted: bool,
    pub step_results: Vec<StepResult>,
}

impl RunState {
    pub fn new(
        run_id: impl Into<String>,
        workflow: WorkflowDefinition,
        workflow_source_dir: PathBuf,
        status: RunStatus,
        now: i64,
    ) -> Self {
        let step_results = workflow
            .steps
            .iter()
            .map(|step| StepResult::pending(step.id.as_str()))
            .collect();
        Self {
            run_id: run_id.into(),
            workflow,
            workflow_source_dir,
            current_step_index: 0,
            start_time: now,
            end_time: None,
            status,
            approval_granted: false,
            step_results,
        }
    }

    /// Smallest index whose result is not yet settled; equals `steps.len()`
    /// when every step is done.
    pub fn first_unsettled_index(&self) -> usize {
        self.step_results
            .iter()
            .position(|result| !result.status.is_settled())
            .unwrap_or(self.step_results.len())
    }

    /// Where resumption restarts: the first step that is neither settled
    /// nor a failure the workflow explicitly continued past.
    pub fn resume_index(&self) -> usize {
        self.step_results
            .iter()
            .enumerate()
            .position(|(index, result)| match result.status {
                StepStatus::Completed | StepStatus::Skipped => false,
                StepStatus::Failed => !matches!(
                    self.workflow.steps.get(index).map(|step| step.on_error),
                    Some(crate::workflow::OnError::Continue)
                ),
                _ => true,
            })
            .unwrap_or(self.step_results.len())
    }

    pub fn is_finished(&self) -> bool {
        self.current_step_index >= self.workflow.steps.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_use_kebab_case() {
        let encoded = serde_json::to_string(&RunStatus::PendingApproval).expect("encode");
        assert_eq!(encoded, "\"pending-approval\"");
    }

    #[test]
    fn terminal_statuses_accept_no_transitions() {
        for status in [RunStatus::Completed, RunStatus::Failed, RunStatus::Blocked] {
            assert!(status.is_terminal());
            assert!(!status.can_transition_to(RunStatus::Running));
        }
    }

    #[test]
    fn pending_approval_resolves_to_running_or_blocked() {
        assert!(RunStatus::PendingApproval.can_transition_to(RunStatus::Running));
        assert!(RunStatus::PendingApproval.can_transition_to(RunStatus::Blocked));
        assert!(!RunStatus::PendingApproval.can_transition_to(RunStatus::Completed));
    }
}
