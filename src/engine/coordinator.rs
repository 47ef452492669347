use super::adapter::{AbortResult, EngineAdapter, EngineError, GovernedResult, ResumeResult};
use crate::artifact::{ArtifactStore, RunState, RunStatus, StepStatus};
use crate::audit::{read_audit_log, AuditDraft, AuditEmitter, AuditEventKind, BoundedSinkQueue};
use crate::executor::{execute_step, ExecutionContext, ExecutorRegistry, OutcomeStatus, StepOutcome};
use crate::governance::{evaluate, GovernanceConfig, Verdict};
use crate::shared::ids::generate_run_id;
use crate::workflow::{parse_workflow_file, validate_workflow, OnError, ValidationResult};
use chrono::Utc;
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const DEFAULT_ARTIFACTS_ROOT: &str = ".bcce_runs";

#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub artifacts_root: PathBuf,
    pub model_cli: String,
    /// Global ceiling from BCCE_MAX_RUN_SECONDS, if set.
    pub max_run_seconds: Option<u64>,
    pub dry_run: bool,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            artifacts_root: PathBuf::from(DEFAULT_ARTIFACTS_ROOT),
            model_cli: "claude".to_string(),
            max_run_seconds: None,
            dry_run: false,
        }
    }
}

/// The reference engine adapter: a serial state machine that persists run
/// state around every transition, supervises one executor at a time, and
/// emits the audit trail through a single choke point.
pub struct RunCoordinator {
    options: CoordinatorOptions,
    governance: GovernanceConfig,
    registry: ExecutorRegistry,
    sink: Option<Arc<BoundedSinkQueue>>,
    cancel: Arc<AtomicBool>,
}

impl RunCoordinator {
    pub fn new(options: CoordinatorOptions, governance: GovernanceConfig) -> Self {
        Self {
            options,
            governance,
            registry: ExecutorRegistry::new(),
            sink: None,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_registry(mut self, registry: ExecutorRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_sink(mut self, sink: Arc<BoundedSinkQueue>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Shared flag an embedding application can flip to request an abort of
    /// the in-flight step.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn governance(&self) -> &GovernanceConfig {
        &self.governance
    }

    // ---- run ----------------------------------------------------------

    pub fn run_workflow(&self, workflow_path: &Path) -> Result<GovernedResult, EngineError> {
        let loaded = parse_workflow_file(workflow_path)?;
        let validation = validate_workflow(&loaded.definition, &loaded.base_dir);
        if !validation.valid {
            return Err(EngineError::Validation {
                errors: validation.errors,
            });
        }
        for warning in &validation.warnings {
            warn!(%warning, "workflow validation warning");
        }

        let evaluation = evaluate(&loaded.definition, &self.governance);
        let now = Utc::now().timestamp();
        let run_id = generate_run_id(Utc::now());
        info!(%run_id, verdict = %evaluation.verdict, "governance evaluated");

        // env.artifacts_dir relocates this run's directory; resume and
        // abort look under the configured root, so an override implies the
        // operator points BCCE_ARTIFACTS_ROOT at the same place later.
        let artifacts_root = loaded
            .definition
            .env
            .artifacts_dir
            .clone()
            .unwrap_or_else(|| self.options.artifacts_root.clone());
        let store = ArtifactStore::create(&artifacts_root, &run_id)?;
        let mut emitter = AuditEmitter::open(store.run_dir(), self.sink.clone())?;
        emitter.emit_all(evaluation.audit_drafts, now)?;

        let violation_messages: Vec<String> = evaluation
            .violations
            .iter()
            .map(|violation| violation.message.clone())
            .collect();

        match evaluation.verdict {
            Verdict::Block => {
                let mut state = RunState::new(
                    &run_id,
                    loaded.definition,
                    loaded.base_dir,
                    RunStatus::Blocked,
                    now,
                );
                state.end_time = Some(now);
                store.save_run_state(&state)?;
                self.emit_final_check(&mut emitter, &state)?;
                self.build_result(&store, &state, violation_messages)
            }
            Verdict::RequireApproval => {
                let state = RunState::new(
                    &run_id,
                    loaded.definition,
                    loaded.base_dir,
                    RunStatus::PendingApproval,
                    now,
                );
                store.save_run_state(&state)?;
                emitter.emit(
                    AuditDraft::new(AuditEventKind::ApprovalRequest)
                        .detail("run_id", run_id.as_str())
                        .detail("reason", "governance requires approval before execution"),
                    now,
                )?;
                self.build_result(&store, &state, violation_messages)
            }
            Verdict::Allow | Verdict::Warn => {
                let mut state = RunState::new(
                    &run_id,
                    loaded.definition,
                    loaded.base_dir,
                    RunStatus::Running,
                    now,
                );
                store.save_run_state(&state)?;
                self.drive(&store, &mut state, &mut emitter)?;
                self.build_result(&store, &state, violation_messages)
            }
        }
    }

    // ---- resume -------------------------------------------------------

    pub fn resume_run(
        &self,
        run_id: &str,
        from_step: Option<&str>,
    ) -> Result<ResumeResult, EngineError> {
        let store = ArtifactStore::open(&self.options.artifacts_root, run_id)?;
        let mut state = store.load_run_state()?;

        if state.status == RunStatus::Completed && from_step.is_none() {
            // Resuming a completed run is a no-op by contract.
            return self.build_result(&store, &state, Vec::new());
        }
        // Blocked runs stay blocked, and an approval gate cannot be
        // side-stepped by resuming around it.
        if matches!(
            state.status,
            RunStatus::Blocked | RunStatus::PendingApproval
        ) {
            return Err(EngineError::NotResumable {
                run_id: run_id.to_string(),
                status: state.status,
            });
        }

        let validation = validate_workflow(&state.workflow, &state.workflow_source_dir);
        if !validation.valid {
            return Err(EngineError::Validation {
                errors: validation.errors,
            });
        }

        let now = Utc::now().timestamp();
        let mut emitter = AuditEmitter::open(store.run_dir(), self.sink.clone())?;

        let _ = fs::remove_file(store.abort_marker_path());
        let discarded = store.discard_pending_steps()?;
        for step_id in &discarded {
            debug!(%step_id, "discarded partial step directory");
            emitter.emit(
                AuditDraft::new(AuditEventKind::WorkflowError)
                    .detail("reason", "partial_artifacts_discarded")
                    .detail("step_id", step_id.as_str()),
                now,
            )?;
        }

        self.recover_interrupted_steps(&mut state, &mut emitter, now)?;

        if let Some(from) = from_step {
            let target = state
                .workflow
                .step_index(from)
                .ok_or_else(|| EngineError::UnknownStep {
                    run_id: run_id.to_string(),
                    step_id: from.to_string(),
                })?;
            for result in &mut state.step_results[target..] {
                let step_id = result.step_id.clone();
                *result = crate::artifact::StepResult::pending(step_id);
            }
        }

        state.current_step_index = state.resume_index();

        // A non-idempotent failure stays failed; the operator must rewind
        // explicitly with --from to retry it.
        if let Some(result) = state.step_results.get(state.current_step_index) {
            if result.status == StepStatus::Failed {
                state.status = RunStatus::Failed;
                state.end_time = Some(now);
                store.save_run_state(&state)?;
                let step_id = result.step_id.clone();
                return self.build_result(
                    &store,
                    &state,
                    vec![format!(
                        "step `{step_id}` previously failed; resume with --from {step_id} to retry"
                    )],
                );
            }
        }

        state.status = RunStatus::Running;
        state.end_time = None;
        store.save_run_state(&state)?;
        self.drive(&store, &mut state, &mut emitter)?;
        self.build_result(&store, &state, Vec::new())
    }

    /// A step recorded as `running` at startup is either retried from
    /// scratch (idempotent) or failed, as the very next action; it is
    /// never silently reclassified.
    fn recover_interrupted_steps(
        &self,
        state: &mut RunState,
        emitter: &mut AuditEmitter,
        now: i64,
    ) -> Result<(), EngineError> {
        for index in 0..state.step_results.len() {
            if state.step_results[index].status != StepStatus::Running {
                continue;
            }
            let idempotent = state
                .workflow
                .steps
                .get(index)
                .map(|step| step.idempotent)
                .unwrap_or(false);
            let step_id = state.step_results[index].step_id.clone();
            if idempotent {
                state.step_results[index] = crate::artifact::StepResult::pending(step_id.clone());
                emitter.emit(
                    AuditDraft::new(AuditEventKind::WorkflowError)
                        .detail("reason", "crash_recovery")
                        .detail("step_id", step_id.as_str())
                        .detail("action", "retry"),
                    now,
                )?;
            } else {
                state.step_results[index].status = StepStatus::Failed;
                state.step_results[index].end_time = Some(now);
                state.step_results[index].error =
                    Some("interrupted: coordinator stopped while the step was running".to_string());
                emitter.emit(
                    AuditDraft::new(AuditEventKind::WorkflowError)
                        .detail("reason", "crash_recovery")
                        .detail("step_id", step_id.as_str())
                        .detail("action", "failed"),
                    now,
                )?;
            }
        }
        Ok(())
    }

    // ---- abort --------------------------------------------------------

    pub fn abort_run(&self, run_id: &str, reason: &str) -> Result<AbortResult, EngineError> {
        let store = ArtifactStore::open(&self.options.artifacts_root, run_id)?;
        let mut state = store.load_run_state()?;

        if state.status.is_terminal() {
            return Ok(AbortResult {
                run_id: run_id.to_string(),
                status: state.status,
                reason: reason.to_string(),
            });
        }

        // Signal a live coordinator first; it checks the marker between
        // steps and its executor watches the shared cancel flag.
        fs::write(store.abort_marker_path(), reason.as_bytes()).map_err(|source| {
            EngineError::Artifact(crate::artifact::ArtifactError::Io {
                path: store.abort_marker_path().display().to_string(),
                source,
            })
        })?;
        self.cancel.store(true, Ordering::Relaxed);

        if state.status != RunStatus::Paused {
            let now = Utc::now().timestamp();
            state.status = RunStatus::Paused;
            store.save_run_state(&state)?;
            let mut emitter = AuditEmitter::open(store.run_dir(), self.sink.clone())?;
            emitter.emit(
                AuditDraft::new(AuditEventKind::WorkflowError)
                    .detail("reason", "aborted")
                    .detail("abort_reason", reason),
                now,
            )?;
        }

        Ok(AbortResult {
            run_id: run_id.to_string(),
            status: RunStatus::Paused,
            reason: reason.to_string(),
        })
    }

    // ---- approval -----------------------------------------------------

    pub fn resolve_approval(
        &self,
        run_id: &str,
        approve: bool,
        actor: Option<&str>,
    ) -> Result<GovernedResult, EngineError> {
        let store = ArtifactStore::open(&self.options.artifacts_root, run_id)?;
        let mut state = store.load_run_state()?;
        if state.status != RunStatus::PendingApproval {
            return Err(EngineError::NotAwaitingApproval {
                run_id: run_id.to_string(),
                status: state.status,
            });
        }

        let now = Utc::now().timestamp();
        let mut emitter = AuditEmitter::open(store.run_dir(), self.sink.clone())?;
        let mut draft = AuditDraft::new(AuditEventKind::ApprovalDecision)
            .detail("run_id", run_id)
            .detail("approved", approve);
        if let Some(actor) = actor {
            draft = draft.actor(actor);
        }
        emitter.emit(draft, now)?;

        if approve {
            state.approval_granted = true;
            state.status = RunStatus::Running;
            store.save_run_state(&state)?;
            self.drive(&store, &mut state, &mut emitter)?;
            self.build_result(&store, &state, Vec::new())
        } else {
            state.status = RunStatus::Blocked;
            state.end_time = Some(now);
            store.save_run_state(&state)?;
            self.emit_final_check(&mut emitter, &state)?;
            self.build_result(
                &store,
                &state,
                vec!["approval was rejected; no steps were executed".to_string()],
            )
        }
    }

    // ---- the state machine loop --------------------------------------

    fn drive(
        &self,
        store: &ArtifactStore,
        state: &mut RunState,
        emitter: &mut AuditEmitter,
    ) -> Result<(), EngineError> {
        // The run budget meters active execution: it restarts when a
        // paused or resumed run re-enters the loop.
        let session_start = Utc::now().timestamp();
        let deadline = self
            .effective_run_seconds(state)
            .map(|seconds| session_start + seconds as i64);

        loop {
            let now = Utc::now().timestamp();

            if state.is_finished() {
                state.status = RunStatus::Completed;
                state.end_time = Some(now);
                store.save_run_state(state)?;
                self.emit_final_check(emitter, state)?;
                return Ok(());
            }

            if self.cancel.load(Ordering::Relaxed) || store.abort_marker_path().exists() {
                state.status = RunStatus::Paused;
                store.save_run_state(state)?;
                emitter.emit(
                    AuditDraft::new(AuditEventKind::WorkflowError).detail("reason", "aborted"),
                    now,
                )?;
                return Ok(());
            }

            if let Some(deadline) = deadline {
                if now >= deadline {
                    let index = state.current_step_index;
                    state.status = RunStatus::Failed;
                    state.end_time = Some(now);
                    store.save_run_state(state)?;
                    emitter.emit(
                        AuditDraft::new(AuditEventKind::WorkflowError)
                            .detail("reason", "run_timeout")
                            .detail("step_index", index),
                        now,
                    )?;
                    self.emit_final_check(emitter, state)?;
                    return Ok(());
                }
            }

            let index = state.current_step_index;
            let step = state.workflow.steps[index].clone();
            let step_id = step.id.as_str().to_string();

            state.step_results[index].status = StepStatus::Running;
            state.step_results[index].start_time = Some(now);
            store.save_run_state(state)?;

            emitter.emit(
                AuditDraft::new(AuditEventKind::StepStart)
                    .detail("step_id", step_id.as_str())
                    .detail("step_index", index)
                    .detail("step_type", step.kind.type_name()),
                now,
            )?;

            let outcome = if self.options.dry_run {
                StepOutcome::completed(None, "dry-run: step not executed")
            } else {
                store.begin_step(&step_id)?;
                let remaining = deadline.map(|d| (d - now).max(1) as u64);
                let ctx = ExecutionContext {
                    store,
                    workflow: &state.workflow,
                    workflow_dir: &state.workflow_source_dir,
                    governance: &self.governance,
                    approval_granted: state.approval_granted,
                    model_cli: &self.options.model_cli,
                    run_seconds_remaining: remaining,
                    cancel: &self.cancel,
                };
                execute_step(&step, &ctx, &self.registry)
            };

            let ended = Utc::now().timestamp();

            // An abort observed mid-step leaves the step directory pending
            // so the next resume discards the partial artifacts.
            if self.cancel.load(Ordering::Relaxed) || store.abort_marker_path().exists() {
                state.step_results[index].status = StepStatus::Failed;
                state.step_results[index].end_time = Some(ended);
                state.step_results[index].error = Some("aborted".to_string());
                state.status = RunStatus::Paused;
                store.save_run_state(state)?;
                emitter.emit(
                    AuditDraft::new(AuditEventKind::WorkflowError)
                        .detail("reason", "aborted")
                        .detail("step_id", step_id.as_str()),
                    ended,
                )?;
                return Ok(());
            }

            if !self.options.dry_run {
                // Durability barrier: artifacts are finalized before the
                // step_end event and before the index advances.
                store.finalize_step(&step_id)?;
            }

            if outcome.security_violation {
                emitter.emit(
                    AuditDraft::new(AuditEventKind::PolicyViolation)
                        .detail("severity", "high")
                        .detail("step_id", step_id.as_str())
                        .detail(
                            "message",
                            outcome.error.clone().unwrap_or_default(),
                        ),
                    ended,
                )?;
            }

            emitter.emit(
                AuditDraft::new(AuditEventKind::StepEnd)
                    .detail("step_id", step_id.as_str())
                    .detail("step_index", index)
                    .detail(
                        "status",
                        match outcome.status {
                            OutcomeStatus::Completed => "completed",
                            OutcomeStatus::Failed => "failed",
                            OutcomeStatus::PendingApproval => "pending_approval",
                        },
                    )
                    .detail("exit_code", outcome.exit_code.unwrap_or_default())
                    .detail("timed_out", outcome.timed_out),
                ended,
            )?;

            match outcome.status {
                OutcomeStatus::PendingApproval => {
                    // The step did not run; it re-executes after approval.
                    state.step_results[index] =
                        crate::artifact::StepResult::pending(step_id.clone());
                    state.status = RunStatus::PendingApproval;
                    store.save_run_state(state)?;
                    emitter.emit(
                        AuditDraft::new(AuditEventKind::ApprovalRequest)
                            .detail("step_id", step_id.as_str())
                            .detail("reason", outcome.output.as_str()),
                        ended,
                    )?;
                    return Ok(());
                }
                OutcomeStatus::Completed => {
                    let result = &mut state.step_results[index];
                    result.status = if self.options.dry_run {
                        StepStatus::Skipped
                    } else {
                        StepStatus::Completed
                    };
                    result.end_time = Some(ended);
                    result.exit_code = outcome.exit_code;
                    result.output = Some(truncate_for_state(&outcome.output));
                    state.current_step_index = index + 1;
                    store.save_run_state(state)?;
                }
                OutcomeStatus::Failed => {
                    let result = &mut state.step_results[index];
                    result.status = StepStatus::Failed;
                    result.end_time = Some(ended);
                    result.exit_code = outcome.exit_code;
                    result.error = outcome.error.clone();
                    if step.on_error == OnError::Continue {
                        state.current_step_index = index + 1;
                        store.save_run_state(state)?;
                        warn!(%step_id, "step failed; continuing per on_error policy");
                    } else {
                        state.status = RunStatus::Failed;
                        state.end_time = Some(ended);
                        store.save_run_state(state)?;
                        emitter.emit(
                            AuditDraft::new(AuditEventKind::WorkflowError)
                                .detail("reason", "step_failed")
                                .detail("step_id", step_id.as_str())
                                .detail(
                                    "resume_from",
                                    format!("bcce workflow resume {} --from {step_id}", state.run_id),
                                ),
                            ended,
                        )?;
                        self.emit_final_check(emitter, state)?;
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Closing `governance_check` carrying the final status, pairing the
    /// opening check emitted at evaluation time.
    fn emit_final_check(
        &self,
        emitter: &mut AuditEmitter,
        state: &RunState,
    ) -> Result<(), EngineError> {
        let now = Utc::now().timestamp();
        emitter.emit(
            AuditDraft::new(AuditEventKind::GovernanceCheck)
                .detail("workflow", state.workflow.name.as_str())
                .detail("final_status", state.status.as_str()),
            now,
        )?;
        Ok(())
    }

    fn effective_run_seconds(&self, state: &RunState) -> Option<u64> {
        [
            state.workflow.env.max_runtime_seconds,
            self.governance
                .cost_controls
                .timeout_minutes
                .map(|minutes| minutes * 60),
            self.options.max_run_seconds,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    fn build_result(
        &self,
        store: &ArtifactStore,
        state: &RunState,
        errors: Vec<String>,
    ) -> Result<GovernedResult, EngineError> {
        let audit_trail = read_audit_log(store.run_dir())?;
        let compliant = !audit_trail.iter().any(|record| {
            record.event == AuditEventKind::PolicyViolation
                && record.details.get("severity").and_then(Value::as_str) == Some("block")
        });
        Ok(GovernedResult {
            status: state.status,
            run_id: state.run_id.clone(),
            workflow_name: state.workflow.name.clone(),
            applied_policies: self.governance.applied_policy_names(),
            compliant,
            audit_trail,
            execution: json!({
                "current_step_index": state.current_step_index,
                "step_results": state.step_results,
            }),
            errors,
        })
    }

    /// Read-only view of a persisted run, for the status command.
    pub fn run_status(&self, run_id: &str) -> Result<RunState, EngineError> {
        let store = ArtifactStore::open(&self.options.artifacts_root, run_id)?;
        Ok(store.load_run_state()?)
    }
}

impl EngineAdapter for RunCoordinator {
    fn execute_with_governance(&self, workflow_path: &Path) -> Result<GovernedResult, EngineError> {
        self.run_workflow(workflow_path)
    }

    fn validate(&self, workflow_path: &Path) -> Result<ValidationResult, EngineError> {
        let loaded = parse_workflow_file(workflow_path)?;
        Ok(validate_workflow(&loaded.definition, &loaded.base_dir))
    }

    fn resume(&self, run_id: &str, from_step: Option<&str>) -> Result<ResumeResult, EngineError> {
        self.resume_run(run_id, from_step)
    }

    fn abort(&self, run_id: &str, reason: &str) -> Result<AbortResult, EngineError> {
        self.abort_run(run_id, reason)
    }
}

const STATE_OUTPUT_LIMIT: usize = 4096;

/// Step outputs are capped inside run-state.json; the full text lives in
/// the step's output.txt artifact.
fn truncate_for_state(output: &str) -> String {
    if output.len() <= STATE_OUTPUT_LIMIT {
        return output.to_string();
    }
    let mut end = STATE_OUTPUT_LIMIT;
    while !output.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}[TRUNCATED]", &output[..end])
}

