use super::agent::TRANSCRIPT_FILE;
use super::patch::{apply_file_diff, extract_diff_blocks, parse_unified_diff, FileDiff};
use super::process::{run_supervised, SpawnOutcome, SupervisedCommand};
use super::{write_failure, ExecutionContext, StepOutcome, METRICS_FILE, OUTPUT_FILE};
use crate::shared::fs_atomic::atomic_write_file;
use crate::workflow::{ApplyDiffStep, Step, StepKind};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde_json::json;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Instant;

pub const DIFF_FILE: &str = "diff.patch";
pub const BACKUP_DIR: &str = "backup";

pub const REASON_PATH_NOT_ALLOWED: &str = "path_not_allowed";
pub const REASON_PATH_ESCAPE: &str = "path_escape";
pub const REASON_DIFF_CONFLICT: &str = "diff_conflict";
pub const REASON_NO_DIFFS: &str = "no_diffs_found";
pub const REASON_APPLY_FAILED: &str = "apply_failed";
pub const REASON_VERIFY_FAILED: &str = "verify_failed";

/// Apply diffs proposed by earlier agent steps to the workflow tree,
/// all-or-none, after safety checks against the effective path policy.
pub fn execute(step: &Step, payload: &ApplyDiffStep, ctx: &ExecutionContext<'_>) -> StepOutcome {
    let step_id = step.id.as_str();
    let started = Instant::now();

    let (diffs, raw_patch) = match collect_prior_diffs(step, ctx) {
        Ok(found) => found,
        Err(outcome) => return *outcome,
    };

    // Conflicting proposals are rejected outright rather than merged.
    let mut targets = BTreeSet::new();
    for diff in &diffs {
        if !targets.insert(diff.target_path().to_string()) {
            return write_failure(
                ctx,
                step_id,
                format!(
                    "{REASON_DIFF_CONFLICT}: more than one diff touches `{}`",
                    diff.target_path()
                ),
            );
        }
    }

    let allowed = match effective_allowed_paths(step, ctx) {
        Ok(set) => set,
        Err(err) => return write_failure(ctx, step_id, err),
    };
    for diff in &diffs {
        if let Err(outcome) = check_path_safety(diff.target_path(), &allowed, ctx, step_id) {
            return *outcome;
        }
    }

    if payload.approve && ctx.governance.approval_required && !ctx.approval_granted {
        return StepOutcome::pending_approval(format!(
            "{} diff(s) await operator approval",
            diffs.len()
        ));
    }

    // Stage every new file content in memory before touching the tree; a
    // parse or context failure here costs nothing.
    let mut staged: Vec<(PathBuf, String)> = Vec::with_capacity(diffs.len());
    let mut backups: Vec<(PathBuf, Option<String>)> = Vec::with_capacity(diffs.len());
    for diff in &diffs {
        let target = ctx.workflow_dir.join(diff.target_path());
        let original = if diff.creates_file() {
            None
        } else {
            match fs::read_to_string(&target) {
                Ok(contents) => Some(contents),
                Err(err) => {
                    return write_failure(
                        ctx,
                        step_id,
                        format!(
                            "{REASON_APPLY_FAILED}: cannot read `{}`: {err}",
                            diff.target_path()
                        ),
                    )
                }
            }
        };
        match apply_file_diff(original.as_deref().unwrap_or(""), diff) {
            Ok(next) => staged.push((target.clone(), next)),
            Err(err) => {
                return write_failure(
                    ctx,
                    step_id,
                    format!(
                        "{REASON_APPLY_FAILED}: diff for `{}` does not apply: {err}",
                        diff.target_path()
                    ),
                )
            }
        }
        backups.push((target, original));
    }

    let mut artifacts = Vec::new();
    if let Err(err) = write_backups(ctx, step_id, &backups) {
        return write_failure(ctx, step_id, err);
    }
    artifacts.push(BACKUP_DIR.to_string());

    // Point of no return: write everything, roll back everything on the
    // first failure.
    for (index, (target, content)) in staged.iter().enumerate() {
        if let Err(err) = write_target(target, content) {
            rollback(&backups[..=index]);
            return write_failure(
                ctx,
                step_id,
                format!(
                    "{REASON_APPLY_FAILED}: writing `{}` failed ({err}); all files restored",
                    target.display()
                ),
            );
        }
    }

    // Post-conditions: every written file exists with the staged size.
    for (target, content) in &staged {
        let ok = fs::metadata(target)
            .map(|meta| meta.len() == content.len() as u64)
            .unwrap_or(false);
        if !ok {
            rollback(&backups);
            return write_failure(
                ctx,
                step_id,
                format!(
                    "{REASON_APPLY_FAILED}: `{}` failed post-apply verification; all files restored",
                    target.display()
                ),
            );
        }
    }

    if let Some(verify) = &payload.verify_command {
        if let Err(reason) = run_verifier(verify, ctx) {
            rollback(&backups);
            return write_failure(
                ctx,
                step_id,
                format!("{REASON_VERIFY_FAILED}: {reason}; all files restored"),
            );
        }
    }

    if ctx
        .store
        .write_step_file(step_id, DIFF_FILE, raw_patch.as_bytes())
        .is_ok()
    {
        artifacts.push(DIFF_FILE.to_string());
    }
    let summary = format!(
        "applied {} diff(s): {}\n",
        staged.len(),
        diffs
            .iter()
            .map(|d| d.target_path().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
    if ctx
        .store
        .write_step_file(step_id, OUTPUT_FILE, summary.as_bytes())
        .is_ok()
    {
        artifacts.push(OUTPUT_FILE.to_string());
    }
    let metrics = json!({
        "duration_seconds": started.elapsed().as_secs_f64(),
        "exit_code": 0,
        "timed_out": false,
        "files_changed": staged.len(),
    });
    if ctx
        .store
        .write_step_file(step_id, METRICS_FILE, metrics.to_string().as_bytes())
        .is_ok()
    {
        artifacts.push(METRICS_FILE.to_string());
    }

    StepOutcome::completed(Some(0), summary).with_artifacts(artifacts)
}

/// Walk earlier steps in workflow order and gather every fenced diff from
/// their transcripts.
fn collect_prior_diffs(
    step: &Step,
    ctx: &ExecutionContext<'_>,
) -> Result<(Vec<FileDiff>, String), Box<StepOutcome>> {
    let step_id = step.id.as_str();
    let own_index = ctx
        .workflow
        .step_index(step_id)
        .unwrap_or(ctx.workflow.steps.len());

    let mut diffs = Vec::new();
    let mut raw_patch = String::new();
    for prior in ctx.workflow.steps.iter().take(own_index) {
        let transcript_path = ctx.store.step_dir(prior.id.as_str()).join(TRANSCRIPT_FILE);
        let Ok(transcript) = fs::read_to_string(&transcript_path) else {
            continue;
        };
        for block in extract_diff_blocks(&transcript) {
            match parse_unified_diff(&block) {
                Ok(parsed) => {
                    raw_patch.push_str(&block);
                    diffs.extend(parsed);
                }
                Err(err) => {
                    return Err(Box::new(write_failure(
                        ctx,
                        step_id,
                        format!(
                            "{REASON_APPLY_FAILED}: transcript of step `{}` contains an unparseable diff: {err}",
                            prior.id
                        ),
                    )))
                }
            }
        }
    }
    if diffs.is_empty() {
        return Err(Box::new(write_failure(
            ctx,
            step_id,
            format!("{REASON_NO_DIFFS}: no prior step produced a diff to apply"),
        )));
    }
    Ok((diffs, raw_patch))
}

/// The path budget for an apply-diff step is the policy of the nearest
/// preceding agent step — the producer of the diffs being applied.
fn effective_allowed_paths(step: &Step, ctx: &ExecutionContext<'_>) -> Result<GlobSet, String> {
    let own_index = ctx
        .workflow
        .step_index(step.id.as_str())
        .unwrap_or(ctx.workflow.steps.len());
    let policy = ctx.workflow.steps[..own_index]
        .iter()
        .rev()
        .find_map(|prior| match &prior.kind {
            StepKind::Agent(agent) => agent.policy.as_ref(),
            _ => None,
        });

    let mut builder = GlobSetBuilder::new();
    if let Some(policy) = policy {
        for pattern in &policy.allowed_paths {
            let glob = Glob::new(pattern)
                .map_err(|err| format!("allowed_paths pattern `{pattern}` is invalid: {err}"))?;
            builder.add(glob);
        }
    }
    builder
        .build()
        .map_err(|err| format!("failed to build allowed_paths matcher: {err}"))
}

fn check_path_safety(
    target: &str,
    allowed: &GlobSet,
    ctx: &ExecutionContext<'_>,
    step_id: &str,
) -> Result<(), Box<StepOutcome>> {
    let path = Path::new(target);
    if path
        .components()
        .any(|component| matches!(component, Component::ParentDir))
    {
        return Err(Box::new(
            write_failure(
                ctx,
                step_id,
                format!("{REASON_PATH_ESCAPE}: `{target}` escapes the workflow root"),
            )
            .security(),
        ));
    }
    if path.is_absolute() || !allowed.is_match(target) {
        return Err(Box::new(
            write_failure(
                ctx,
                step_id,
                format!("{REASON_PATH_NOT_ALLOWED}: `{target}` is outside allowed_paths"),
            )
            .security(),
        ));
    }
    Ok(())
}

fn write_backups(
    ctx: &ExecutionContext<'_>,
    step_id: &str,
    backups: &[(PathBuf, Option<String>)],
) -> Result<(), String> {
    let backup_root = ctx.store.step_dir(step_id).join(BACKUP_DIR);
    fs::create_dir_all(&backup_root)
        .map_err(|err| format!("failed to create backup directory: {err}"))?;
    for (index, (target, original)) in backups.iter().enumerate() {
        let Some(original) = original else { continue };
        let name = target
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file");
        let path = backup_root.join(format!("{index}-{name}"));
        fs::write(&path, original)
            .map_err(|err| format!("failed to back up `{}`: {err}", target.display()))?;
    }
    Ok(())
}

fn write_target(target: &Path, content: &str) -> std::io::Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    atomic_write_file(target, content.as_bytes())
}

fn rollback(backups: &[(PathBuf, Option<String>)]) {
    for (target, original) in backups {
        match original {
            Some(contents) => {
                let _ = atomic_write_file(target, contents.as_bytes());
            }
            None => {
                let _ = fs::remove_file(target);
            }
        }
    }
}

fn run_verifier(verify: &str, ctx: &ExecutionContext<'_>) -> Result<(), String> {
    let mut tokens = verify.split_whitespace();
    let Some(program) = tokens.next() else {
        return Err("verifier command is empty".to_string());
    };
    let basename = Path::new(program)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(program);
    if !ctx.command_allowlist().contains(&basename) {
        return Err(format!(
            "verifier `{basename}` is not in the command allow-list"
        ));
    }
    let mut command = SupervisedCommand::new(program, ctx.workflow_dir);
    command.args = tokens.map(str::to_string).collect();
    command.timeout = ctx.step_timeout(None);
    match run_supervised(&command, ctx.cancel, None) {
        Ok(SpawnOutcome::Exited(exit)) if exit.exit_code == Some(0) => Ok(()),
        Ok(SpawnOutcome::Exited(exit)) => Err(format!(
            "verifier exited with status {}",
            exit.exit_code.unwrap_or(-1)
        )),
        Ok(SpawnOutcome::MissingBinary) => Err(format!("verifier `{program}` is not installed")),
        Err(err) => Err(format!("failed to spawn verifier: {err}")),
    }
}
