use super::process::{run_supervised, SpawnOutcome, SupervisedCommand};
use super::{write_failure, ExecutionContext, StepOutcome, METRICS_FILE, OUTPUT_FILE};
use crate::shared::redact::redact_secrets;
use crate::workflow::load::resolve_template;
use crate::workflow::{AgentPolicy, AgentStep, Step};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;

pub const POLICY_FILE: &str = "policy.json";
pub const PROMPT_FILE: &str = "prompt.txt";
pub const TRANSCRIPT_FILE: &str = "transcript.md";

/// Delegate a step to the external language-model CLI under the declared
/// resource policy. The executor owns enforcement; the policy is exported
/// to the subprocess environment for information only.
pub fn execute(step: &Step, payload: &AgentStep, ctx: &ExecutionContext<'_>) -> StepOutcome {
    let step_id = step.id.as_str();

    let Some(policy) = payload.policy.as_ref() else {
        // The validator rejects this before a run starts; reaching it means
        // the coordinator was driven with an unvalidated definition.
        return write_failure(
            ctx,
            step_id,
            "agent step has no resource policy".to_string(),
        )
        .security();
    };

    let mut artifacts = Vec::new();

    let policy_json = match serde_json::to_vec_pretty(policy) {
        Ok(body) => body,
        Err(err) => {
            return write_failure(ctx, step_id, format!("failed to encode policy: {err}"))
        }
    };
    if let Err(err) = ctx.store.write_step_file(step_id, POLICY_FILE, &policy_json) {
        return write_failure(ctx, step_id, format!("failed to write policy artifact: {err}"));
    }
    artifacts.push(POLICY_FILE.to_string());

    let prompt = match render_prompt(step, payload, policy, ctx) {
        Ok(prompt) => prompt,
        Err(err) => return write_failure(ctx, step_id, err),
    };
    let prompt_path = match ctx
        .store
        .write_step_file(step_id, PROMPT_FILE, prompt.as_bytes())
    {
        Ok(path) => path,
        Err(err) => {
            return write_failure(ctx, step_id, format!("failed to write prompt artifact: {err}"))
        }
    };
    artifacts.push(PROMPT_FILE.to_string());

    let transcript_path = ctx.store.step_dir(step_id).join(TRANSCRIPT_FILE);
    let mut transcript = match fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&transcript_path)
    {
        Ok(file) => file,
        Err(err) => {
            return write_failure(ctx, step_id, format!("failed to open transcript: {err}"))
        }
    };
    let header = format!(
        "# Agent transcript: {step_id}\n\nmodel_ref: {}\ntimeout_seconds: {}\n\n",
        ctx.workflow.model_ref, policy.timeout_seconds
    );
    let _ = transcript.write_all(header.as_bytes());
    artifacts.push(TRANSCRIPT_FILE.to_string());

    let step_dir = ctx.store.step_dir(step_id);
    let mut command = SupervisedCommand::new(ctx.model_cli, &step_dir);
    command.args = vec!["-p".to_string(), prompt_path.display().to_string()];
    if let Some(model) = resolve_template(&ctx.workflow.model_ref) {
        command.args.push("--model".to_string());
        command.args.push(model);
    }
    command.timeout = ctx.step_timeout(Some(policy));
    command.env = policy_env(policy);
    for (key, value) in &ctx.workflow.env.vars {
        command.env.push((key.clone(), value.clone()));
    }
    if let Some(seed) = ctx.workflow.env.seed {
        command.env.push(("BCCE_SEED".to_string(), seed.to_string()));
    }

    let mut hook = |line: &str| {
        let _ = transcript.write_all(redact_secrets(line).as_bytes());
    };

    let exit = match run_supervised(&command, ctx.cancel, Some(&mut hook)) {
        Ok(SpawnOutcome::Exited(exit)) => exit,
        Ok(SpawnOutcome::MissingBinary) => {
            drop(hook);
            return simulate(step_id, &prompt, ctx, artifacts, policy);
        }
        Err(err) => {
            return write_failure(
                ctx,
                step_id,
                format!("failed to spawn model CLI `{}`: {err}", ctx.model_cli),
            )
        }
    };
    drop(hook);
    let _ = transcript.sync_all();

    let output = redact_secrets(exit.stdout.trim_end());
    if ctx
        .store
        .write_step_file(step_id, OUTPUT_FILE, output.as_bytes())
        .is_ok()
    {
        artifacts.push(OUTPUT_FILE.to_string());
    }

    let metrics = json!({
        "duration_seconds": exit.duration.as_secs_f64(),
        "exit_code": exit.exit_code.unwrap_or(-1),
        "timed_out": exit.timed_out,
        "simulated": false,
        "policy": policy,
    });
    if ctx
        .store
        .write_step_file(step_id, METRICS_FILE, metrics.to_string().as_bytes())
        .is_ok()
    {
        artifacts.push(METRICS_FILE.to_string());
    }

    if exit.canceled {
        let mut outcome = write_failure(ctx, step_id, "step canceled by abort".to_string());
        outcome.artifacts_written.extend(artifacts);
        return outcome;
    }
    if exit.timed_out {
        let mut outcome = write_failure(
            ctx,
            step_id,
            format!(
                "agent exceeded its {}s timeout and was terminated",
                policy.timeout_seconds
            ),
        );
        outcome.timed_out = true;
        outcome.exit_code = exit.exit_code;
        outcome.artifacts_written.extend(artifacts);
        return outcome;
    }
    match exit.exit_code {
        Some(0) => StepOutcome::completed(Some(0), output).with_artifacts(artifacts),
        code => {
            let stderr = redact_secrets(exit.stderr.trim_end());
            let mut outcome = write_failure(
                ctx,
                step_id,
                format!(
                    "model CLI exited with status {}: {stderr}",
                    code.unwrap_or(-1)
                ),
            );
            outcome.exit_code = code;
            outcome.artifacts_written.extend(artifacts);
            outcome
        }
    }
}

/// Constraints block first, then the task, then the operator's prompt
/// material; the subprocess sees its limits before anything else.
fn render_prompt(
    step: &Step,
    payload: &AgentStep,
    policy: &AgentPolicy,
    ctx: &ExecutionContext<'_>,
) -> Result<String, String> {
    let mut prompt = String::new();
    prompt.push_str("## Execution constraints\n\n");
    prompt.push_str(&format!("- timeout_seconds: {}\n", policy.timeout_seconds));
    prompt.push_str(&format!("- max_files: {}\n", policy.max_files));
    prompt.push_str(&format!("- max_edits: {}\n", policy.max_edits));
    prompt.push_str(&format!(
        "- allowed_paths: {}\n",
        if policy.allowed_paths.is_empty() {
            "(none — no file access)".to_string()
        } else {
            policy.allowed_paths.join(", ")
        }
    ));
    prompt.push_str(&format!(
        "- cmd_allowlist: {}\n",
        if policy.cmd_allowlist.is_empty() {
            "(none)".to_string()
        } else {
            policy.cmd_allowlist.join(", ")
        }
    ));
    prompt.push_str(&format!(
        "\n## Task\n\nworkflow: {}\nstep: {}\n",
        ctx.workflow.name, step.id
    ));
    for (key, value) in &payload.inputs {
        prompt.push_str(&format!("{key}: {value}\n"));
    }
    if let Some(prompt_file) = &payload.prompt_file {
        let source = ctx.workflow_dir.join(prompt_file);
        let contents = fs::read_to_string(&source)
            .map_err(|err| format!("failed to read prompt file {}: {err}", source.display()))?;
        prompt.push('\n');
        prompt.push_str(&contents);
    }
    Ok(prompt)
}

fn policy_env(policy: &AgentPolicy) -> Vec<(String, String)> {
    vec![
        (
            "BCCE_POLICY_TIMEOUT_SECONDS".to_string(),
            policy.timeout_seconds.to_string(),
        ),
        (
            "BCCE_POLICY_MAX_FILES".to_string(),
            policy.max_files.to_string(),
        ),
        (
            "BCCE_POLICY_MAX_EDITS".to_string(),
            policy.max_edits.to_string(),
        ),
        (
            "BCCE_POLICY_ALLOWED_PATHS".to_string(),
            policy.allowed_paths.join(":"),
        ),
        (
            "BCCE_POLICY_CMD_ALLOWLIST".to_string(),
            policy.cmd_allowlist.join(":"),
        ),
    ]
}

/// Offline degradation: when the model CLI is not installed, produce a
/// deterministic transcript derived from the prompt so validation runs
/// still exercise the full artifact layout.
fn simulate(
    step_id: &str,
    prompt: &str,
    ctx: &ExecutionContext<'_>,
    mut artifacts: Vec<String>,
    policy: &AgentPolicy,
) -> StepOutcome {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    let digest = hasher.finalize();
    let fingerprint = digest[..8]
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<String>();

    let body = format!(
        "[SIMULATED] model CLI `{}` is not installed; no model was invoked.\n\
         prompt fingerprint: {fingerprint}\n",
        ctx.model_cli
    );
    let transcript_path = ctx.store.step_dir(step_id).join(TRANSCRIPT_FILE);
    if let Ok(mut file) = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&transcript_path)
    {
        let _ = file.write_all(body.as_bytes());
    }

    if ctx
        .store
        .write_step_file(step_id, OUTPUT_FILE, body.as_bytes())
        .is_ok()
    {
        artifacts.push(OUTPUT_FILE.to_string());
    }
    let metrics = json!({
        "duration_seconds": 0.0,
        "exit_code": 0,
        "timed_out": false,
        "simulated": true,
        "policy": policy,
    });
    if ctx
        .store
        .write_step_file(step_id, METRICS_FILE, metrics.to_string().as_bytes())
        .is_ok()
    {
        artifacts.push(METRICS_FILE.to_string());
    }
    StepOutcome::completed(Some(0), body).with_artifacts(artifacts)
}
