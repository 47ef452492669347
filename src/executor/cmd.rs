use super::process::{run_supervised, SpawnOutcome, SupervisedCommand};
use super::{write_failure, ExecutionContext, StepOutcome, METRICS_FILE, OUTPUT_FILE};
use crate::shared::redact::{is_sensitive_env_key, redact_secrets, redact_values};
use crate::workflow::{CmdStep, Step};
use serde_json::json;
use std::path::Path;

pub const COMMAND_FILE: &str = "command.txt";
pub const STDOUT_FILE: &str = "stdout.txt";
pub const STDERR_FILE: &str = "stderr.txt";

pub const REASON_COMMAND_NOT_ALLOWED: &str = "command_not_allowed";

/// Run a command without a shell: the first token must be allow-listed,
/// the rest become discrete arguments.
pub fn execute(step: &Step, payload: &CmdStep, ctx: &ExecutionContext<'_>) -> StepOutcome {
    let step_id = step.id.as_str();

    let mut tokens = payload.command.split_whitespace();
    let Some(program) = tokens.next() else {
        return write_failure(ctx, step_id, "command is empty".to_string());
    };
    let args: Vec<String> = tokens.map(str::to_string).collect();

    let basename = Path::new(program)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(program);
    let allowlist = ctx.command_allowlist();
    if !allowlist.contains(&basename) {
        return write_failure(
            ctx,
            step_id,
            format!(
                "{REASON_COMMAND_NOT_ALLOWED}: `{basename}` is not in the command allow-list"
            ),
        )
        .security();
    }

    let mut artifacts = Vec::new();
    if ctx
        .store
        .write_step_file(step_id, COMMAND_FILE, payload.command.as_bytes())
        .is_ok()
    {
        artifacts.push(COMMAND_FILE.to_string());
    }

    let step_dir = ctx.store.step_dir(step_id);
    let mut command = SupervisedCommand::new(program, &step_dir);
    command.args = args;
    command.timeout = ctx.step_timeout(None);
    for (key, value) in &ctx.workflow.env.vars {
        command.env.push((key.clone(), value.clone()));
    }
    if let Some(seed) = ctx.workflow.env.seed {
        command.env.push(("BCCE_SEED".to_string(), seed.to_string()));
    }

    // Values of reserved credential keys must never survive into captured
    // logs, even when a subprocess echoes them.
    let sensitive_values: Vec<&str> = ctx
        .workflow
        .env
        .vars
        .iter()
        .filter(|(key, _)| is_sensitive_env_key(key))
        .map(|(_, value)| value.as_str())
        .collect();

    let exit = match run_supervised(&command, ctx.cancel, None) {
        Ok(SpawnOutcome::Exited(exit)) => exit,
        Ok(SpawnOutcome::MissingBinary) => {
            return write_failure(
                ctx,
                step_id,
                format!("command `{program}` is allow-listed but not installed"),
            )
        }
        Err(err) => {
            return write_failure(ctx, step_id, format!("failed to spawn `{program}`: {err}"))
        }
    };

    let stdout = redact_values(&redact_secrets(&exit.stdout), &sensitive_values);
    let stderr = redact_values(&redact_secrets(&exit.stderr), &sensitive_values);

    for (name, content) in [(STDOUT_FILE, &stdout), (STDERR_FILE, &stderr)] {
        if let Err(err) = ctx.store.write_step_file(step_id, name, content.as_bytes()) {
            return write_failure(ctx, step_id, format!("failed to write {name}: {err}"));
        }
        artifacts.push(name.to_string());
    }
    if ctx
        .store
        .write_step_file(step_id, OUTPUT_FILE, stdout.as_bytes())
        .is_ok()
    {
        artifacts.push(OUTPUT_FILE.to_string());
    }

    let metrics = json!({
        "duration_seconds": exit.duration.as_secs_f64(),
        "exit_code": exit.exit_code.unwrap_or(-1),
        "timed_out": exit.timed_out,
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
            format!("command timed out after {:?}", command.timeout),
        );
        outcome.timed_out = true;
        outcome.exit_code = exit.exit_code;
        outcome.artifacts_written.extend(artifacts);
        return outcome;
    }
    match exit.exit_code {
        Some(0) => StepOutcome::completed(Some(0), stdout).with_artifacts(artifacts),
        code => {
            let mut outcome = write_failure(
                ctx,
                step_id,
                format!("command exited with status {}", code.unwrap_or(-1)),
            );
            outcome.exit_code = code;
            outcome.output = stdout;
            outcome.artifacts_written.extend(artifacts);
            outcome
        }
    }
}
