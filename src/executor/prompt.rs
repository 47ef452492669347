use super::{write_failure, ExecutionContext, StepOutcome, METRICS_FILE, OUTPUT_FILE};
use crate::workflow::PromptStep;
use crate::workflow::Step;
use serde_json::json;
use std::fs;
use std::time::Instant;

pub const PROMPT_FILE: &str = "prompt.txt";

/// Deterministic: copies the selected prompt into the step directory and
/// records which prompt was chosen. The model call, when one is wanted,
/// belongs to the agent executor.
pub fn execute(step: &Step, payload: &PromptStep, ctx: &ExecutionContext<'_>) -> StepOutcome {
    let step_id = step.id.as_str();
    let started = Instant::now();

    let source = ctx.workflow_dir.join(&payload.prompt_file);
    let contents = match fs::read_to_string(&source) {
        Ok(contents) => contents,
        Err(err) => {
            return write_failure(
                ctx,
                step_id,
                format!("failed to read prompt file {}: {err}", source.display()),
            )
        }
    };

    let mut artifacts = Vec::new();
    if let Err(err) = ctx
        .store
        .write_step_file(step_id, PROMPT_FILE, contents.as_bytes())
    {
        return write_failure(ctx, step_id, format!("failed to write prompt artifact: {err}"));
    }
    artifacts.push(PROMPT_FILE.to_string());

    let output = format!(
        "selected prompt `{}` ({} bytes)\n",
        payload.prompt_file.display(),
        contents.len()
    );
    if let Err(err) = ctx
        .store
        .write_step_file(step_id, OUTPUT_FILE, output.as_bytes())
    {
        return write_failure(ctx, step_id, format!("failed to write output artifact: {err}"));
    }
    artifacts.push(OUTPUT_FILE.to_string());

    let metrics = json!({
        "duration_seconds": started.elapsed().as_secs_f64(),
        "exit_code": 0,
        "timed_out": false,
    });
    if ctx
        .store
        .write_step_file(step_id, METRICS_FILE, metrics.to_string().as_bytes())
        .is_ok()
    {
        artifacts.push(METRICS_FILE.to_string());
    }

    StepOutcome::completed(Some(0), output).with_artifacts(artifacts)
}
