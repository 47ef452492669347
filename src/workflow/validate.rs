use super::definition::{Step, StepKind, WorkflowDefinition, SUPPORTED_VERSION};
use super::load::env_template_name;
use globset::Glob;
use std::collections::BTreeSet;
use std::path::Path;

const MAX_ENV_VARS: usize = 64;
const MAX_ENV_VALUE_LEN: usize = 4096;

/// Tool names still accepted for compatibility, with their replacements.
const DEPRECATED_TOOLS: &[(&str, &str)] = &[("shell", "cmd"), ("code_interpreter", "cmd")];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    fn finish(errors: Vec<String>, warnings: Vec<String>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
            warnings,
        }
    }
}

/// Semantic validation over an already-parsed definition. Deterministic for
/// a fixed definition, filesystem view, and process environment; repeated
/// invocations return identical results.
pub fn validate_workflow(definition: &WorkflowDefinition, base_dir: &Path) -> ValidationResult {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if definition.version != SUPPORTED_VERSION {
        errors.push(format!(
            "unsupported workflow version {}; this engine accepts version {SUPPORTED_VERSION}",
            definition.version
        ));
    }
    if definition.name.trim().is_empty() {
        errors.push("workflow name must be non-empty".to_string());
    }
    if definition.steps.is_empty() {
        errors.push("workflow must declare at least one step".to_string());
    }

    if let Some(name) = env_template_name(&definition.model_ref) {
        if std::env::var(name).is_err() {
            warnings.push(format!(
                "model_ref references environment variable `{name}` which is not set"
            ));
        }
    }

    check_env_bounds(definition, &mut errors);
    check_allowlist_entries(
        "workflow command_allowlist",
        &definition.command_allowlist,
        &mut errors,
    );

    let mut seen_ids = BTreeSet::new();
    for step in &definition.steps {
        if !seen_ids.insert(step.id.as_str().to_string()) {
            errors.push(format!("Duplicate step ID: {}", step.id));
        }
        check_step(step, base_dir, &mut errors, &mut warnings);
    }

    ValidationResult::finish(errors, warnings)
}

fn check_env_bounds(definition: &WorkflowDefinition, errors: &mut Vec<String>) {
    if definition.env.vars.len() > MAX_ENV_VARS {
        errors.push(format!(
            "env declares {} variables; at most {MAX_ENV_VARS} are allowed",
            definition.env.vars.len()
        ));
    }
    for (key, value) in &definition.env.vars {
        if value.len() > MAX_ENV_VALUE_LEN {
            errors.push(format!(
                "env `{key}` value is {} bytes; at most {MAX_ENV_VALUE_LEN} are allowed",
                value.len()
            ));
        }
    }
    if definition.env.max_runtime_seconds == Some(0) {
        errors.push("env max_runtime_seconds must be greater than zero".to_string());
    }
}

fn check_step(step: &Step, base_dir: &Path, errors: &mut Vec<String>, warnings: &mut Vec<String>) {
    match &step.kind {
        StepKind::Prompt(prompt) => {
            check_prompt_file(step.id.as_str(), &prompt.prompt_file, base_dir, errors);
            check_tools(step.id.as_str(), &prompt.available_tools, warnings);
        }
        StepKind::Cmd(cmd) => {
            if cmd.command.split_whitespace().next().is_none() {
                errors.push(format!("step `{}` has an empty command", step.id));
            }
        }
        StepKind::Agent(agent) => {
            match &agent.policy {
                None => errors.push(format!("agent step `{}` is missing `policy`", step.id)),
                Some(policy) => {
                    if policy.timeout_seconds == 0 {
                        errors.push(format!(
                            "agent step `{}` policy timeout_seconds must be greater than zero",
                            step.id
                        ));
                    }
                    for pattern in &policy.allowed_paths {
                        if let Err(err) = Glob::new(pattern) {
                            errors.push(format!(
                                "agent step `{}` allowed_paths pattern `{pattern}` is not a valid glob: {err}",
                                step.id
                            ));
                        }
                    }
                    check_allowlist_entries(
                        &format!("agent step `{}` cmd_allowlist", step.id),
                        &policy.cmd_allowlist,
                        errors,
                    );
                }
            }
            if let Some(prompt_file) = &agent.prompt_file {
                check_prompt_file(step.id.as_str(), prompt_file, base_dir, errors);
            }
            check_tools(step.id.as_str(), &agent.available_tools, warnings);
        }
        StepKind::ApplyDiff(_) => {}
        StepKind::Custom(custom) => {
            if custom.runner.trim().is_empty() {
                errors.push(format!(
                    "custom step `{}` must name a registered runner",
                    step.id
                ));
            }
        }
    }
}

fn check_prompt_file(
    step_id: &str,
    prompt_file: &Path,
    base_dir: &Path,
    errors: &mut Vec<String>,
) {
    if prompt_file.is_absolute() {
        errors.push(format!(
            "step `{step_id}` prompt_file must be relative to the workflow file"
        ));
        return;
    }
    let resolved = base_dir.join(prompt_file);
    if !resolved.is_file() {
        errors.push(format!(
            "step `{step_id}` prompt_file `{}` not found (resolved to {})",
            prompt_file.display(),
            resolved.display()
        ));
    }
}

fn check_allowlist_entries(context: &str, entries: &[String], errors: &mut Vec<String>) {
    for entry in entries {
        if entry.trim().is_empty() {
            errors.push(format!("{context} contains an empty entry"));
        } else if entry.contains('/') || entry.contains('\\') {
            errors.push(format!(
                "{context} entry `{entry}` must be a plain executable basename without path separators"
            ));
        }
    }
}

fn check_tools(step_id: &str, tools: &[String], warnings: &mut Vec<String>) {
    for tool in tools {
        if let Some((_, replacement)) = DEPRECATED_TOOLS
            .iter()
            .find(|(deprecated, _)| deprecated == tool)
        {
            warnings.push(format!(
                "step `{step_id}` uses deprecated tool `{tool}`; use `{replacement}` instead"
            ));
        }
    }
}
