use super::doctor::{run_checks, CheckStatus};
use crate::artifact::{list_run_ids, RunStatus};
use crate::engine::{CoordinatorOptions, EngineError, GovernedResult, RunCoordinator};
use crate::governance::GovernanceConfig;
use crate::workflow::parse_workflow_file;
use std::path::{Path, PathBuf};

pub const EXIT_OK: i32 = 0;
pub const EXIT_RUN_FAILED: i32 = 1;
pub const EXIT_CONFIG: i32 = 2;

const USAGE: &str = "usage:
  bcce workflow validate <path>
  bcce workflow run <path> [--dry-run] [--resume-from <step_id>] [--governance <path>]
  bcce workflow resume <run_id> [--from <step_id>] [--governance <path>]
  bcce workflow abort <run_id> [--reason <text>]
  bcce workflow approve <run_id> (--approve | --reject) [--actor <name>]
  bcce workflow status <run_id>
  bcce doctor";

/// Entry point for the operator CLI. Returns the process exit code.
pub fn run_cli(args: Vec<String>) -> i32 {
    match dispatch(args) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err}");
            if let Some(fix) = err.fix_hint() {
                eprintln!("{fix}");
            }
            err.exit_code()
        }
    }
}

fn dispatch(args: Vec<String>) -> Result<i32, EngineError> {
    let mut args = args.into_iter();
    match args.next().as_deref() {
        Some("workflow") => dispatch_workflow(args.collect()),
        Some("doctor") => Ok(run_doctor()),
        Some(other) => {
            eprintln!("unknown command `{other}`\n{USAGE}");
            Ok(EXIT_CONFIG)
        }
        None => {
            eprintln!("{USAGE}");
            Ok(EXIT_CONFIG)
        }
    }
}

fn dispatch_workflow(args: Vec<String>) -> Result<i32, EngineError> {
    let mut args = args.into_iter();
    let Some(subcommand) = args.next() else {
        eprintln!("{USAGE}");
        return Ok(EXIT_CONFIG);
    };
    let rest: Vec<String> = args.collect();
    match subcommand.as_str() {
        "validate" => cmd_validate(rest),
        "run" => cmd_run(rest),
        "resume" => cmd_resume(rest),
        "abort" => cmd_abort(rest),
        "approve" => cmd_approve(rest),
        "status" => cmd_status(rest),
        other => {
            eprintln!("unknown workflow subcommand `{other}`\n{USAGE}");
            Ok(EXIT_CONFIG)
        }
    }
}

fn cmd_validate(args: Vec<String>) -> Result<i32, EngineError> {
    let Some(path) = args.first() else {
        eprintln!("workflow validate requires a path\n{USAGE}");
        return Ok(EXIT_CONFIG);
    };
    let coordinator = build_coordinator(false, flag_value(&args, "--governance"))?;
    match crate::engine::EngineAdapter::validate(&coordinator, Path::new(path)) {
        Ok(result) => {
            for warning in &result.warnings {
                println!("warning: {warning}");
            }
            if result.valid {
                println!("{path}: valid");
                Ok(EXIT_OK)
            } else {
                for error in &result.errors {
                    eprintln!("error: {error}");
                }
                Ok(EXIT_RUN_FAILED)
            }
        }
        Err(err) => {
            // The validate contract is binary: anything that prevents a
            // verdict (unreadable file, malformed YAML) exits 1 too.
            eprintln!("{err}");
            if let Some(fix) = err.fix_hint() {
                eprintln!("{fix}");
            }
            Ok(EXIT_RUN_FAILED)
        }
    }
}

fn cmd_run(args: Vec<String>) -> Result<i32, EngineError> {
    let Some(path) = args.first().filter(|arg| !arg.starts_with("--")) else {
        eprintln!("workflow run requires a path\n{USAGE}");
        return Ok(EXIT_CONFIG);
    };
    let dry_run = args.iter().any(|arg| arg == "--dry-run");
    let resume_from = flag_value(&args, "--resume-from");
    let coordinator = build_coordinator(dry_run, flag_value(&args, "--governance"))?;

    let result = match resume_from {
        Some(step_id) => {
            let run_id = latest_run_for_workflow(&coordinator, Path::new(path))?;
            coordinator.resume_run(&run_id, Some(&step_id))?
        }
        None => coordinator.run_workflow(Path::new(path))?,
    };
    Ok(report_result(&result))
}

fn cmd_resume(args: Vec<String>) -> Result<i32, EngineError> {
    let Some(run_id) = args.first().filter(|arg| !arg.starts_with("--")) else {
        eprintln!("workflow resume requires a run id\n{USAGE}");
        return Ok(EXIT_CONFIG);
    };
    let coordinator = build_coordinator(false, flag_value(&args, "--governance"))?;
    let result = coordinator.resume_run(run_id, flag_value(&args, "--from").as_deref())?;
    Ok(report_result(&result))
}

fn cmd_abort(args: Vec<String>) -> Result<i32, EngineError> {
    let Some(run_id) = args.first().filter(|arg| !arg.starts_with("--")) else {
        eprintln!("workflow abort requires a run id\n{USAGE}");
        return Ok(EXIT_CONFIG);
    };
    let reason = flag_value(&args, "--reason").unwrap_or_else(|| "operator abort".to_string());
    let coordinator = build_coordinator(false, None)?;
    let result = coordinator.abort_run(run_id, &reason)?;
    println!("run {} is {}", result.run_id, result.status);
    if result.status == RunStatus::Paused {
        Ok(EXIT_OK)
    } else {
        Ok(EXIT_RUN_FAILED)
    }
}

fn cmd_approve(args: Vec<String>) -> Result<i32, EngineError> {
    let Some(run_id) = args.first().filter(|arg| !arg.starts_with("--")) else {
        eprintln!("workflow approve requires a run id\n{USAGE}");
        return Ok(EXIT_CONFIG);
    };
    let approve = args.iter().any(|arg| arg == "--approve");
    let reject = args.iter().any(|arg| arg == "--reject");
    if approve == reject {
        eprintln!("workflow approve requires exactly one of --approve or --reject\n{USAGE}");
        return Ok(EXIT_CONFIG);
    }
    let coordinator = build_coordinator(false, flag_value(&args, "--governance"))?;
    let result =
        coordinator.resolve_approval(run_id, approve, flag_value(&args, "--actor").as_deref())?;
    Ok(report_result(&result))
}

fn cmd_status(args: Vec<String>) -> Result<i32, EngineError> {
    let Some(run_id) = args.first() else {
        eprintln!("workflow status requires a run id\n{USAGE}");
        return Ok(EXIT_CONFIG);
    };
    let coordinator = build_coordinator(false, None)?;
    let state = coordinator.run_status(run_id)?;
    println!("run: {}", state.run_id);
    println!("workflow: {}", state.workflow.name);
    println!("status: {}", state.status);
    println!("current step index: {}", state.current_step_index);
    for result in &state.step_results {
        println!("  {} {}", result.step_id, result.status);
    }
    Ok(EXIT_OK)
}

fn run_doctor() -> i32 {
    let artifacts_root = artifacts_root_from_env();
    let model_cli = model_cli_from_env();
    let checks = run_checks(&artifacts_root, &model_cli);
    let mut failed = false;
    for check in &checks {
        println!("[{}] {}: {}", check.status.as_str(), check.name, check.detail);
        if let Some(fix) = &check.fix {
            println!("      {fix}");
        }
        failed |= check.status == CheckStatus::Fail;
    }
    if failed {
        EXIT_RUN_FAILED
    } else {
        EXIT_OK
    }
}

fn report_result(result: &GovernedResult) -> i32 {
    println!("run: {}", result.run_id);
    println!("status: {}", result.status);
    for error in &result.errors {
        eprintln!("error: {error}");
    }
    match result.status {
        RunStatus::Completed => EXIT_OK,
        RunStatus::PendingApproval => {
            println!(
                "approval required: resolve with `bcce workflow approve {} --approve`",
                result.run_id
            );
            EXIT_RUN_FAILED
        }
        _ => EXIT_RUN_FAILED,
    }
}

fn build_coordinator(
    dry_run: bool,
    governance_flag: Option<String>,
) -> Result<RunCoordinator, EngineError> {
    let governance = match governance_flag.or_else(|| std::env::var("BCCE_GOVERNANCE_FILE").ok()) {
        Some(path) => GovernanceConfig::from_path(Path::new(&path))?,
        None => GovernanceConfig::default(),
    };
    let max_run_seconds = match std::env::var("BCCE_MAX_RUN_SECONDS") {
        Err(_) => None,
        Ok(raw) => match raw.parse::<u64>() {
            Ok(seconds) if seconds > 0 => Some(seconds),
            _ => {
                return Err(EngineError::Validation {
                    errors: vec![format!(
                        "BCCE_MAX_RUN_SECONDS=`{raw}` is not a positive integer"
                    )],
                })
            }
        },
    };
    let options = CoordinatorOptions {
        artifacts_root: artifacts_root_from_env(),
        model_cli: model_cli_from_env(),
        max_run_seconds,
        dry_run,
    };
    Ok(RunCoordinator::new(options, governance))
}

/// `run <path> --resume-from` targets the newest run started from the
/// same workflow: both the name and the directory the definition was
/// loaded from must match, so runs of unrelated workflows under the same
/// artifacts root are never resumed by accident.
fn latest_run_for_workflow(
    coordinator: &RunCoordinator,
    workflow_path: &Path,
) -> Result<String, EngineError> {
    let loaded = parse_workflow_file(workflow_path)?;
    for run_id in list_run_ids(&artifacts_root_from_env())? {
        let Ok(state) = coordinator.run_status(&run_id) else {
            continue;
        };
        if state.workflow.name == loaded.definition.name
            && state.workflow_source_dir == loaded.base_dir
        {
            return Ok(run_id);
        }
    }
    Err(EngineError::Validation {
        errors: vec![format!(
            "no previous run of workflow `{}` exists under {}; use `bcce workflow resume <run_id>` instead",
            loaded.definition.name,
            artifacts_root_from_env().display()
        )],
    })
}

fn artifacts_root_from_env() -> PathBuf {
    std::env::var("BCCE_ARTIFACTS_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(crate::engine::coordinator::DEFAULT_ARTIFACTS_ROOT))
}

fn model_cli_from_env() -> String {
    std::env::var("BCCE_MODEL_CLI").unwrap_or_else(|_| "claude".to_string())
}

fn flag_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|arg| arg == flag)
        .and_then(|index| args.get(index + 1))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_values_follow_their_flag() {
        let args: Vec<String> = ["resume", "run-1", "--from", "build"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(flag_value(&args, "--from"), Some("build".to_string()));
        assert_eq!(flag_value(&args, "--reason"), None);
    }

    #[test]
    fn unknown_commands_exit_with_config_code() {
        assert_eq!(run_cli(vec!["frobnicate".to_string()]), EXIT_CONFIG);
        assert_eq!(run_cli(Vec::new()), EXIT_CONFIG);
    }
}
