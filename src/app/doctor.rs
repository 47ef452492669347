use crate::governance::GovernanceConfig;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

impl CheckStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "ok",
            Self::Warn => "warn",
            Self::Fail => "fail",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DoctorCheck {
    pub name: &'static str,
    pub status: CheckStatus,
    pub detail: String,
    pub fix: Option<String>,
}

/// Environment health probe backing the `doctor` command. Warnings do not
/// fail the exit code; failures do.
pub fn run_checks(artifacts_root: &Path, model_cli: &str) -> Vec<DoctorCheck> {
    vec![
        check_artifacts_root(artifacts_root),
        check_model_cli(model_cli),
        check_max_run_seconds(),
        check_governance_file(),
    ]
}

fn check_artifacts_root(root: &Path) -> DoctorCheck {
    let probe = root.join(".doctor-probe");
    let result = fs::create_dir_all(root).and_then(|_| fs::write(&probe, b"probe"));
    let _ = fs::remove_file(&probe);
    match result {
        Ok(()) => DoctorCheck {
            name: "artifacts root",
            status: CheckStatus::Pass,
            detail: format!("{} is writable", root.display()),
            fix: None,
        },
        Err(err) => DoctorCheck {
            name: "artifacts root",
            status: CheckStatus::Fail,
            detail: format!("cannot write to {}: {err}", root.display()),
            fix: Some(format!(
                "Fix: create the directory or set BCCE_ARTIFACTS_ROOT, e.g. `mkdir -p {}`",
                root.display()
            )),
        },
    }
}

fn check_model_cli(model_cli: &str) -> DoctorCheck {
    if binary_on_path(model_cli) {
        DoctorCheck {
            name: "model CLI",
            status: CheckStatus::Pass,
            detail: format!("`{model_cli}` found on PATH"),
            fix: None,
        }
    } else {
        DoctorCheck {
            name: "model CLI",
            status: CheckStatus::Warn,
            detail: format!(
                "`{model_cli}` not found on PATH; agent steps will run in simulated mode"
            ),
            fix: Some(
                "Fix: install the model CLI or point BCCE_MODEL_CLI at its binary".to_string(),
            ),
        }
    }
}

fn check_max_run_seconds() -> DoctorCheck {
    match std::env::var("BCCE_MAX_RUN_SECONDS") {
        Err(_) => DoctorCheck {
            name: "run ceiling",
            status: CheckStatus::Pass,
            detail: "BCCE_MAX_RUN_SECONDS not set; no global ceiling".to_string(),
            fix: None,
        },
        Ok(raw) => match raw.parse::<u64>() {
            Ok(seconds) if seconds > 0 => DoctorCheck {
                name: "run ceiling",
                status: CheckStatus::Pass,
                detail: format!("global run ceiling is {seconds}s"),
                fix: None,
            },
            _ => DoctorCheck {
                name: "run ceiling",
                status: CheckStatus::Fail,
                detail: format!("BCCE_MAX_RUN_SECONDS=`{raw}` is not a positive integer"),
                fix: Some(
                    "Fix: set BCCE_MAX_RUN_SECONDS to a positive number of seconds or unset it"
                        .to_string(),
                ),
            },
        },
    }
}

fn check_governance_file() -> DoctorCheck {
    match std::env::var("BCCE_GOVERNANCE_FILE") {
        Err(_) => DoctorCheck {
            name: "governance file",
            status: CheckStatus::Pass,
            detail: "BCCE_GOVERNANCE_FILE not set; default governance applies".to_string(),
            fix: None,
        },
        Ok(raw) => match GovernanceConfig::from_path(Path::new(&raw)) {
            Ok(config) => DoctorCheck {
                name: "governance file",
                status: CheckStatus::Pass,
                detail: format!(
                    "{raw} loads with {} active policy families",
                    config.policies.len()
                ),
                fix: None,
            },
            Err(err) => DoctorCheck {
                name: "governance file",
                status: CheckStatus::Fail,
                detail: err.to_string(),
                fix: err.fix_hint(),
            },
        },
    }
}

fn binary_on_path(name: &str) -> bool {
    if name.contains('/') {
        return Path::new(name).is_file();
    }
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir: PathBuf| dir.join(name).is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writable_root_passes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let check = check_artifacts_root(temp.path());
        assert_eq!(check.status, CheckStatus::Pass);
    }

    #[test]
    fn missing_model_cli_warns_instead_of_failing() {
        let check = check_model_cli("definitely-not-installed-bcce");
        assert_eq!(check.status, CheckStatus::Warn);
        assert!(check.fix.is_some());
    }
}
