use super::definition::WorkflowDefinition;
use super::error::WorkflowError;
use std::fs;
use std::path::{Path, PathBuf};

/// A parsed workflow together with the directory its relative paths
/// (prompt files, diff targets) resolve against.
#[derive(Debug, Clone)]
pub struct LoadedWorkflow {
    pub definition: WorkflowDefinition,
    pub source_path: PathBuf,
    pub base_dir: PathBuf,
}

/// Parse the YAML workflow document at `path`. Schema violations, unknown
/// keys, and unknown step types are all rejected here; semantic rules are
/// the validator's job.
pub fn parse_workflow_file(path: &Path) -> Result<LoadedWorkflow, WorkflowError> {
    let raw = fs::read_to_string(path).map_err(|source| WorkflowError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let definition: WorkflowDefinition =
        serde_yaml::from_str(&raw).map_err(|source| parse_error(path, source))?;
    let base_dir = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    Ok(LoadedWorkflow {
        definition,
        source_path: path.to_path_buf(),
        base_dir,
    })
}

fn parse_error(path: &Path, source: serde_yaml::Error) -> WorkflowError {
    let (line, column) = source
        .location()
        .map(|loc| (loc.line(), loc.column()))
        .unwrap_or((0, 0));
    WorkflowError::Parse {
        path: path.display().to_string(),
        line,
        column,
        source,
    }
}

/// Recognize `${NAME}` template references in string fields. Only a full
/// match counts; partial interpolation is not supported.
pub fn env_template_name(value: &str) -> Option<&str> {
    let inner = value.strip_prefix("${")?.strip_suffix('}')?;
    if inner.is_empty()
        || !inner
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
    {
        return None;
    }
    Some(inner)
}

/// Resolve a possibly-templated value against the process environment.
pub fn resolve_template(value: &str) -> Option<String> {
    match env_template_name(value) {
        Some(name) => std::env::var(name).ok(),
        None => Some(value.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn parses_a_minimal_workflow_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("wf.yaml");
        fs::write(
            &path,
            "version: 1\nname: demo\nmodel_ref: claude\nsteps:\n  - id: hello\n    type: cmd\n    command: echo hi\n",
        )
        .expect("write");

        let loaded = parse_workflow_file(&path).expect("parse");
        assert_eq!(loaded.definition.name, "demo");
        assert_eq!(loaded.definition.steps.len(), 1);
        assert_eq!(loaded.base_dir, temp.path());
    }

    #[test]
    fn unknown_top_level_keys_are_rejected_with_location() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("wf.yaml");
        fs::write(
            &path,
            "version: 1\nname: demo\nmodel_ref: claude\ndashboard: true\nsteps: []\n",
        )
        .expect("write");

        let err = parse_workflow_file(&path).expect_err("must fail");
        assert!(matches!(err, WorkflowError::Parse { .. }));
        assert!(err.to_string().contains("dashboard"));
    }

    #[test]
    fn template_names_are_recognized() {
        assert_eq!(env_template_name("${BEDROCK_MODEL_ID}"), Some("BEDROCK_MODEL_ID"));
        assert_eq!(env_template_name("claude-sonnet"), None);
        assert_eq!(env_template_name("${}"), None);
        assert_eq!(env_template_name("${A B}"), None);
    }
}
