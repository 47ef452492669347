#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("failed to read workflow file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid yaml in {path}:{line}:{column}: {source}")]
    Parse {
        path: String,
        line: usize,
        column: usize,
        #[source]
        source: serde_yaml::Error,
    },
}

impl WorkflowError {
    /// Concrete remediation shown to the operator alongside the error.
    pub fn fix_hint(&self) -> Option<String> {
        match self {
            Self::Read { path, .. } => Some(format!(
                "Fix: check that `{path}` exists and is readable, e.g. `ls -l {path}`"
            )),
            Self::Parse { path, .. } => Some(format!(
                "Fix: run `bcce workflow validate {path}` after correcting the reported line"
            )),
        }
    }
}
