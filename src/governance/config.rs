use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum GovernanceError {
    #[error("failed to read governance file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid yaml in governance file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("governance file {path} names unknown policy `{policy}`")]
    UnknownPolicy { path: String, policy: String },
}

impl GovernanceError {
    pub fn fix_hint(&self) -> Option<String> {
        match self {
            Self::Read { path, .. } => Some(format!(
                "Fix: create `{path}` or point BCCE_GOVERNANCE_FILE at an existing file"
            )),
            Self::Parse { path, .. } => Some(format!(
                "Fix: correct the YAML in `{path}`; see schema/workflow.schema.json for field names"
            )),
            Self::UnknownPolicy { .. } => Some(
                "Fix: use one of the supported policy names: security, cost_control, compliance"
                    .to_string(),
            ),
        }
    }
}

/// The closed set of governance policy families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    Security,
    CostControl,
    Compliance,
}

impl PolicyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Security => "security",
            Self::CostControl => "cost_control",
            Self::Compliance => "compliance",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "security" => Ok(Self::Security),
            "cost_control" | "cost-control" => Ok(Self::CostControl),
            "compliance" => Ok(Self::Compliance),
            _ => Err("policy must be one of: security, cost_control, compliance".to_string()),
        }
    }
}

impl std::fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditLevel {
    #[default]
    Basic,
    Detailed,
    Comprehensive,
}

impl AuditLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Detailed => "detailed",
            Self::Comprehensive => "comprehensive",
        }
    }
}

impl std::fmt::Display for AuditLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CostControls {
    #[serde(default)]
    pub budget_limit: Option<f64>,
    #[serde(default)]
    pub model_restrictions: Vec<String>,
    #[serde(default)]
    pub timeout_minutes: Option<u64>,
}

/// Run-level governance: which policy families are active and the knobs
/// they evaluate against.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct GovernanceConfig {
    #[serde(default)]
    pub policies: Vec<PolicyKind>,
    #[serde(default)]
    pub approval_required: bool,
    #[serde(default)]
    pub compliance_logging: bool,
    #[serde(default)]
    pub cost_controls: CostControls,
    #[serde(default)]
    pub audit_level: AuditLevel,
    #[serde(default)]
    pub command_allowlist: Vec<String>,
    #[serde(default)]
    pub compliance_frameworks: Vec<String>,
    #[serde(default)]
    pub retention_days: Option<u32>,
}

impl GovernanceConfig {
    pub fn from_path(path: &Path) -> Result<Self, GovernanceError> {
        let raw = fs::read_to_string(path).map_err(|source| GovernanceError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| GovernanceError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn policy_active(&self, kind: PolicyKind) -> bool {
        self.policies.contains(&kind)
    }

    pub fn applied_policy_names(&self) -> Vec<String> {
        self.policies.iter().map(|p| p.to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn governance_file_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("governance.yaml");
        fs::write(
            &path,
            "policies: [security, cost_control]\napproval_required: true\ncost_controls:\n  budget_limit: 2.5\n  model_restrictions: [legacy-model]\naudit_level: comprehensive\n",
        )
        .expect("write");

        let config = GovernanceConfig::from_path(&path).expect("load");
        assert!(config.policy_active(PolicyKind::Security));
        assert!(config.policy_active(PolicyKind::CostControl));
        assert!(!config.policy_active(PolicyKind::Compliance));
        assert!(config.approval_required);
        assert_eq!(config.cost_controls.budget_limit, Some(2.5));
        assert_eq!(config.audit_level, AuditLevel::Comprehensive);
    }

    #[test]
    fn unknown_governance_keys_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("governance.yaml");
        fs::write(&path, "dashboards: true\n").expect("write");
        assert!(matches!(
            GovernanceConfig::from_path(&path),
            Err(GovernanceError::Parse { .. })
        ));
    }
}
