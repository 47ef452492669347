use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    GovernanceCheck,
    PolicyViolation,
    BudgetCheck,
    StepStart,
    StepEnd,
    WorkflowError,
    ApprovalRequest,
    ApprovalDecision,
}

impl AuditEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GovernanceCheck => "governance_check",
            Self::PolicyViolation => "policy_violation",
            Self::BudgetCheck => "budget_check",
            Self::StepStart => "step_start",
            Self::StepEnd => "step_end",
            Self::WorkflowError => "workflow_error",
            Self::ApprovalRequest => "approval_request",
            Self::ApprovalDecision => "approval_decision",
        }
    }

    /// Events that must be durable on disk the moment they are emitted.
    pub fn requires_fsync(self) -> bool {
        matches!(
            self,
            Self::StepEnd
                | Self::PolicyViolation
                | Self::WorkflowError
                | Self::ApprovalRequest
                | Self::ApprovalDecision
        )
    }
}

impl std::fmt::Display for AuditEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An event prepared by a component but not yet sequenced or timestamped.
/// Drafts keep the policy engine pure: it returns drafts, the emitter
/// assigns order and time.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditDraft {
    pub event: AuditEventKind,
    pub details: Map<String, Value>,
    pub actor: Option<String>,
    pub cost: Option<f64>,
}

impl AuditDraft {
    pub fn new(event: AuditEventKind) -> Self {
        Self {
            event,
            details: Map::new(),
            actor: None,
            cost: None,
        }
    }

    pub fn detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn cost(mut self, cost: f64) -> Self {
        self.cost = Some(cost);
        self
    }
}

/// One persisted line of `audit.log`. Field order is the serialization
/// order below and never changes.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AuditRecord {
    pub seq: u64,
    pub timestamp: String,
    pub event: AuditEventKind,
    pub details: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
}
