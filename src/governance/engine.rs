use super::config::{AuditLevel, GovernanceConfig, PolicyKind};
use crate::audit::{AuditDraft, AuditEventKind};
use crate::workflow::{StepKind, WorkflowDefinition};
use serde_json::Value;
use std::collections::BTreeSet;

/// Cost assumed per agent step for models we recognize, in account units.
/// The estimate is deliberately coarse; it exists to gate runaway budgets,
/// not to bill anyone.
const MODEL_COST_ESTIMATES: &[(&str, f64)] = &[
    ("claude", 0.08),
    ("gpt", 0.06),
    ("nova", 0.02),
    ("titan", 0.01),
];
const DEFAULT_STEP_COST: f64 = 0.05;

/// Most severe verdict wins: block > require_approval > warn > allow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verdict {
    #[default]
    Allow,
    Warn,
    RequireApproval,
    Block,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Warn => "warn",
            Self::RequireApproval => "require_approval",
            Self::Block => "block",
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Stable reason codes carried in audit entries. Never renumber or rename
/// these; external tooling keys off the strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReasonCode {
    AgentPolicyMissing,
    GuardrailsEmpty,
    BudgetExceeded,
    ModelRestricted,
    AuditLevelInsufficient,
    RetentionUnset,
}

impl ReasonCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AgentPolicyMissing => "agent_policy_missing",
            Self::GuardrailsEmpty => "guardrails_empty",
            Self::BudgetExceeded => "budget_exceeded",
            Self::ModelRestricted => "model_restricted",
            Self::AuditLevelInsufficient => "audit_level_insufficient",
            Self::RetentionUnset => "retention_unset",
        }
    }

    fn severity(self) -> Verdict {
        match self {
            Self::AgentPolicyMissing => Verdict::Block,
            Self::GuardrailsEmpty => Verdict::Warn,
            Self::BudgetExceeded => Verdict::RequireApproval,
            Self::ModelRestricted => Verdict::Block,
            Self::AuditLevelInsufficient => Verdict::Block,
            Self::RetentionUnset => Verdict::Warn,
        }
    }
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PolicyViolation {
    pub policy: PolicyKind,
    pub reason: ReasonCode,
    pub step_id: Option<String>,
    pub severity: Verdict,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PolicyEvaluation {
    pub verdict: Verdict,
    pub violations: Vec<PolicyViolation>,
    pub estimated_cost: Option<f64>,
    pub audit_drafts: Vec<AuditDraft>,
}

/// Evaluate a workflow against the active governance policies. Pure: the
/// same `(workflow, config)` pair always yields the same verdict and the
/// same multiset of reason codes.
pub fn evaluate(workflow: &WorkflowDefinition, config: &GovernanceConfig) -> PolicyEvaluation {
    let mut violations = Vec::new();
    let mut estimated_cost = None;

    if config.policy_active(PolicyKind::Security) {
        security_policy(workflow, &mut violations);
    }
    if config.policy_active(PolicyKind::CostControl) {
        estimated_cost = Some(cost_policy(workflow, config, &mut violations));
    }
    if config.policy_active(PolicyKind::Compliance) {
        compliance_policy(config, &mut violations);
    }

    dedup_violations(&mut violations);

    let mut verdict = violations
        .iter()
        .map(|v| v.severity)
        .max()
        .unwrap_or(Verdict::Allow);
    if config.approval_required {
        verdict = verdict.max(Verdict::RequireApproval);
    }

    let audit_drafts = build_drafts(workflow, config, verdict, &violations, estimated_cost);

    PolicyEvaluation {
        verdict,
        violations,
        estimated_cost,
        audit_drafts,
    }
}

fn security_policy(workflow: &WorkflowDefinition, violations: &mut Vec<PolicyViolation>) {
    for step in &workflow.steps {
        if let StepKind::Agent(agent) = &step.kind {
            if agent.policy.is_none() {
                violations.push(PolicyViolation {
                    policy: PolicyKind::Security,
                    reason: ReasonCode::AgentPolicyMissing,
                    step_id: Some(step.id.as_str().to_string()),
                    severity: ReasonCode::AgentPolicyMissing.severity(),
                    message: format!("agent step `{}` declares no resource policy", step.id),
                });
            }
        }
    }
    if workflow.guardrails.is_empty() {
        violations.push(PolicyViolation {
            policy: PolicyKind::Security,
            reason: ReasonCode::GuardrailsEmpty,
            step_id: None,
            severity: ReasonCode::GuardrailsEmpty.severity(),
            message: "security policy is active but the workflow declares no guardrails"
                .to_string(),
        });
    }
}

fn cost_policy(
    workflow: &WorkflowDefinition,
    config: &GovernanceConfig,
    violations: &mut Vec<PolicyViolation>,
) -> f64 {
    let agent_steps = workflow
        .steps
        .iter()
        .filter(|step| matches!(step.kind, StepKind::Agent(_)))
        .count();
    let estimated = agent_steps as f64 * model_step_cost(&workflow.model_ref);

    if let Some(limit) = config.cost_controls.budget_limit {
        if estimated > limit {
            violations.push(PolicyViolation {
                policy: PolicyKind::CostControl,
                reason: ReasonCode::BudgetExceeded,
                step_id: None,
                severity: ReasonCode::BudgetExceeded.severity(),
                message: format!(
                    "estimated cost {estimated:.2} exceeds budget limit {limit:.2}"
                ),
            });
        }
    }
    for restricted in &config.cost_controls.model_restrictions {
        if workflow.model_ref.contains(restricted.as_str()) {
            violations.push(PolicyViolation {
                policy: PolicyKind::CostControl,
                reason: ReasonCode::ModelRestricted,
                step_id: None,
                severity: ReasonCode::ModelRestricted.severity(),
                message: format!(
                    "model_ref `{}` matches restricted model `{restricted}`",
                    workflow.model_ref
                ),
            });
        }
    }
    estimated
}

fn compliance_policy(config: &GovernanceConfig, violations: &mut Vec<PolicyViolation>) {
    if !config.compliance_frameworks.is_empty() && config.audit_level != AuditLevel::Comprehensive
    {
        violations.push(PolicyViolation {
            policy: PolicyKind::Compliance,
            reason: ReasonCode::AuditLevelInsufficient,
            step_id: None,
            severity: ReasonCode::AuditLevelInsufficient.severity(),
            message: format!(
                "frameworks {:?} require audit_level comprehensive, found {}",
                config.compliance_frameworks, config.audit_level
            ),
        });
    }
    if config.retention_days.is_none() {
        violations.push(PolicyViolation {
            policy: PolicyKind::Compliance,
            reason: ReasonCode::RetentionUnset,
            step_id: None,
            severity: ReasonCode::RetentionUnset.severity(),
            message: "compliance policy is active but retention_days is not set".to_string(),
        });
    }
}

fn model_step_cost(model_ref: &str) -> f64 {
    let lowered = model_ref.to_ascii_lowercase();
    MODEL_COST_ESTIMATES
        .iter()
        .find(|(family, _)| lowered.contains(family))
        .map(|(_, cost)| *cost)
        .unwrap_or(DEFAULT_STEP_COST)
}

fn dedup_violations(violations: &mut Vec<PolicyViolation>) {
    let mut seen = BTreeSet::new();
    violations.retain(|v| {
        seen.insert((
            v.policy,
            v.reason,
            v.step_id.clone().unwrap_or_default(),
        ))
    });
}

fn build_drafts(
    workflow: &WorkflowDefinition,
    config: &GovernanceConfig,
    verdict: Verdict,
    violations: &[PolicyViolation],
    estimated_cost: Option<f64>,
) -> Vec<AuditDraft> {
    let mut drafts = Vec::with_capacity(violations.len() + 2);
    drafts.push(
        AuditDraft::new(AuditEventKind::GovernanceCheck)
            .detail("workflow", workflow.name.as_str())
            .detail(
                "policies",
                Value::from(config.applied_policy_names()),
            )
            .detail("verdict", verdict.as_str()),
    );
    if let Some(estimated) = estimated_cost {
        let mut draft = AuditDraft::new(AuditEventKind::BudgetCheck)
            .detail("estimated_cost", estimated)
            .cost(estimated);
        if let Some(limit) = config.cost_controls.budget_limit {
            draft = draft.detail("budget_limit", limit);
        }
        drafts.push(draft);
    }
    for violation in violations {
        let mut draft = AuditDraft::new(AuditEventKind::PolicyViolation)
            .detail("policy", violation.policy.as_str())
            .detail("reason", violation.reason.as_str())
            .detail("severity", violation.severity.as_str())
            .detail("message", violation.message.as_str());
        if let Some(step_id) = &violation.step_id {
            draft = draft.detail("step_id", step_id.as_str());
        }
        drafts.push(draft);
    }
    drafts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::ids::StepId;
    use crate::workflow::{AgentPolicy, AgentStep, OnError, Step};

    fn agent_step(id: &str, policy: Option<AgentPolicy>) -> Step {
        Step {
            id: StepId::parse(id).expect("id"),
            on_error: OnError::default(),
            idempotent: false,
            kind: StepKind::Agent(AgentStep {
                policy,
                ..AgentStep::default()
            }),
        }
    }

    fn sample_policy() -> AgentPolicy {
        AgentPolicy {
            timeout_seconds: 60,
            max_files: 10,
            max_edits: 5,
            allowed_paths: vec!["src/**".to_string()],
            cmd_allowlist: vec!["cargo".to_string()],
        }
    }

    fn workflow(steps: Vec<Step>) -> WorkflowDefinition {
        WorkflowDefinition {
            version: 1,
            name: "demo".to_string(),
            model_ref: "claude-sonnet".to_string(),
            guardrails: vec!["pii-filter".to_string()],
            command_allowlist: Vec::new(),
            env: Default::default(),
            steps,
        }
    }

    fn governance(policies: Vec<PolicyKind>) -> GovernanceConfig {
        GovernanceConfig {
            policies,
            ..GovernanceConfig::default()
        }
    }

    #[test]
    fn clean_workflow_is_allowed() {
        let wf = workflow(vec![agent_step("a", Some(sample_policy()))]);
        let result = evaluate(&wf, &governance(vec![PolicyKind::Security]));
        assert_eq!(result.verdict, Verdict::Allow);
        assert!(result.violations.is_empty());
        assert_eq!(result.audit_drafts[0].event, AuditEventKind::GovernanceCheck);
    }

    #[test]
    fn missing_agent_policy_blocks() {
        let wf = workflow(vec![agent_step("a", None)]);
        let result = evaluate(&wf, &governance(vec![PolicyKind::Security]));
        assert_eq!(result.verdict, Verdict::Block);
        assert_eq!(result.violations[0].reason, ReasonCode::AgentPolicyMissing);
    }

    #[test]
    fn budget_overrun_requires_approval() {
        let wf = workflow(vec![
            agent_step("a", Some(sample_policy())),
            agent_step("b", Some(sample_policy())),
        ]);
        let mut config = governance(vec![PolicyKind::CostControl]);
        config.cost_controls.budget_limit = Some(0.01);
        let result = evaluate(&wf, &config);
        assert_eq!(result.verdict, Verdict::RequireApproval);
        assert!(result
            .violations
            .iter()
            .any(|v| v.reason == ReasonCode::BudgetExceeded));
        assert!(result
            .audit_drafts
            .iter()
            .any(|d| d.event == AuditEventKind::BudgetCheck));
    }

    #[test]
    fn restricted_model_blocks() {
        let wf = workflow(vec![agent_step("a", Some(sample_policy()))]);
        let mut config = governance(vec![PolicyKind::CostControl]);
        config.cost_controls.model_restrictions = vec!["claude-sonnet".to_string()];
        let result = evaluate(&wf, &config);
        assert_eq!(result.verdict, Verdict::Block);
    }

    #[test]
    fn duplicate_violations_are_deduplicated() {
        let wf = workflow(vec![agent_step("a", None)]);
        let mut config = governance(vec![PolicyKind::Security]);
        config.policies.push(PolicyKind::Security);
        let result = evaluate(&wf, &config);
        let count = result
            .violations
            .iter()
            .filter(|v| v.reason == ReasonCode::AgentPolicyMissing)
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn evaluation_is_deterministic() {
        let wf = workflow(vec![agent_step("a", None), agent_step("b", None)]);
        let config = governance(vec![PolicyKind::Security, PolicyKind::Compliance]);
        let first = evaluate(&wf, &config);
        let second = evaluate(&wf, &config);
        assert_eq!(first, second);
    }

    #[test]
    fn approval_required_raises_the_verdict_floor() {
        let wf = workflow(vec![agent_step("a", Some(sample_policy()))]);
        let mut config = governance(vec![PolicyKind::Security]);
        config.approval_required = true;
        let result = evaluate(&wf, &config);
        assert_eq!(result.verdict, Verdict::RequireApproval);
    }
}
