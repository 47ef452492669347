use crate::shared::ids::StepId;
use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;

pub const SUPPORTED_VERSION: u64 = 1;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowDefinition {
    pub version: u64,
    pub name: String,
    pub model_ref: String,
    #[serde(default)]
    pub guardrails: Vec<String>,
    #[serde(default)]
    pub command_allowlist: Vec<String>,
    #[serde(default)]
    pub env: WorkflowEnv,
    pub steps: Vec<Step>,
}

impl WorkflowDefinition {
    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.steps.iter().find(|step| step.id.as_str() == step_id)
    }

    pub fn step_index(&self, step_id: &str) -> Option<usize> {
        self.steps
            .iter()
            .position(|step| step.id.as_str() == step_id)
    }
}

/// The workflow `env` block: three reserved keys plus a bounded map of
/// plain string variables exported to subprocesses.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkflowEnv {
    pub max_runtime_seconds: Option<u64>,
    pub artifacts_dir: Option<PathBuf>,
    pub seed: Option<u64>,
    pub vars: BTreeMap<String, String>,
}

impl Serialize for WorkflowEnv {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(None)?;
        if let Some(value) = self.max_runtime_seconds {
            map.serialize_entry("max_runtime_seconds", &value)?;
        }
        if let Some(value) = &self.artifacts_dir {
            map.serialize_entry("artifacts_dir", value)?;
        }
        if let Some(value) = self.seed {
            map.serialize_entry("seed", &value)?;
        }
        for (key, value) in &self.vars {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for WorkflowEnv {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = serde_yaml::Mapping::deserialize(deserializer)?;
        let mut env = WorkflowEnv::default();
        for (key, value) in raw {
            let key = match key {
                Value::String(key) => key,
                other => {
                    return Err(D::Error::custom(format!(
                        "env keys must be strings, got `{other:?}`"
                    )))
                }
            };
            match key.as_str() {
                "max_runtime_seconds" => {
                    env.max_runtime_seconds = Some(expect_u64::<D>(&key, &value)?);
                }
                "artifacts_dir" => {
                    env.artifacts_dir = Some(PathBuf::from(expect_string::<D>(&key, &value)?));
                }
                "seed" => {
                    env.seed = Some(expect_u64::<D>(&key, &value)?);
                }
                _ => {
                    env.vars.insert(key.clone(), expect_string::<D>(&key, &value)?);
                }
            }
        }
        Ok(env)
    }
}

fn expect_u64<'de, D: Deserializer<'de>>(key: &str, value: &Value) -> Result<u64, D::Error> {
    value
        .as_u64()
        .ok_or_else(|| D::Error::custom(format!("env `{key}` must be a non-negative integer")))
}

fn expect_string<'de, D: Deserializer<'de>>(key: &str, value: &Value) -> Result<String, D::Error> {
    match value {
        Value::String(s) => Ok(s.clone()),
        other => Err(D::Error::custom(format!(
            "env `{key}` must be a string, got `{other:?}`"
        ))),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    #[default]
    Fail,
    Continue,
}

impl OnError {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fail => "fail",
            Self::Continue => "continue",
        }
    }
}

impl std::fmt::Display for OnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-agent-step resource budget. Every field is mandatory; an agent step
/// without a complete policy never reaches the executor.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AgentPolicy {
    pub timeout_seconds: u64,
    pub max_files: u32,
    pub max_edits: u32,
    pub allowed_paths: Vec<String>,
    pub cmd_allowlist: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PromptStep {
    pub prompt_file: PathBuf,
    #[serde(default)]
    pub available_tools: Vec<String>,
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CmdStep {
    pub command: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AgentStep {
    #[serde(default)]
    pub policy: Option<AgentPolicy>,
    #[serde(default)]
    pub prompt_file: Option<PathBuf>,
    #[serde(default)]
    pub available_tools: Vec<String>,
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ApplyDiffStep {
    pub approve: bool,
    #[serde(default)]
    pub verify_command: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CustomStep {
    pub runner: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepKind {
    Prompt(PromptStep),
    Cmd(CmdStep),
    Agent(AgentStep),
    ApplyDiff(ApplyDiffStep),
    Custom(CustomStep),
}

impl StepKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Prompt(_) => "prompt",
            Self::Cmd(_) => "cmd",
            Self::Agent(_) => "agent",
            Self::ApplyDiff(_) => "apply-diff",
            Self::Custom(_) => "custom",
        }
    }
}

/// One unit of work. The `type` tag selects the payload variant; unknown
/// tags and unknown keys are rejected when the document is parsed, not when
/// the step executes.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub id: StepId,
    pub on_error: OnError,
    pub idempotent: bool,
    pub kind: StepKind,
}

impl Serialize for Step {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let payload = match &self.kind {
            StepKind::Prompt(step) => to_yaml_mapping(step),
            StepKind::Cmd(step) => to_yaml_mapping(step),
            StepKind::Agent(step) => to_yaml_mapping(step),
            StepKind::ApplyDiff(step) => to_yaml_mapping(step),
            StepKind::Custom(step) => to_yaml_mapping(step),
        }
        .map_err(serde::ser::Error::custom)?;

        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("id", &self.id)?;
        map.serialize_entry("type", self.kind.type_name())?;
        map.serialize_entry("on_error", &self.on_error)?;
        map.serialize_entry("idempotent", &self.idempotent)?;
        for (key, value) in payload {
            if let Value::String(key) = key {
                map.serialize_entry(&key, &value)?;
            }
        }
        map.end()
    }
}

fn to_yaml_mapping<T: Serialize>(value: &T) -> Result<serde_yaml::Mapping, serde_yaml::Error> {
    match serde_yaml::to_value(value)? {
        Value::Mapping(map) => Ok(map),
        _ => Ok(serde_yaml::Mapping::new()),
    }
}

impl<'de> Deserialize<'de> for Step {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let mut raw = serde_yaml::Mapping::deserialize(deserializer)?;

        let id_value = take_key(&mut raw, "id")
            .ok_or_else(|| D::Error::custom("step is missing required key `id`"))?;
        let id_raw = match id_value {
            Value::String(raw) => raw,
            other => return Err(D::Error::custom(format!("step `id` must be a string, got `{other:?}`"))),
        };
        let id = StepId::parse(&id_raw)
            .map_err(|err| D::Error::custom(format!("invalid step id `{id_raw}`: {err}")))?;

        let type_value = take_key(&mut raw, "type").ok_or_else(|| {
            D::Error::custom(format!("step `{id_raw}` is missing required key `type`"))
        })?;
        let type_tag = match type_value {
            Value::String(tag) => tag,
            other => {
                return Err(D::Error::custom(format!(
                    "step `{id_raw}` key `type` must be a string, got `{other:?}`"
                )))
            }
        };

        let on_error = match take_key(&mut raw, "on_error") {
            Some(value) => from_yaml_value::<OnError, D::Error>(&id_raw, "on_error", value)?,
            None => OnError::default(),
        };
        let idempotent = match take_key(&mut raw, "idempotent") {
            Some(Value::Bool(flag)) => flag,
            Some(other) => {
                return Err(D::Error::custom(format!(
                    "step `{id_raw}` key `idempotent` must be a boolean, got `{other:?}`"
                )))
            }
            None => false,
        };

        let payload = Value::Mapping(raw);
        let kind = match type_tag.as_str() {
            "prompt" => StepKind::Prompt(from_yaml_value::<PromptStep, D::Error>(&id_raw, "prompt", payload)?),
            "cmd" => StepKind::Cmd(from_yaml_value::<CmdStep, D::Error>(&id_raw, "cmd", payload)?),
            "agent" => StepKind::Agent(from_yaml_value::<AgentStep, D::Error>(&id_raw, "agent", payload)?),
            "apply-diff" => StepKind::ApplyDiff(from_yaml_value::<ApplyDiffStep, D::Error>(
                &id_raw,
                "apply-diff",
                payload,
            )?),
            "custom" => StepKind::Custom(from_yaml_value::<CustomStep, D::Error>(&id_raw, "custom", payload)?),
            other => {
                return Err(D::Error::custom(format!(
                    "step `{id_raw}` has unknown type `{other}`; expected one of: prompt, cmd, agent, apply-diff, custom"
                )))
            }
        };

        Ok(Step {
            id,
            on_error,
            idempotent,
            kind,
        })
    }
}

fn take_key(map: &mut serde_yaml::Mapping, key: &str) -> Option<Value> {
    map.remove(&Value::String(key.to_string()))
}

fn from_yaml_value<T, E>(step_id: &str, context: &str, value: Value) -> Result<T, E>
where
    T: serde::de::DeserializeOwned,
    E: serde::de::Error,
{
    serde_yaml::from_value(value)
        .map_err(|err| E::custom(format!("step `{step_id}` ({context}): {err}")))
}
