pub mod definition;
pub mod error;
pub mod load;
pub mod validate;

pub use definition::{
    AgentPolicy, AgentStep, ApplyDiffStep, CmdStep, CustomStep, OnError, PromptStep, Step,
    StepKind, WorkflowDefinition, WorkflowEnv, SUPPORTED_VERSION,
};
pub use error::WorkflowError;
pub use load::{env_template_name, parse_workflow_file, LoadedWorkflow};
pub use validate::{validate_workflow, ValidationResult};
