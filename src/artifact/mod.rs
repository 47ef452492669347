pub mod run_state;
pub mod store;

pub use crate::shared::ids::generate_run_id;
pub use run_state::{RunState, RunStatus, StepResult, StepStatus};
pub use store::{list_run_ids, ArtifactError, ArtifactStore, PENDING_MARKER, RUN_STATE_FILE};
