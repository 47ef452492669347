pub mod cli;
pub mod doctor;

pub use cli::run_cli;
pub use doctor::{run_checks, CheckStatus, DoctorCheck};
