use landcase_core::PlanError;
use thiserror::Error;

mod command;
mod executor;
mod install;
mod namelist;

pub use command::{run_command, CommandOutput, CommandSpec};
pub use executor::{PlanExecutor, StatusSink, ToolchainFuture};
pub use install::ToolchainLayout;
pub use namelist::{render_namelist_entry, render_namelist_value};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ToolchainError {
    #[error("toolchain script missing: {0}")]
    MissingScript(String),
    #[error("{program} failed: {stderr}")]
    CommandFailed { program: String, stderr: String },
    #[error("io error: {0}")]
    Io(String),
    #[error("vegetation parameter file not found")]
    ParamFileNotFound,
    #[error("plan error: {0}")]
    Plan(#[from] PlanError),
    #[error("status update failed: {0}")]
    Status(String),
    #[error("internal error: {0}")]
    Internal(String),
}
