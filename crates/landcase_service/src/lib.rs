use thiserror::Error;

use landcase_core::{RegistryError, ValidationError};
use landcase_toolchain::ToolchainError;

mod executor;
mod reconcile;
mod service;
mod sites;
mod store;

pub use executor::{ExecutorFuture, TaskExecutor, TokioTaskExecutor};
pub use reconcile::{error_excerpt, with_task_info};
pub use service::{CaseService, ServiceConfig};
pub use sites::SiteLink;
pub use store::{CaseStore, FsCaseStore, StoreError};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ServiceError {
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("toolchain error: {0}")]
    Toolchain(#[from] ToolchainError),
    #[error("unknown case: {0}")]
    UnknownCase(String),
    #[error("executor error: {0}")]
    Executor(String),
    #[error("internal error: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests;
