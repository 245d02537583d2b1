use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Whole-set variable validation failure. Validation is atomic: one message
/// per failing variable, and no partial variable list is ever produced.
#[derive(Clone, Debug, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
#[error("variable validation failed: {}", .errors.join("; "))]
pub struct ValidationError {
    pub errors: Vec<String>,
}

impl ValidationError {
    pub fn new(errors: Vec<String>) -> Self {
        Self { errors }
    }

    pub fn single(message: impl Into<String>) -> Self {
        Self {
            errors: vec![message.into()],
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("registry document unreadable at {path}: {detail}")]
    Unreadable { path: String, detail: String },
    #[error("registry document is not valid json: {0}")]
    Parse(String),
}

/// Raised while turning a validated record into an executable plan.
/// A variable that passed validation but has no registry entry at plan time
/// means the registry changed underneath an old record; the plan fails
/// instead of guessing.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("variable {0} is not supported")]
    UnsupportedVariable(String),
    #[error("variable {name} has no usable value: {detail}")]
    InvalidValue { name: String, detail: String },
}
