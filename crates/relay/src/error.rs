//! Error types shared across the engine

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::engine::InvalidTransition;
use crate::models::SyncRunId;

/// Field-level validation failures, keyed by field name
///
/// Serializes to the shape API callers expect, e.g.
/// `{"schedule_type": ["invalid schedule type"]}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ValidationErrors(BTreeMap<String, Vec<String>>);

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set holding a single failure
    pub fn single(field: impl Into<String>, message: impl Into<String>) -> Self {
        let mut errors = Self::new();
        errors.add(field, message);
        errors
    }

    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.0.entry(field.into()).or_default().push(message.into());
    }

    /// Merge another set into this one
    pub fn extend(&mut self, other: ValidationErrors) {
        for (field, messages) in other.0 {
            self.0.entry(field).or_default().extend(messages);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Messages recorded for a field
    pub fn get(&self, field: &str) -> Option<&[String]> {
        self.0.get(field).map(Vec::as_slice)
    }

    /// `Ok(())` when nothing was recorded
    pub fn into_result(self) -> Result<(), ValidationErrors> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (field, messages) in &self.0 {
            for message in messages {
                if !first {
                    f.write_str("; ")?;
                }
                write!(f, "{field}: {message}")?;
                first = false;
            }
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

/// A stored string did not name a known enum variant
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value:?}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    pub fn new(kind: &'static str, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }
}

/// Errors returned by engine operations
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Validation failed: {0}")]
    Validation(ValidationErrors),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    /// Another transition on the same run committed first
    #[error("Sync run {0} was modified concurrently")]
    ConcurrentTransition(SyncRunId),

    #[error("Not found: {resource}")]
    NotFound { resource: String },

    #[error("Connector error: {message}")]
    Connector { message: String },

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl SyncError {
    pub fn not_found(resource: impl Into<String>) -> Self {
        SyncError::NotFound {
            resource: resource.into(),
        }
    }

    pub fn connector(message: impl Into<String>) -> Self {
        SyncError::Connector {
            message: message.into(),
        }
    }

    /// The validation failures, if this is a validation error
    pub fn validation_errors(&self) -> Option<&ValidationErrors> {
        match self {
            SyncError::Validation(errors) => Some(errors),
            _ => None,
        }
    }
}

impl From<ValidationErrors> for SyncError {
    fn from(errors: ValidationErrors) -> Self {
        SyncError::Validation(errors)
    }
}
