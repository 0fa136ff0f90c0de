//! Structured error types shared across the unfolding crates.

use std::collections::BTreeMap;
use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured payload attached to every [`UnfoldError`] variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Stable machine readable error code.
    pub code: String,
    /// Human readable diagnostic message.
    pub message: String,
    /// Contextual key value pairs (bin indices, lengths, etc.).
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    /// Optional hint that may help the caller resolve the issue.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl ErrorInfo {
    /// Creates a new error payload with the provided code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            context: BTreeMap::new(),
            hint: None,
        }
    }

    /// Adds a context entry to the payload.
    pub fn with_context(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.context.insert(key.into(), value.to_string());
        self
    }

    /// Sets a human readable hint for remediation.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

/// Canonical error type for the unfolding engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "family", content = "detail")]
pub enum UnfoldError {
    /// Bin counts implied by the inputs disagree.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(ErrorInfo),
    /// Inconsistent or incomplete configuration.
    #[error("configuration error: {0}")]
    Configuration(ErrorInfo),
    /// Malformed prior or input data.
    #[error("validation error: {0}")]
    Validation(ErrorInfo),
    /// Regularization fit did not converge.
    #[error("regularization error: {0}")]
    Regularization(ErrorInfo),
    /// Degenerate response matrix or efficiencies.
    #[error("mixing error: {0}")]
    Mixing(ErrorInfo),
    /// Test statistic inputs live on different supports.
    #[error("comparison error: {0}")]
    Comparison(ErrorInfo),
    /// Non-finite values produced mid-iteration.
    #[error("divergence error: {0}")]
    Divergence(ErrorInfo),
    /// Serialization and schema errors.
    #[error("serde error: {0}")]
    Serde(ErrorInfo),
}

impl Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code: {})", self.message, self.code)?;
        if !self.context.is_empty() {
            write!(f, " | context: [")?;
            for (idx, (key, value)) in self.context.iter().enumerate() {
                if idx > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{key}={value}")?;
            }
            write!(f, "]")?;
        }
        if let Some(hint) = &self.hint {
            write!(f, " | hint: {hint}")?;
        }
        Ok(())
    }
}

impl UnfoldError {
    /// Returns a reference to the payload describing the error.
    pub fn info(&self) -> &ErrorInfo {
        match self {
            UnfoldError::ShapeMismatch(info)
            | UnfoldError::Configuration(info)
            | UnfoldError::Validation(info)
            | UnfoldError::Regularization(info)
            | UnfoldError::Mixing(info)
            | UnfoldError::Comparison(info)
            | UnfoldError::Divergence(info)
            | UnfoldError::Serde(info) => info,
        }
    }

    /// Shorthand for a [`UnfoldError::ShapeMismatch`] carrying both lengths.
    pub fn shape(code: &str, what: &str, expected: usize, found: usize) -> Self {
        UnfoldError::ShapeMismatch(
            ErrorInfo::new(code, format!("{what} has unexpected length"))
                .with_context("expected", expected)
                .with_context("found", found),
        )
    }
}
