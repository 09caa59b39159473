//! Structured error types shared across trialbal crates.

use std::collections::BTreeMap;
use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured payload attached to every [`TrialError`] variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Stable machine readable error code.
    pub code: String,
    /// Human readable diagnostic message.
    pub message: String,
    /// Contextual key value pairs (instance ids, covariate names, sizes).
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
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Sets a human readable hint for remediation.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

/// Canonical error type for allocation experiments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "family", content = "detail")]
pub enum TrialError {
    /// A different protocol configuration was submitted for an instance already started.
    #[error("protocol conflict: {0}")]
    ProtocolConflict(ErrorInfo),
    /// Group sizes diverged by more than one after full assignment.
    #[error("assignment invariant violated: {0}")]
    AssignmentInvariant(ErrorInfo),
    /// Contingency table has fewer than two informative rows or columns.
    #[error("degenerate table: {0}")]
    DegenerateTable(ErrorInfo),
    /// Not enough observations to compute a statistic.
    #[error("insufficient data: {0}")]
    InsufficientData(ErrorInfo),
    /// A numeric routine produced an unusable value.
    #[error("test computation failed: {0}")]
    TestComputation(ErrorInfo),
    /// The allocation service failed in the middle of a trial.
    #[error("trial aborted: {0}")]
    TrialAborted(ErrorInfo),
    /// The allocation service rejected a payload.
    #[error("invalid data: {0}")]
    InvalidData(ErrorInfo),
    /// Unknown or stopped protocol instance, or unknown subject.
    #[error("not found: {0}")]
    NotFound(ErrorInfo),
    /// Wire-level failure talking to a remote allocation service.
    #[error("transport error: {0}")]
    Transport(ErrorInfo),
    /// Serialization, schema and filesystem errors.
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

impl TrialError {
    /// Returns a reference to the payload describing the error.
    pub fn info(&self) -> &ErrorInfo {
        match self {
            TrialError::ProtocolConflict(info)
            | TrialError::AssignmentInvariant(info)
            | TrialError::DegenerateTable(info)
            | TrialError::InsufficientData(info)
            | TrialError::TestComputation(info)
            | TrialError::TrialAborted(info)
            | TrialError::InvalidData(info)
            | TrialError::NotFound(info)
            | TrialError::Transport(info)
            | TrialError::Serde(info) => info,
        }
    }

    /// Short family label used in failure records and logs.
    pub fn family(&self) -> &'static str {
        match self {
            TrialError::ProtocolConflict(_) => "protocol-conflict",
            TrialError::AssignmentInvariant(_) => "assignment-invariant",
            TrialError::DegenerateTable(_) => "degenerate-table",
            TrialError::InsufficientData(_) => "insufficient-data",
            TrialError::TestComputation(_) => "test-computation",
            TrialError::TrialAborted(_) => "trial-aborted",
            TrialError::InvalidData(_) => "invalid-data",
            TrialError::NotFound(_) => "not-found",
            TrialError::Transport(_) => "transport",
            TrialError::Serde(_) => "serde",
        }
    }

    /// True for statistical preconditions that skip a single result row.
    pub fn is_statistical(&self) -> bool {
        matches!(
            self,
            TrialError::DegenerateTable(_)
                | TrialError::InsufficientData(_)
                | TrialError::TestComputation(_)
        )
    }

    /// True for errors that invalidate a whole experiment configuration.
    pub fn is_config_fatal(&self) -> bool {
        matches!(
            self,
            TrialError::ProtocolConflict(_) | TrialError::AssignmentInvariant(_)
        )
    }

    /// Attaches a context entry to the payload regardless of family.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let info = match &mut self {
            TrialError::ProtocolConflict(info)
            | TrialError::AssignmentInvariant(info)
            | TrialError::DegenerateTable(info)
            | TrialError::InsufficientData(info)
            | TrialError::TestComputation(info)
            | TrialError::TrialAborted(info)
            | TrialError::InvalidData(info)
            | TrialError::NotFound(info)
            | TrialError::Transport(info)
            | TrialError::Serde(info) => info,
        };
        info.context.insert(key.into(), value.into());
        self
    }
}
