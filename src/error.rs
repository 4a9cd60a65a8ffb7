//! Error types for the sequencing pipeline.
//!
//! All errors are strongly typed using thiserror so callers can match on
//! specific conditions. Overflow of the dispatch queue is not an
//! error: it is reported through `EnqueueOutcome` and the skipped counter.

use thiserror::Error;

use crate::job::JobId;

/// Errors raised synchronously while registering or configuring sequencers.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Path expression '{expression}' is invalid at position {position}: {reason}")]
    InvalidPathExpression {
        expression: String,
        position: usize,
        reason: String,
    },

    #[error("Path expression may not be blank")]
    BlankPathExpression,

    #[error("Sequencer '{name}' is already registered")]
    DuplicateSequencer {
        name: String,
    },

    #[error("Sequencer '{name}' is not registered")]
    UnknownSequencer {
        name: String,
    },

    #[error("Sequencer logic '{reference}' is not available in the catalog")]
    UnknownSequencerLogic {
        reference: String,
    },

    #[error("Required field '{field}' is missing")]
    MissingField {
        field: String,
    },

    #[error("Invalid setting '{setting}': {reason}")]
    InvalidSetting {
        setting: String,
        reason: String,
    },

    #[error("Unable to read configuration: {message}")]
    Unreadable {
        message: String,
    },
}

/// Errors raised while a job executes. These never propagate to the mutation
/// that triggered the job; they only mark the job FAILED.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Sequencer '{sequencer}' failed: {message}")]
    SequencerFailed {
        sequencer: String,
        message: String,
    },

    #[error("Sequencer '{sequencer}' panicked: {message}")]
    SequencerPanicked {
        sequencer: String,
        message: String,
    },

    #[error("Unable to obtain a session to workspace '{workspace}': {message}")]
    SessionUnavailable {
        workspace: String,
        message: String,
    },

    #[error("Node not found: {path}")]
    NodeNotFound {
        path: String,
    },

    #[error("Property '{property}' not found on node {path}")]
    PropertyNotFound {
        path: String,
        property: String,
    },

    #[error("Binary value {key} not found")]
    BinaryNotFound {
        key: String,
    },

    #[error("Invalid derived path '{path}': {reason}")]
    InvalidPath {
        path: String,
        reason: String,
    },

    #[error("Session has already been closed")]
    SessionClosed,

    #[error("Commit failed: {message}")]
    CommitFailed {
        message: String,
    },

    #[error("Storage error: {message}")]
    Storage {
        message: String,
    },

    #[error("Job {job_id} was abandoned by a terminated worker")]
    WorkerTerminated {
        job_id: JobId,
    },

    #[error("Timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },

    #[error("Channel '{path}' disconnected")]
    Disconnected {
        path: String,
    },
}

/// Lifecycle errors.
///
/// State mismatches are no-ops rather than errors; only resource failures
/// surface here.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Unable to spawn worker '{name}': {message}")]
    WorkerSpawn {
        name: String,
        message: String,
    },
}

/// Top-level error type for the sequencing pipeline.
#[derive(Debug, Error)]
pub enum SequencingError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl SequencingError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a configuration error.
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    /// Returns true if this is an execution error.
    #[must_use]
    pub const fn is_execution(&self) -> bool {
        matches!(self, Self::Execution(_))
    }

    /// Returns true if this is a lifecycle error.
    #[must_use]
    pub const fn is_lifecycle(&self) -> bool {
        matches!(self, Self::Lifecycle(_))
    }

    /// Returns true if this is an internal error.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }
}

/// Result type alias for sequencing operations.
pub type SequencingResult<T> = Result<T, SequencingError>;

pub(crate) fn lock_err(context: &str) -> SequencingError {
    SequencingError::internal(format!("lock poisoned: {context}"))
}
