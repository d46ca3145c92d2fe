//! Error handling for usrecon-rs
//!
//! This module defines the error taxonomy for acquisition and reconstruction
//! and a Result alias for use throughout the crate.

use thiserror::Error;

use crate::session::SessionState;

/// Main error type for acquisition and reconstruction operations
#[derive(Error, Debug)]
pub enum UsReconError {
    /// Recording requested while the readiness predicate is false
    #[error("Not ready: {0}")]
    NotReady(String),

    /// Operation not permitted in the current session state
    #[error("Cannot {operation} while session is {state}")]
    InvalidTransition {
        operation: &'static str,
        state: SessionState,
    },

    /// No frame of a stream could be matched to a recent tracking sample
    #[error("Stale tracking on stream '{stream}': all {dropped} frames dropped")]
    StaleTracking { stream: String, dropped: usize },

    /// Volume grid above the memory ceiling, or a frame copy that could not be allocated
    #[error("Allocation error: {0}")]
    Allocation(String),

    /// Probe-to-tool calibration is identity/default
    #[error("Calibration missing: {0}")]
    CalibrationMissing(String),

    /// User-requested cancellation
    #[error("Operation cancelled")]
    Cancelled,

    /// Errors reported by a video or tracking source
    #[error("Source error: {0}")]
    Source(String),

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors related to reading or writing sessions and volumes
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Errors related to channel communication
    #[error("Channel error: {0}")]
    Channel(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<UsReconError>,
    },
}

impl UsReconError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        UsReconError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping any context wrappers
    pub fn root(&self) -> &UsReconError {
        match self {
            UsReconError::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    /// Check if this error (or the error it wraps) is a cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), UsReconError::Cancelled)
    }
}

impl From<serde_json::Error> for UsReconError {
    fn from(err: serde_json::Error) -> Self {
        UsReconError::Serialization(err.to_string())
    }
}

/// Result type alias for usrecon-rs operations
pub type Result<T> = std::result::Result<T, UsReconError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, std::io::Error> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| UsReconError::Io(e).with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| UsReconError::Io(e).with_context(f()))
    }
}
