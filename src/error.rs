//! Error types for window counter operations.

use std::fmt;

use thiserror::Error;

/// The public operation that produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Get,
    Peek,
    Reset,
}

impl Operation {
    /// Verb used in error messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Get => "get",
            Operation::Peek => "peek",
            Operation::Reset => "reset",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for ratewindow operations.
#[derive(Error, Debug)]
pub enum WindowError {
    /// The store could not be reached or failed the command
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// The watched key changed between observation and commit
    #[error("transaction aborted: watched key was modified concurrently")]
    OptimisticConflict,

    /// Every configured attempt hit a conflict
    #[error("retry limit exceeded after {attempts} attempts")]
    RetryExhausted { attempts: u32 },

    /// The counter needed an expiry and the store refused to set one
    #[error("cannot configure timeout on key")]
    ExpiryFixupFailed,

    /// A stored value is not an integer counter
    #[error("malformed counter value: {0}")]
    MalformedState(String),

    /// The caller cancelled the operation
    #[error("operation cancelled")]
    Cancelled,

    /// The caller's deadline elapsed
    #[error("operation deadline exceeded")]
    DeadlineExceeded,

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An error surfaced by a public operation, annotated with the window key
    #[error("cannot {op} value for {key}: {source}")]
    Operation {
        op: Operation,
        key: String,
        #[source]
        source: Box<WindowError>,
    },
}

impl WindowError {
    /// Wrap an error with the operation and fully-qualified key.
    pub fn during(self, op: Operation, key: impl Into<String>) -> Self {
        WindowError::Operation {
            op,
            key: key.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping operation context.
    pub fn root(&self) -> &WindowError {
        match self {
            WindowError::Operation { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether the error is an optimistic-transaction abort that may be retried.
    pub fn is_conflict(&self) -> bool {
        matches!(self.root(), WindowError::OptimisticConflict)
    }
}

impl From<redis::RedisError> for WindowError {
    fn from(err: redis::RedisError) -> Self {
        let message = err.to_string();
        // INCR on a non-integer value, or past i64::MAX.
        if message.contains("not an integer") || message.contains("would overflow") {
            WindowError::MalformedState(message)
        } else {
            WindowError::StoreUnavailable(message)
        }
    }
}

/// Result type alias for ratewindow operations.
pub type Result<T> = std::result::Result<T, WindowError>;
