//! Error types for fableq operations.

use thiserror::Error;

use crate::task::{TaskId, TaskType};

/// Result type used throughout fableq.
pub type FableResult<T> = Result<T, FableError>;

/// Main error type for fableq operations.
#[derive(Error, Debug)]
pub enum FableError {
    /// Payload or request failed validation
    #[error("Validation failed: {message}")]
    Validation {
        /// Error message
        message: String,
    },

    /// No processor is registered for the task type
    #[error("No processor registered for task type '{task_type}'")]
    UnknownTaskType {
        /// The task type that wasn't found
        task_type: TaskType,
    },

    /// Task not found in the store
    #[error("Task '{task_id}' not found")]
    TaskNotFound {
        /// The missing task
        task_id: TaskId,
    },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Task store error
    #[error("Store error: {message}")]
    Store {
        /// Error message
        message: String,
        /// Optional underlying error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Notification delivery error
    #[error("Notification error: {message}")]
    Notification {
        /// Error message
        message: String,
    },

    /// Operation timeout
    #[error("Operation timed out after {timeout_secs} seconds")]
    Timeout {
        /// Timeout duration in seconds
        timeout_secs: u64,
    },

    /// Configuration error
    #[error("Configuration error: {message}")]
    ConfigError {
        /// Error message
        message: String,
    },

    /// The queue manager is already running
    #[error("Queue manager is already running")]
    AlreadyRunning,

    /// The queue manager is not running
    #[error("Queue manager is not running")]
    NotRunning,

    /// Database error
    #[cfg(feature = "postgres-store")]
    #[cfg_attr(docsrs, doc(cfg(feature = "postgres-store")))]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Metrics registration error
    #[cfg(feature = "metrics")]
    #[cfg_attr(docsrs, doc(cfg(feature = "metrics")))]
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl FableError {
    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a store error wrapping an underlying cause
    pub fn store<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Store {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a store error without an underlying cause
    pub fn store_msg(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
            source: None,
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError {
            message: message.into(),
        }
    }

    /// Whether this error came from the task store layer
    pub fn is_store_error(&self) -> bool {
        match self {
            Self::Store { .. } => true,
            #[cfg(feature = "postgres-store")]
            Self::Database(_) => true,
            _ => false,
        }
    }
}
