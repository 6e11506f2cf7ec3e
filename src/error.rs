//! Error types for mcl-core.

use thiserror::Error;

/// Result type alias using mcl-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during loop operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Input rejected before entering the loop
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Timeout during operation
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// Cloud model API error
    #[error("Model API error: {provider} - {message}")]
    ModelApi { provider: String, message: String },

    /// Model error (simple variant)
    #[error("Model error: {0}")]
    Model(String),

    /// Trace storage error
    #[error("Trace storage error: {0}")]
    TraceStorage(String),

    /// Frame assembly error
    #[error("Frame assembly error: {0}")]
    FrameAssembly(String),

    /// A protected dependency is refusing calls
    #[error("Service unavailable: {service}")]
    ServiceUnavailable { service: String },

    /// Admission wait budget exhausted
    #[error("Wait budget of {max_wait_ms}ms exceeded before admission")]
    WaitBudgetExceeded { max_wait_ms: u64 },

    /// Scheduler capacity exhausted
    #[error("Schedule full: {0}")]
    ScheduleFull(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an invalid-input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Create a model API error.
    pub fn model_api(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ModelApi {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Create a service-unavailable error.
    pub fn service_unavailable(service: impl Into<String>) -> Self {
        Self::ServiceUnavailable {
            service: service.into(),
        }
    }

    /// Create a wait-budget error.
    pub fn wait_budget_exceeded(max_wait_ms: u64) -> Self {
        Self::WaitBudgetExceeded { max_wait_ms }
    }
}
