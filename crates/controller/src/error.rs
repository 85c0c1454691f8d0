//! Error types for the replica controller.

use ess_cloud::CloudProviderError;
use thiserror::Error;

/// Errors raised while running a control cycle.
#[derive(Error, Debug)]
pub enum ControllerError {
    /// A backend call failed.
    #[error("Backend error: {0}")]
    Backend(#[from] CloudProviderError),

    /// A bounded wait expired.
    #[error("{operation} timed out after {waited_secs} seconds")]
    Timeout {
        /// What was being waited for.
        operation: String,
        /// Bound that expired.
        waited_secs: u64,
    },

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// A launched task stopped before it became usable.
    #[error("Task launch failed: {0}")]
    LaunchFailed(String),
}

/// Configuration validation errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required identifier is empty.
    #[error("{0} must not be empty")]
    Missing(&'static str),

    /// No subnets were given.
    #[error("at least one subnet id is required")]
    NoSubnets,

    /// Volume size of zero.
    #[error("volume size must be at least 1 GiB")]
    ZeroVolumeSize,

    /// The per-replica environment template could not be parsed.
    #[error("invalid task environment: {0}")]
    Environment(String),
}

/// Result alias for controller operations.
pub type Result<T, E = ControllerError> = std::result::Result<T, E>;
