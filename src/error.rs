//! Custom error types for flotilla.

use thiserror::Error;

/// Errors that can occur while converging a cluster.
#[derive(Error, Debug)]
pub enum FlotillaError {
    #[error("no OS support for {0}")]
    MissingOsSupport(String),

    #[error("staged binary {path} not found on {host}")]
    BinaryMissing { host: String, path: String },

    #[error("invalid cluster configuration: {0}")]
    InvalidClusterConfig(String),

    #[error("cluster has no controller host")]
    NoLeader,
}

impl FlotillaError {
    /// Returns true when retrying the failed operation cannot help.
    pub const fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::MissingOsSupport(_) | Self::InvalidClusterConfig(_) | Self::NoLeader
        )
    }
}
