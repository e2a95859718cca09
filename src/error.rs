//! Error types for mysqlbox.

use std::time::Duration;

use thiserror::Error;

/// Result type for mysqlbox operations.
pub type Result<T> = std::result::Result<T, BoxError>;

/// Errors that can occur while provisioning, using or tearing down a box.
#[derive(Debug, Error)]
pub enum BoxError {
    /// Docker is not available.
    #[error("Docker not available: {reason}")]
    DockerNotAvailable {
        /// Reason why Docker is unavailable.
        reason: String,
    },

    /// Failed to pull the image.
    #[error("Failed to pull image '{image}': {reason}")]
    ImagePullFailed {
        /// Image reference.
        image: String,
        /// Reason for failure.
        reason: String,
    },

    /// Failed to create the container.
    #[error("Failed to create container '{name}': {reason}")]
    ContainerCreationFailed {
        /// Container name.
        name: String,
        /// Reason for failure.
        reason: String,
    },

    /// Failed to start the container.
    #[error("Failed to start container '{name}': {reason}")]
    ContainerStartFailed {
        /// Container name.
        name: String,
        /// Reason for failure.
        reason: String,
    },

    /// The MySQL port binding could not be read from the running container.
    #[error("Failed to resolve MySQL port of container '{id}': {reason}")]
    PortResolutionFailed {
        /// Container ID.
        id: String,
        /// Reason for failure.
        reason: String,
    },

    /// MySQL did not accept connections before the readiness deadline.
    #[error("could not connect to mysql within {timeout:?}: {reason}")]
    ConnectTimeout {
        /// Readiness deadline.
        timeout: Duration,
        /// Last probe failure.
        reason: String,
    },

    /// The container exited before MySQL became reachable, usually because
    /// the initial script crashed the server during initialization.
    #[error("container '{name}' exited before mysql became ready")]
    ExitedEarly {
        /// Container name.
        name: String,
    },

    /// Failed to stop the container.
    #[error("Failed to stop container '{id}': {reason}")]
    ContainerStopFailed {
        /// Container ID.
        id: String,
        /// Reason for failure.
        reason: String,
    },

    /// Failed while waiting for the container to be removed.
    #[error("Failed waiting for removal of container '{id}': {reason}")]
    RemovalWaitFailed {
        /// Container ID.
        id: String,
        /// Reason for failure.
        reason: String,
    },

    /// Failed to force-remove a container.
    #[error("Failed to remove container '{id}': {reason}")]
    ContainerRemovalFailed {
        /// Container ID.
        id: String,
        /// Reason for failure.
        reason: String,
    },

    /// Failed to list containers carrying a label.
    #[error("Failed to list containers labelled '{label}': {reason}")]
    ContainerListFailed {
        /// Label as `key=value`.
        label: String,
        /// Reason for failure.
        reason: String,
    },

    /// The container log stream failed while the instance was running.
    #[error("Container log stream failed: {reason}")]
    LogStream {
        /// Reason for failure.
        reason: String,
    },

    /// A database connection could not be configured or used.
    #[error("Connection to database '{database}' failed: {reason}")]
    Connection {
        /// Database name.
        database: String,
        /// Reason for failure.
        reason: String,
    },

    /// The table catalog query failed.
    #[error("Failed to list tables: {reason}")]
    TableCatalog {
        /// Reason for failure.
        reason: String,
    },

    /// A TRUNCATE statement failed.
    #[error("Failed to truncate table '{table}': {reason}")]
    TruncateFailed {
        /// Table name.
        table: String,
        /// Reason for failure.
        reason: String,
    },

    /// The initial script could not be loaded or written.
    #[error("Initial script error: {reason}")]
    Script {
        /// Reason for failure.
        reason: String,
    },

    /// Configuration error.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The handle does not hold a running instance.
    #[error("mysqlbox instance is absent (never started or already stopped)")]
    InstanceAbsent,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while resolving configuration from the environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A variable is set but its value cannot be used.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// What is wrong with it.
        message: String,
    },

    /// A variable contains non-unicode data.
    #[error("Environment variable {key} is not valid unicode")]
    NotUnicode {
        /// Variable name.
        key: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readiness_errors_are_distinguishable() {
        let timeout = BoxError::ConnectTimeout {
            timeout: Duration::from_secs(30),
            reason: "connection refused".to_string(),
        };
        let exited = BoxError::ExitedEarly {
            name: "mysqlbox-abc".to_string(),
        };

        assert!(timeout.to_string().starts_with("could not connect to mysql"));
        assert!(exited.to_string().contains("exited before mysql became ready"));
    }

    #[test]
    fn test_config_error_is_transparent() {
        let err: BoxError = ConfigError::InvalidValue {
            key: "MYSQLBOX_PORT".to_string(),
            message: "invalid digit".to_string(),
        }
        .into();

        assert_eq!(
            err.to_string(),
            "Invalid value for MYSQLBOX_PORT: invalid digit"
        );
    }
}
