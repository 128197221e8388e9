//! Error types shared across the workspace.

use thiserror::Error;

/// Main error type for configuration and host-level failures.
#[derive(Error, Debug)]
pub enum Error {
    /// IO errors (reading configuration files)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed TOML
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// A configuration value is out of range
    #[error("Config error: {0}")]
    Config(String),

    /// Generic internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using the workspace's Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = Error::Config("frames_in_flight must be at least 1".to_string());
        assert_eq!(
            err.to_string(),
            "Config error: frames_in_flight must be at least 1"
        );
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
