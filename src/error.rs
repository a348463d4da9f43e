//! Error types for the mock runtime.
//!
//! One enum per concern: definition loading, structural validation,
//! extension loading, per-message matching and handler startup.

use std::path::PathBuf;
use thiserror::Error;

use crate::config::Protocol;

/// Structural problems in a mock definition.
///
/// Validation never looks at template or regex syntax; those fail later at
/// render or listen time.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// `protocol` named something no handler implements
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    /// Port outside 1-65535
    #[error("port must be between 1 and 65535, got {0}")]
    InvalidPort(u16),

    /// HTTP definition without routes
    #[error("'routes' must be defined for HTTP protocol")]
    MissingRoutes,

    /// TCP or WebSocket definition without an `onMessage` block
    #[error("'onMessage' must be defined for {0} protocol")]
    MissingOnMessage(Protocol),

    /// SFTP definition without files
    #[error("'files' must be defined for SFTP protocol")]
    MissingFiles,

    /// SFTP definition without credentials
    #[error("'sftpAuth' must be defined for SFTP protocol")]
    MissingSftpAuth,

    /// SFTP credentials with an empty username or password
    #[error("'sftpAuth' must include username and password")]
    IncompleteSftpAuth,
}

/// Errors raised while reading a definition document.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("error reading file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON document did not match the definition shape
    #[error("invalid JSON format: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML document did not match the definition shape
    #[error("invalid YAML format: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Document parsed but failed structural validation
    #[error("schema validation failed: {0}")]
    Validation(#[from] ValidationError),
}

/// Errors raised while fetching an extension fragment.
#[derive(Debug, Error)]
pub enum ExtensionError {
    /// Remote fetch failed at the transport level
    #[error("failed to fetch {source_url}: {error}")]
    Http {
        source_url: String,
        #[source]
        error: reqwest::Error,
    },

    /// Remote fetch returned something other than 200
    #[error("failed to fetch {source_url}: status {status}")]
    Status { source_url: String, status: u16 },

    /// Local file could not be read
    #[error("failed to read {path}: {error}")]
    Io {
        path: String,
        #[source]
        error: std::io::Error,
    },
}

/// Per-message failures inside the matching pipeline. Always recovered by
/// the owning connection.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The definition carries no `onMessage` block
    #[error("onMessage is not defined")]
    MissingRules,

    /// A response template failed to render
    #[error("failed to render {stage}: {source}")]
    Render {
        stage: String,
        #[source]
        source: handlebars::RenderError,
    },
}

/// Errors surfaced by a protocol handler's `start`/`stop`.
#[derive(Debug, Error)]
pub enum StartError {
    /// The definition should never have reached a handler
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Listener could not bind (typically the port is in use)
    #[error("failed to listen on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// Listener bound but the server loop died right away
    #[error("server on port {port} exited during startup: {reason}")]
    Exited { port: u16, reason: String },

    /// SSH host key could not be loaded or generated
    #[error("failed to load host key: {0}")]
    HostKey(String),

    /// Filesystem work required before listening failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// `start` called twice without `stop`
    #[error("handler is already running")]
    AlreadyRunning,
}

/// Convenience alias for handler lifecycle results.
pub type StartResult<T> = std::result::Result<T, StartError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_messages() {
        assert_eq!(
            ValidationError::UnsupportedProtocol("smtp".into()).to_string(),
            "unsupported protocol: smtp"
        );
        assert_eq!(
            ValidationError::MissingOnMessage(Protocol::Ws).to_string(),
            "'onMessage' must be defined for ws protocol"
        );
    }

    #[test]
    fn test_config_error_wraps_validation() {
        let err: ConfigError = ValidationError::MissingRoutes.into();
        assert_eq!(
            err.to_string(),
            "schema validation failed: 'routes' must be defined for HTTP protocol"
        );
    }

    #[test]
    fn test_bind_error_names_port() {
        let err = StartError::Bind {
            port: 8080,
            source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "address in use"),
        };
        assert!(err.to_string().contains("8080"));
        assert!(err.to_string().contains("address in use"));
    }
}
