//! Error types for the onemigrate core library.
//!
//! [`Error`] covers infrastructure failures (I/O, configuration, process
//! control, remote APIs). Per-phase pipeline failures are reported separately
//! as [`crate::phase::PhaseFailure`] so the orchestrator can classify them.

use std::path::PathBuf;
use std::time::Duration;

/// The main error type for onemigrate operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error with optional path context.
    #[error("I/O error{}: {source}", path.as_ref().map(|p| format!(" at '{}'", p.display())).unwrap_or_default())]
    Io {
        source: std::io::Error,
        path: Option<PathBuf>,
    },

    /// The settings document does not exist.
    #[error("Config file not found: '{}'", path.display())]
    ConfigMissing { path: PathBuf },

    /// The settings document exists but is invalid.
    #[error("Config error: {message}")]
    Config { message: String },

    /// A migration job failed validation.
    #[error("Invalid job: {message}")]
    InvalidJob { message: String },

    /// An external tool could not be started or supervised.
    #[error("Tool '{program}' failed: {message}")]
    Tool { program: String, message: String },

    /// An external tool exceeded its time budget and was killed.
    #[error("Tool '{program}' timed out after {timeout:?}")]
    ToolTimeout { program: String, timeout: Duration },

    /// Error talking to the source hypervisor.
    #[error("Hypervisor error: {message}")]
    Hypervisor { message: String },

    /// Error talking to the destination image registry.
    #[error("Registry error: {message}")]
    Registry { message: String },

    /// Transport-level HTTP failure (connection, TLS, timeout, 5xx).
    #[error("HTTP error: {message}")]
    Http { message: String },

    /// Malformed XML-RPC payload.
    #[error("XML-RPC error: {message}")]
    XmlRpc { message: String },
}

/// A specialized Result type for onemigrate operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an I/O error with path context.
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        Self::Io {
            source,
            path: Some(path.into()),
        }
    }

    /// Create a config-missing error.
    pub fn config_missing(path: impl Into<PathBuf>) -> Self {
        Self::ConfigMissing { path: path.into() }
    }

    /// Create a config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an invalid-job error.
    pub fn invalid_job(message: impl Into<String>) -> Self {
        Self::InvalidJob {
            message: message.into(),
        }
    }

    /// Create a tool error.
    pub fn tool(program: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Tool {
            program: program.into(),
            message: message.into(),
        }
    }

    /// Create a tool timeout error.
    pub fn tool_timeout(program: impl Into<String>, timeout: Duration) -> Self {
        Self::ToolTimeout {
            program: program.into(),
            timeout,
        }
    }

    /// Create a hypervisor error.
    pub fn hypervisor(message: impl Into<String>) -> Self {
        Self::Hypervisor {
            message: message.into(),
        }
    }

    /// Create a registry error.
    pub fn registry(message: impl Into<String>) -> Self {
        Self::Registry {
            message: message.into(),
        }
    }

    /// Create an HTTP transport error.
    pub fn http(message: impl Into<String>) -> Self {
        Self::Http {
            message: message.into(),
        }
    }

    /// Create an XML-RPC error.
    pub fn xml_rpc(message: impl Into<String>) -> Self {
        Self::XmlRpc {
            message: message.into(),
        }
    }

    /// Whether retrying the same request could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Http { .. })
    }
}

impl From<reqwest::Error> for Error {
    fn from(source: reqwest::Error) -> Self {
        Self::http(source.to_string())
    }
}
