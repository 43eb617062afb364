use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Every way a language-server operation can fail.
///
/// None of these are fatal to the editor: the pipeline carries them to its
/// terminal `Result` stage and the editor shows them as a status message.
#[derive(Error, Debug)]
pub enum LspError {
    #[error("no language support found for extension: {extension}")]
    NoLanguageSupport { extension: String },

    #[error("LSP server {server} is not installed")]
    ServerNotInstalled { server: String },

    #[error("failed to start language server {server}: {source}")]
    Spawn {
        server: String,
        #[source]
        source: std::io::Error,
    },

    #[error("language server {stream} pipe not available")]
    Pipe { stream: &'static str },

    #[error("frame is missing its Content-Length header")]
    MissingHeader,

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("timeout waiting for response to {method} (id {id}) after {timeout:?}")]
    Timeout { method: String, id: u64, timeout: Duration },

    #[error("LSP error {code}: {message}")]
    Server { code: i64, message: String },

    #[error("language server connection closed")]
    ConnectionClosed,

    #[error("no {what} found")]
    NotFound { what: &'static str },

    #[error("LSP server not ready")]
    NotReady,

    #[error("LSP server not ready after {0:?}")]
    ReadinessTimeout(Duration),

    #[error("invalid path: {}", .0.display())]
    InvalidPath(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classes of [`LspError`], used for status rendering and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Environment,
    Process,
    Protocol,
    Semantic,
    Readiness,
    Io,
}

impl LspError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NoLanguageSupport { .. } | Self::ServerNotInstalled { .. } => {
                ErrorCategory::Environment
            }
            Self::Spawn { .. } | Self::Pipe { .. } => ErrorCategory::Process,
            Self::MissingHeader
            | Self::MalformedFrame(_)
            | Self::Json(_)
            | Self::Timeout { .. }
            | Self::Server { .. }
            | Self::ConnectionClosed => ErrorCategory::Protocol,
            Self::NotFound { .. } => ErrorCategory::Semantic,
            Self::NotReady | Self::ReadinessTimeout(_) => ErrorCategory::Readiness,
            Self::InvalidPath(_) | Self::Io(_) => ErrorCategory::Io,
        }
    }
}
