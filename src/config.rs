use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::lsp::client::ClientSettings;
use crate::lsp::server::ServerCommand;
use crate::utils::error::LspError;

/// User configuration, read from an optional JSON file.
///
/// Every field has a default, so `{}` is a valid file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub request_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
    /// Readiness bound for interactive queries.
    pub ready_timeout_ms: u64,
    /// Readiness bound for the bulk indexing flow (`check`).
    pub index_ready_timeout_ms: u64,
    /// Post-handshake settling time. Tuned against gopls; not a protocol guarantee.
    pub ready_grace_ms: u64,
    pub ready_poll_interval_ms: u64,
    /// Cap on documents opened per workspace before a query.
    pub max_open_files: usize,
    pub transcript_dir: Option<PathBuf>,
    pub disable_transcripts: bool,
    /// Extra or replacement language servers. An entry replaces the built-in
    /// mapping for each extension it lists.
    pub languages: Vec<LanguageServer>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            request_timeout_ms: 10_000,
            shutdown_grace_ms: 2_000,
            ready_timeout_ms: 5_000,
            index_ready_timeout_ms: 30_000,
            ready_grace_ms: 3_000,
            ready_poll_interval_ms: 100,
            max_open_files: 2_000,
            transcript_dir: None,
            disable_transcripts: false,
            languages: Vec::new(),
        }
    }
}

impl Config {
    /// Load `path`, or the defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn client_settings(&self) -> ClientSettings {
        let transcript_dir = if self.disable_transcripts {
            None
        } else {
            Some(self.transcript_dir.clone().unwrap_or_else(std::env::temp_dir))
        };
        ClientSettings {
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
            ready_grace: Duration::from_millis(self.ready_grace_ms),
            ready_poll_interval: Duration::from_millis(self.ready_poll_interval_ms.max(1)),
            transcript_dir,
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            ready_timeout: Duration::from_millis(self.ready_timeout_ms),
            max_open_files: self.max_open_files,
        }
    }

    pub fn index_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.index_ready_timeout_ms)
    }

    pub fn language_registry(&self) -> LanguageRegistry {
        let mut registry = LanguageRegistry::builtin();
        for server in &self.languages {
            registry.register(server.clone());
        }
        registry
    }
}

/// Bounds applied by the query pipeline.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub ready_timeout: Duration,
    pub max_open_files: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Config::default().pipeline_settings()
    }
}

/// A language server and the file extensions it handles.
#[derive(Debug, Clone, Deserialize)]
pub struct LanguageServer {
    pub language: String,
    pub extensions: Vec<String>,
    pub server: ServerCommand,
}

impl LanguageServer {
    fn new(language: &str, extensions: &[&str], server: ServerCommand) -> Self {
        Self {
            language: language.to_string(),
            extensions: extensions.iter().map(|e| (*e).to_string()).collect(),
            server,
        }
    }

    pub fn handles(&self, path: &Path) -> bool {
        extension_of(path).is_some_and(|ext| self.extensions.iter().any(|e| *e == ext))
    }
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase)
}

/// Maps file extensions to the server that should answer for them.
#[derive(Debug, Clone, Default)]
pub struct LanguageRegistry {
    servers: Vec<LanguageServer>,
}

impl LanguageRegistry {
    pub fn builtin() -> Self {
        let mut registry = Self::default();
        registry.register(LanguageServer::new(
            "Go",
            &["go"],
            ServerCommand::new("gopls", "gopls", &[]),
        ));
        registry.register(LanguageServer::new(
            "Python",
            &["py"],
            ServerCommand::new("pyright", "pyright-langserver", &["--stdio"]),
        ));
        registry.register(LanguageServer::new(
            "JavaScript/TypeScript",
            &["js", "jsx", "ts", "tsx"],
            ServerCommand::new(
                "typescript-language-server",
                "typescript-language-server",
                &["--stdio"],
            ),
        ));
        registry.register(LanguageServer::new(
            "Rust",
            &["rs"],
            ServerCommand::new("rust-analyzer", "rust-analyzer", &[]),
        ));
        registry.register(LanguageServer::new(
            "C/C++",
            &["c", "h", "cc", "cpp", "cxx", "hpp"],
            ServerCommand::new("clangd", "clangd", &[]),
        ));
        registry
    }

    /// Add `server`, taking its extensions away from any earlier entry.
    pub fn register(&mut self, server: LanguageServer) {
        for existing in &mut self.servers {
            existing.extensions.retain(|ext| !server.extensions.contains(ext));
        }
        self.servers.retain(|existing| !existing.extensions.is_empty());
        self.servers.push(server);
    }

    pub fn for_path(&self, path: &Path) -> Result<&LanguageServer, LspError> {
        self.servers.iter().find(|server| server.handles(path)).ok_or_else(|| {
            LspError::NoLanguageSupport { extension: extension_of(path).unwrap_or_default() }
        })
    }

    pub fn servers(&self) -> &[LanguageServer] {
        &self.servers
    }
}
