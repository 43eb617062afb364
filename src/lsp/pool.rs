//! LSP client pool management.
//!
//! One [`LspClient`] per (server, workspace root). Clients are created on
//! first use and shared by every later query against the same root, so the
//! server process and its index survive between queries.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::task::JoinSet;

use crate::lsp::client::{ClientSettings, LspClient};
use crate::lsp::server::ServerCommand;
use crate::utils::error::LspError;

/// Creates the client for a pool entry.
///
/// Called with the pool lock held, so it must not block for long: spawn
/// the process and return, leave the handshake to the background.
pub trait Launcher: Send + Sync {
    fn launch(
        &self,
        command: &ServerCommand,
        root: &Path,
        settings: &ClientSettings,
    ) -> Result<Arc<LspClient>, LspError>;
}

/// Launches real server processes.
pub struct ProcessLauncher;

impl Launcher for ProcessLauncher {
    fn launch(
        &self,
        command: &ServerCommand,
        root: &Path,
        settings: &ClientSettings,
    ) -> Result<Arc<LspClient>, LspError> {
        LspClient::spawn(command, root, settings.clone())
    }
}

/// Identity of a pool entry: server name plus absolute workspace root.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub server: String,
    pub root: PathBuf,
}

/// Manages a pool of LSP clients, one per workspace.
///
/// # Thread Safety
///
/// The map sits behind one mutex and a lookup holds it across both the
/// check and the insert, so concurrent lookups for the same root can never
/// launch two servers.
///
/// # Example
///
/// ```no_run
/// use std::path::Path;
/// use modal_lsp::lsp::client::ClientSettings;
/// use modal_lsp::lsp::pool::LspClientPool;
/// use modal_lsp::lsp::server::ServerCommand;
///
/// # async fn example() -> anyhow::Result<()> {
/// let pool = LspClientPool::new(ClientSettings::default());
/// let gopls = ServerCommand::new("gopls", "gopls", &[]);
///
/// let client = pool.get_client(&gopls, Path::new("/path/to/workspace"))?;
/// client.wait_for_ready(std::time::Duration::from_secs(5)).await;
///
/// pool.close_all().await;
/// # Ok(())
/// # }
/// ```
pub struct LspClientPool {
    entries: Mutex<HashMap<PoolKey, Arc<LspClient>>>,
    launcher: Box<dyn Launcher>,
    settings: ClientSettings,
}

impl LspClientPool {
    /// Creates an empty pool that launches real server processes.
    pub fn new(settings: ClientSettings) -> Self {
        Self::with_launcher(settings, ProcessLauncher)
    }

    pub fn with_launcher(settings: ClientSettings, launcher: impl Launcher + 'static) -> Self {
        Self { entries: Mutex::new(HashMap::new()), launcher: Box::new(launcher), settings }
    }

    /// Gets the client for `root`, launching one if there is none yet.
    ///
    /// `root` is made absolute before lookup. A pooled client whose
    /// handshake failed or that was closed is replaced.
    pub fn get_client(
        &self,
        command: &ServerCommand,
        root: &Path,
    ) -> Result<Arc<LspClient>, LspError> {
        let root = std::path::absolute(root).map_err(|_| LspError::InvalidPath(root.into()))?;
        let key = PoolKey { server: command.name.clone(), root };

        let mut entries = self.entries.lock().expect("pool mutex poisoned");
        if let Some(client) = entries.get(&key) {
            if client.is_usable() {
                return Ok(Arc::clone(client));
            }
            tracing::debug!("Replacing unusable {} client for {}", key.server, key.root.display());
            if let Some(stale) = entries.remove(&key) {
                tokio::spawn(async move { stale.close().await });
            }
        }

        let client = self.launcher.launch(command, &key.root, &self.settings)?;
        entries.insert(key, Arc::clone(&client));
        Ok(client)
    }

    /// Removes and closes the client for `key`, if any.
    pub async fn remove(&self, key: &PoolKey) {
        let removed = self.entries.lock().expect("pool mutex poisoned").remove(key);
        if let Some(client) = removed {
            client.close().await;
        }
    }

    /// Closes every client and empties the pool.
    pub async fn close_all(&self) {
        let clients: Vec<Arc<LspClient>> = {
            let mut entries = self.entries.lock().expect("pool mutex poisoned");
            entries.drain().map(|(_, client)| client).collect()
        };

        let mut closing = JoinSet::new();
        for client in clients {
            closing.spawn(async move { client.close().await });
        }
        while closing.join_next().await.is_some() {}
    }

    /// Workspace roots with a pooled client, in arbitrary order.
    pub fn active_workspaces(&self) -> Vec<PathBuf> {
        let entries = self.entries.lock().expect("pool mutex poisoned");
        entries.keys().map(|key| key.root.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("pool mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LspClientPool {
    fn default() -> Self {
        Self::new(ClientSettings::default())
    }
}
