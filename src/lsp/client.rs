use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::lsp::codec::{self, Incoming, ReadOutcome};
use crate::lsp::language::language_id;
use crate::lsp::protocol::{
    file_uri, parse_locations, DidOpenTextDocumentParams, LSPNotification, LSPReply, LSPRequest,
    Location, Message, Position, ReferenceContext, ReferenceParams, TextDocumentIdentifier,
    TextDocumentItem, TextDocumentPositionParams, JSONRPC_VERSION,
};
use crate::lsp::server::{LspServer, ServerCommand};
use crate::lsp::transcript::Transcript;
use crate::utils::error::LspError;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Timeouts and paths governing one client.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Upper bound on one request/response round trip.
    pub request_timeout: Duration,
    /// How long a closing client waits for the server to exit before killing it.
    pub shutdown_grace: Duration,
    /// Settling time imposed after readiness first flips to true. Servers
    /// report ready before their background indexing has converged.
    pub ready_grace: Duration,
    pub ready_poll_interval: Duration,
    /// Where transcripts go. `None` disables them.
    pub transcript_dir: Option<PathBuf>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(2),
            ready_grace: Duration::from_secs(3),
            ready_poll_interval: Duration::from_millis(100),
            transcript_dir: Some(std::env::temp_dir()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Process running, handshake not finished.
    Starting,
    Ready,
    /// The `initialize` exchange failed.
    Failed,
    Closed,
}

impl ClientState {
    const fn as_u8(self) -> u8 {
        match self {
            Self::Starting => 0,
            Self::Ready => 1,
            Self::Failed => 2,
            Self::Closed => 3,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Starting,
            1 => Self::Ready,
            2 => Self::Failed,
            _ => Self::Closed,
        }
    }
}

/// Position queries that answer with locations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Definition,
    Implementation,
    TypeDefinition,
    References,
}

impl QueryKind {
    pub const fn method(self) -> &'static str {
        match self {
            Self::Definition => "textDocument/definition",
            Self::Implementation => "textDocument/implementation",
            Self::TypeDefinition => "textDocument/typeDefinition",
            Self::References => "textDocument/references",
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::Definition => "definition",
            Self::Implementation => "implementation",
            Self::TypeDefinition => "type definition",
            Self::References => "references",
        }
    }
}

/// The byte streams (and optionally the process) behind a client.
pub struct Transport<R, W> {
    pub reader: R,
    pub writer: W,
    pub process: Option<LspServer>,
}

/// A connection to one language server for one workspace root.
///
/// Requests are strictly sequential: the inbound queue is held for the whole
/// round trip, so a response can only ever be matched by the request that
/// is waiting for it. Queries are rejected until the handshake completes;
/// document opens issued earlier are queued and flushed right after
/// `initialized`.
pub struct LspClient {
    server_name: String,
    root: PathBuf,
    settings: ClientSettings,
    server: tokio::sync::Mutex<Option<LspServer>>,
    stdin: tokio::sync::Mutex<Option<BoxedWriter>>,
    incoming: tokio::sync::Mutex<Incoming>,
    request_id: AtomicU64,
    state: AtomicU8,
    ready_at: OnceLock<Instant>,
    deferred_opens: Mutex<Vec<DidOpenTextDocumentParams>>,
    /// URIs already sent via `textDocument/didOpen`.
    opened_documents: Mutex<HashSet<String>>,
    cancel: CancellationToken,
    transcript: Arc<Transcript>,
}

impl fmt::Debug for LspClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LspClient")
            .field("server", &self.server_name)
            .field("root", &self.root)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl LspClient {
    /// Launch `command` in `root` and start the handshake in the background.
    ///
    /// Returns as soon as the process is running; use [`LspClient::wait_for_ready`]
    /// to wait for the handshake.
    pub fn spawn(
        command: &ServerCommand,
        root: &Path,
        settings: ClientSettings,
    ) -> Result<Arc<Self>, LspError> {
        let root = std::path::absolute(root).map_err(|_| LspError::InvalidPath(root.into()))?;
        let mut server = LspServer::start(command, &root)?;
        let writer = server.take_stdin()?;
        let reader = server.take_stdout()?;

        let transcript = match &settings.transcript_dir {
            Some(dir) => Transcript::open(dir, &command.name, &root),
            None => Transcript::disabled(),
        };
        if let Some(path) = transcript.path() {
            tracing::debug!("Recording {} transcript to {}", command.name, path.display());
        }

        Ok(Self::connect(
            &command.name,
            &root,
            Transport { reader, writer, process: Some(server) },
            Arc::new(transcript),
            settings,
        ))
    }

    /// Build a client over arbitrary streams and start the handshake.
    pub fn connect<R, W>(
        server_name: &str,
        root: &Path,
        transport: Transport<R, W>,
        transcript: Arc<Transcript>,
        settings: ClientSettings,
    ) -> Arc<Self>
    where
        R: AsyncBufRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let incoming =
            codec::spawn_reader(transport.reader, Arc::clone(&transcript), cancel.child_token());
        let reader_stopped = incoming.stopped();

        let client = Arc::new(Self {
            server_name: server_name.to_string(),
            root: root.to_path_buf(),
            settings,
            server: tokio::sync::Mutex::new(transport.process),
            stdin: tokio::sync::Mutex::new(Some(Box::new(transport.writer))),
            incoming: tokio::sync::Mutex::new(incoming),
            request_id: AtomicU64::new(1),
            state: AtomicU8::new(ClientState::Starting.as_u8()),
            ready_at: OnceLock::new(),
            deferred_opens: Mutex::new(Vec::new()),
            opened_documents: Mutex::new(HashSet::new()),
            cancel,
            transcript,
        });

        tokio::spawn(Arc::clone(&client).handshake());
        tokio::spawn(watch_reader(Arc::downgrade(&client), reader_stopped));
        client
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state(&self) -> ClientState {
        ClientState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// True once `initialize`/`initialized` have been exchanged.
    pub fn is_ready(&self) -> bool {
        self.state() == ClientState::Ready
    }

    /// False once the client has been closed, its handshake failed or the
    /// server stopped talking.
    pub fn is_usable(&self) -> bool {
        matches!(self.state(), ClientState::Starting | ClientState::Ready)
    }

    /// Poll readiness until it holds or `timeout` elapses.
    ///
    /// After readiness is first observed the call also waits out whatever is
    /// left of the configured grace period since the handshake finished.
    /// Returns false immediately if the handshake failed or the client is closed.
    pub async fn wait_for_ready(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            match self.state() {
                ClientState::Ready => break,
                ClientState::Failed | ClientState::Closed => return false,
                ClientState::Starting => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(self.settings.ready_poll_interval.min(deadline - now)).await;
        }

        if let Some(ready_at) = self.ready_at.get() {
            tokio::time::sleep_until(*ready_at + self.settings.ready_grace).await;
        }
        self.is_ready()
    }

    /// Send `textDocument/didOpen` for `path` once per document.
    ///
    /// Returns false if the document was already opened. Before the handshake
    /// completes the notification is queued instead of sent.
    pub async fn open_document(&self, path: &Path, text: &str) -> Result<bool, LspError> {
        let uri = file_uri(path)?;

        {
            let mut opened =
                self.opened_documents.lock().expect("opened_documents mutex poisoned");
            if !opened.insert(uri.clone()) {
                tracing::debug!("open_document: already open, skipping didOpen for {uri}");
                return Ok(false);
            }
        }

        let params = DidOpenTextDocumentParams {
            text_document: TextDocumentItem {
                uri: uri.clone(),
                language_id: language_id(path).to_string(),
                version: 1,
                text: text.to_string(),
            },
        };

        let ready = {
            let mut deferred = self.deferred_opens.lock().expect("deferred_opens mutex poisoned");
            match self.state() {
                ClientState::Starting => {
                    deferred.push(params);
                    return Ok(true);
                }
                ClientState::Ready => true,
                ClientState::Failed | ClientState::Closed => false,
            }
        };

        let sent = if ready {
            match serde_json::to_value(&params) {
                Ok(value) => self.send_notification("textDocument/didOpen", value).await,
                Err(err) => Err(err.into()),
            }
        } else {
            Err(LspError::NotReady)
        };
        if let Err(err) = sent {
            self.forget_document(&uri);
            return Err(err);
        }
        Ok(true)
    }

    pub async fn goto_definition(
        &self,
        path: &Path,
        line: u32,
        character: u32,
    ) -> Result<Location, LspError> {
        self.first_location(QueryKind::Definition, path, Position { line, character }).await
    }

    pub async fn goto_implementation(
        &self,
        path: &Path,
        line: u32,
        character: u32,
    ) -> Result<Location, LspError> {
        self.first_location(QueryKind::Implementation, path, Position { line, character }).await
    }

    pub async fn goto_type_definition(
        &self,
        path: &Path,
        line: u32,
        character: u32,
    ) -> Result<Location, LspError> {
        self.first_location(QueryKind::TypeDefinition, path, Position { line, character }).await
    }

    pub async fn find_references(
        &self,
        path: &Path,
        line: u32,
        character: u32,
    ) -> Result<Location, LspError> {
        self.first_location(QueryKind::References, path, Position { line, character }).await
    }

    /// First location answered for `kind`, or `NotFound` when there is none.
    pub async fn first_location(
        &self,
        kind: QueryKind,
        path: &Path,
        position: Position,
    ) -> Result<Location, LspError> {
        self.locations(kind, path, position)
            .await?
            .into_iter()
            .next()
            .ok_or(LspError::NotFound { what: kind.label() })
    }

    /// Every location the server answers for `kind` at `position` (UTF-16 column).
    pub async fn locations(
        &self,
        kind: QueryKind,
        path: &Path,
        position: Position,
    ) -> Result<Vec<Location>, LspError> {
        if !self.is_ready() {
            return Err(LspError::NotReady);
        }

        let position_params = TextDocumentPositionParams {
            text_document: TextDocumentIdentifier { uri: file_uri(path)? },
            position,
        };
        let params = match kind {
            QueryKind::References => serde_json::to_value(ReferenceParams {
                text_document_position_params: position_params,
                context: ReferenceContext { include_declaration: true },
            })?,
            _ => serde_json::to_value(position_params)?,
        };

        self.transcript.record(
            "QUERY",
            &format!(
                "{}: file={}, line={}, char={}",
                kind.method(),
                path.display(),
                position.line,
                position.character
            ),
        );

        let locations = parse_locations(self.send_request(kind.method(), params).await?);
        self.transcript.record(
            "QUERY",
            &format!("{} returned {} location(s)", kind.method(), locations.len()),
        );
        Ok(locations)
    }

    /// Cancel, give the server `shutdown_grace` to exit, then kill it.
    ///
    /// Input stream and transcript are released on every path. Safe to call twice.
    pub async fn close(&self) {
        self.state.store(ClientState::Closed.as_u8(), Ordering::SeqCst);
        self.cancel.cancel();

        if let Some(mut stdin) = self.stdin.lock().await.take() {
            let _ = stdin.shutdown().await;
        }
        if let Some(server) = self.server.lock().await.take() {
            server.shutdown(self.settings.shutdown_grace).await;
        }

        self.transcript.record("SESSION", "client closed");
        self.transcript.close();
        tracing::debug!("Closed {} client for {}", self.server_name, self.root.display());
    }

    async fn handshake(self: Arc<Self>) {
        tracing::debug!("Sending LSP initialize request...");
        match self.initialize().await {
            Ok(()) => tracing::debug!("LSP client initialized successfully"),
            Err(err) => {
                tracing::warn!("{} initialize failed: {err}", self.server_name);
                self.transcript.record("STATUS", &format!("initialize failed: {err}"));
                let mut deferred =
                    self.deferred_opens.lock().expect("deferred_opens mutex poisoned");
                deferred.clear();
                let _ = self.state.compare_exchange(
                    ClientState::Starting.as_u8(),
                    ClientState::Failed.as_u8(),
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
            }
        }
    }

    async fn initialize(&self) -> Result<(), LspError> {
        let root_uri = file_uri(&self.root)?;
        let root_name = self.root.file_name().map_or_else(
            || self.root.display().to_string(),
            |name| name.to_string_lossy().into_owned(),
        );
        let dynamic = json!({ "dynamicRegistration": true });

        let init_params = json!({
            "processId": std::process::id(),
            "rootPath": self.root,
            "rootUri": root_uri,
            "workspaceFolders": [{ "uri": root_uri, "name": root_name }],
            "capabilities": {
                "workspace": {
                    "workspaceFolders": true,
                    "executeCommand": dynamic
                },
                "textDocument": {
                    "definition": dynamic,
                    "implementation": dynamic,
                    "typeDefinition": dynamic,
                    "completion": dynamic,
                    "hover": dynamic,
                    "signatureHelp": dynamic,
                    "references": dynamic,
                    "documentHighlight": dynamic,
                    "documentSymbol": dynamic,
                    "codeAction": dynamic,
                    "codeLens": dynamic,
                    "formatting": dynamic,
                    "rangeFormatting": dynamic,
                    "onTypeFormatting": dynamic,
                    "rename": dynamic,
                    "documentLink": dynamic
                }
            }
        });

        let _capabilities = self.send_request("initialize", init_params).await?;
        self.send_notification("initialized", json!({})).await?;

        // Deferred opens go out before the state flips, so no query can
        // overtake them. Opens queued during the flush are picked up by the
        // next round.
        loop {
            let deferred = {
                let mut queue =
                    self.deferred_opens.lock().expect("deferred_opens mutex poisoned");
                if queue.is_empty() {
                    // Set before the flip: a waiter that sees Ready must see the grace anchor.
                    self.ready_at.get_or_init(Instant::now);
                    self.state
                        .compare_exchange(
                            ClientState::Starting.as_u8(),
                            ClientState::Ready.as_u8(),
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        )
                        .map_err(|_| LspError::ConnectionClosed)?;
                    break;
                }
                std::mem::take(&mut *queue)
            };

            for params in deferred {
                let uri = params.text_document.uri.clone();
                let sent = match serde_json::to_value(&params) {
                    Ok(value) => self.send_notification("textDocument/didOpen", value).await,
                    Err(err) => Err(err.into()),
                };
                if let Err(err) = sent {
                    tracing::warn!("Deferred didOpen for {uri} failed: {err}");
                    self.forget_document(&uri);
                }
            }
        }
        self.transcript.record("STATUS", "LSP server initialized");
        Ok(())
    }

    fn forget_document(&self, uri: &str) {
        self.opened_documents.lock().expect("opened_documents mutex poisoned").remove(uri);
    }

    async fn send_request(&self, method: &str, params: Value) -> Result<Value, LspError> {
        let mut incoming = self.incoming.lock().await;
        self.drain_stale(&mut incoming).await;

        let id = self.request_id.fetch_add(1, Ordering::SeqCst);
        let request = LSPRequest { jsonrpc: JSONRPC_VERSION, id, method, params };

        tracing::debug!("Sending LSP request: {method} (id: {id})");
        let body = self.write(&request).await?;
        self.transcript.record("REQUEST", &body);

        let timeout = self.settings.request_timeout;
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let outcome = tokio::select! {
                () = self.cancel.cancelled() => return Err(LspError::ConnectionClosed),
                outcome = incoming.next_within(remaining) => outcome,
            };

            match outcome {
                Ok(ReadOutcome::Message(message)) if message.response_id() == Some(id) => {
                    if let Some(ref error) = message.error {
                        tracing::debug!("LSP error response for {method} (id: {id}): {error:?}");
                    } else {
                        tracing::debug!("LSP response received for {method} (id: {id})");
                    }
                    self.transcript.record("RESPONSE", &format!("{method} (id: {id})"));
                    return message.into_result();
                }
                Ok(ReadOutcome::Message(message)) => self.handle_unsolicited(message).await,
                Ok(ReadOutcome::NotYet) => {
                    self.transcript.record("TIMEOUT", &format!("{method} (id: {id})"));
                    return Err(LspError::Timeout { method: method.to_string(), id, timeout });
                }
                Ok(ReadOutcome::Closed) => return Err(LspError::ConnectionClosed),
                Err(err) => {
                    tracing::warn!("Ignoring bad frame while waiting for {method} (id: {id}): {err}");
                }
            }
        }
    }

    /// Consume frames that arrived while no request was outstanding.
    async fn drain_stale(&self, incoming: &mut Incoming) {
        loop {
            match incoming.try_next() {
                Ok(ReadOutcome::Message(message)) => self.handle_unsolicited(message).await,
                Ok(ReadOutcome::NotYet | ReadOutcome::Closed) => break,
                Err(err) => tracing::warn!("Ignoring bad frame: {err}"),
            }
        }
    }

    /// Anything that is not the awaited response: notifications are logged
    /// and dropped, server requests get a `null` result, stray responses are
    /// logged and dropped.
    async fn handle_unsolicited(&self, message: Message) {
        if message.is_server_request() {
            let method = message.method.as_deref().unwrap_or_default();
            tracing::debug!("Answering server request {method} with null");
            let reply = LSPReply {
                jsonrpc: JSONRPC_VERSION,
                id: message.id.clone().unwrap_or(Value::Null),
                result: Value::Null,
            };
            match self.write(&reply).await {
                Ok(body) => self.transcript.record("REPLY", &body),
                Err(err) => tracing::debug!("Could not answer server request {method}: {err}"),
            }
        } else if message.is_notification() {
            let method = message.method.as_deref().unwrap_or_default();
            tracing::debug!("LSP notification while waiting for response: {method}");
            self.transcript.record("NOTIFICATION (while waiting for response)", method);
        } else {
            tracing::warn!("Discarding LSP response with unexpected id: {:?}", message.id);
            self.transcript.record("UNMATCHED", &format!("id {:?}", message.id));
        }
    }

    async fn send_notification(&self, method: &str, params: Value) -> Result<(), LspError> {
        let notification = LSPNotification { jsonrpc: JSONRPC_VERSION, method, params };
        let body = self.write(&notification).await?;
        self.transcript.record("NOTIFICATION", &body);
        Ok(())
    }

    async fn write<T: Serialize>(&self, payload: &T) -> Result<String, LspError> {
        let mut stdin = self.stdin.lock().await;
        let writer = stdin.as_mut().ok_or(LspError::ConnectionClosed)?;
        codec::write_message(writer, payload).await
    }

    /// The server's output ended without [`LspClient::close`]. A live
    /// client becomes `Closed` so the pool replaces it on the next lookup.
    fn mark_disconnected(&self) {
        let previous = self.state.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |raw| {
            matches!(ClientState::from_u8(raw), ClientState::Starting | ClientState::Ready)
                .then_some(ClientState::Closed.as_u8())
        });
        if previous.is_ok() {
            tracing::warn!(
                "{} server for {} stopped responding",
                self.server_name,
                self.root.display()
            );
            self.transcript.record("STATUS", "server output closed");
        }
    }
}

async fn watch_reader(client: Weak<LspClient>, reader_stopped: CancellationToken) {
    reader_stopped.cancelled().await;
    if let Some(client) = client.upgrade() {
        client.mark_disconnected();
    }
}
