//! Non-blocking position queries driven by the editor's message loop.
//!
//! A query moves through `Init -> OpenFiles -> AwaitReady -> Query -> Result`.
//! Handing a message to [`Pipeline::advance`] never blocks: each non-terminal
//! stage starts a background task that reports the next stage as a new
//! message on the editor's channel, so the loop sees one discrete
//! transition per tick and stays responsive between them.

pub mod jump;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::mpsc::UnboundedSender;

use crate::config::{LanguageRegistry, PipelineSettings};
use crate::lsp::client::{LspClient, QueryKind};
use crate::lsp::coords::utf16_index;
use crate::lsp::pool::LspClientPool;
use crate::lsp::protocol::{Location, Position};
use crate::utils::error::LspError;
use crate::workspace::detection::WorkspaceDetector;
use crate::workspace::documents::open_workspace;

/// What was asked, carried unchanged through every stage.
#[derive(Debug, Clone)]
pub struct QueryContext {
    /// Increases with every query started on a pipeline.
    pub id: u64,
    pub kind: QueryKind,
    pub path: PathBuf,
    pub line: u32,
    /// Code-point column.
    pub column: usize,
    /// Text of `line` as the editor sees it; read from disk when absent.
    pub line_text: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Init,
    OpenFiles,
    AwaitReady,
    Query,
    Result,
}

#[derive(Debug)]
pub enum PipelineMsg {
    Init(QueryContext),
    OpenFiles { client: Arc<LspClient>, ctx: QueryContext },
    AwaitReady { client: Arc<LspClient>, ctx: QueryContext },
    Query { client: Arc<LspClient>, ctx: QueryContext },
    Result { ctx: QueryContext, outcome: Result<Location, LspError> },
}

impl PipelineMsg {
    pub fn stage(&self) -> PipelineStage {
        match self {
            Self::Init(_) => PipelineStage::Init,
            Self::OpenFiles { .. } => PipelineStage::OpenFiles,
            Self::AwaitReady { .. } => PipelineStage::AwaitReady,
            Self::Query { .. } => PipelineStage::Query,
            Self::Result { .. } => PipelineStage::Result,
        }
    }

    pub fn context(&self) -> &QueryContext {
        match self {
            Self::Init(ctx)
            | Self::OpenFiles { ctx, .. }
            | Self::AwaitReady { ctx, .. }
            | Self::Query { ctx, .. }
            | Self::Result { ctx, .. } => ctx,
        }
    }
}

/// Terminal output of a query.
#[derive(Debug)]
pub struct QueryResult {
    pub ctx: QueryContext,
    pub outcome: Result<Location, LspError>,
}

pub enum Step {
    /// Work for this stage is running; its successor will arrive as a message.
    Pending(PipelineStage),
    Done(QueryResult),
}

pub struct Pipeline {
    pool: Arc<LspClientPool>,
    languages: Arc<LanguageRegistry>,
    settings: PipelineSettings,
    workspace: Option<PathBuf>,
    tx: UnboundedSender<PipelineMsg>,
    runtime: Handle,
    next_query: AtomicU64,
}

impl Pipeline {
    /// Must be called from within a tokio runtime; stage work runs on it.
    pub fn new(
        pool: Arc<LspClientPool>,
        languages: LanguageRegistry,
        settings: PipelineSettings,
        tx: UnboundedSender<PipelineMsg>,
    ) -> Self {
        Self {
            pool,
            languages: Arc::new(languages),
            settings,
            workspace: None,
            tx,
            runtime: Handle::current(),
            next_query: AtomicU64::new(1),
        }
    }

    /// Use `root` for every query instead of detecting one per file.
    #[must_use]
    pub fn with_workspace(mut self, root: PathBuf) -> Self {
        self.workspace = Some(root);
        self
    }

    pub fn pool(&self) -> &Arc<LspClientPool> {
        &self.pool
    }

    pub fn languages(&self) -> &LanguageRegistry {
        &self.languages
    }

    pub fn go_to_definition(&self, path: &Path, line: u32, column: usize) -> PipelineMsg {
        self.start(QueryKind::Definition, path, line, column, None)
    }

    pub fn go_to_implementation(&self, path: &Path, line: u32, column: usize) -> PipelineMsg {
        self.start(QueryKind::Implementation, path, line, column, None)
    }

    pub fn go_to_type_definition(&self, path: &Path, line: u32, column: usize) -> PipelineMsg {
        self.start(QueryKind::TypeDefinition, path, line, column, None)
    }

    pub fn find_references(&self, path: &Path, line: u32, column: usize) -> PipelineMsg {
        self.start(QueryKind::References, path, line, column, None)
    }

    /// Opening message for a query. Nothing runs until it is advanced.
    pub fn start(
        &self,
        kind: QueryKind,
        path: &Path,
        line: u32,
        column: usize,
        line_text: Option<String>,
    ) -> PipelineMsg {
        PipelineMsg::Init(QueryContext {
            id: self.next_query.fetch_add(1, Ordering::SeqCst),
            kind,
            path: std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf()),
            line,
            column,
            line_text,
        })
    }

    /// Handle one message. Returns immediately.
    pub fn advance(&self, msg: PipelineMsg) -> Step {
        let stage = msg.stage();
        match msg {
            PipelineMsg::Init(ctx) => self.acquire_client(ctx),
            PipelineMsg::OpenFiles { client, ctx } => self.open_files(client, ctx),
            PipelineMsg::AwaitReady { client, ctx } => self.await_ready(client, ctx),
            PipelineMsg::Query { client, ctx } => self.query(client, ctx),
            PipelineMsg::Result { ctx, outcome } => return Step::Done(QueryResult { ctx, outcome }),
        }
        Step::Pending(stage)
    }

    fn acquire_client(&self, ctx: QueryContext) {
        let tx = self.tx.clone();
        let pool = Arc::clone(&self.pool);
        let languages = Arc::clone(&self.languages);
        let workspace = self.workspace.clone();

        self.runtime.spawn(async move {
            let acquired = languages.for_path(&ctx.path).and_then(|language| {
                let root =
                    workspace.unwrap_or_else(|| WorkspaceDetector::root_for_file(&ctx.path));
                tracing::debug!(
                    "Acquiring {} client for {}",
                    language.server.name,
                    root.display()
                );
                pool.get_client(&language.server, &root)
            });
            let next = match acquired {
                Ok(client) => PipelineMsg::OpenFiles { client, ctx },
                Err(err) => PipelineMsg::Result { ctx, outcome: Err(err) },
            };
            send(&tx, next);
        });
    }

    fn open_files(&self, client: Arc<LspClient>, ctx: QueryContext) {
        let tx = self.tx.clone();
        let extensions = self
            .languages
            .for_path(&ctx.path)
            .map(|language| language.extensions.clone())
            .unwrap_or_default();
        let limit = self.settings.max_open_files;

        self.runtime.spawn(async move {
            if let Err(err) = open_workspace(&client, extensions, &ctx.path, limit).await {
                tracing::warn!("Document walk failed: {err}");
            }

            send(&tx, PipelineMsg::AwaitReady { client, ctx });
        });
    }

    fn await_ready(&self, client: Arc<LspClient>, ctx: QueryContext) {
        let tx = self.tx.clone();
        let timeout = self.settings.ready_timeout;

        self.runtime.spawn(async move {
            let next = if client.wait_for_ready(timeout).await {
                PipelineMsg::Query { client, ctx }
            } else if client.is_usable() {
                PipelineMsg::Result { ctx, outcome: Err(LspError::ReadinessTimeout(timeout)) }
            } else {
                PipelineMsg::Result { ctx, outcome: Err(LspError::NotReady) }
            };
            send(&tx, next);
        });
    }

    fn query(&self, client: Arc<LspClient>, ctx: QueryContext) {
        let tx = self.tx.clone();

        self.runtime.spawn(async move {
            let line_text = match &ctx.line_text {
                Some(text) => Some(text.clone()),
                None => read_source_line(&ctx.path, ctx.line).await,
            };
            let utf16_column = line_text.map_or(ctx.column, |text| utf16_index(&text, ctx.column));
            let position = Position {
                line: ctx.line,
                character: u32::try_from(utf16_column).unwrap_or(u32::MAX),
            };

            let outcome = client.first_location(ctx.kind, &ctx.path, position).await;
            send(&tx, PipelineMsg::Result { ctx, outcome });
        });
    }
}

fn send(tx: &UnboundedSender<PipelineMsg>, msg: PipelineMsg) {
    if tx.send(msg).is_err() {
        tracing::debug!("Editor loop has gone away; dropping pipeline message");
    }
}

/// One line (0-based) of a file on disk.
pub async fn read_source_line(path: &Path, line: u32) -> Option<String> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) => {
            tracing::debug!("read_source_line: cannot read {}: {err}", path.display());
            return None;
        }
    };
    content.lines().nth(line as usize).map(str::to_string)
}
