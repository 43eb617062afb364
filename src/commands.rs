use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc::{self, UnboundedReceiver};

use crate::cli::output::{CheckReport, OutputFormatter};
use crate::config::Config;
use crate::editor::Editor;
use crate::lsp::client::QueryKind;
use crate::lsp::pool::LspClientPool;
use crate::pipeline::{Pipeline, PipelineMsg};
use crate::workspace::detection::WorkspaceDetector;
use crate::workspace::documents::open_workspace;

/// Try to parse a string as `file:line:col`. Returns `None` if it doesn't match.
fn parse_file_position(input: &str) -> Option<(PathBuf, u32, u32)> {
    let last_colon = input.rfind(':')?;
    let col: u32 = input[last_colon + 1..].parse().ok()?;
    let rest = &input[..last_colon];
    let second_colon = rest.rfind(':')?;
    let line: u32 = rest[second_colon + 1..].parse().ok()?;
    let file = &rest[..second_colon];
    if file.is_empty() {
        return None;
    }
    Some((PathBuf::from(file), line, col))
}

/// Parse one REPL line: an optional query keyword followed by `file:line:col`.
///
/// A bare `line:col` refers to `current`, the last file queried.
fn parse_repl_query(
    input: &str,
    current: Option<&Path>,
) -> Option<(QueryKind, PathBuf, u32, u32)> {
    let (kind, target) = match input.split_once(char::is_whitespace) {
        Some((word, rest)) => {
            let kind = match word {
                "def" | "definition" => QueryKind::Definition,
                "impl" | "implementation" => QueryKind::Implementation,
                "type" | "type-definition" => QueryKind::TypeDefinition,
                "refs" | "references" => QueryKind::References,
                _ => return None,
            };
            (kind, rest.trim())
        }
        None => (QueryKind::Definition, input),
    };

    if let Some((file, line, col)) = parse_file_position(target) {
        return Some((kind, file, line, col));
    }
    let (line, col) = target.split_once(':')?;
    Some((kind, current?.to_path_buf(), line.parse().ok()?, col.parse().ok()?))
}

/// One CLI invocation: a pool of warm clients, the pipeline over it and the
/// buffer host that receives jumps.
pub struct Session {
    config: Config,
    workspace: Option<PathBuf>,
    pipeline: Pipeline,
    rx: UnboundedReceiver<PipelineMsg>,
    editor: Editor,
    formatter: OutputFormatter,
}

impl Session {
    /// Must be called from within a tokio runtime.
    pub fn new(config: Config, workspace: Option<PathBuf>, formatter: OutputFormatter) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let pool = Arc::new(LspClientPool::new(config.client_settings()));
        let mut pipeline =
            Pipeline::new(pool, config.language_registry(), config.pipeline_settings(), tx);
        if let Some(root) = &workspace {
            pipeline = pipeline.with_workspace(root.clone());
        }
        Self { config, workspace, pipeline, rx, editor: Editor::new(), formatter }
    }

    /// Run one position query (1-based line and column) and print where it
    /// landed. Returns whether the jump succeeded.
    pub async fn jump(
        &mut self,
        kind: QueryKind,
        file: &Path,
        line: u32,
        column: u32,
    ) -> Result<bool> {
        self.editor.open(file)?;
        if let Some(buffer) = self.editor.current_buffer_mut() {
            buffer.set_cursor(line.saturating_sub(1), column.saturating_sub(1) as usize);
        }

        let outcome = self
            .editor
            .run_query(&self.pipeline, &mut self.rx, kind)
            .await
            .context("Query ended without a result")?;

        let source = outcome.as_ref().ok().and_then(|landed| {
            self.editor.current_buffer().and_then(|buffer| buffer.line(landed.line))
        });
        let query_info = format!("{}:{line}:{column}", file.display());
        println!("{}", self.formatter.format_jump(kind, &query_info, &outcome, source));

        Ok(outcome.is_ok())
    }

    /// Start the server for `file`'s workspace, open its documents and wait
    /// for the index-sized readiness bound. Returns whether it became ready.
    pub async fn check(&mut self, file: &Path) -> Result<bool> {
        let file = std::path::absolute(file)
            .with_context(|| format!("Failed to get absolute path: {}", file.display()))?;
        let language = self.pipeline.languages().for_path(&file)?.clone();
        let root =
            self.workspace.clone().unwrap_or_else(|| WorkspaceDetector::root_for_file(&file));

        let started = Instant::now();
        let client = self.pipeline.pool().get_client(&language.server, &root)?;
        tracing::debug!("Checking {} workspace at {}", language.server.name, root.display());

        let documents = open_workspace(
            &client,
            language.extensions.clone(),
            &file,
            self.config.max_open_files,
        )
        .await
        .context("Document walk failed")?;

        let ready = client.wait_for_ready(self.config.index_ready_timeout()).await;
        let report = CheckReport::new(
            client.server_name(),
            client.root(),
            documents.opened,
            ready,
            started.elapsed(),
        );
        println!("{}", self.formatter.format_check(&report));
        Ok(ready)
    }

    /// Read queries from stdin until `quit` or end of input.
    pub async fn interactive(&mut self, initial_file: Option<PathBuf>) -> Result<()> {
        println!("mlsp interactive mode");
        println!("Commands: [def|impl|type|refs] <file>:<line>:<column>, <line>:<column>, quit");

        let mut current = initial_file;
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdout = tokio::io::stdout();

        loop {
            stdout.write_all(b"> ").await?;
            stdout.flush().await?;

            let Some(input) = lines.next_line().await? else {
                break;
            };
            let input = input.trim();
            if input.is_empty() {
                continue;
            }
            if input == "quit" || input == "q" {
                break;
            }

            match parse_repl_query(input, current.as_deref()) {
                Some((kind, file, line, column)) => {
                    if let Err(e) = self.jump(kind, &file, line, column).await {
                        eprintln!("Error: {e:#}");
                    }
                    current = Some(file);
                }
                None => eprintln!("Usage: [def|impl|type|refs] <file>:<line>:<column>, or quit"),
            }
        }

        println!("Goodbye!");
        Ok(())
    }

    /// Shut down every language server started by this session.
    pub async fn close(self) {
        let pool = Arc::clone(self.pipeline.pool());
        let workspaces = pool.len();
        pool.close_all().await;
        tracing::debug!("Closed {workspaces} workspace client(s)");
    }
}
