//! A minimal buffer host: enough editor to receive jumps.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::lsp::client::QueryKind;
use crate::pipeline::jump::{apply_result, JumpPosition, JumpTarget};
use crate::pipeline::{Pipeline, PipelineMsg, PipelineStage, Step};

pub struct Buffer {
    path: PathBuf,
    lines: Vec<String>,
    cursor_line: u32,
    cursor_column: usize,
}

impl Buffer {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read file: {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            lines: content.lines().map(str::to_string).collect(),
            cursor_line: 0,
            cursor_column: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn line(&self, line: u32) -> Option<&str> {
        self.lines.get(line as usize).map(String::as_str)
    }

    /// Cursor as (line, code-point column), both 0-based.
    pub fn cursor(&self) -> (u32, usize) {
        (self.cursor_line, self.cursor_column)
    }

    /// Move the cursor, clamped to the buffer's contents.
    pub fn set_cursor(&mut self, line: u32, column: usize) {
        let last_line = u32::try_from(self.lines.len().saturating_sub(1)).unwrap_or(u32::MAX);
        self.cursor_line = line.min(last_line);
        let width = self.line(self.cursor_line).map_or(0, |text| text.chars().count());
        self.cursor_column = column.min(width);
    }
}

/// Outcome of one finished query, as the editor saw it.
pub type JumpOutcome = Result<JumpPosition, String>;

#[derive(Default)]
pub struct Editor {
    buffers: Vec<Buffer>,
    current: Option<usize>,
    status: Option<String>,
    loading: bool,
    latest_query: Option<u64>,
    transitions: Vec<PipelineStage>,
}

impl Editor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open `path` (or switch to it if already loaded) and make it current.
    pub fn open(&mut self, path: &Path) -> Result<()> {
        let absolute = std::path::absolute(path)
            .with_context(|| format!("Failed to get absolute path: {}", path.display()))?;

        let index = if let Some(index) = self.buffers.iter().position(|b| b.path == absolute) {
            index
        } else {
            self.buffers.push(Buffer::load(&absolute)?);
            self.buffers.len() - 1
        };
        self.current = Some(index);
        Ok(())
    }

    pub fn current_buffer(&self) -> Option<&Buffer> {
        self.current.and_then(|index| self.buffers.get(index))
    }

    pub fn current_buffer_mut(&mut self) -> Option<&mut Buffer> {
        self.current.and_then(|index| self.buffers.get_mut(index))
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn status(&self) -> Option<&str> {
        self.status.as_deref()
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    /// Stages of the latest query observed by [`Editor::update`], oldest first.
    pub fn transitions(&self) -> &[PipelineStage] {
        &self.transitions
    }

    /// Start a `kind` query at the current buffer's cursor.
    pub fn start_query(&mut self, pipeline: &Pipeline, kind: QueryKind) -> Option<PipelineMsg> {
        let buffer = self.current_buffer()?;
        let (line, column) = buffer.cursor();
        let line_text = buffer.line(line).map(str::to_string);
        let msg = pipeline.start(kind, buffer.path(), line, column, line_text);

        self.latest_query = Some(msg.context().id);
        self.transitions.clear();
        self.loading = true;
        self.status = None;
        Some(msg)
    }

    /// One loop tick: hand `msg` to the pipeline and apply a finished result.
    ///
    /// Results of queries superseded by a newer one are dropped.
    pub fn update(&mut self, pipeline: &Pipeline, msg: PipelineMsg) -> Option<JumpOutcome> {
        if self.latest_query == Some(msg.context().id) {
            self.transitions.push(msg.stage());
        }
        match pipeline.advance(msg) {
            Step::Pending(_) => None,
            Step::Done(result) => {
                if self.latest_query != Some(result.ctx.id) {
                    tracing::debug!("Dropping stale result for query {}", result.ctx.id);
                    return None;
                }
                self.loading = false;
                Some(apply_result(self, result.outcome))
            }
        }
    }

    /// Run a query from the current cursor to completion, one message per tick.
    pub async fn run_query(
        &mut self,
        pipeline: &Pipeline,
        rx: &mut UnboundedReceiver<PipelineMsg>,
        kind: QueryKind,
    ) -> Option<JumpOutcome> {
        let mut next = Some(self.start_query(pipeline, kind)?);
        loop {
            let msg = match next.take() {
                Some(msg) => msg,
                None => rx.recv().await?,
            };
            if let Some(outcome) = self.update(pipeline, msg) {
                return Some(outcome);
            }
        }
    }
}

impl JumpTarget for Editor {
    fn focus_file(&mut self, path: &Path) -> Result<()> {
        self.open(path)
    }

    fn line_text(&self, line: u32) -> Option<String> {
        self.current_buffer()?.line(line).map(str::to_string)
    }

    fn move_cursor(&mut self, line: u32, column: usize) {
        if let Some(buffer) = self.current_buffer_mut() {
            buffer.set_cursor(line, column);
        }
    }

    fn report_error(&mut self, message: String) {
        self.status = Some(message);
    }
}
