use std::fmt::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use owo_colors::OwoColorize;
use serde::Serialize;

use crate::cli::args::OutputFormat;
use crate::lsp::client::QueryKind;
use crate::pipeline::jump::JumpPosition;

/// Outcome of `check`: how far a workspace got towards a usable index.
#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    pub server: String,
    pub root: PathBuf,
    pub documents_opened: usize,
    pub ready: bool,
    pub elapsed_ms: u128,
}

impl CheckReport {
    pub fn new(
        server: &str,
        root: &Path,
        documents_opened: usize,
        ready: bool,
        elapsed: Duration,
    ) -> Self {
        Self {
            server: server.to_string(),
            root: root.to_path_buf(),
            documents_opened,
            ready,
            elapsed_ms: elapsed.as_millis(),
        }
    }
}

pub struct OutputFormatter {
    format: OutputFormat,
    color: bool,
    cwd: PathBuf,
}

impl OutputFormatter {
    pub fn new(format: OutputFormat) -> Self {
        let color = supports_color::on(supports_color::Stream::Stdout).is_some();
        Self::with_color(format, color)
    }

    pub fn with_color(format: OutputFormat, color: bool) -> Self {
        Self { format, color, cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/")) }
    }

    /// Render one finished jump. `source` is the text of the landing line.
    pub fn format_jump(
        &self,
        kind: QueryKind,
        query_info: &str,
        outcome: &Result<JumpPosition, String>,
        source: Option<&str>,
    ) -> String {
        match self.format {
            OutputFormat::Human => self.format_jump_human(kind, query_info, outcome, source),
            OutputFormat::Json => Self::format_jump_json(kind, query_info, outcome),
        }
    }

    fn format_jump_human(
        &self,
        kind: QueryKind,
        query_info: &str,
        outcome: &Result<JumpPosition, String>,
        source: Option<&str>,
    ) -> String {
        let landed = match outcome {
            Ok(landed) => landed,
            Err(message) => return format!("{}: {message} ({query_info})", self.error_label()),
        };

        let target = format!(
            "{}:{}:{}",
            self.display_path(&landed.path),
            landed.line + 1,
            landed.column + 1
        );
        let mut output = format!("{} for {query_info}\n", capitalize(kind.label()));
        if self.color {
            let _ = writeln!(output, "  {}", target.cyan().bold());
        } else {
            let _ = writeln!(output, "  {target}");
        }
        if let Some(src) = source {
            let _ = writeln!(output, "    {}", src.trim());
        }
        output
    }

    fn format_jump_json(
        kind: QueryKind,
        query_info: &str,
        outcome: &Result<JumpPosition, String>,
    ) -> String {
        let value = match outcome {
            Ok(landed) => serde_json::json!({
                "query": query_info,
                "kind": kind.label(),
                "path": landed.path,
                "line": landed.line + 1,
                "column": landed.column + 1,
            }),
            Err(message) => serde_json::json!({
                "query": query_info,
                "kind": kind.label(),
                "error": message,
            }),
        };
        serde_json::to_string_pretty(&value).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn format_check(&self, report: &CheckReport) -> String {
        match self.format {
            OutputFormat::Human => {
                let status = match (report.ready, self.color) {
                    (true, true) => "ready".green().bold().to_string(),
                    (true, false) => "ready".to_string(),
                    (false, true) => "not ready".red().bold().to_string(),
                    (false, false) => "not ready".to_string(),
                };
                format!(
                    "{} in {}: {status}\n  {} document(s) opened, {} ms\n",
                    report.server,
                    self.display_path(&report.root),
                    report.documents_opened,
                    report.elapsed_ms
                )
            }
            OutputFormat::Json => {
                serde_json::to_string_pretty(report).unwrap_or_else(|_| "{}".to_string())
            }
        }
    }

    fn error_label(&self) -> String {
        if self.color {
            "error".red().bold().to_string()
        } else {
            "error".to_string()
        }
    }

    fn display_path(&self, path: &Path) -> String {
        match path.strip_prefix(&self.cwd) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel.display().to_string(),
            _ => path.display().to_string(),
        }
    }
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    chars.next().map_or_else(String::new, |first| first.to_uppercase().chain(chars).collect())
}
