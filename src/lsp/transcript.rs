//! Append-only, timestamped record of everything exchanged with one server.
//!
//! Purely a debugging aid: nothing reads it back, and a transcript that
//! cannot be written never fails the operation that tried to write it.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Local;

pub struct Transcript {
    path: Option<PathBuf>,
    file: Mutex<Option<File>>,
}

/// File name for a server's transcript, safe for any server name.
pub fn transcript_file_name(server_name: &str) -> String {
    let safe: String = server_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();
    format!("modal-lsp-{safe}.log")
}

fn timestamp() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

impl Transcript {
    /// Open (or create) the transcript for `server_name` inside `dir`, in append mode.
    pub fn open(dir: &Path, server_name: &str, root: &Path) -> Self {
        let path = dir.join(transcript_file_name(server_name));
        let file = match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => Some(file),
            Err(err) => {
                tracing::warn!("Cannot open LSP transcript {}: {err}", path.display());
                None
            }
        };

        let transcript = Self { path: Some(path), file: Mutex::new(file) };
        transcript.raw_line("");
        transcript.record("SESSION", "===== NEW LSP CLIENT SESSION =====");
        transcript.record("SESSION", &format!("Server: {server_name}, Root: {}", root.display()));
        transcript
    }

    /// A transcript that drops everything.
    pub fn disabled() -> Self {
        Self { path: None, file: Mutex::new(None) }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn record(&self, kind: &str, text: &str) {
        self.raw_line(&format!("[{}] {kind}: {text}", timestamp()));
    }

    fn raw_line(&self, line: &str) {
        let Ok(mut guard) = self.file.lock() else {
            return;
        };
        let Some(file) = guard.as_mut() else {
            return;
        };
        if let Err(err) = writeln!(file, "{line}") {
            tracing::warn!("Disabling LSP transcript after write failure: {err}");
            *guard = None;
        }
    }

    /// Flush and release the file. Later records are dropped.
    pub fn close(&self) {
        if let Ok(mut guard) = self.file.lock() {
            if let Some(mut file) = guard.take() {
                let _ = file.flush();
            }
        }
    }
}
