//! Turning a query result into a cursor move.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::lsp::coords::char_index_from_utf16;
use crate::lsp::protocol::{uri_to_path, Location};
use crate::utils::error::LspError;

/// The editor side of a jump.
pub trait JumpTarget {
    /// Make the buffer for `path` current, loading it if needed. On error
    /// nothing may have changed.
    fn focus_file(&mut self, path: &Path) -> anyhow::Result<()>;

    /// Text of a line in the current buffer.
    fn line_text(&self, line: u32) -> Option<String>;

    /// Move the current buffer's cursor; `column` counts code points.
    fn move_cursor(&mut self, line: u32, column: usize);

    /// Show a transient error without touching any buffer.
    fn report_error(&mut self, message: String);
}

/// Where a successful jump landed, in editor coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JumpPosition {
    pub path: PathBuf,
    pub line: u32,
    pub column: usize,
}

/// Apply a query outcome to `target`.
///
/// Success focuses the file named by the location and places the cursor at
/// its start, converting the UTF-16 column back to code points. Any failure
/// is reported through [`JumpTarget::report_error`] and returned as its message.
pub fn apply_result<T: JumpTarget + ?Sized>(
    target: &mut T,
    outcome: Result<Location, LspError>,
) -> Result<JumpPosition, String> {
    let fail = |target: &mut T, message: String| {
        target.report_error(message.clone());
        Err(message)
    };

    let location = match outcome {
        Ok(location) => location,
        Err(err) => {
            tracing::debug!("Query failed ({:?}): {err}", err.category());
            return fail(target, err.to_string());
        }
    };
    let path = match uri_to_path(&location.uri) {
        Ok(path) => path,
        Err(err) => return fail(target, err.to_string()),
    };
    if let Err(err) = target.focus_file(&path) {
        return fail(target, format!("Failed to load file: {err}"));
    }

    let start = location.range.start;
    let utf16_column = start.character as usize;
    let column = target
        .line_text(start.line)
        .map_or(utf16_column, |text| char_index_from_utf16(&text, utf16_column));
    target.move_cursor(start.line, column);

    Ok(JumpPosition { path, line: start.line, column })
}
