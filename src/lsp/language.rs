use std::path::Path;

/// Best-effort `languageId` for `textDocument/didOpen`, from the file extension.
pub fn language_id(path: &Path) -> &'static str {
    let ext = path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("go") => "go",
        Some("py") => "python",
        Some("js") => "javascript",
        Some("jsx") => "javascriptreact",
        Some("ts") => "typescript",
        Some("tsx") => "typescriptreact",
        Some("rs") => "rust",
        Some("c" | "h") => "c",
        Some("cpp" | "cc" | "cxx" | "hpp" | "hh") => "cpp",
        _ => "plaintext",
    }
}
