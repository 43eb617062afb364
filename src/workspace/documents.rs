use std::path::{Path, PathBuf};

use ignore::WalkBuilder;
use tokio::task::JoinError;

use crate::lsp::client::LspClient;

/// Files under `root` whose extension is in `extensions`, honouring
/// `.gitignore` and skipping hidden entries. `first` (if given) leads the
/// list; at most `limit` paths are returned.
pub fn collect_documents(
    root: &Path,
    extensions: &[String],
    first: Option<&Path>,
    limit: usize,
) -> Vec<PathBuf> {
    let mut documents: Vec<PathBuf> = first.map(Path::to_path_buf).into_iter().collect();

    for entry in WalkBuilder::new(root).build() {
        if documents.len() >= limit {
            break;
        }
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                tracing::debug!("Skipping unreadable workspace entry: {err}");
                continue;
            }
        };
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }
        let path = entry.into_path();
        let matches = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)));
        if matches && Some(path.as_path()) != first {
            documents.push(path);
        }
    }

    documents.truncate(limit);
    documents
}

/// Counts from [`open_workspace`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenedDocuments {
    pub found: usize,
    /// `didOpen` sent or queued by this call.
    pub opened: usize,
}

/// Walk the client's root and open every matching document, `first` leading.
///
/// Unreadable files and failed opens are logged and skipped. Fails only if
/// the walk itself panicked.
pub async fn open_workspace(
    client: &LspClient,
    extensions: Vec<String>,
    first: &Path,
    limit: usize,
) -> Result<OpenedDocuments, JoinError> {
    let root = client.root().to_path_buf();
    let lead = first.to_path_buf();
    let documents = tokio::task::spawn_blocking(move || {
        collect_documents(&root, &extensions, Some(&lead), limit)
    })
    .await?;

    let mut opened = 0;
    for document in &documents {
        let text = match tokio::fs::read_to_string(document).await {
            Ok(text) => text,
            Err(err) => {
                tracing::debug!("Skipping {}: {err}", document.display());
                continue;
            }
        };
        match client.open_document(document, &text).await {
            Ok(true) => opened += 1,
            Ok(false) => {}
            Err(err) => tracing::debug!("didOpen {} failed: {err}", document.display()),
        }
    }
    tracing::debug!(
        "Opened {opened} of {} document(s) in {}",
        documents.len(),
        client.root().display()
    );

    Ok(OpenedDocuments { found: documents.len(), opened })
}
