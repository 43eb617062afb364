use std::path::{Path, PathBuf};

/// Files and directories that mark a project boundary.
const ROOT_MARKERS: &[&str] = &[
    ".git",
    "go.mod",
    "Cargo.toml",
    "package.json",
    "tsconfig.json",
    "pyproject.toml",
    "setup.py",
    "compile_commands.json",
];

pub struct WorkspaceDetector;

impl WorkspaceDetector {
    /// Nearest ancestor of `start_path` (inclusive) carrying a project marker.
    pub fn find_workspace_root(start_path: &Path) -> Option<PathBuf> {
        let mut current = start_path;

        loop {
            if Self::has_root_markers(current) {
                return Some(current.to_path_buf());
            }

            if let Some(parent) = current.parent() {
                current = parent;
            } else {
                break;
            }
        }

        None
    }

    /// Workspace root for a file: the nearest marked ancestor of its
    /// directory, else the directory itself.
    pub fn root_for_file(file: &Path) -> PathBuf {
        let absolute = std::path::absolute(file).unwrap_or_else(|_| file.to_path_buf());
        let dir = absolute.parent().map_or_else(|| absolute.clone(), Path::to_path_buf);
        Self::find_workspace_root(&dir).unwrap_or(dir)
    }

    fn has_root_markers(path: &Path) -> bool {
        ROOT_MARKERS.iter().any(|marker| path.join(marker).exists())
    }
}
