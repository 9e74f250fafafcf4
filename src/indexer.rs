use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use walkdir::WalkDir;

use crate::error::Result;
use crate::queue::ScriptKind;

/// Directory names whose subtrees are never indexed or executed from.
pub const SKIP_DIRS: &[&str] = &[
    ".venv",
    ".cache",
    ".local",
    "anaconda3",
    "__pycache__",
    ".git",
];

/// A runnable file found under the home directory.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct IndexedScript {
    /// Relative to the home directory, `/`-separated
    pub path: String,
    pub kind: ScriptKind,
}

/// True if any component of `path` is an excluded directory name.
pub fn is_excluded(path: &Path) -> bool {
    path.components().any(|component| match component {
        Component::Normal(name) => name
            .to_str()
            .is_some_and(|name| SKIP_DIRS.contains(&name)),
        _ => false,
    })
}

/// Walks a home directory for `.py` and `.ipynb` files.
///
/// Symlinks are not followed, so a link cycle cannot keep the walk going.
#[derive(Debug, Clone)]
pub struct ScriptIndexer {
    root: PathBuf,
}

impl ScriptIndexer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Scan the tree. Unreadable subdirectories are skipped; an unreadable root
    /// is an error.
    pub fn scan(&self) -> Result<Vec<IndexedScript>> {
        std::fs::read_dir(&self.root)?;

        let walker = WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| {
                entry.depth() == 0
                    || !(entry.file_type().is_dir()
                        && entry
                            .file_name()
                            .to_str()
                            .is_some_and(|name| SKIP_DIRS.contains(&name)))
            });

        let mut scripts = Vec::new();
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::debug!(error = %e, "Skipping unreadable path during scan");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(kind) = ScriptKind::from_path(entry.path()) else {
                continue;
            };
            let Ok(relative) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let Some(path) = to_slash_path(relative) else {
                tracing::debug!(path = %entry.path().display(), "Skipping non UTF-8 path");
                continue;
            };
            scripts.push(IndexedScript { path, kind });
        }

        scripts.sort();
        Ok(scripts)
    }
}

fn to_slash_path(path: &Path) -> Option<String> {
    let parts: Option<Vec<&str>> = path
        .components()
        .map(|component| component.as_os_str().to_str())
        .collect();
    parts.map(|parts| parts.join("/"))
}
