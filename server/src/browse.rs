//! Directory listings confined to the working directory.

use std::io;
use std::path::{Path, PathBuf};

#[derive(thiserror::Error, Debug)]
pub enum BrowseError {
    #[error("invalid path: {0}")]
    OutsideRoot(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub name: String,
    /// Relative to the browse root.
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Listing {
    pub current_path: String,
    pub full_path: PathBuf,
    pub entries: Vec<Entry>,
}

fn relative(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    if rel.as_os_str().is_empty() {
        ".".to_string()
    } else {
        rel.to_string_lossy().into_owned()
    }
}

/// List `rel_path` under `root`, which must already be canonical.
///
/// Symlinks are resolved before the containment check, so a link pointing out
/// of `root` is rejected like a `..` that climbs out of it.
pub fn browse(root: &Path, rel_path: &str) -> Result<Listing, BrowseError> {
    let rel_path = if rel_path.is_empty() { "." } else { rel_path };
    let full_path = root
        .join(rel_path)
        .canonicalize()
        .map_err(|_| BrowseError::OutsideRoot(rel_path.to_string()))?;
    if !full_path.starts_with(root) {
        return Err(BrowseError::OutsideRoot(rel_path.to_string()));
    }

    let mut entries = Vec::new();
    if full_path != root {
        if let Some(parent) = full_path.parent() {
            entries.push(Entry {
                name: "..".to_string(),
                path: relative(root, parent),
                is_dir: true,
                size: 0,
            });
        }
    }

    let mut children = Vec::new();
    for entry in std::fs::read_dir(&full_path)? {
        let entry = entry?;
        // entries that vanish or cannot be inspected are skipped
        let meta = match entry.metadata() {
            Ok(meta) => meta,
            Err(_) => continue,
        };
        let path = entry.path();
        children.push(Entry {
            name: entry.file_name().to_string_lossy().into_owned(),
            path: relative(root, &path),
            is_dir: meta.is_dir(),
            size: meta.len(),
        });
    }
    children.sort_by(|a, b| a.name.cmp(&b.name));
    entries.extend(children);

    Ok(Listing {
        current_path: rel_path.to_string(),
        full_path,
        entries,
    })
}
