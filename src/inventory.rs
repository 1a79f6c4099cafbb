//! Local project directory enumeration

use std::path::Path;

use chrono::{DateTime, Utc};
use walkdir::WalkDir;

use crate::config::METADATA_DIR;

/// A file found under a project directory.
#[derive(Debug, Clone)]
pub struct LocalFile {
    /// Path relative to the project root, forward slashes.
    pub path: String,
    pub size: u64,
    pub mtime: Option<DateTime<Utc>>,
}

fn is_ignored(path: &Path, ignore_extensions: &[String]) -> bool {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => ignore_extensions.iter().any(|i| i == ext),
        None => false,
    }
}

fn relative_slash_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}

/// Recursively lists the files of a project directory, relative to `root`
/// and sorted by path. The `.mergin/` bookkeeping directory and files with
/// ignored extensions are skipped. A missing or unreadable root yields an
/// empty list.
pub fn list_project_files(root: &Path, ignore_extensions: &[String]) -> Vec<LocalFile> {
    let mut out = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || e.file_name() != METADATA_DIR);
    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        if !entry.file_type().is_file() || is_ignored(entry.path(), ignore_extensions) {
            continue;
        }
        let meta = match entry.metadata() {
            Ok(m) => m,
            Err(_) => continue,
        };
        if let Some(path) = relative_slash_path(root, entry.path()) {
            out.push(LocalFile {
                path,
                size: meta.len(),
                mtime: meta.modified().ok().map(DateTime::<Utc>::from),
            });
        }
    }
    out.sort_by(|a, b| a.path.cmp(&b.path));
    out
}

/// Most recent modification time across the project's files, used to
/// decide whether anything changed since the last sync. Only file mtimes
/// count; directory timestamps move for bookkeeping reasons (such as
/// `.mergin/` being written) that are not user edits. An empty project
/// has no mtime.
pub fn last_modified(root: &Path, ignore_extensions: &[String]) -> Option<DateTime<Utc>> {
    let mut newest: Option<DateTime<Utc>> = None;
    for file in list_project_files(root, ignore_extensions) {
        if let Some(mtime) = file.mtime {
            if newest.map_or(true, |n| mtime > n) {
                newest = Some(mtime);
            }
        }
    }
    newest
}
