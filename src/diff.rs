//! Local-versus-server manifest comparison

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::checksum;
use crate::inventory;
use crate::project::FileEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirection {
    /// Server wins; entries carry server-side metadata.
    Pull,
    /// Local wins; entries carry local metadata.
    Push,
}

/// Outcome of comparing a local tree against a server manifest.
///
/// `renamed` is always empty: a rename is deliberately reported as a
/// removal plus an addition, but the field stays so the wire shape of a
/// push request is complete.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChangeSet {
    pub added: Vec<FileEntry>,
    pub updated: Vec<FileEntry>,
    pub removed: Vec<FileEntry>,
    pub renamed: Vec<FileEntry>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.updated.is_empty()
            && self.removed.is_empty()
            && self.renamed.is_empty()
    }

    /// Files a pull must fetch: every bucket except `added` (those exist
    /// only locally and are left alone by a pull).
    pub fn files_to_fetch(&self) -> Vec<FileEntry> {
        let mut out = self.updated.clone();
        out.extend(self.removed.iter().cloned());
        out.extend(self.renamed.iter().cloned());
        out
    }

    /// Files a push must send content for: every bucket except `removed`
    /// (deletions travel in the manifest, not as chunks).
    pub fn files_to_upload(&self) -> Vec<FileEntry> {
        let mut out = self.added.clone();
        out.extend(self.updated.iter().cloned());
        out.extend(self.renamed.iter().cloned());
        out
    }
}

fn local_mtime(meta: Option<&fs::Metadata>) -> Option<DateTime<Utc>> {
    meta.and_then(|m| m.modified().ok()).map(DateTime::<Utc>::from)
}

/// Classifies every difference between the local tree at `project_dir` and
/// the server manifest `server_files`.
///
/// Classification is checksum-driven and the same for both directions;
/// only the metadata carried on each entry differs. Server entries keep
/// their manifest order, additions come out sorted by path, so the result
/// is deterministic for a given tree and manifest.
pub fn compare(
    project_dir: &Path,
    server_files: &[FileEntry],
    direction: SyncDirection,
    ignore_extensions: &[String],
) -> ChangeSet {
    let mut change = ChangeSet::default();

    let mut local_only: BTreeMap<String, ()> =
        inventory::list_project_files(project_dir, ignore_extensions)
            .into_iter()
            .map(|f| (f.path, ()))
            .collect();

    for server_file in server_files {
        let abs = project_dir.join(&server_file.path);
        let local_checksum = checksum::file_checksum(&abs);
        let meta = fs::metadata(&abs).ok();
        local_only.remove(&server_file.path);

        match local_checksum {
            // On the server, gone locally.
            None => {
                let (size, mtime) = match direction {
                    SyncDirection::Pull => (server_file.size, server_file.mtime),
                    SyncDirection::Push => (0, None),
                };
                change.removed.push(FileEntry {
                    path: server_file.path.clone(),
                    checksum: server_file.checksum.clone(),
                    size,
                    mtime,
                    chunks: Vec::new(),
                });
            }
            // Content differs; the winning side's metadata rides along.
            Some(local) if local != server_file.checksum => {
                let entry = match direction {
                    SyncDirection::Pull => FileEntry {
                        path: server_file.path.clone(),
                        checksum: server_file.checksum.clone(),
                        size: server_file.size,
                        mtime: server_file.mtime,
                        chunks: Vec::new(),
                    },
                    SyncDirection::Push => FileEntry {
                        path: server_file.path.clone(),
                        checksum: local,
                        size: meta.as_ref().map(|m| m.len()).unwrap_or(0),
                        mtime: local_mtime(meta.as_ref()),
                        chunks: Vec::new(),
                    },
                };
                change.updated.push(entry);
            }
            // Identical content: no entry at all.
            Some(_) => {}
        }
    }

    // Whatever the manifest did not claim is new on this side.
    for path in local_only.into_keys() {
        let abs = project_dir.join(&path);
        let meta = fs::metadata(&abs).ok();
        change.added.push(FileEntry {
            checksum: checksum::file_checksum(&abs).unwrap_or_default(),
            size: meta.as_ref().map(|m| m.len()).unwrap_or(0),
            mtime: local_mtime(meta.as_ref()),
            path,
            chunks: Vec::new(),
        });
    }

    change
}
