//! Local project registry: discovery, server-list merge, directory naming

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::error::{Result, SyncError};
use crate::inventory;
use crate::project::{split_full_name, Project, ProjectMetadata, SyncStatus};

/// Everything the client knows about projects, local and listed. Keyed by
/// `namespace/name`. Reads hand out clones; the lock is never held across
/// I/O or awaits.
#[derive(Default)]
pub struct ProjectRegistry {
    projects: RwLock<HashMap<String, Project>>,
}

impl ProjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Discovers downloaded projects by scanning the data directory for
    /// metadata documents. Directories without one are not projects and
    /// are skipped; a corrupt document is logged and skipped too.
    pub fn load_from_dir(&self, data_dir: &Path) -> usize {
        let entries = match fs::read_dir(data_dir) {
            Ok(entries) => entries,
            Err(_) => return 0,
        };
        let mut found = 0;
        for entry in entries.flatten() {
            let dir = entry.path();
            if !dir.is_dir() {
                continue;
            }
            let meta = match ProjectMetadata::load(&dir) {
                Ok(Some(meta)) => meta,
                Ok(None) => continue,
                Err(err) => {
                    warn!(dir = %dir.display(), %err, "skipping unreadable project metadata");
                    continue;
                }
            };
            let mut project = Project::new(meta.namespace, meta.name);
            project.version = meta.version;
            project.client_updated = meta.client_updated;
            project.last_sync = meta.last_sync;
            project.files = meta.files;
            project.local_dir = Some(dir);
            found += 1;
            self.projects
                .write()
                .insert(project.full_name(), project);
        }
        debug!(count = found, "registry loaded from disk");
        found
    }

    /// Folds a server listing in. Known projects keep their local side
    /// (directory, sync times, manifest) and adopt the server's view;
    /// unknown ones are added. Projects absent from the listing stay: a
    /// filtered listing says nothing about them.
    pub fn merge_server_list(&self, listed: Vec<Project>) {
        let mut projects = self.projects.write();
        for incoming in listed {
            let key = incoming.full_name();
            match projects.get_mut(&key) {
                Some(existing) => {
                    existing.creator = incoming.creator;
                    existing.writers = incoming.writers;
                    existing.tags = incoming.tags;
                    existing.server_updated = incoming.server_updated;
                }
                None => {
                    projects.insert(key, incoming);
                }
            }
        }
    }

    /// Snapshot of all known projects, ordered by full name.
    pub fn projects(&self) -> Vec<Project> {
        let mut out: Vec<Project> = self.projects.read().values().cloned().collect();
        out.sort_by(|a, b| a.full_name().cmp(&b.full_name()));
        out
    }

    pub fn get(&self, full_name: &str) -> Option<Project> {
        self.projects.read().get(full_name).cloned()
    }

    /// Sync state of one project, measured against the local tree.
    pub fn status(&self, full_name: &str, ignore_extensions: &[String]) -> Option<SyncStatus> {
        let project = self.get(full_name)?;
        let last_modified = project
            .local_dir
            .as_deref()
            .and_then(|dir| inventory::last_modified(dir, ignore_extensions));
        Some(project.status(last_modified))
    }

    /// Registry entry for `namespace/name`, inserting a blank one if the
    /// project has never been seen.
    pub fn ensure_project(&self, namespace: &str, name: &str) -> Project {
        let mut projects = self.projects.write();
        projects
            .entry(crate::project::full_project_name(namespace, name))
            .or_insert_with(|| Project::new(namespace, name))
            .clone()
    }

    /// Local directory for a project, picking and creating one on first
    /// use. The preferred name is the project name; when that directory is
    /// already taken, a numeric suffix finds the first free variant.
    pub fn ensure_local_dir(&self, cfg: &ClientConfig, full_name: &str) -> Result<PathBuf> {
        let (namespace, name) = split_full_name(full_name)
            .ok_or_else(|| SyncError::UnknownProject(full_name.to_string()))?;
        let existing = self.ensure_project(namespace, name);
        if let Some(dir) = existing.local_dir {
            return Ok(dir);
        }

        let dir = unique_directory(&cfg.data_dir.join(name));
        fs::create_dir_all(&dir)?;
        if let Some(project) = self.projects.write().get_mut(full_name) {
            project.local_dir = Some(dir.clone());
        }
        Ok(dir)
    }

    /// Records a completed sync: stamps the manifest with the sync times,
    /// writes it atomically into the project directory and updates the
    /// in-memory entry so the status flips to up to date.
    pub fn apply_sync_result(
        &self,
        full_name: &str,
        mut meta: ProjectMetadata,
        server_updated: Option<DateTime<Utc>>,
    ) -> Result<ProjectMetadata> {
        let dir = self
            .get(full_name)
            .and_then(|p| p.local_dir)
            .ok_or_else(|| SyncError::UnknownProject(full_name.to_string()))?;

        let now = Utc::now();
        meta.client_updated = server_updated.or(Some(now));
        meta.last_sync = Some(now);
        meta.save(&dir)?;

        if let Some(project) = self.projects.write().get_mut(full_name) {
            project.client_updated = meta.client_updated;
            project.last_sync = meta.last_sync;
            project.version = meta.version.clone();
            project.files = meta.files.clone();
            if server_updated.is_some() {
                project.server_updated = server_updated;
            }
        }
        Ok(meta)
    }

    /// Refreshes the server-side modification time after a detail fetch.
    /// The listing is the authority for the other server fields.
    pub fn note_server_updated(&self, full_name: &str, updated: Option<DateTime<Utc>>) {
        if updated.is_none() {
            return;
        }
        if let Some(project) = self.projects.write().get_mut(full_name) {
            project.server_updated = updated;
        }
    }

    /// Forgets the local side of a project after the server confirmed its
    /// deletion. The entry survives with its last known manifest so the UI
    /// can still show what was there; the status reverts to no-version.
    pub fn reset(&self, full_name: &str) {
        if let Some(project) = self.projects.write().get_mut(full_name) {
            project.client_updated = None;
            project.last_sync = None;
            project.server_updated = None;
            project.local_dir = None;
        }
    }
}

/// First non-existing variant of `preferred`: the path itself, then with
/// suffixes 0, 1, 2 and so on.
fn unique_directory(preferred: &Path) -> PathBuf {
    if !preferred.exists() {
        return preferred.to_path_buf();
    }
    let base = preferred.to_string_lossy().into_owned();
    let mut i = 0u32;
    loop {
        let candidate = PathBuf::from(format!("{base}{i}"));
        if !candidate.exists() {
            return candidate;
        }
        i += 1;
    }
}
