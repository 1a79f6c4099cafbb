//! Project model, sync-state rules and the on-disk metadata document

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{METADATA_DIR, METADATA_FILE};
use crate::error::Result;

/// Serde helpers for ISO-8601 timestamps with millisecond precision.
/// An absent or unparseable value maps to `None`, which serializes back
/// as an empty string; the wire format uses `""` for "no such time".
pub(crate) mod ts {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn format(t: &DateTime<Utc>) -> String {
        t.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
    }

    pub fn parse(s: &str) -> Option<DateTime<Utc>> {
        if s.is_empty() {
            return None;
        }
        if let Ok(t) = DateTime::parse_from_rfc3339(s) {
            return Some(t.with_timezone(&Utc));
        }
        // Tolerate a missing offset; such values are taken as UTC.
        NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|n| n.and_utc())
    }

    pub fn serialize<S: Serializer>(v: &Option<DateTime<Utc>>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(t) => s.serialize_str(&format(t)),
            None => s.serialize_str(""),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw = Option::<String>::deserialize(d)?;
        Ok(raw.as_deref().and_then(parse))
    }
}

/// One file of a project manifest. `checksum` is lowercase hex SHA-1; an
/// empty string means the content does not exist on the side that produced
/// the entry. `chunks` carries transfer IDs and only appears on the wire
/// while a push is being negotiated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    #[serde(default)]
    pub checksum: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default, with = "ts")]
    pub mtime: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chunks: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// Never synced from this device (or reset after server-side deletion).
    NoVersion,
    UpToDate,
    /// Server has news; local tree is untouched since the last sync.
    OutOfDate,
    /// Local edits exist. Takes precedence over `OutOfDate`.
    Modified,
}

/// Comparison with the "no time sorts first" rule: an unknown instant is
/// earlier than any known one, and two unknowns are not ordered.
pub(crate) fn earlier(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> bool {
    match (a, b) {
        (Some(x), Some(y)) => x < y,
        (None, Some(_)) => true,
        _ => false,
    }
}

/// Derives the sync state of one project. Rule order is significant:
/// local modification wins over the server having a newer version, so a
/// stale-but-edited project reports `Modified` and the push path decides
/// whether a pull must happen first.
pub fn project_status(
    client_updated: Option<DateTime<Utc>>,
    server_updated: Option<DateTime<Utc>>,
    last_sync: Option<DateTime<Utc>>,
    last_modified: Option<DateTime<Utc>>,
) -> SyncStatus {
    if client_updated.is_none() {
        return SyncStatus::NoVersion;
    }
    if earlier(last_sync, last_modified) {
        return SyncStatus::Modified;
    }
    if earlier(client_updated, server_updated) && earlier(last_sync, server_updated) {
        return SyncStatus::OutOfDate;
    }
    SyncStatus::UpToDate
}

/// One registry entry: what is known about a project, locally and from the
/// server listing. `local_dir` is set once the project exists on disk.
#[derive(Debug, Clone)]
pub struct Project {
    pub name: String,
    pub namespace: String,
    pub creator: Option<i64>,
    pub writers: Vec<i64>,
    pub tags: Vec<String>,
    /// Server version label, e.g. `v42`. Empty until known.
    pub version: String,
    pub server_updated: Option<DateTime<Utc>>,
    pub client_updated: Option<DateTime<Utc>>,
    pub last_sync: Option<DateTime<Utc>>,
    pub local_dir: Option<PathBuf>,
    pub files: Vec<FileEntry>,
}

impl Project {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Project {
            name: name.into(),
            namespace: namespace.into(),
            creator: None,
            writers: Vec::new(),
            tags: Vec::new(),
            version: String::new(),
            server_updated: None,
            client_updated: None,
            last_sync: None,
            local_dir: None,
            files: Vec::new(),
        }
    }

    pub fn full_name(&self) -> String {
        full_project_name(&self.namespace, &self.name)
    }

    pub fn is_downloaded(&self) -> bool {
        self.local_dir.is_some()
    }

    /// Status given the newest mtime under the local directory.
    pub fn status(&self, last_modified: Option<DateTime<Utc>>) -> SyncStatus {
        project_status(
            self.client_updated,
            self.server_updated,
            self.last_sync,
            last_modified,
        )
    }
}

pub fn full_project_name(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

/// Splits `namespace/name`, taking the last two segments so URL paths like
/// `/v1/project/john/survey` resolve the same way.
pub fn split_full_name(full: &str) -> Option<(&str, &str)> {
    let mut parts = full.rsplit('/');
    let name = parts.next()?;
    let namespace = parts.next()?;
    if name.is_empty() || namespace.is_empty() {
        return None;
    }
    Some((namespace, name))
}

/// The `.mergin/mergin.json` document: the client's record of the last
/// synced state. `files` is the manifest the server confirmed at that sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectMetadata {
    #[serde(rename = "clientUpdated", default, with = "ts")]
    pub client_updated: Option<DateTime<Utc>>,
    #[serde(rename = "lastSync", default, with = "ts")]
    pub last_sync: Option<DateTime<Utc>>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub files: Vec<FileEntry>,
}

impl ProjectMetadata {
    pub fn path_for(project_dir: &Path) -> PathBuf {
        project_dir.join(METADATA_DIR).join(METADATA_FILE)
    }

    /// Reads the document from `<project_dir>/.mergin/mergin.json`.
    /// A missing file is `Ok(None)`; a present but unreadable one is an error.
    pub fn load(project_dir: &Path) -> Result<Option<Self>> {
        let path = Self::path_for(project_dir);
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read(&path)?;
        Ok(Some(serde_json::from_slice(&data)?))
    }

    /// Writes the document atomically: a temp file in the metadata
    /// directory is persisted over the target, so a crash never leaves a
    /// half-written record.
    pub fn save(&self, project_dir: &Path) -> Result<()> {
        let dir = project_dir.join(METADATA_DIR);
        fs::create_dir_all(&dir)?;
        let tmp = tempfile::NamedTempFile::new_in(&dir)?;
        serde_json::to_writer_pretty(&tmp, self)?;
        tmp.persist(Self::path_for(project_dir))
            .map_err(|e| e.error)?;
        Ok(())
    }
}
