//! Server API surface: endpoint URLs and wire payloads

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::diff::ChangeSet;
use crate::project::{ts, FileEntry, Project, ProjectMetadata};

/// Endpoint builders. Paths mirror the server's v1 REST layout; the
/// transport is responsible for any percent-encoding it needs.
pub mod urls {
    use super::ProjectFilter;
    use crate::config::ClientConfig;

    pub fn ping(cfg: &ClientConfig) -> String {
        cfg.endpoint("/ping")
    }

    pub fn login(cfg: &ClientConfig) -> String {
        cfg.endpoint("/v1/auth/login")
    }

    pub fn user_info(cfg: &ClientConfig, username: &str) -> String {
        cfg.endpoint(&format!("/v1/user/{username}"))
    }

    pub fn list_projects(cfg: &ClientConfig, filter: &ProjectFilter) -> String {
        format!("{}{}", cfg.endpoint("/v1/project"), filter.query())
    }

    pub fn project_info(cfg: &ClientConfig, full_name: &str) -> String {
        cfg.endpoint(&format!("/v1/project/{full_name}"))
    }

    pub fn create_project(cfg: &ClientConfig, namespace: &str) -> String {
        cfg.endpoint(&format!("/v1/project/{namespace}"))
    }

    pub fn delete_project(cfg: &ClientConfig, full_name: &str) -> String {
        cfg.endpoint(&format!("/v1/project/{full_name}"))
    }

    pub fn download_chunk(
        cfg: &ClientConfig,
        full_name: &str,
        file_path: &str,
        version: &str,
        chunk_no: usize,
    ) -> String {
        format!(
            "{}?file={file_path}&version={version}&chunkNo={chunk_no}",
            cfg.endpoint(&format!("/v1/project/raw/{full_name}"))
        )
    }

    pub fn push_start(cfg: &ClientConfig, full_name: &str) -> String {
        cfg.endpoint(&format!("/v1/project/push/{full_name}"))
    }

    pub fn push_chunk(cfg: &ClientConfig, transaction: &str, chunk_id: &str) -> String {
        cfg.endpoint(&format!("/v1/project/push/chunk/{transaction}/{chunk_id}"))
    }

    pub fn push_finish(cfg: &ClientConfig, transaction: &str) -> String {
        cfg.endpoint(&format!("/v1/project/push/finish/{transaction}"))
    }

    pub fn push_cancel(cfg: &ClientConfig, transaction: &str) -> String {
        cfg.endpoint(&format!("/v1/project/push/cancel/{transaction}"))
    }
}

/// Server-side filters for the project listing.
#[derive(Debug, Clone, Default)]
pub struct ProjectFilter {
    pub tags: Option<String>,
    pub search: Option<String>,
    pub flag: Option<String>,
    pub user: Option<String>,
}

impl ProjectFilter {
    pub fn by_tag(tag: impl Into<String>) -> Self {
        ProjectFilter {
            tags: Some(tag.into()),
            ..Default::default()
        }
    }

    fn query(&self) -> String {
        let mut pairs: Vec<String> = Vec::new();
        if let Some(tags) = &self.tags {
            pairs.push(format!("tags={tags}"));
        }
        if let Some(q) = &self.search {
            pairs.push(format!("q={q}"));
        }
        if let Some(flag) = &self.flag {
            pairs.push(format!("flag={flag}"));
            if let Some(user) = &self.user {
                pairs.push(format!("user={user}"));
            }
        }
        if pairs.is_empty() {
            String::new()
        } else {
            format!("?{}", pairs.join("&"))
        }
    }
}

#[derive(Debug, Serialize)]
pub struct LoginRequest<'a> {
    pub login: &'a str,
    pub password: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct SessionInfo {
    pub token: String,
    #[serde(default, with = "ts")]
    pub expire: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct LoginResponse {
    pub session: SessionInfo,
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub disk_usage: u64,
    #[serde(default)]
    pub storage_limit: u64,
}

#[derive(Debug, Deserialize)]
pub struct UserInfoResponse {
    #[serde(default)]
    pub disk_usage: u64,
    #[serde(default)]
    pub storage_limit: u64,
}

#[derive(Debug, Deserialize)]
pub struct PingResponse {
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct CreateProjectRequest<'a> {
    pub name: &'a str,
    pub public: bool,
}

#[derive(Debug, Deserialize)]
pub struct PushStartResponse {
    #[serde(default)]
    pub transaction: String,
}

/// Body of a push negotiation: the classified changes (entries carry
/// their chunk IDs) plus the server version the diff was computed against.
#[derive(Debug, Serialize)]
pub struct PushStartRequest<'a> {
    pub changes: &'a ChangeSet,
    pub version: &'a str,
}

/// Detail response for one project, also returned by a push finish.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectInfoResponse {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, with = "ts")]
    pub updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub files: Vec<FileEntry>,
}

impl ProjectInfoResponse {
    /// Version label, with the server's historical default for projects
    /// that have never been versioned.
    pub fn version_or_default(&self) -> String {
        if self.version.is_empty() {
            "v1".to_string()
        } else {
            self.version.clone()
        }
    }

    /// The manifest as a metadata document, ready to be stamped with sync
    /// times once the transfer completes.
    pub fn to_metadata(&self) -> ProjectMetadata {
        ProjectMetadata {
            client_updated: None,
            last_sync: None,
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            version: self.version_or_default(),
            files: self.files.clone(),
        }
    }
}

/// Pulls the human-readable detail out of an error body. The server wraps
/// failures as `{"detail": "..."}`; anything else is passed through as text.
pub fn extract_server_error(body: &[u8]) -> String {
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) {
        if let Some(detail) = value.get("detail").and_then(|d| d.as_str()) {
            return detail.to_string();
        }
    }
    let text = String::from_utf8_lossy(body).trim().to_string();
    if text.is_empty() {
        "(no error detail)".to_string()
    } else {
        text
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct AccessInfo {
    #[serde(default)]
    pub writers: Vec<i64>,
}

/// One element of the `GET /v1/project` listing.
#[derive(Debug, Deserialize)]
pub struct ProjectListEntry {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub creator: Option<i64>,
    #[serde(default)]
    pub access: AccessInfo,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, with = "ts")]
    pub updated: Option<DateTime<Utc>>,
    #[serde(default, with = "ts")]
    pub created: Option<DateTime<Utc>>,
}

impl ProjectListEntry {
    /// Listing entry as a registry project. `updated` falls back to
    /// `created` for projects that have never been pushed to.
    pub fn into_project(self) -> Project {
        let mut project = Project::new(self.namespace, self.name);
        project.creator = self.creator;
        project.writers = self.access.writers;
        project.tags = self.tags;
        project.server_updated = self.updated.or(self.created);
        project
    }
}
