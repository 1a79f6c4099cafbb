//! Client facade: wires auth, registry and transfers into sync operations

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::api::{
    self, CreateProjectRequest, PingResponse, ProjectFilter, ProjectInfoResponse,
    ProjectListEntry, UserInfoResponse,
};
use crate::auth::{bare_username, AuthGate, CredentialStore, MemoryCredentialStore, Session};
use crate::config::{ClientConfig, API_VERSION_MAJOR, API_VERSION_MINOR};
use crate::diff::{self, SyncDirection};
use crate::error::{Result, SyncError};
use crate::multipart::safe_join;
use crate::project::{earlier, full_project_name, Project, SyncStatus};
use crate::registry::ProjectRegistry;
use crate::transfer::{CancelFlag, TransferManager, TransferStats};
use crate::transport::{ApiRequest, Transport};

/// Outcome of the server version handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiVersionStatus {
    /// Not checked yet.
    Unknown,
    /// Check in flight.
    Pending,
    Ok,
    /// The server is older than this engine supports.
    Incompatible,
    /// The server did not answer the ping.
    NotFound,
}

/// What a completed sync moved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub pulled: TransferStats,
    pub pushed: TransferStats,
    /// Server version label after the sync.
    pub version: String,
}

fn parse_server_version(raw: &str) -> Option<(u32, u32)> {
    let (major, minor) = raw.trim().split_once('.')?;
    Some((major.trim().parse().ok()?, minor.trim().parse().ok()?))
}

fn version_is_supported(major: u32, minor: u32) -> bool {
    major > API_VERSION_MAJOR || (major == API_VERSION_MAJOR && minor >= API_VERSION_MINOR)
}

/// True when the server has a version this client has not seen: the
/// out-of-date condition, measured against the detail response.
fn server_moved_on(project: &Project, server_updated: Option<DateTime<Utc>>) -> bool {
    earlier(project.client_updated, server_updated) && earlier(project.last_sync, server_updated)
}

/// Per-project mutual exclusion for syncs. Dropping the guard releases
/// the project.
struct SyncGuard<'a> {
    active: &'a parking_lot::Mutex<HashSet<String>>,
    key: String,
}

impl<'a> SyncGuard<'a> {
    fn acquire(active: &'a parking_lot::Mutex<HashSet<String>>, key: &str) -> Result<Self> {
        if !active.lock().insert(key.to_string()) {
            return Err(SyncError::SyncInProgress(key.to_string()));
        }
        Ok(SyncGuard {
            active,
            key: key.to_string(),
        })
    }
}

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.active.lock().remove(&self.key);
    }
}

/// The synchronization engine's front door. One instance serves a whole
/// application; methods take `&self` and every sync runs under a
/// per-project guard, so concurrent calls for different projects are fine
/// while a second sync of the same project is refused.
pub struct MerginClient {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    auth: AuthGate,
    registry: ProjectRegistry,
    api_status: parking_lot::Mutex<ApiVersionStatus>,
    server_version: parking_lot::Mutex<String>,
    active_syncs: parking_lot::Mutex<HashSet<String>>,
    /// Projects whose push is waiting behind a catch-up pull; their
    /// local-only files are spared the obsolete-file cleanup.
    pending_push: parking_lot::Mutex<HashSet<String>>,
}

impl MerginClient {
    pub fn new(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        Self::with_credential_store(config, transport, Box::<MemoryCredentialStore>::default())
    }

    pub fn with_credential_store(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        store: Box<dyn CredentialStore>,
    ) -> Self {
        MerginClient {
            auth: AuthGate::new(store),
            registry: ProjectRegistry::new(),
            api_status: parking_lot::Mutex::new(ApiVersionStatus::Unknown),
            server_version: parking_lot::Mutex::new(String::new()),
            active_syncs: parking_lot::Mutex::new(HashSet::new()),
            pending_push: parking_lot::Mutex::new(HashSet::new()),
            config,
            transport,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Discovers already-downloaded projects under the data directory.
    /// Returns how many were found.
    pub fn load_local_projects(&self) -> usize {
        self.registry.load_from_dir(&self.config.data_dir)
    }

    pub fn projects(&self) -> Vec<Project> {
        self.registry.projects()
    }

    pub fn project_status(&self, full_name: &str) -> Option<SyncStatus> {
        self.registry
            .status(full_name, &self.config.ignore_extensions)
    }

    pub fn api_version_status(&self) -> ApiVersionStatus {
        *self.api_status.lock()
    }

    pub async fn set_credentials(&self, login: &str, password: &str) {
        self.auth.set_credentials(login, password).await;
    }

    pub async fn has_credentials(&self) -> bool {
        self.auth.has_credentials().await
    }

    /// Drops the session and the persisted credentials.
    pub async fn logout(&self) {
        self.auth.clear().await;
    }

    /// Stores the credentials and performs the login exchange right away,
    /// returning the granted session.
    pub async fn login(&self, login: &str, password: &str) -> Result<Session> {
        self.auth.set_credentials(login, password).await;
        self.auth
            .token(self.transport.as_ref(), &self.config)
            .await?;
        self.auth
            .session()
            .await
            .ok_or_else(|| SyncError::Auth("login produced no session".into()))
    }

    /// Storage numbers for the logged-in user.
    pub async fn user_info(&self) -> Result<UserInfoResponse> {
        let username = self.auth.username().await.ok_or(SyncError::AuthRequired)?;
        let token = self
            .auth
            .token(self.transport.as_ref(), &self.config)
            .await?;
        let url = api::urls::user_info(&self.config, bare_username(&username));
        let body = self.expect_success(ApiRequest::get(&url).bearer(&token), &url).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Asks the server for its API version and records whether this engine
    /// can talk to it. An unreachable server is `NotFound` and the
    /// underlying error is returned.
    pub async fn ping(&self) -> Result<ApiVersionStatus> {
        self.set_api_status(ApiVersionStatus::Pending);
        let url = api::urls::ping(&self.config);
        let outcome = self.ping_exchange(&url).await;
        match outcome {
            Ok(version) => {
                let status = match parse_server_version(&version) {
                    Some((major, minor)) if version_is_supported(major, minor) => {
                        ApiVersionStatus::Ok
                    }
                    _ => ApiVersionStatus::Incompatible,
                };
                debug!(server = %version, ?status, "ping answered");
                *self.server_version.lock() = version;
                self.set_api_status(status);
                Ok(status)
            }
            Err(err) => {
                self.set_api_status(ApiVersionStatus::NotFound);
                Err(err)
            }
        }
    }

    async fn ping_exchange(&self, url: &str) -> Result<String> {
        let response = self
            .transport
            .execute(ApiRequest::get(url))
            .await
            .map_err(SyncError::Transport)?;
        let status = response.status;
        let body = response.read_body().await.map_err(SyncError::Transport)?;
        if !(200..300).contains(&status) {
            return Err(SyncError::Server {
                status,
                url: url.to_string(),
                message: api::extract_server_error(&body),
            });
        }
        let parsed: PingResponse = serde_json::from_slice(&body)?;
        Ok(parsed.version)
    }

    fn set_api_status(&self, status: ApiVersionStatus) {
        *self.api_status.lock() = status;
    }

    /// Server operations run only against a compatible server. The check
    /// result is cached; an earlier failure to reach the server is retried
    /// here, an incompatible answer is not.
    async fn ensure_ready(&self) -> Result<()> {
        let status = match self.api_version_status() {
            ApiVersionStatus::Ok => return Ok(()),
            ApiVersionStatus::Incompatible => ApiVersionStatus::Incompatible,
            _ => self.ping().await?,
        };
        if status == ApiVersionStatus::Ok {
            Ok(())
        } else {
            Err(SyncError::VersionIncompatible {
                server: self.server_version.lock().clone(),
                expected: self.config.expected_api_version(),
            })
        }
    }

    /// Fetches the listing, folds it into the registry and returns the
    /// listed projects with their local state attached.
    pub async fn list_projects(&self, filter: &ProjectFilter) -> Result<Vec<Project>> {
        self.ensure_ready().await?;
        let token = self
            .auth
            .token(self.transport.as_ref(), &self.config)
            .await?;
        let url = api::urls::list_projects(&self.config, filter);
        let body = self.expect_success(ApiRequest::get(&url).bearer(&token), &url).await?;
        let entries: Vec<ProjectListEntry> = serde_json::from_slice(&body)?;
        let listed: Vec<Project> = entries
            .into_iter()
            .map(ProjectListEntry::into_project)
            .collect();
        let names: Vec<String> = listed.iter().map(|p| p.full_name()).collect();
        debug!(count = names.len(), "project listing received");
        self.registry.merge_server_list(listed);
        Ok(names
            .iter()
            .filter_map(|name| self.registry.get(name))
            .collect())
    }

    /// Current server-side state of one project.
    pub async fn project_info(&self, full_name: &str) -> Result<ProjectInfoResponse> {
        self.ensure_ready().await?;
        self.fetch_project_info(full_name).await
    }

    pub async fn create_project(&self, namespace: &str, name: &str) -> Result<()> {
        self.ensure_ready().await?;
        let token = self
            .auth
            .token(self.transport.as_ref(), &self.config)
            .await?;
        let url = api::urls::create_project(&self.config, namespace);
        let payload = serde_json::to_vec(&CreateProjectRequest { name, public: false })?;
        self.expect_success(
            ApiRequest::post(&url).bearer(&token).json_body(payload),
            &url,
        )
        .await?;
        self.registry.ensure_project(namespace, name);
        info!(project = %full_project_name(namespace, name), "project created");
        Ok(())
    }

    /// Deletes the project server-side. Local files stay on disk; the
    /// registry entry reverts to a never-synced state.
    pub async fn delete_project(&self, full_name: &str) -> Result<()> {
        self.ensure_ready().await?;
        let token = self
            .auth
            .token(self.transport.as_ref(), &self.config)
            .await?;
        let url = api::urls::delete_project(&self.config, full_name);
        self.expect_success(ApiRequest::delete(&url).bearer(&token), &url)
            .await?;
        self.registry.reset(full_name);
        info!(project = full_name, "project deleted on server");
        Ok(())
    }

    /// Brings the local copy up to the server's latest version. Files the
    /// server no longer has are removed locally, unless a push for this
    /// project is queued behind the pull.
    pub async fn pull_project(&self, full_name: &str, cancel: CancelFlag) -> Result<SyncReport> {
        let _guard = SyncGuard::acquire(&self.active_syncs, full_name)?;
        self.ensure_ready().await?;
        let (pulled, version) = self.pull_locked(full_name, &cancel).await?;
        Ok(SyncReport {
            pulled,
            pushed: TransferStats::default(),
            version,
        })
    }

    /// Publishes local changes as a new server version. A project the
    /// server has moved past gets a catch-up pull first; conflicting local
    /// files survive that pull as conflict copies and are then pushed.
    pub async fn push_project(&self, full_name: &str, cancel: CancelFlag) -> Result<SyncReport> {
        let _guard = SyncGuard::acquire(&self.active_syncs, full_name)?;
        self.ensure_ready().await?;
        self.push_locked(full_name, &cancel).await
    }

    async fn pull_locked(
        &self,
        full_name: &str,
        cancel: &CancelFlag,
    ) -> Result<(TransferStats, String)> {
        let info = self.fetch_project_info(full_name).await?;
        let dir = self.registry.ensure_local_dir(&self.config, full_name)?;
        let change = diff::compare(
            &dir,
            &info.files,
            SyncDirection::Pull,
            &self.config.ignore_extensions,
        );

        // Local-only files get deleted once the pull lands, except when a
        // push is queued: then they are about to be uploaded instead.
        let obsolete: Vec<String> = if self.pending_push.lock().contains(full_name) {
            Vec::new()
        } else {
            change.added.iter().map(|f| f.path.clone()).collect()
        };

        let to_fetch = change.files_to_fetch();
        let stats = if to_fetch.is_empty() {
            TransferStats::default()
        } else {
            let manager = TransferManager::new(
                self.transport.as_ref(),
                &self.auth,
                &self.config,
                cancel.clone(),
            );
            manager
                .download(full_name, &info.version_or_default(), &dir, &to_fetch)
                .await?
        };

        let meta = self
            .registry
            .apply_sync_result(full_name, info.to_metadata(), info.updated)?;
        self.remove_obsolete(&dir, &obsolete);
        info!(
            project = full_name,
            version = %meta.version,
            files = stats.files,
            "pull complete"
        );
        Ok((stats, meta.version))
    }

    async fn push_locked(&self, full_name: &str, cancel: &CancelFlag) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        let mut info = self.fetch_project_info(full_name).await?;
        let dir = self.registry.ensure_local_dir(&self.config, full_name)?;

        let project = self
            .registry
            .get(full_name)
            .ok_or_else(|| SyncError::UnknownProject(full_name.to_string()))?;
        if server_moved_on(&project, info.updated) {
            info!(project = full_name, "server moved on, pulling before push");
            self.pending_push.lock().insert(full_name.to_string());
            let pulled = self.pull_locked(full_name, cancel).await;
            self.pending_push.lock().remove(full_name);
            report.pulled = pulled?.0;
            info = self.fetch_project_info(full_name).await?;
        }

        let change = diff::compare(
            &dir,
            &info.files,
            SyncDirection::Push,
            &self.config.ignore_extensions,
        );
        if change.is_empty() {
            // No transaction needed; record that local and server agree.
            let meta = self
                .registry
                .apply_sync_result(full_name, info.to_metadata(), info.updated)?;
            report.version = meta.version;
            info!(project = full_name, "nothing to push");
            return Ok(report);
        }

        let manager = TransferManager::new(
            self.transport.as_ref(),
            &self.auth,
            &self.config,
            cancel.clone(),
        );
        let (confirmed, stats) = manager
            .upload(full_name, &dir, &info.version_or_default(), change)
            .await?;
        let server_updated = confirmed.updated;
        let meta = self
            .registry
            .apply_sync_result(full_name, confirmed.to_metadata(), server_updated)?;
        report.pushed = stats;
        report.version = meta.version;
        info!(
            project = full_name,
            version = %report.version,
            files = stats.files,
            "push complete"
        );
        Ok(report)
    }

    async fn fetch_project_info(&self, full_name: &str) -> Result<ProjectInfoResponse> {
        let token = self
            .auth
            .token(self.transport.as_ref(), &self.config)
            .await?;
        let url = api::urls::project_info(&self.config, full_name);
        let body = self.expect_success(ApiRequest::get(&url).bearer(&token), &url).await?;
        let info: ProjectInfoResponse = serde_json::from_slice(&body)?;
        if let Some((namespace, name)) = crate::project::split_full_name(full_name) {
            self.registry.ensure_project(namespace, name);
        }
        self.registry.note_server_updated(full_name, info.updated);
        Ok(info)
    }

    fn remove_obsolete(&self, dir: &Path, paths: &[String]) {
        for rel in paths {
            match safe_join(dir, rel) {
                Ok(target) => match std::fs::remove_file(&target) {
                    Ok(()) => debug!(file = rel.as_str(), "removed file absent from server"),
                    Err(err) => {
                        warn!(file = rel.as_str(), %err, "could not remove obsolete file")
                    }
                },
                Err(err) => {
                    warn!(file = rel.as_str(), %err, "skipping obsolete file with unsafe path")
                }
            }
        }
    }

    /// Executes a request and returns the body of a 2xx response; anything
    /// else becomes a server error carrying the extracted detail.
    async fn expect_success(&self, request: ApiRequest, url: &str) -> Result<Vec<u8>> {
        let response = self
            .transport
            .execute(request)
            .await
            .map_err(SyncError::Transport)?;
        let status = response.status;
        let body = response.read_body().await.map_err(SyncError::Transport)?;
        if (200..300).contains(&status) {
            Ok(body)
        } else {
            Err(SyncError::Server {
                status,
                url: url.to_string(),
                message: api::extract_server_error(&body),
            })
        }
    }
}
