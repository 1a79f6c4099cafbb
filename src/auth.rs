//! Session handling: credential storage and the bearer-token exchange

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::api::{self, LoginRequest, LoginResponse};
use crate::config::ClientConfig;
use crate::error::{Result, SyncError};
use crate::transport::{ApiRequest, Transport};

/// Login identifiers may be an email address; server-side user resources
/// are keyed by the plain username in front of the domain.
pub fn bare_username(login: &str) -> &str {
    match login.find('@') {
        Some(at) => &login[..at],
        None => login,
    }
}

/// What survives a restart. Implementations decide where this lives
/// (settings file, keychain); the engine only reads it at startup and
/// rewrites it after a successful login.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredAuth {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub user_id: Option<i64>,
    #[serde(default)]
    pub token: String,
    #[serde(default, with = "crate::project::ts")]
    pub expire: Option<DateTime<Utc>>,
    #[serde(default)]
    pub api_root: String,
}

pub trait CredentialStore: Send + Sync {
    fn load(&self) -> Option<StoredAuth>;
    fn save(&self, auth: &StoredAuth);
    fn clear(&self);
}

/// In-memory store; the default when the host application does not supply
/// a persistent one.
#[derive(Default)]
pub struct MemoryCredentialStore {
    slot: parking_lot::Mutex<Option<StoredAuth>>,
}

impl CredentialStore for MemoryCredentialStore {
    fn load(&self) -> Option<StoredAuth> {
        self.slot.lock().clone()
    }

    fn save(&self, auth: &StoredAuth) {
        *self.slot.lock() = Some(auth.clone());
    }

    fn clear(&self) {
        *self.slot.lock() = None;
    }
}

/// An authenticated session as granted by the server.
#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    pub expire: Option<DateTime<Utc>>,
    pub user_id: Option<i64>,
    pub disk_usage: u64,
    pub storage_limit: u64,
}

impl Session {
    fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        !self.token.is_empty() && self.expire.map_or(false, |e| e > now)
    }
}

#[derive(Default)]
struct AuthState {
    username: String,
    password: String,
    session: Option<Session>,
}

/// Serializes token access: the first caller holding the lock performs the
/// login exchange when the cached session is missing or expired, and every
/// concurrent caller then reuses the fresh token.
pub struct AuthGate {
    state: Mutex<AuthState>,
    store: Box<dyn CredentialStore>,
}

impl AuthGate {
    pub fn new(store: Box<dyn CredentialStore>) -> Self {
        let mut state = AuthState::default();
        if let Some(saved) = store.load() {
            state.username = saved.username;
            state.password = saved.password;
            if !saved.token.is_empty() {
                state.session = Some(Session {
                    token: saved.token,
                    expire: saved.expire,
                    user_id: saved.user_id,
                    disk_usage: 0,
                    storage_limit: 0,
                });
            }
        }
        AuthGate {
            state: Mutex::new(state),
            store,
        }
    }

    pub async fn set_credentials(&self, login: impl Into<String>, password: impl Into<String>) {
        let mut state = self.state.lock().await;
        state.username = login.into();
        state.password = password.into();
        state.session = None;
    }

    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        *state = AuthState::default();
        self.store.clear();
    }

    pub async fn has_credentials(&self) -> bool {
        let state = self.state.lock().await;
        !state.username.is_empty() && !state.password.is_empty()
    }

    pub async fn username(&self) -> Option<String> {
        let state = self.state.lock().await;
        if state.username.is_empty() {
            None
        } else {
            Some(state.username.clone())
        }
    }

    pub async fn session(&self) -> Option<Session> {
        self.state.lock().await.session.clone()
    }

    /// Bearer token for the next request, logging in first if needed.
    ///
    /// A rejected login (400/401) wipes the credentials, both cached and
    /// persisted, so the application re-prompts instead of hammering the
    /// server. Transport failures leave them in place.
    pub async fn token(&self, transport: &dyn Transport, cfg: &ClientConfig) -> Result<String> {
        let mut state = self.state.lock().await;
        if let Some(session) = &state.session {
            if session.is_valid_at(Utc::now()) {
                return Ok(session.token.clone());
            }
        }
        if state.username.is_empty() || state.password.is_empty() {
            return Err(SyncError::AuthRequired);
        }

        let url = api::urls::login(cfg);
        let payload = serde_json::to_vec(&LoginRequest {
            login: &state.username,
            password: &state.password,
        })?;
        let request = ApiRequest::post(&url).json_body(payload);
        let response = transport
            .execute(request)
            .await
            .map_err(SyncError::Transport)?;
        let status = response.status;
        let body = response.read_body().await.map_err(SyncError::Transport)?;

        if (200..300).contains(&status) {
            let parsed: LoginResponse = serde_json::from_slice(&body)?;
            let session = Session {
                token: parsed.session.token,
                expire: parsed.session.expire,
                user_id: parsed.id,
                disk_usage: parsed.disk_usage,
                storage_limit: parsed.storage_limit,
            };
            self.store.save(&StoredAuth {
                username: state.username.clone(),
                password: state.password.clone(),
                user_id: session.user_id,
                token: session.token.clone(),
                expire: session.expire,
                api_root: cfg.api_root.clone(),
            });
            debug!(user = %state.username, "login succeeded");
            let token = session.token.clone();
            state.session = Some(session);
            Ok(token)
        } else if status == 400 || status == 401 {
            let message = api::extract_server_error(&body);
            warn!(user = %state.username, status, "login rejected");
            *state = AuthState::default();
            self.store.clear();
            Err(SyncError::Auth(message))
        } else {
            Err(SyncError::Server {
                status,
                url,
                message: api::extract_server_error(&body),
            })
        }
    }
}
