//! Mergin Sync Library
//!
//! Client-side synchronization engine for Mergin project stores: keeps a
//! local directory of projects in step with a server over a chunked HTTP
//! protocol, with manifest diffing, conflict copies and resumable
//! transfers. The HTTP socket itself is behind the [`Transport`] trait so
//! applications bring their own client.

pub mod api;
pub mod auth;
pub mod checksum;
pub mod chunker;
pub mod client;
pub mod config;
pub mod diff;
pub mod error;
pub mod inventory;
pub mod multipart;
pub mod project;
pub mod registry;
pub mod transfer;
pub mod transport;

pub use api::{ProjectFilter, ProjectInfoResponse, UserInfoResponse};
pub use auth::{CredentialStore, MemoryCredentialStore, Session, StoredAuth};
pub use client::{ApiVersionStatus, MerginClient, SyncReport};
pub use config::ClientConfig;
pub use diff::{ChangeSet, SyncDirection};
pub use error::{ErrorCategory, Result, SyncError};
pub use project::{FileEntry, Project, ProjectMetadata, SyncStatus};
pub use registry::ProjectRegistry;
pub use transfer::{CancelFlag, TransferState, TransferStats};
pub use transport::{ApiRequest, ApiResponse, Method, Transport};
