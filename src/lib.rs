//! haex-sync - server side of an end-to-end encrypted multi-device sync
//! platform.
//!
//! This crate provides:
//! - Cell-level CRDT change ingestion with HLC last-write-wins merge
//! - Stable cursor-paginated pull, correct under bulk imports
//! - Per-vault list partitioning with lifecycle-managed DDL
//! - An S3-compatible storage gateway with SigV4 verification
//! - Per-user storage credentials, encrypted at rest
//! - REST API

pub mod api;
pub mod config;
pub mod credentials;
pub mod gateway;
pub mod hlc;
pub mod identity;
pub mod sigv4;
pub mod storage;
#[cfg(test)]
pub mod testutil;

use config::Config;
use credentials::CredentialService;
use gateway::S3Gateway;
use identity::IdentityClient;
use storage::Database;

/// Shared application state
pub struct AppState {
    pub config: Config,
    pub credentials: CredentialService,
    pub db: Database,
    /// `None` when the object backend is not configured; storage routes then
    /// answer 503.
    pub gateway: Option<S3Gateway>,
    pub identity: IdentityClient,
}
