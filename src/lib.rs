//! user-svc - A user account service with per-identity locking and rotating
//! token signing secrets
//!
//! This crate provides:
//! - Time-ordered account identities
//! - Per-identity reader/writer locks, released on every exit path
//! - An availability gate checked before any work is admitted
//! - HMAC signing secrets with atomic rotation and historical lookup
//! - Bearer token mint / persist / verify
//! - redb embedded database (ACID, MVCC, crash-safe)
//! - REST API

pub mod api;
pub mod clock;
pub mod config;
pub mod error;
pub mod expiration;
pub mod gate;
pub mod identity;
pub mod locks;
pub mod notify;
pub mod password;
pub mod secrets;
pub mod service;
pub mod storage;
#[cfg(test)]
pub mod testutil;
pub mod tokens;
pub mod validation;

use config::Config;
use service::UserService;
use storage::Database;

/// Shared application state
pub struct AppState {
    pub config: Config,
    pub service: UserService<Database>,
}
