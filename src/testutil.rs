//! Shared test helpers, available to all `#[cfg(test)]` modules in the crate.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tempfile::TempDir;

use crate::clock::ManualClock;
use crate::config::{Config, LogFormat, NodeConfig, PasswordConfig, TokenConfig};
use crate::identity::{IdGenerator, Identity};
use crate::service::{NewUser, UserService};
use crate::storage::models::{EmailToken, Permission, Secret, TokenRecord, User};
use crate::storage::Database;
use crate::AppState;

/// Cheap argon2 parameters so tests don't spend their time hashing.
pub const TEST_PASSWORD_MEMORY_KIB: u32 = 1024;
pub const TEST_PASSWORD_ITERATIONS: u32 = 1;

/// Password used by [`new_user`].
pub const TEST_PASSWORD: &str = "s3cret-passw0rd";

/// Open a fresh database in a temporary directory.
///
/// Returns both the `Database` and the `TempDir` guard. The caller must
/// keep the `TempDir` alive for the duration of the test.
pub fn setup_db() -> (Database, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db = Database::open(temp_dir.path()).unwrap();
    (db, temp_dir)
}

/// A minimal `Config` suitable for unit tests.
pub fn test_config() -> Config {
    Config {
        admin_routes: true,
        log_format: LogFormat::Plain,
        node: NodeConfig {
            bind_address: "127.0.0.1:8080".to_string(),
            data_dir: "/tmp/test".to_string(),
        },
        passwords: PasswordConfig {
            iterations: TEST_PASSWORD_ITERATIONS,
            memory_kib: TEST_PASSWORD_MEMORY_KIB,
        },
        start_unavailable: false,
        tokens: TokenConfig::default(),
    }
}

/// A service over an in-memory database with a manual clock.
pub fn test_service() -> (UserService<Database>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let service = UserService::builder(Arc::new(Database::in_memory().unwrap()))
        .clock(clock.clone())
        .password_cost(TEST_PASSWORD_MEMORY_KIB, TEST_PASSWORD_ITERATIONS)
        .build()
        .unwrap();
    (service, clock)
}

/// Build a full `Arc<AppState>` around the given database.
pub fn test_state(db: Database) -> Arc<AppState> {
    let config = test_config();
    let service = UserService::builder(Arc::new(db))
        .password_cost(config.passwords.memory_kib, config.passwords.iterations)
        .build()
        .unwrap();
    Arc::new(AppState { config, service })
}

/// Service input for a valid account with [`TEST_PASSWORD`].
pub fn new_user(email: &str) -> NewUser {
    NewUser {
        email: email.to_string(),
        first_name: "Ada".to_string(),
        last_name: "Lovelace".to_string(),
        organization: "Analytical Engines".to_string(),
        password: TEST_PASSWORD.to_string(),
    }
}

/// A stored user with a fresh identity. The password hash is not real.
pub fn make_user(email: &str) -> User {
    let now = Utc::now();
    User {
        created_at: now,
        email: email.to_string(),
        first_name: "Ada".to_string(),
        identity: IdGenerator::default().generate().unwrap(),
        is_verified: false,
        last_name: "Lovelace".to_string(),
        organization: "Analytical Engines".to_string(),
        password_hash: "hash".to_string(),
        permission: Permission::User,
        updated_at: now,
    }
}

pub fn make_token_record(
    jti: &str,
    identity: Identity,
    key_id: &str,
    expires_at: DateTime<Utc>,
) -> TokenRecord {
    TokenRecord {
        created_at: Utc::now(),
        expires_at,
        identity,
        jti: jti.to_string(),
        key_id: key_id.to_string(),
    }
}

/// A verification token for `user` that expires in a day.
pub fn make_email_token(token: &str, user: &User) -> EmailToken {
    let now = Utc::now();
    EmailToken {
        created_at: now,
        email: user.email.clone(),
        expires_at: now + Duration::days(1),
        identity: user.identity,
        token: token.to_string(),
    }
}

/// A secret with deterministic key material derived from its id.
pub fn make_secret(key_id: &str) -> Secret {
    let key = format!("key-material-for-{key_id}").into_bytes();
    Secret::new(key_id, key, Utc::now())
}
