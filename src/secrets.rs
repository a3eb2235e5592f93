//! Active signing secret and its historical predecessors.
//!
//! The active secret lives in a single in-memory slot that is replaced with
//! one write after the new secret has been persisted, so readers always see
//! exactly one active secret. Rotations are serialized by their own mutex and
//! never hold the slot lock while talking to the store.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

use crate::clock::Clock;
use crate::identity::{GenerationError, IdGenerator};
use crate::storage::models::Secret;
use crate::storage::{Store, StoreError};

/// Bytes of HMAC key material per secret (enough for HS512).
pub const SECRET_KEY_BYTES: usize = 64;

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("No active secret")]
    NoActiveSecret,
    #[error("Secret not found: {0}")]
    NotFound(String),
    #[error("Failed to generate secret id: {0}")]
    Generation(#[from] GenerationError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

pub struct SecretStore<S> {
    active: RwLock<Option<Arc<Secret>>>,
    clock: Arc<dyn Clock>,
    ids: Arc<IdGenerator>,
    rotation: Mutex<()>,
    store: Arc<S>,
}

impl<S: Store> SecretStore<S> {
    /// Load the persisted active secret, rotating once if there is none.
    pub fn open(
        store: Arc<S>,
        ids: Arc<IdGenerator>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, SecretError> {
        let persisted = store.get_active_secret()?;
        let secrets = Self {
            active: RwLock::new(persisted.map(Arc::new)),
            clock,
            ids,
            rotation: Mutex::new(()),
            store,
        };

        match secrets.active_secret() {
            Ok(secret) => {
                tracing::info!(key_id = %secret.key_id, "Loaded active secret");
            }
            Err(_) => {
                let secret = secrets.rotate()?;
                tracing::info!(key_id = %secret.key_id, "No active secret found, generated one");
            }
        }
        Ok(secrets)
    }

    pub fn active_secret(&self) -> Result<Arc<Secret>, SecretError> {
        self.active
            .read()
            .as_ref()
            .map(Arc::clone)
            .ok_or(SecretError::NoActiveSecret)
    }

    /// Look up any secret, active or historical, by key id.
    pub fn secret_by_key(&self, key_id: &str) -> Result<Arc<Secret>, SecretError> {
        if let Some(active) = self.active.read().as_ref() {
            if active.key_id == key_id {
                return Ok(Arc::clone(active));
            }
        }
        self.store
            .get_secret(key_id)?
            .map(Arc::new)
            .ok_or_else(|| SecretError::NotFound(key_id.to_string()))
    }

    /// Generate a new secret, persist it as active and swap it in. The
    /// previous secret stays in the store for verifying older tokens.
    pub fn rotate(&self) -> Result<Arc<Secret>, SecretError> {
        let _rotation = self.rotation.lock();
        self.rotate_locked()
    }

    /// Delete a secret, invalidating every token signed with it. Deleting the
    /// active secret rotates to a fresh one first.
    pub fn delete(&self, key_id: &str) -> Result<(), SecretError> {
        let _rotation = self.rotation.lock();

        let is_active = self
            .active
            .read()
            .as_ref()
            .is_some_and(|active| active.key_id == key_id);
        if is_active {
            self.rotate_locked()?;
        }

        if !self.store.delete_secret(key_id)? {
            return Err(SecretError::NotFound(key_id.to_string()));
        }
        tracing::info!(key_id = %key_id, "Deleted secret");
        Ok(())
    }

    fn rotate_locked(&self) -> Result<Arc<Secret>, SecretError> {
        let mut key = vec![0u8; SECRET_KEY_BYTES];
        OsRng.fill_bytes(&mut key);
        let secret = Secret::new(self.ids.generate()?.to_string(), key, self.clock.now());

        let demoted = self.store.insert_active_secret(&secret)?;
        let secret = Arc::new(secret);
        *self.active.write() = Some(Arc::clone(&secret));

        tracing::info!(
            key_id = %secret.key_id,
            demoted = demoted.as_deref().unwrap_or("-"),
            "Rotated signing secret"
        );
        Ok(secret)
    }
}

impl<S> std::fmt::Debug for SecretStore<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let active = self.active.read().as_ref().map(|s| s.key_id.clone());
        f.debug_struct("SecretStore")
            .field("active", &active)
            .finish_non_exhaustive()
    }
}
