//! Account service entry points.
//!
//! Every entry point follows the same order: admission (availability gate,
//! then a store reachability probe), input validation, the per-identity lock
//! and finally the store. Locks are scoped guards, so they are released on
//! every exit path including a cancelled request.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::ServiceError;
use crate::gate::{AvailabilityGate, ServiceState};
use crate::identity::{IdGenerator, Identity};
use crate::locks::LockRegistry;
use crate::notify::{LogNotifier, Notifier};
use crate::password::{PasswordError, Passwords};
use crate::secrets::{SecretError, SecretStore};
use crate::storage::models::{EmailToken, Permission, PurgeStats, User};
use crate::storage::{normalize_email, Store, StoreError};
use crate::tokens::{
    generate_email_token, Claims, MintError, PersistenceError, TokenLifecycle, VerifyError,
};
use crate::validation::{BasicValidator, UserValidator, ValidationError};

pub const DEFAULT_TOKEN_TTL_SECONDS: i64 = 3600;
pub const DEFAULT_EMAIL_TOKEN_TTL_SECONDS: i64 = 24 * 3600;
pub const DEFAULT_PASSWORD_MEMORY_KIB: u32 = 19 * 1024;
pub const DEFAULT_PASSWORD_ITERATIONS: u32 = 2;

/// Mint/persist rounds before a vanishing signing secret fails the request
const ISSUE_TOKEN_ATTEMPTS: u32 = 3;

// ============================================================================
// Inputs and outputs
// ============================================================================

#[derive(Clone, Deserialize)]
pub struct NewUser {
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub organization: String,
    pub password: String,
}

impl fmt::Debug for NewUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewUser")
            .field("email", &self.email)
            .field("first_name", &self.first_name)
            .field("last_name", &self.last_name)
            .field("organization", &self.organization)
            .finish_non_exhaustive()
    }
}

/// Partial update. Absent and empty fields are left unchanged.
#[derive(Clone, Default, Deserialize)]
pub struct UserUpdate {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub organization: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl UserUpdate {
    fn without_empty_fields(self) -> Self {
        let keep = |field: Option<String>| field.filter(|v| !v.is_empty());
        Self {
            email: keep(self.email),
            first_name: keep(self.first_name),
            last_name: keep(self.last_name),
            organization: keep(self.organization),
            password: keep(self.password),
        }
    }

    fn is_empty(&self) -> bool {
        self.email.is_none()
            && self.first_name.is_none()
            && self.last_name.is_none()
            && self.organization.is_none()
            && self.password.is_none()
    }
}

impl fmt::Debug for UserUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserUpdate")
            .field("email", &self.email)
            .field("first_name", &self.first_name)
            .field("last_name", &self.last_name)
            .field("organization", &self.organization)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Clone, Deserialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .finish_non_exhaustive()
    }
}

/// A user as shown to callers. Never carries the password hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub created_at: DateTime<Utc>,
    pub email: String,
    pub first_name: String,
    pub identity: Identity,
    pub is_verified: bool,
    pub last_name: String,
    pub organization: String,
    pub permission: Permission,
    pub updated_at: DateTime<Utc>,
}

impl From<User> for UserProfile {
    fn from(user: User) -> Self {
        Self {
            created_at: user.created_at,
            email: user.email,
            first_name: user.first_name,
            identity: user.identity,
            is_verified: user.is_verified,
            last_name: user.last_name,
            organization: user.organization,
            permission: user.permission,
            updated_at: user.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuedToken {
    pub expires_at: DateTime<Utc>,
    pub key_id: String,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecretInfo {
    pub created_at: DateTime<Utc>,
    pub key_id: String,
}

// ============================================================================
// Construction
// ============================================================================

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Failed to load signing secret: {0}")]
    Secret(#[from] SecretError),
    #[error(transparent)]
    Password(#[from] PasswordError),
}

pub struct ServiceBuilder<S> {
    clock: Arc<dyn Clock>,
    email_token_ttl: Duration,
    initial_state: ServiceState,
    notifier: Arc<dyn Notifier>,
    password_iterations: u32,
    password_memory_kib: u32,
    store: Arc<S>,
    token_ttl: Duration,
    validator: Arc<dyn UserValidator>,
}

impl<S: Store> ServiceBuilder<S> {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn email_token_ttl(mut self, ttl: Duration) -> Self {
        self.email_token_ttl = ttl;
        self
    }

    pub fn initial_state(mut self, state: ServiceState) -> Self {
        self.initial_state = state;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Argon2id memory (KiB) and iteration cost.
    pub fn password_cost(mut self, memory_kib: u32, iterations: u32) -> Self {
        self.password_memory_kib = memory_kib;
        self.password_iterations = iterations;
        self
    }

    pub fn token_ttl(mut self, ttl: Duration) -> Self {
        self.token_ttl = ttl;
        self
    }

    pub fn validator(mut self, validator: Arc<dyn UserValidator>) -> Self {
        self.validator = validator;
        self
    }

    /// Load or bootstrap the signing secret and assemble the service.
    pub fn build(self) -> Result<UserService<S>, StartupError> {
        let passwords = Passwords::new(self.password_memory_kib, self.password_iterations)?;
        let ids = Arc::new(IdGenerator::new(Arc::clone(&self.clock)));
        let secrets = Arc::new(SecretStore::open(
            Arc::clone(&self.store),
            Arc::clone(&ids),
            Arc::clone(&self.clock),
        )?);
        let tokens = TokenLifecycle::new(
            Arc::clone(&self.store),
            Arc::clone(&secrets),
            Arc::clone(&self.clock),
            self.token_ttl,
        );

        Ok(UserService {
            clock: self.clock,
            email_token_ttl: self.email_token_ttl,
            gate: AvailabilityGate::new(self.initial_state),
            ids,
            locks: LockRegistry::new(),
            notifier: self.notifier,
            passwords,
            secrets,
            store: self.store,
            tokens,
            validator: self.validator,
        })
    }
}

// ============================================================================
// Service
// ============================================================================

pub struct UserService<S> {
    clock: Arc<dyn Clock>,
    email_token_ttl: Duration,
    gate: AvailabilityGate,
    ids: Arc<IdGenerator>,
    locks: LockRegistry,
    notifier: Arc<dyn Notifier>,
    passwords: Passwords,
    secrets: Arc<SecretStore<S>>,
    store: Arc<S>,
    tokens: TokenLifecycle<S>,
    validator: Arc<dyn UserValidator>,
}

impl<S: Store> UserService<S> {
    pub fn builder(store: Arc<S>) -> ServiceBuilder<S> {
        ServiceBuilder {
            clock: Arc::new(SystemClock),
            email_token_ttl: Duration::seconds(DEFAULT_EMAIL_TOKEN_TTL_SECONDS),
            initial_state: ServiceState::Available,
            notifier: Arc::new(LogNotifier),
            password_iterations: DEFAULT_PASSWORD_ITERATIONS,
            password_memory_kib: DEFAULT_PASSWORD_MEMORY_KIB,
            store,
            token_ttl: Duration::seconds(DEFAULT_TOKEN_TTL_SECONDS),
            validator: Arc::new(BasicValidator),
        }
    }

    pub fn locks(&self) -> &LockRegistry {
        &self.locks
    }

    pub fn state(&self) -> ServiceState {
        self.gate.state()
    }

    /// Flip the availability gate. Never gated itself, so an operator can
    /// always bring the service back.
    pub fn set_state(&self, state: ServiceState) -> ServiceState {
        self.gate.set_state(state)
    }

    /// Succeeds only when the gate is open and the store answers.
    pub fn status(&self) -> Result<(), ServiceError> {
        self.admit()
    }

    pub async fn create_user(&self, new: NewUser) -> Result<UserProfile, ServiceError> {
        self.admit()?;
        self.validator.first_name(&new.first_name)?;
        self.validator.last_name(&new.last_name)?;
        self.validator.email(&new.email)?;
        self.validator.password(&new.password)?;
        self.validator.organization(&new.organization)?;

        let identity = self.ids.generate().map_err(|e| {
            error!(error = %e, "Failed to generate identity");
            ServiceError::Internal
        })?;

        // Dropped without `keep()` on any failure below, which removes the
        // freshly allocated lock entry.
        let mut guard = self.locks.exclusive_uncommitted(identity).await;

        let password_hash = self.hash_password(new.password).await?;
        let now = self.clock.now();
        let user = User {
            created_at: now,
            email: new.email.trim().to_string(),
            first_name: new.first_name.trim().to_string(),
            identity,
            is_verified: false,
            last_name: new.last_name.trim().to_string(),
            organization: new.organization.trim().to_string(),
            password_hash,
            permission: Permission::User,
            updated_at: now,
        };

        if let Err(e) = self.store.insert_user(&user) {
            warn!(identity = %identity, "Create failed, releasing lock entry");
            return Err(store_failure("Failed to insert user", e));
        }
        guard.keep();

        self.request_verification(&user)?;
        info!(identity = %identity, "Created user");
        Ok(user.into())
    }

    pub async fn get_user(&self, id: &str) -> Result<UserProfile, ServiceError> {
        self.admit()?;
        let identity = self.parse_identity(id)?;

        let _guard = self.locks.shared(identity).await;
        let user = self.load_user(&identity)?;
        debug!(identity = %identity, "Retrieved user");
        Ok(user.into())
    }

    pub async fn update_user(
        &self,
        id: &str,
        update: UserUpdate,
    ) -> Result<UserProfile, ServiceError> {
        self.admit()?;
        let identity = self.parse_identity(id)?;

        let update = update.without_empty_fields();
        if update.is_empty() {
            return Err(ValidationError::EmptyUpdate.into());
        }
        if let Some(name) = &update.first_name {
            self.validator.first_name(name)?;
        }
        if let Some(name) = &update.last_name {
            self.validator.last_name(name)?;
        }
        if let Some(email) = &update.email {
            self.validator.email(email)?;
        }
        if let Some(password) = &update.password {
            self.validator.password(password)?;
        }
        if let Some(organization) = &update.organization {
            self.validator.organization(organization)?;
        }

        let _guard = self.locks.exclusive(identity).await;
        let mut user = self.load_user(&identity)?;

        let email_changed = match update.email {
            Some(email) if normalize_email(&email) != normalize_email(&user.email) => {
                user.email = email.trim().to_string();
                user.is_verified = false;
                true
            }
            _ => false,
        };
        if let Some(name) = update.first_name {
            user.first_name = name.trim().to_string();
        }
        if let Some(name) = update.last_name {
            user.last_name = name.trim().to_string();
        }
        if let Some(organization) = update.organization {
            user.organization = organization.trim().to_string();
        }
        if let Some(password) = update.password {
            user.password_hash = self.hash_password(password).await?;
        }
        user.updated_at = self.clock.now();

        let updated = self
            .store
            .update_user(&user)
            .map_err(|e| store_failure("Failed to update user", e))?;
        if !updated {
            return Err(ServiceError::NotFound("user"));
        }

        if email_changed {
            self.request_verification(&user)?;
        }
        info!(identity = %identity, email_changed, "Updated user");
        Ok(user.into())
    }

    /// Delete the account along with its token records, then drop its lock
    /// entry.
    pub async fn delete_user(&self, id: &str) -> Result<(), ServiceError> {
        self.admit()?;
        let identity = self.parse_identity(id)?;

        let mut guard = self.locks.exclusive(identity).await;
        let deleted = self
            .store
            .delete_user(&identity)
            .map_err(|e| store_failure("Failed to delete user", e))?;
        guard.evict();

        if !deleted {
            return Err(ServiceError::NotFound("user"));
        }
        info!(identity = %identity, "Deleted user");
        Ok(())
    }

    pub async fn authenticate(
        &self,
        id: &str,
        credentials: Credentials,
    ) -> Result<UserProfile, ServiceError> {
        self.admit()?;
        let identity = self.parse_identity(id)?;
        self.validator.email(&credentials.email)?;
        self.validator.password(&credentials.password)?;

        let _guard = self.locks.shared(identity).await;
        let user = self.check_credentials(&identity, credentials).await?;
        info!(identity = %identity, "Authenticated user");
        Ok(user.into())
    }

    /// Authenticate, then mint and persist a token carrying the account's
    /// stored permission.
    pub async fn issue_token(
        &self,
        id: &str,
        credentials: Credentials,
    ) -> Result<IssuedToken, ServiceError> {
        self.admit()?;
        let identity = self.parse_identity(id)?;
        self.validator.email(&credentials.email)?;
        self.validator.password(&credentials.password)?;

        let _guard = self.locks.exclusive(identity).await;
        let user = self.check_credentials(&identity, credentials).await?;

        // A secret deleted between mint and persist is retried with the
        // newly active one
        let mut attempt = 1;
        let (token, secret) = loop {
            let secret = self.secrets.active_secret().map_err(secret_failure)?;
            let token = self
                .tokens
                .mint(identity, user.permission, &secret)
                .map_err(|e| match e {
                    MintError::NoPermission(permission) => {
                        warn!(identity = %identity, ?permission, "Refused token for account");
                        ServiceError::Authentication
                    }
                    other => {
                        error!(identity = %identity, error = %other, "Failed to mint token");
                        ServiceError::Internal
                    }
                })?;

            match self.tokens.persist(&token, &secret) {
                Ok(()) => break (token, secret),
                Err(PersistenceError::Store(StoreError::NotFound(_)))
                    if attempt < ISSUE_TOKEN_ATTEMPTS =>
                {
                    debug!(
                        identity = %identity,
                        key_id = %secret.key_id,
                        attempt,
                        "Signing secret deleted before persist, retrying"
                    );
                    attempt += 1;
                }
                Err(PersistenceError::Store(e)) => {
                    return Err(store_failure("Failed to persist token", e));
                }
                Err(other) => {
                    error!(identity = %identity, error = %other, "Failed to persist token");
                    return Err(ServiceError::Internal);
                }
            }
        };

        let expires_at =
            DateTime::from_timestamp(token.body().exp, 0).ok_or(ServiceError::Internal)?;
        info!(identity = %identity, key_id = %secret.key_id, "Issued token");
        Ok(IssuedToken {
            expires_at,
            key_id: secret.key_id.clone(),
            token: token.to_string(),
        })
    }

    /// Verify a presented token.
    ///
    /// Runs without the identity lock: it reads only the secret and the token
    /// record, and identity deletion removes those records in one transaction.
    pub async fn verify_token(&self, token: &str) -> Result<Claims, ServiceError> {
        self.admit()?;
        if token.is_empty() {
            return Err(ValidationError::Token.into());
        }

        self.tokens.verify(token).map_err(|e| match e {
            VerifyError::Malformed(e) => {
                debug!(error = %e, "Rejected malformed token");
                ServiceError::Validation(ValidationError::Token)
            }
            VerifyError::UnknownSecret(key_id) => {
                debug!(key_id = %key_id, "Token references unknown secret");
                ServiceError::Authentication
            }
            err @ (VerifyError::SignatureMismatch | VerifyError::Revoked) => {
                debug!(error = %err, "Rejected token");
                ServiceError::Authentication
            }
            VerifyError::Expired => ServiceError::Expired,
            VerifyError::Store(e) => store_failure("Failed to verify token", e),
        })
    }

    pub async fn rotate_secret(&self) -> Result<SecretInfo, ServiceError> {
        self.admit()?;
        let secret = self.secrets.rotate().map_err(secret_failure)?;
        Ok(SecretInfo {
            created_at: secret.created_at,
            key_id: secret.key_id.clone(),
        })
    }

    /// Delete a secret and every token it signed.
    pub async fn delete_secret(&self, key_id: &str) -> Result<(), ServiceError> {
        self.admit()?;
        if key_id.trim().is_empty() {
            return Err(ServiceError::NotFound("secret"));
        }
        self.secrets.delete(key_id).map_err(secret_failure)
    }

    pub fn active_secret(&self) -> Result<SecretInfo, ServiceError> {
        let secret = self.secrets.active_secret().map_err(secret_failure)?;
        Ok(SecretInfo {
            created_at: secret.created_at,
            key_id: secret.key_id.clone(),
        })
    }

    /// Remove token records and verification tokens that have expired.
    pub fn purge_expired(&self) -> Result<PurgeStats, StoreError> {
        self.store.delete_expired(self.clock.now())
    }

    // ------------------------------------------------------------------------

    fn admit(&self) -> Result<(), ServiceError> {
        if !self.gate.is_available() {
            debug!("Rejected request while unavailable");
            return Err(ServiceError::Unavailable);
        }
        self.store.ping().map_err(|e| {
            warn!(error = %e, "Store unreachable");
            ServiceError::Unavailable
        })
    }

    fn parse_identity(&self, text: &str) -> Result<Identity, ServiceError> {
        self.validator.identity(text)?;
        Identity::parse(text).map_err(|e| ServiceError::Validation(e.into()))
    }

    fn load_user(&self, identity: &Identity) -> Result<User, ServiceError> {
        self.store
            .get_user(identity)
            .map_err(|e| store_failure("Failed to read user", e))?
            .ok_or(ServiceError::NotFound("user"))
    }

    /// Email and password must both match. Which one failed is only logged.
    async fn check_credentials(
        &self,
        identity: &Identity,
        credentials: Credentials,
    ) -> Result<User, ServiceError> {
        let user = self
            .store
            .get_user(identity)
            .map_err(|e| store_failure("Failed to read user", e))?;
        let Some(user) = user else {
            debug!(identity = %identity, "Authentication failed: unknown identity");
            return Err(ServiceError::Authentication);
        };

        if normalize_email(&user.email) != normalize_email(&credentials.email) {
            debug!(identity = %identity, "Authentication failed: email mismatch");
            return Err(ServiceError::Authentication);
        }
        if !self
            .verify_password(credentials.password, user.password_hash.clone())
            .await?
        {
            debug!(identity = %identity, "Authentication failed: password mismatch");
            return Err(ServiceError::Authentication);
        }
        Ok(user)
    }

    fn request_verification(&self, user: &User) -> Result<(), ServiceError> {
        let now = self.clock.now();
        let token = EmailToken {
            created_at: now,
            email: user.email.clone(),
            expires_at: now + self.email_token_ttl,
            identity: user.identity,
            token: generate_email_token(),
        };
        self.store
            .put_email_token(&token)
            .map_err(|e| store_failure("Failed to store email verification token", e))?;

        if let Err(e) = self.notifier.verify_email(user, &token) {
            warn!(identity = %user.identity, error = %e, "Failed to send verification email");
        }
        Ok(())
    }

    async fn hash_password(&self, password: String) -> Result<String, ServiceError> {
        let passwords = self.passwords.clone();
        tokio::task::spawn_blocking(move || passwords.hash(&password))
            .await
            .map_err(|e| {
                error!(error = %e, "Password hashing task failed");
                ServiceError::Internal
            })?
            .map_err(|e| {
                error!(error = %e, "Failed to hash password");
                ServiceError::Internal
            })
    }

    async fn verify_password(&self, password: String, hash: String) -> Result<bool, ServiceError> {
        let passwords = self.passwords.clone();
        tokio::task::spawn_blocking(move || passwords.verify(&password, &hash))
            .await
            .map_err(|e| {
                error!(error = %e, "Password verification task failed");
                ServiceError::Internal
            })?
            .map_err(|e| {
                error!(error = %e, "Stored password hash is unusable");
                ServiceError::Internal
            })
    }
}

/// Map a store failure into the service taxonomy, logging anything internal.
fn store_failure(context: &'static str, err: StoreError) -> ServiceError {
    match err {
        StoreError::Conflict(what) => ServiceError::Conflict(what),
        StoreError::NotFound(what) => ServiceError::NotFound(what),
        StoreError::Unreachable(reason) => {
            warn!(reason = %reason, "{context}: store unreachable");
            ServiceError::Unavailable
        }
        StoreError::Database(e) => {
            error!(error = %e, "{context}");
            ServiceError::Internal
        }
    }
}

fn secret_failure(err: SecretError) -> ServiceError {
    match err {
        SecretError::NotFound(_) => ServiceError::NotFound("secret"),
        SecretError::Store(e) => store_failure("Secret store operation failed", e),
        other => {
            error!(error = %other, "Secret operation failed");
            ServiceError::Internal
        }
    }
}

impl<S> fmt::Debug for UserService<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserService")
            .field("gate", &self.gate)
            .field("locks", &self.locks.len())
            .field("secrets", &self.secrets)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::models::{Secret, TokenRecord};
    use crate::storage::Database;
    use crate::testutil::{
        new_user, test_service, TEST_PASSWORD, TEST_PASSWORD_ITERATIONS, TEST_PASSWORD_MEMORY_KIB,
    };

    #[tokio::test]
    async fn test_create_then_get() {
        let (service, _clock) = test_service();
        let created = service
            .create_user(new_user("ada@example.com"))
            .await
            .unwrap();

        assert_eq!(created.permission, Permission::User);
        assert!(!created.is_verified);
        assert!(service.locks().contains(&created.identity));

        let fetched = service
            .get_user(&created.identity.to_string())
            .await
            .unwrap();
        assert_eq!(fetched, created);
    }

    #[tokio::test]
    async fn test_duplicate_email_conflicts_and_releases_lock() {
        let (service, _clock) = test_service();
        service
            .create_user(new_user("dup@example.com"))
            .await
            .unwrap();
        let allocated = service.locks().allocated();

        let err = service
            .create_user(new_user("DUP@example.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Conflict("email")));

        // One lock was allocated for the failed create and removed again
        assert_eq!(service.locks().allocated(), allocated + 1);
        assert_eq!(service.locks().len(), 1);
    }

    #[tokio::test]
    async fn test_create_validates_before_allocating() {
        let (service, _clock) = test_service();
        let mut bad = new_user("not-an-email");
        bad.email = "not-an-email".to_string();

        assert!(matches!(
            service.create_user(bad).await,
            Err(ServiceError::Validation(ValidationError::Email))
        ));
        assert_eq!(service.locks().allocated(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_short_circuits() {
        let (service, _clock) = test_service();
        service.set_state(ServiceState::Unavailable);

        assert!(matches!(
            service.create_user(new_user("x@example.com")).await,
            Err(ServiceError::Unavailable)
        ));
        assert!(matches!(
            service.get_user("garbage").await,
            Err(ServiceError::Unavailable)
        ));
        assert!(matches!(service.status(), Err(ServiceError::Unavailable)));
        assert_eq!(service.locks().allocated(), 0);

        assert_eq!(
            service.set_state(ServiceState::Available),
            ServiceState::Unavailable
        );
        assert!(service.status().is_ok());
    }

    #[tokio::test]
    async fn test_update_email_resets_verification() {
        let (service, _clock) = test_service();
        let created = service
            .create_user(new_user("old@example.com"))
            .await
            .unwrap();
        let id = created.identity.to_string();

        let updated = service
            .update_user(
                &id,
                UserUpdate {
                    email: Some("new@example.com".to_string()),
                    first_name: Some("Grace".to_string()),
                    last_name: Some(String::new()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.email, "new@example.com");
        assert_eq!(updated.first_name, "Grace");
        assert_eq!(updated.last_name, created.last_name);
        assert!(!updated.is_verified);

        assert!(matches!(
            service.update_user(&id, UserUpdate::default()).await,
            Err(ServiceError::Validation(ValidationError::EmptyUpdate))
        ));
    }

    #[tokio::test]
    async fn test_update_password_changes_credentials() {
        let (service, _clock) = test_service();
        let created = service
            .create_user(new_user("pw@example.com"))
            .await
            .unwrap();
        let id = created.identity.to_string();

        service
            .update_user(
                &id,
                UserUpdate {
                    password: Some("n3w-passw0rd".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let old = Credentials {
            email: "pw@example.com".to_string(),
            password: "s3cret-passw0rd".to_string(),
        };
        assert!(matches!(
            service.authenticate(&id, old).await,
            Err(ServiceError::Authentication)
        ));
        let new = Credentials {
            email: "pw@example.com".to_string(),
            password: "n3w-passw0rd".to_string(),
        };
        assert!(service.authenticate(&id, new).await.is_ok());
    }

    #[tokio::test]
    async fn test_delete_evicts_lock_and_cascades() {
        let (service, _clock) = test_service();
        let created = service
            .create_user(new_user("gone@example.com"))
            .await
            .unwrap();
        let id = created.identity.to_string();
        let issued = service
            .issue_token(
                &id,
                Credentials {
                    email: "gone@example.com".to_string(),
                    password: "s3cret-passw0rd".to_string(),
                },
            )
            .await
            .unwrap();

        service.delete_user(&id).await.unwrap();
        assert!(!service.locks().contains(&created.identity));
        assert!(matches!(
            service.get_user(&id).await,
            Err(ServiceError::NotFound("user"))
        ));
        assert!(matches!(
            service.verify_token(&issued.token).await,
            Err(ServiceError::Authentication)
        ));
        assert!(matches!(
            service.delete_user(&id).await,
            Err(ServiceError::NotFound("user"))
        ));
    }

    #[tokio::test]
    async fn test_authentication_never_says_which_factor() {
        let (service, _clock) = test_service();
        let created = service
            .create_user(new_user("auth@example.com"))
            .await
            .unwrap();
        let id = created.identity.to_string();

        let wrong_email = Credentials {
            email: "other@example.com".to_string(),
            password: "s3cret-passw0rd".to_string(),
        };
        let wrong_password = Credentials {
            email: "auth@example.com".to_string(),
            password: "wrong-passw0rd".to_string(),
        };
        for credentials in [wrong_email, wrong_password] {
            let err = service.authenticate(&id, credentials).await.unwrap_err();
            assert!(matches!(err, ServiceError::Authentication));
            assert_eq!(err.to_string(), "Credentials do not match");
        }

        let right = Credentials {
            email: "AUTH@example.com".to_string(),
            password: "s3cret-passw0rd".to_string(),
        };
        assert_eq!(
            service.authenticate(&id, right).await.unwrap().identity,
            created.identity
        );
    }

    #[tokio::test]
    async fn test_issue_and_verify_token() {
        let (service, clock) = test_service();
        let created = service
            .create_user(new_user("tok@example.com"))
            .await
            .unwrap();
        let id = created.identity.to_string();
        let credentials = Credentials {
            email: "tok@example.com".to_string(),
            password: "s3cret-passw0rd".to_string(),
        };

        let issued = service.issue_token(&id, credentials).await.unwrap();
        assert_eq!(issued.key_id, service.active_secret().unwrap().key_id);

        let claims = service.verify_token(&issued.token).await.unwrap();
        assert_eq!(claims.identity, created.identity);
        assert_eq!(claims.permission, Permission::User);

        clock.advance(Duration::minutes(61));
        assert!(matches!(
            service.verify_token(&issued.token).await,
            Err(ServiceError::Expired)
        ));
    }

    #[tokio::test]
    async fn test_verify_token_error_mapping() {
        let (service, _clock) = test_service();
        assert!(matches!(
            service.verify_token("").await,
            Err(ServiceError::Validation(ValidationError::Token))
        ));
        assert!(matches!(
            service.verify_token("not.a.token").await,
            Err(ServiceError::Validation(ValidationError::Token))
        ));
    }

    #[tokio::test]
    async fn test_rotate_and_delete_secret() {
        let (service, _clock) = test_service();
        let first = service.active_secret().unwrap();
        let second = service.rotate_secret().await.unwrap();
        assert_ne!(first.key_id, second.key_id);

        service.delete_secret(&first.key_id).await.unwrap();
        assert!(matches!(
            service.delete_secret(&first.key_id).await,
            Err(ServiceError::NotFound("secret"))
        ));
    }

    #[tokio::test]
    async fn test_invalid_identity_is_validation_error() {
        let (service, _clock) = test_service();
        for bad in ["", "abc", "01ARZ3NDEKTSV4RRFFQ69G5FAV"] {
            assert!(matches!(
                service.get_user(bad).await,
                Err(ServiceError::Validation(ValidationError::Identity(_)))
            ));
        }
        assert_eq!(service.locks().allocated(), 0);
    }

    #[test]
    fn test_builder_rejects_bad_password_cost() {
        let db = Arc::new(Database::in_memory().unwrap());
        assert!(matches!(
            UserService::builder(db).password_cost(0, 0).build(),
            Err(StartupError::Password(_))
        ));
    }

    /// Deletes the signing secret of the next token record just before it is
    /// written, the way a concurrent `delete_secret` would.
    struct SecretRacingStore {
        armed: std::sync::atomic::AtomicBool,
        inner: Database,
        secrets: std::sync::OnceLock<Arc<SecretStore<SecretRacingStore>>>,
    }

    impl Store for SecretRacingStore {
        fn ping(&self) -> Result<(), StoreError> {
            self.inner.ping().map_err(|e| StoreError::Unreachable(e.to_string()))
        }
        fn insert_user(&self, user: &User) -> Result<(), StoreError> {
            Ok(self.inner.insert_user(user)?)
        }
        fn get_user(&self, identity: &Identity) -> Result<Option<User>, StoreError> {
            Ok(self.inner.get_user(identity)?)
        }
        fn update_user(&self, user: &User) -> Result<bool, StoreError> {
            Ok(self.inner.update_user(user)?)
        }
        fn delete_user(&self, identity: &Identity) -> Result<bool, StoreError> {
            Ok(self.inner.delete_user(identity)?)
        }
        fn put_email_token(&self, token: &EmailToken) -> Result<(), StoreError> {
            Ok(self.inner.put_email_token(token)?)
        }
        fn insert_secret(&self, secret: &Secret) -> Result<(), StoreError> {
            Ok(self.inner.insert_secret(secret)?)
        }
        fn insert_active_secret(&self, secret: &Secret) -> Result<Option<String>, StoreError> {
            Ok(self.inner.insert_active_secret(secret)?)
        }
        fn get_secret(&self, key_id: &str) -> Result<Option<Secret>, StoreError> {
            Ok(self.inner.get_secret(key_id)?)
        }
        fn get_active_secret(&self) -> Result<Option<Secret>, StoreError> {
            Ok(self.inner.get_active_secret()?)
        }
        fn delete_secret(&self, key_id: &str) -> Result<bool, StoreError> {
            Ok(self.inner.delete_secret(key_id)?)
        }
        fn insert_token(&self, record: &TokenRecord) -> Result<(), StoreError> {
            if self.armed.swap(false, std::sync::atomic::Ordering::SeqCst) {
                if let Some(secrets) = self.secrets.get() {
                    secrets.delete(&record.key_id).unwrap();
                }
            }
            Ok(self.inner.insert_token(record)?)
        }
        fn get_token(&self, jti: &str) -> Result<Option<TokenRecord>, StoreError> {
            Ok(self.inner.get_token(jti)?)
        }
        fn delete_expired(&self, now: DateTime<Utc>) -> Result<PurgeStats, StoreError> {
            Ok(self.inner.delete_expired(now)?)
        }
    }

    #[tokio::test]
    async fn test_issue_token_retries_when_secret_vanishes() {
        let store = Arc::new(SecretRacingStore {
            armed: Default::default(),
            inner: Database::in_memory().unwrap(),
            secrets: Default::default(),
        });
        let service = UserService::builder(store.clone())
            .password_cost(TEST_PASSWORD_MEMORY_KIB, TEST_PASSWORD_ITERATIONS)
            .build()
            .unwrap();
        assert!(store.secrets.set(service.secrets.clone()).is_ok());

        let created = service
            .create_user(new_user("race@example.com"))
            .await
            .unwrap();
        let doomed = service.active_secret().unwrap().key_id;

        store.armed.store(true, std::sync::atomic::Ordering::SeqCst);
        let issued = service
            .issue_token(
                &created.identity.to_string(),
                Credentials {
                    email: "race@example.com".to_string(),
                    password: TEST_PASSWORD.to_string(),
                },
            )
            .await
            .unwrap();

        assert_ne!(issued.key_id, doomed);
        assert!(store.inner.get_secret(&doomed).unwrap().is_none());
        let claims = service.verify_token(&issued.token).await.unwrap();
        assert_eq!(claims.key_id, issued.key_id);
    }
}
