use redb::TableDefinition;

/// Users: identity -> User (msgpack)
pub const USERS: TableDefinition<&str, &[u8]> = TableDefinition::new("users");

/// Unique email index: normalized email -> identity
pub const USER_EMAILS: TableDefinition<&str, &str> = TableDefinition::new("user_emails");

/// Signing secrets: key_id -> Secret (msgpack)
pub const SECRETS: TableDefinition<&str, &[u8]> = TableDefinition::new("secrets");

/// Service metadata, e.g. "active_secret" -> key_id
pub const META: TableDefinition<&str, &str> = TableDefinition::new("meta");

/// Issued tokens: jti -> TokenRecord (msgpack)
pub const TOKENS: TableDefinition<&str, &[u8]> = TableDefinition::new("tokens");

/// Secondary index: key_id -> Vec<jti> (for cascading secret deletion)
pub const SECRET_TOKENS: TableDefinition<&str, &[u8]> = TableDefinition::new("secret_tokens");

/// Secondary index: identity -> Vec<jti> (for cascading user deletion)
pub const IDENTITY_TOKENS: TableDefinition<&str, &[u8]> = TableDefinition::new("identity_tokens");

/// Expiration index: "{expires_ms:020}:{jti}" -> jti
pub const TOKEN_EXPIRY: TableDefinition<&str, &str> = TableDefinition::new("token_expiry");

/// Pending email verifications: token -> EmailToken (msgpack)
pub const EMAIL_TOKENS: TableDefinition<&str, &[u8]> = TableDefinition::new("email_tokens");

/// Secondary index: identity -> pending email token
pub const IDENTITY_EMAIL_TOKENS: TableDefinition<&str, &str> =
    TableDefinition::new("identity_email_tokens");

pub(crate) const ACTIVE_SECRET_KEY: &str = "active_secret";
