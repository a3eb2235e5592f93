use redb::ReadableTable;

use super::db::{index_take, read_record, Database, DatabaseError};
use super::models::{EmailToken, User};
use super::tables::*;
use super::tokens::remove_token_in;
use crate::identity::Identity;

/// Emails are unique regardless of case or surrounding whitespace.
pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

impl Database {
    // ========================================================================
    // User operations
    // ========================================================================

    /// Insert a new user. Fails with `Conflict` if the identity or email is taken.
    pub fn insert_user(&self, user: &User) -> Result<(), DatabaseError> {
        let id = user.identity.to_string();
        let email = normalize_email(&user.email);

        let write_txn = self.begin_write()?;
        {
            let mut emails = write_txn.open_table(USER_EMAILS)?;
            if emails.get(email.as_str())?.is_some() {
                return Err(DatabaseError::Conflict("email"));
            }

            let mut users = write_txn.open_table(USERS)?;
            if users.get(id.as_str())?.is_some() {
                return Err(DatabaseError::Conflict("identity"));
            }

            let data = rmp_serde::to_vec_named(user)?;
            users.insert(id.as_str(), data.as_slice())?;
            emails.insert(email.as_str(), id.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Get a user by identity
    pub fn get_user(&self, identity: &Identity) -> Result<Option<User>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(USERS)?;
        read_record(&table, &identity.to_string())
    }

    /// Replace a stored user. Returns false if the user does not exist.
    pub fn update_user(&self, user: &User) -> Result<bool, DatabaseError> {
        let id = user.identity.to_string();

        let write_txn = self.begin_write()?;
        {
            let mut users = write_txn.open_table(USERS)?;
            let existing: Option<User> = read_record(&users, &id)?;
            let Some(existing) = existing else {
                return Ok(false);
            };

            let old_email = normalize_email(&existing.email);
            let new_email = normalize_email(&user.email);
            if old_email != new_email {
                let mut emails = write_txn.open_table(USER_EMAILS)?;
                let owner = emails.get(new_email.as_str())?.map(|v| v.value().to_string());
                if owner.is_some_and(|owner| owner != id) {
                    return Err(DatabaseError::Conflict("email"));
                }
                emails.remove(old_email.as_str())?;
                emails.insert(new_email.as_str(), id.as_str())?;
            }

            let data = rmp_serde::to_vec_named(user)?;
            users.insert(id.as_str(), data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(true)
    }

    /// Delete a user together with its email index entry, issued tokens and
    /// pending email verification.
    pub fn delete_user(&self, identity: &Identity) -> Result<bool, DatabaseError> {
        let id = identity.to_string();

        let write_txn = self.begin_write()?;
        let user: Option<User> = {
            let mut users = write_txn.open_table(USERS)?;
            let user: Option<User> = read_record(&users, &id)?;
            if user.is_some() {
                users.remove(id.as_str())?;
            }
            user
        };

        let Some(user) = user else {
            return Ok(false);
        };

        {
            let mut emails = write_txn.open_table(USER_EMAILS)?;
            emails.remove(normalize_email(&user.email).as_str())?;
        }

        for jti in index_take(&write_txn, IDENTITY_TOKENS, &id)? {
            remove_token_in(&write_txn, &jti)?;
        }

        let pending = {
            let mut index = write_txn.open_table(IDENTITY_EMAIL_TOKENS)?;
            let pending = index.remove(id.as_str())?.map(|v| v.value().to_string());
            pending
        };
        if let Some(token) = pending {
            let mut table = write_txn.open_table(EMAIL_TOKENS)?;
            table.remove(token.as_str())?;
        }

        write_txn.commit()?;
        Ok(true)
    }

    // ========================================================================
    // Email verification tokens
    // ========================================================================

    /// Store a pending email verification, replacing any earlier one for the
    /// same identity.
    pub fn put_email_token(&self, token: &EmailToken) -> Result<(), DatabaseError> {
        let id = token.identity.to_string();

        let write_txn = self.begin_write()?;
        {
            let mut index = write_txn.open_table(IDENTITY_EMAIL_TOKENS)?;
            let previous = index
                .insert(id.as_str(), token.token.as_str())?
                .map(|v| v.value().to_string());

            let mut table = write_txn.open_table(EMAIL_TOKENS)?;
            if let Some(previous) = previous {
                table.remove(previous.as_str())?;
            }
            let data = rmp_serde::to_vec_named(token)?;
            table.insert(token.token.as_str(), data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn get_email_token(&self, token: &str) -> Result<Option<EmailToken>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(EMAIL_TOKENS)?;
        read_record(&table, token)
    }
}
