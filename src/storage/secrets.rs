use redb::ReadableTable;

use super::db::{index_take, read_record, Database, DatabaseError};
use super::models::Secret;
use super::tables::*;
use super::tokens::remove_token_in;

impl Database {
    // ========================================================================
    // Secret operations
    // ========================================================================

    /// Store a historical (non-active) secret
    pub fn insert_secret(&self, secret: &Secret) -> Result<(), DatabaseError> {
        let write_txn = self.begin_write()?;
        {
            let mut table = write_txn.open_table(SECRETS)?;
            if table.get(secret.key_id.as_str())?.is_some() {
                return Err(DatabaseError::Conflict("secret"));
            }
            let data = rmp_serde::to_vec_named(secret)?;
            table.insert(secret.key_id.as_str(), data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Store `secret` and point the active marker at it in one transaction.
    /// Returns the key id of the secret that was active before.
    pub fn insert_active_secret(&self, secret: &Secret) -> Result<Option<String>, DatabaseError> {
        let write_txn = self.begin_write()?;
        let previous = {
            let mut table = write_txn.open_table(SECRETS)?;
            if table.get(secret.key_id.as_str())?.is_some() {
                return Err(DatabaseError::Conflict("secret"));
            }
            let data = rmp_serde::to_vec_named(secret)?;
            table.insert(secret.key_id.as_str(), data.as_slice())?;

            let mut meta = write_txn.open_table(META)?;
            let previous = meta
                .insert(ACTIVE_SECRET_KEY, secret.key_id.as_str())?
                .map(|v| v.value().to_string());
            previous
        };
        write_txn.commit()?;
        Ok(previous)
    }

    /// Get a secret by key id
    pub fn get_secret(&self, key_id: &str) -> Result<Option<Secret>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(SECRETS)?;
        read_record(&table, key_id)
    }

    /// Get the secret the active marker points at
    pub fn get_active_secret(&self) -> Result<Option<Secret>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let meta = read_txn.open_table(META)?;
        let key_id = match meta.get(ACTIVE_SECRET_KEY)? {
            Some(v) => v.value().to_string(),
            None => return Ok(None),
        };
        let table = read_txn.open_table(SECRETS)?;
        read_record(&table, &key_id)
    }

    /// Delete a secret and every token record signed with it.
    pub fn delete_secret(&self, key_id: &str) -> Result<bool, DatabaseError> {
        let write_txn = self.begin_write()?;
        let existed = {
            let mut table = write_txn.open_table(SECRETS)?;
            let existed = table.remove(key_id)?.is_some();
            existed
        };

        if !existed {
            return Ok(false);
        }

        let mut revoked = 0usize;
        for jti in index_take(&write_txn, SECRET_TOKENS, key_id)? {
            if remove_token_in(&write_txn, &jti)? {
                revoked += 1;
            }
        }

        {
            let mut meta = write_txn.open_table(META)?;
            let is_active = meta
                .get(ACTIVE_SECRET_KEY)?
                .is_some_and(|v| v.value() == key_id);
            if is_active {
                meta.remove(ACTIVE_SECRET_KEY)?;
            }
        }

        write_txn.commit()?;
        tracing::debug!(key_id = %key_id, revoked, "Deleted secret and its token records");
        Ok(true)
    }
}
