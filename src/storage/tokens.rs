use chrono::{DateTime, Utc};
use redb::{ReadableTable, WriteTransaction};

use super::db::{expiry_key, expiry_key_ms, index_add, index_remove, read_record, Database, DatabaseError};
use super::models::{EmailToken, PurgeStats, TokenRecord};
use super::tables::*;

/// Remove one token record and its index entries inside an open write
/// transaction. Returns whether the record existed.
pub(crate) fn remove_token_in(txn: &WriteTransaction, jti: &str) -> Result<bool, DatabaseError> {
    let record: Option<TokenRecord> = {
        let mut table = txn.open_table(TOKENS)?;
        let record: Option<TokenRecord> = read_record(&table, jti)?;
        if record.is_some() {
            table.remove(jti)?;
        }
        record
    };

    let Some(record) = record else {
        return Ok(false);
    };

    index_remove(txn, SECRET_TOKENS, &record.key_id, jti)?;
    index_remove(txn, IDENTITY_TOKENS, &record.identity.to_string(), jti)?;
    {
        let mut expiry = txn.open_table(TOKEN_EXPIRY)?;
        expiry.remove(expiry_key(&record.expires_at, jti).as_str())?;
    }
    Ok(true)
}

impl Database {
    // ========================================================================
    // Token record operations
    // ========================================================================

    /// Store an issued token record
    pub fn insert_token(&self, record: &TokenRecord) -> Result<(), DatabaseError> {
        debug_assert!(!record.jti.is_empty(), "token jti must not be empty");
        debug_assert!(!record.key_id.is_empty(), "token key_id must not be empty");

        let write_txn = self.begin_write()?;
        {
            // A secret deleted after minting must not gain new index rows
            let secrets = write_txn.open_table(SECRETS)?;
            if secrets.get(record.key_id.as_str())?.is_none() {
                return Err(DatabaseError::NotFound("secret"));
            }
        }
        {
            let mut table = write_txn.open_table(TOKENS)?;
            if table.get(record.jti.as_str())?.is_some() {
                return Err(DatabaseError::Conflict("token"));
            }
            let data = rmp_serde::to_vec_named(record)?;
            table.insert(record.jti.as_str(), data.as_slice())?;
        }
        index_add(&write_txn, SECRET_TOKENS, &record.key_id, &record.jti)?;
        index_add(
            &write_txn,
            IDENTITY_TOKENS,
            &record.identity.to_string(),
            &record.jti,
        )?;
        {
            let mut expiry = write_txn.open_table(TOKEN_EXPIRY)?;
            let ek = expiry_key(&record.expires_at, &record.jti);
            expiry.insert(ek.as_str(), record.jti.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Get a token record by its jti
    pub fn get_token(&self, jti: &str) -> Result<Option<TokenRecord>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(TOKENS)?;
        read_record(&table, jti)
    }

    /// Revoke a single token record
    pub fn delete_token(&self, jti: &str) -> Result<bool, DatabaseError> {
        let write_txn = self.begin_write()?;
        let deleted = remove_token_in(&write_txn, jti)?;
        write_txn.commit()?;
        Ok(deleted)
    }

    /// Delete token records and email verifications that expired at or before
    /// `now`. Uses the expiration index for tokens (no full table scan).
    pub fn delete_expired(&self, now: DateTime<Utc>) -> Result<PurgeStats, DatabaseError> {
        let now_ms = now.timestamp_millis();

        // Phase 1: collect expired entries
        let (expired_tokens, expired_emails) = {
            let read_txn = self.begin_read()?;

            let expiry = read_txn.open_table(TOKEN_EXPIRY)?;
            let mut tokens = Vec::new();
            for entry in expiry.iter()? {
                let (key, value) = entry?;
                match expiry_key_ms(key.value()) {
                    Some(ms) if ms <= now_ms => tokens.push(value.value().to_string()),
                    _ => break,
                }
            }

            let emails_table = read_txn.open_table(EMAIL_TOKENS)?;
            let mut emails = Vec::new();
            for entry in emails_table.iter()? {
                let (_, value) = entry?;
                let token: EmailToken = rmp_serde::from_slice(value.value())?;
                if token.expires_at <= now {
                    emails.push(token);
                }
            }

            (tokens, emails)
        };

        let mut stats = PurgeStats::default();
        if expired_tokens.is_empty() && expired_emails.is_empty() {
            return Ok(stats);
        }

        // Phase 2: delete and clean up indexes
        let write_txn = self.begin_write()?;
        for jti in &expired_tokens {
            if remove_token_in(&write_txn, jti)? {
                stats.tokens += 1;
            }
        }
        {
            let mut table = write_txn.open_table(EMAIL_TOKENS)?;
            let mut index = write_txn.open_table(IDENTITY_EMAIL_TOKENS)?;
            for token in &expired_emails {
                if table.remove(token.token.as_str())?.is_some() {
                    stats.email_tokens += 1;
                }
                let id = token.identity.to_string();
                let current = index.get(id.as_str())?.map(|v| v.value() == token.token);
                if current == Some(true) {
                    index.remove(id.as_str())?;
                }
            }
        }
        write_txn.commit()?;

        Ok(stats)
    }
}
