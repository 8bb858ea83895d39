// src/store/kv.rs
//! Transactional key-value store
//!
//! A single SQLite table holds every record. One [`KvStore::update`] call is
//! one SQLite transaction: it commits when the closure returns `Ok` and rolls
//! back on any `Err`, so multi-record invariants are all-or-nothing.

use std::path::Path;
use std::sync::Mutex;

use log::trace;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::StoreError;

/// Transactional store backed by SQLite
pub struct KvStore {
    /// SQLite connection, one writer at a time
    conn: Mutex<Connection>,
}

/// Handle used inside a [`KvStore::view`] or [`KvStore::update`] closure
pub struct Txn<'a> {
    conn: &'a Connection,
    writable: bool,
}

impl KvStore {
    /// Open (or create) a store at `path`
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Open a throwaway store that lives only in memory
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL
            )",
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Run `f` in a read-only transaction
    pub fn view<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Txn<'_>) -> Result<T, StoreError>,
    {
        let mut conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
        let txn = Txn { conn: &tx, writable: false };
        // Dropping the transaction rolls it back; nothing was written anyway
        f(&txn)
    }

    /// Run `f` in a read-write transaction, committing only on success
    pub fn update<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Txn<'_>) -> Result<T, StoreError>,
    {
        let mut conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let result = {
            let txn = Txn { conn: &tx, writable: true };
            f(&txn)
        };
        match result {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                trace!("Rolling back transaction: {}", e);
                tx.rollback()?;
                Err(e)
            }
        }
    }
}

impl<'a> Txn<'a> {
    /// Raw value stored at `key`
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let value = self
            .conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    pub fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let found: Option<i64> = self
            .conn
            .query_row("SELECT 1 FROM kv WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?;
        Ok(found.is_some())
    }

    pub fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.ensure_writable()?;
        self.conn.execute(
            "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    /// Delete `key`, returning whether it existed
    pub fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.ensure_writable()?;
        let removed = self.conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(removed > 0)
    }

    /// Decode the bincode record at `key`
    pub fn get_record<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.get(key)? {
            Some(bytes) => {
                let record = bincode::deserialize(&bytes).map_err(|e| StoreError::Corrupt {
                    key: key.to_string(),
                    reason: e.to_string(),
                })?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Encode `record` with bincode and store it at `key`
    pub fn put_record<T: Serialize>(&self, key: &str, record: &T) -> Result<(), StoreError> {
        let bytes = bincode::serialize(record)?;
        self.set(key, &bytes)
    }

    fn ensure_writable(&self) -> Result<(), StoreError> {
        if self.writable {
            Ok(())
        } else {
            Err(StoreError::ReadOnlyTransaction)
        }
    }
}
