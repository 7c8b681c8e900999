// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Durable key-value storage.
//!
//! The engine only relies on [`DurableStore`]: records are JSON values grouped
//! into named collections, and can be listed in the order of one of their
//! top-level fields. [`SqliteStore`] is the crash-durable implementation;
//! [`MemoryStore`] keeps everything in process memory.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::error::{Error, Result};

/// Index name that lists records in insertion order.
pub const INSERTION_ORDER: &str = "_seq";

/// SQL schema for the record store.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS records (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    collection TEXT NOT NULL,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    UNIQUE (collection, key)
);

CREATE INDEX IF NOT EXISTS idx_records_collection ON records(collection, seq);
"#;

/// Crash-durable storage consumed by the command queue.
pub trait DurableStore: Send + Sync {
    /// Insert or replace a record. Replacing keeps the original insertion position.
    fn put(&self, collection: &str, key: &str, value: &Value) -> Result<()>;

    /// Fetch a record.
    fn get(&self, collection: &str, key: &str) -> Result<Option<Value>>;

    /// Delete a record. Returns whether a record was removed.
    fn delete(&self, collection: &str, key: &str) -> Result<bool>;

    /// List every record of a collection ordered by the given top-level field,
    /// ties broken by insertion order. [`INSERTION_ORDER`] orders by insertion only.
    fn list_by_index(&self, collection: &str, index: &str) -> Result<Vec<Value>>;

    /// Number of records in a collection.
    fn count(&self, collection: &str) -> Result<usize> {
        Ok(self.list_by_index(collection, INSERTION_ORDER)?.len())
    }
}

fn validate_index(collection: &str, index: &str) -> Result<()> {
    let valid = !index.is_empty()
        && index
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::UnknownIndex {
            collection: collection.to_string(),
            index: index.to_string(),
        })
    }
}

/// SQLite-backed store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a store at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;

        // WAL keeps readers cheap; FULL sync makes every commit survive power loss
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = FULL;
             PRAGMA busy_timeout = 5000;",
        )?;
        conn.execute_batch(SCHEMA)?;

        tracing::debug!(path = %path.display(), "opened durable store");
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }

    /// Open a store that lives only as long as this value.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }
}

impl DurableStore for SqliteStore {
    fn put(&self, collection: &str, key: &str, value: &Value) -> Result<()> {
        let json = serde_json::to_string(value)?;
        self.conn.lock().execute(
            "INSERT INTO records (collection, key, value) VALUES (?1, ?2, ?3)
             ON CONFLICT(collection, key) DO UPDATE SET value = excluded.value",
            params![collection, key, json],
        )?;
        Ok(())
    }

    fn get(&self, collection: &str, key: &str) -> Result<Option<Value>> {
        let json: Option<String> = self
            .conn
            .lock()
            .query_row(
                "SELECT value FROM records WHERE collection = ?1 AND key = ?2",
                params![collection, key],
                |row| row.get(0),
            )
            .optional()?;
        json.map(|j| serde_json::from_str(&j).map_err(Error::from))
            .transpose()
    }

    fn delete(&self, collection: &str, key: &str) -> Result<bool> {
        let removed = self.conn.lock().execute(
            "DELETE FROM records WHERE collection = ?1 AND key = ?2",
            params![collection, key],
        )?;
        Ok(removed > 0)
    }

    fn list_by_index(&self, collection: &str, index: &str) -> Result<Vec<Value>> {
        validate_index(collection, index)?;
        let conn = self.conn.lock();

        let rows: Vec<String> = if index == INSERTION_ORDER {
            let mut stmt = conn
                .prepare("SELECT value FROM records WHERE collection = ?1 ORDER BY seq")?;
            let rows = stmt.query_map(params![collection], |row| row.get(0))?;
            let values = rows.collect::<std::result::Result<Vec<String>, _>>()?;
            values
        } else {
            let mut stmt = conn.prepare(
                "SELECT value FROM records WHERE collection = ?1
                 ORDER BY json_extract(value, ?2), seq",
            )?;
            let path = format!("$.{index}");
            let rows = stmt.query_map(params![collection, path], |row| row.get(0))?;
            let values = rows.collect::<std::result::Result<Vec<String>, _>>()?;
            values
        };

        rows.iter()
            .map(|j| serde_json::from_str(j).map_err(Error::from))
            .collect()
    }

    fn count(&self, collection: &str) -> Result<usize> {
        let count: i64 = self.conn.lock().query_row(
            "SELECT COUNT(*) FROM records WHERE collection = ?1",
            params![collection],
            |row| row.get(0),
        )?;
        usize::try_from(count).map_err(|_| Error::CorruptedData(format!("record count {count}")))
    }
}

/// Volatile store keeping records in process memory.
///
/// Can be switched to "unavailable" to simulate storage that went away.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    next_seq: u64,
    records: HashMap<(String, String), (u64, Value)>,
    unavailable: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail with [`Error::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.inner.lock().unavailable = !available;
    }
}

impl MemoryInner {
    fn check(&self) -> Result<()> {
        if self.unavailable {
            Err(Error::Unavailable("memory store switched off".to_string()))
        } else {
            Ok(())
        }
    }
}

impl DurableStore for MemoryStore {
    fn put(&self, collection: &str, key: &str, value: &Value) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check()?;
        let id = (collection.to_string(), key.to_string());
        if let Some(existing) = inner.records.get_mut(&id) {
            existing.1 = value.clone();
        } else {
            inner.next_seq += 1;
            let seq = inner.next_seq;
            inner.records.insert(id, (seq, value.clone()));
        }
        Ok(())
    }

    fn get(&self, collection: &str, key: &str) -> Result<Option<Value>> {
        let inner = self.inner.lock();
        inner.check()?;
        Ok(inner
            .records
            .get(&(collection.to_string(), key.to_string()))
            .map(|(_, v)| v.clone()))
    }

    fn delete(&self, collection: &str, key: &str) -> Result<bool> {
        let mut inner = self.inner.lock();
        inner.check()?;
        Ok(inner
            .records
            .remove(&(collection.to_string(), key.to_string()))
            .is_some())
    }

    fn list_by_index(&self, collection: &str, index: &str) -> Result<Vec<Value>> {
        validate_index(collection, index)?;
        let inner = self.inner.lock();
        inner.check()?;

        let mut rows: Vec<&(u64, Value)> = inner
            .records
            .iter()
            .filter(|((c, _), _)| c == collection)
            .map(|(_, row)| row)
            .collect();

        if index == INSERTION_ORDER {
            rows.sort_by_key(|(seq, _)| *seq);
        } else {
            rows.sort_by(|(seq_a, a), (seq_b, b)| {
                compare_index_values(a.get(index), b.get(index)).then(seq_a.cmp(seq_b))
            });
        }

        Ok(rows.into_iter().map(|(_, v)| v.clone()).collect())
    }
}

/// Orders index values the way SQLite orders `json_extract` results:
/// missing/null first, then numbers, then strings.
fn compare_index_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(v: Option<&Value>) -> u8 {
        match v {
            None | Some(Value::Null) => 0,
            Some(Value::Bool(_)) | Some(Value::Number(_)) => 1,
            Some(Value::String(_)) => 2,
            Some(_) => 3,
        }
    }

    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
