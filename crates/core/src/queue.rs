// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Durable queue of commands that have not been acknowledged by the server.
//!
//! Every command is persisted before `enqueue` returns. Entries are read back
//! oldest-first and removed one at a time as the server confirms (or rejects)
//! them, so a crash at any point leaves exactly the unconfirmed commands behind.

use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::Result;
use crate::store::DurableStore;

/// Store collection holding queued commands.
pub const COLLECTION: &str = "queued_commands";

/// Field the queue is ordered by.
const CREATED_AT_INDEX: &str = "created_at";

/// A command waiting to be delivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedCommand {
    /// Caller-assigned identifier, stable across retries.
    pub id: Uuid,
    /// Scope (e.g. room or session) the command targets.
    pub scope_id: String,
    /// Opaque command body.
    pub payload: Value,
    #[serde(with = "chrono::serde::ts_microseconds")]
    pub created_at: DateTime<Utc>,
}

impl QueuedCommand {
    /// Creates a command stamped with the current time.
    pub fn new(id: Uuid, scope_id: impl Into<String>, payload: Value) -> Self {
        QueuedCommand {
            id,
            scope_id: scope_id.into(),
            payload,
            // Persisted with microsecond precision
            created_at: Utc::now().trunc_subsecs(6),
        }
    }
}

/// Durable FIFO of outbound commands.
///
/// Cloning is cheap; clones share the same underlying store handle.
#[derive(Clone)]
pub struct CommandQueue {
    store: Arc<dyn DurableStore>,
}

impl CommandQueue {
    /// Create a queue on top of an opened store.
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        CommandQueue { store }
    }

    /// Persist a new command under a fresh identifier.
    pub fn enqueue(&self, scope_id: &str, payload: Value) -> Result<QueuedCommand> {
        self.enqueue_with_id(Uuid::new_v4(), scope_id, payload)
    }

    /// Persist a command under a caller-chosen identifier.
    ///
    /// Enqueueing an identifier that is already queued leaves the stored entry
    /// untouched and returns it.
    pub fn enqueue_with_id(
        &self,
        id: Uuid,
        scope_id: &str,
        payload: Value,
    ) -> Result<QueuedCommand> {
        if let Some(existing) = self.get(id)? {
            tracing::debug!(%id, "command already queued");
            return Ok(existing);
        }

        let command = QueuedCommand::new(id, scope_id, payload);
        self.store
            .put(COLLECTION, &id.to_string(), &serde_json::to_value(&command)?)?;
        tracing::debug!(%id, scope = scope_id, "command queued");
        Ok(command)
    }

    /// Look up a queued command.
    pub fn get(&self, id: Uuid) -> Result<Option<QueuedCommand>> {
        self.store
            .get(COLLECTION, &id.to_string())?
            .map(|v| serde_json::from_value(v).map_err(Into::into))
            .transpose()
    }

    /// All queued commands, oldest first.
    pub fn list_pending(&self) -> Result<Vec<QueuedCommand>> {
        self.store
            .list_by_index(COLLECTION, CREATED_AT_INDEX)?
            .into_iter()
            .map(|v| serde_json::from_value(v).map_err(Into::into))
            .collect()
    }

    /// Remove a command. Unknown identifiers are ignored.
    pub fn remove(&self, id: Uuid) -> Result<()> {
        if !self.store.delete(COLLECTION, &id.to_string())? {
            tracing::debug!(%id, "remove: command not queued");
        }
        Ok(())
    }

    /// Number of queued commands.
    pub fn count(&self) -> Result<u32> {
        let count = self.store.count(COLLECTION)?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    /// Check if the queue is empty.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.count()? == 0)
    }
}

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;
