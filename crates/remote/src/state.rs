// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Relay state.
//!
//! Applied commands live in a durable store, one collection per scope, keyed
//! by command id so redeliveries are recognised. Each scope has its own
//! broadcast channel for `command_applied` events.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};

use tether_core::protocol::{CommandBody, ServerFrame};
use tether_core::{DurableStore, Result, SqliteStore, INSERTION_ORDER};

/// Event broadcast to a scope for every newly applied command.
pub const COMMAND_APPLIED: &str = "command_applied";

const BROADCAST_CAPACITY: usize = 1024;

/// A command as recorded by the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedCommand {
    #[serde(flatten)]
    pub command: CommandBody,
    /// Milliseconds since the Unix epoch.
    pub applied_at: i64,
}

/// Result of applying one command.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    Applied(AppliedCommand),
    /// The id was already applied in this scope; nothing changed.
    Duplicate,
}

/// Shared relay state.
#[derive(Clone)]
pub struct ServerState {
    inner: Arc<ServerStateInner>,
}

struct ServerStateInner {
    store: Arc<dyn DurableStore>,
    /// Also serializes apply so the duplicate check and the write are atomic.
    channels: Mutex<HashMap<String, broadcast::Sender<ServerFrame>>>,
    token: Option<String>,
}

impl ServerState {
    /// Opens the relay database in `data_dir`.
    pub fn new(data_dir: &Path, token: Option<String>) -> Result<Self> {
        let store = SqliteStore::open(&data_dir.join("relay.db"))?;
        Ok(Self::with_store(Arc::new(store), token))
    }

    pub fn with_store(store: Arc<dyn DurableStore>, token: Option<String>) -> Self {
        ServerState {
            inner: Arc::new(ServerStateInner {
                store,
                channels: Mutex::new(HashMap::new()),
                token,
            }),
        }
    }

    /// Whether a connection presenting `token` may join.
    pub fn authorize(&self, token: Option<&str>) -> bool {
        match &self.inner.token {
            Some(expected) => token == Some(expected.as_str()),
            None => true,
        }
    }

    /// Applies a command to `scope` unless its id was seen before, then
    /// broadcasts it to the scope.
    pub async fn apply(&self, scope: &str, command: CommandBody) -> Result<ApplyOutcome> {
        let mut channels = self.inner.channels.lock().await;
        let collection = collection(scope);

        if self.inner.store.get(&collection, &command.id)?.is_some() {
            return Ok(ApplyOutcome::Duplicate);
        }

        let applied = AppliedCommand {
            command,
            applied_at: now_millis(),
        };
        self.inner
            .store
            .put(&collection, &applied.command.id, &serde_json::to_value(&applied)?)?;

        if let Some(tx) = channels.get(scope) {
            let event = ServerFrame::event(COMMAND_APPLIED, Some(serde_json::to_value(&applied)?));
            if tx.send(event).is_err() {
                // Every subscriber is gone
                channels.remove(scope);
            }
        }

        Ok(ApplyOutcome::Applied(applied))
    }

    /// Commands applied to `scope`, oldest first.
    pub fn applied(&self, scope: &str) -> Result<Vec<AppliedCommand>> {
        self.inner
            .store
            .list_by_index(&collection(scope), INSERTION_ORDER)?
            .into_iter()
            .map(|value| serde_json::from_value(value).map_err(Into::into))
            .collect()
    }

    /// Subscribe to the events of one scope.
    pub async fn subscribe(&self, scope: &str) -> broadcast::Receiver<ServerFrame> {
        let mut channels = self.inner.channels.lock().await;
        channels
            .entry(scope.to_string())
            .or_insert_with(|| broadcast::channel(BROADCAST_CAPACITY).0)
            .subscribe()
    }
}

fn collection(scope: &str) -> String {
    format!("applied:{scope}")
}

/// Wall clock in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}

#[cfg(test)]
#[path = "state_tests.rs"]
mod tests;
