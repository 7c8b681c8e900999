// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Applying server-pushed events to the read cache.
//!
//! [`Rules`] map an event `type` to a cache policy. Patches and removals are
//! applied as they arrive. Invalidations are applied immediately when idle,
//! but while the queue is draining they are collected and flushed in a single
//! [`Cache::invalidate_many`] once the drain ends. This keeps the UI from
//! refetching half-applied state between each replayed command.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;

use tether_core::protocol::{ServerEvent, ServerFrame};

use crate::cache::Cache;
use crate::observer::Subscription;
use crate::rpc::RpcClient;
use crate::sync::{SyncManager, SyncState};

/// What to do with the cache when an event arrives.
///
/// Keys may contain `{field}` placeholders filled from the event data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Policy {
    /// Upsert the event data as an entity at `key`.
    Patch { key: String },
    /// Remove the entity whose `id` is in the event data, everywhere.
    Remove,
    /// Mark `keys` stale.
    Invalidate { keys: Vec<String> },
}

/// Event type to policy table.
#[derive(Debug, Clone, Default)]
pub struct Rules {
    policies: HashMap<String, Policy>,
}

impl Rules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn patch(mut self, event_type: &str, key: &str) -> Self {
        self.policies.insert(
            event_type.to_string(),
            Policy::Patch {
                key: key.to_string(),
            },
        );
        self
    }

    pub fn remove(mut self, event_type: &str) -> Self {
        self.policies.insert(event_type.to_string(), Policy::Remove);
        self
    }

    pub fn invalidate<I, S>(mut self, event_type: &str, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.policies.insert(
            event_type.to_string(),
            Policy::Invalidate {
                keys: keys.into_iter().map(Into::into).collect(),
            },
        );
        self
    }

    pub fn policy(&self, event_type: &str) -> Option<&Policy> {
        self.policies.get(event_type)
    }
}

/// Fill `{field}` placeholders from `data`. `None` if a field is missing.
pub fn render_key(template: &str, data: Option<&Value>) -> Option<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        let end = rest[start..].find('}')? + start;
        out.push_str(&rest[..start]);
        let field = &rest[start + 1..end];
        match data?.get(field)? {
            Value::String(s) => out.push_str(s),
            Value::Number(n) => out.push_str(&n.to_string()),
            Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
            _ => return None,
        }
        rest = &rest[end + 1..];
    }
    out.push_str(rest);
    Some(out)
}

/// What an event did to the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Patched(String),
    Removed(Vec<String>),
    Invalidated(Vec<String>),
    /// Invalidation held until the drain ends.
    Deferred(Vec<String>),
    Ignored,
}

#[derive(Default)]
struct Batch {
    draining: bool,
    keys: Vec<String>,
}

struct ReconcilerInner {
    cache: Cache,
    rules: Rules,
    batch: Mutex<Batch>,
    subscriptions: Mutex<Vec<Subscription>>,
}

/// Applies server events to a [`Cache`]. Cheap to clone.
#[derive(Clone)]
pub struct Reconciler {
    inner: Arc<ReconcilerInner>,
}

impl Reconciler {
    pub fn new(cache: Cache, rules: Rules) -> Self {
        Reconciler {
            inner: Arc::new(ReconcilerInner {
                cache,
                rules,
                batch: Mutex::new(Batch::default()),
                subscriptions: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Follow events from `rpc` and drain progress from `sync`.
    pub fn attach(&self, rpc: &RpcClient, sync: &SyncManager) {
        let events = {
            let weak: Weak<ReconcilerInner> = Arc::downgrade(&self.inner);
            rpc.subscribe_events(move |frame| {
                if let (ServerFrame::Event(event), Some(inner)) = (frame, weak.upgrade()) {
                    Reconciler { inner }.apply_event(event);
                }
            })
        };
        let states = {
            let weak: Weak<ReconcilerInner> = Arc::downgrade(&self.inner);
            sync.subscribe(move |state| {
                if let Some(inner) = weak.upgrade() {
                    Reconciler { inner }.on_sync_state(state);
                }
            })
        };
        let mut subscriptions = self.inner.subscriptions.lock();
        subscriptions.push(events);
        subscriptions.push(states);
    }

    /// Stop following events. Collected invalidations are flushed.
    pub fn detach(&self) {
        self.inner.subscriptions.lock().clear();
        self.flush();
    }

    /// Apply one event according to the rules.
    pub fn apply_event(&self, event: &ServerEvent) -> Applied {
        let Some(policy) = self.inner.rules.policy(&event.event_type) else {
            tracing::trace!(event = %event.event_type, "no rule for event");
            return Applied::Ignored;
        };
        let data = event.data.as_ref();

        match policy {
            Policy::Patch { key } => {
                let Some(key) = render_key(key, data) else {
                    tracing::debug!(event = %event.event_type, "patch key fields missing");
                    return Applied::Ignored;
                };
                match data {
                    Some(entity) if !entity.is_null() => {
                        self.inner.cache.patch_entity(&key, entity.clone());
                        Applied::Patched(key)
                    }
                    // Nothing to patch with, so refetch instead
                    _ => self.invalidate(vec![key]),
                }
            }
            Policy::Remove => match data.and_then(|d| d.get("id")) {
                Some(id) => Applied::Removed(self.inner.cache.remove_entity(id)),
                None => {
                    tracing::debug!(event = %event.event_type, "remove event without id");
                    Applied::Ignored
                }
            },
            Policy::Invalidate { keys } => {
                let keys: Vec<String> = keys.iter().filter_map(|k| render_key(k, data)).collect();
                if keys.is_empty() {
                    return Applied::Ignored;
                }
                self.invalidate(keys)
            }
        }
    }

    fn invalidate(&self, keys: Vec<String>) -> Applied {
        {
            let mut batch = self.inner.batch.lock();
            if batch.draining {
                for key in &keys {
                    if !batch.keys.contains(key) {
                        batch.keys.push(key.clone());
                    }
                }
                return Applied::Deferred(keys);
            }
        }
        self.inner.cache.invalidate_many(&keys);
        Applied::Invalidated(keys)
    }

    /// Track drain boundaries; leaving `Syncing` flushes the batch.
    pub fn on_sync_state(&self, state: &SyncState) {
        let leaving = {
            let mut batch = self.inner.batch.lock();
            let was = batch.draining;
            batch.draining = state.is_syncing();
            was && !batch.draining
        };
        if leaving {
            self.flush();
        }
    }

    fn flush(&self) {
        let keys = std::mem::take(&mut self.inner.batch.lock().keys);
        if keys.is_empty() {
            return;
        }
        tracing::debug!(count = keys.len(), "flushing deferred invalidations");
        self.inner.cache.invalidate_many(&keys);
    }

    /// Keys waiting for the drain to end.
    pub fn pending_invalidations(&self) -> Vec<String> {
        self.inner.batch.lock().keys.clone()
    }

    pub fn cache(&self) -> &Cache {
        &self.inner.cache
    }
}

#[cfg(test)]
#[path = "reconcile_tests.rs"]
mod tests;
