// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Keyed read-model cache.
//!
//! Each key holds either a collection of entities (JSON objects with an `id`)
//! or a single detail value, plus a `stale` flag. Stale or missing keys are
//! refetched through a [`Fetcher`] on [`Cache::get`]. Every mutation bumps a
//! per-slot generation so a fetch that raced with a newer write never
//! overwrites it.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::{join_all, BoxFuture, Shared};
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;

use crate::observer::{ObserverRegistry, Subscription};

/// Cached projection for one key.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheValue {
    /// Ordered entities, each carrying an `id` field.
    Collection(Vec<Value>),
    Detail(Value),
}

/// Snapshot of a cache slot.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub value: CacheValue,
    pub stale: bool,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CacheError {
    #[error("fetch failed for '{key}': {message}")]
    Fetch { key: String, message: String },
}

/// What happened to a set of keys. Observers get one notice per operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheChange {
    Set(Vec<String>),
    Patched(Vec<String>),
    Removed(Vec<String>),
    Invalidated(Vec<String>),
    Refreshed(Vec<String>),
    RolledBack(Vec<String>),
}

impl CacheChange {
    pub fn keys(&self) -> &[String] {
        match self {
            CacheChange::Set(k)
            | CacheChange::Patched(k)
            | CacheChange::Removed(k)
            | CacheChange::Invalidated(k)
            | CacheChange::Refreshed(k)
            | CacheChange::RolledBack(k) => k,
        }
    }
}

pub type FetchFuture<'a> = Pin<Box<dyn Future<Output = Result<CacheValue, String>> + Send + 'a>>;

/// Loads the authoritative value for a key.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, key: &str) -> FetchFuture<'_>;
}

#[derive(Debug, Clone)]
struct Slot {
    value: CacheValue,
    stale: bool,
    generation: u64,
}

type SharedLoad = Shared<BoxFuture<'static, Result<CacheValue, CacheError>>>;

/// A fetch other readers of the same slot generation can join.
struct InFlight {
    seen: Option<u64>,
    load: SharedLoad,
}

struct CacheInner {
    slots: Mutex<HashMap<String, Slot>>,
    in_flight: Mutex<HashMap<String, InFlight>>,
    fetcher: Arc<dyn Fetcher>,
    observers: ObserverRegistry<CacheChange>,
    generation: AtomicU64,
}

impl CacheInner {
    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Shared read cache. Cheap to clone.
#[derive(Clone)]
pub struct Cache {
    inner: Arc<CacheInner>,
}

fn entity_id(entity: &Value) -> Option<&Value> {
    entity.get("id").filter(|id| id.is_string() || id.is_number())
}

impl Cache {
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
        Cache {
            inner: Arc::new(CacheInner {
                slots: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
                fetcher,
                observers: ObserverRegistry::new(),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Current slot without fetching.
    pub fn peek(&self, key: &str) -> Option<CacheEntry> {
        self.inner.slots.lock().get(key).map(|slot| CacheEntry {
            value: slot.value.clone(),
            stale: slot.stale,
        })
    }

    pub fn is_stale(&self, key: &str) -> bool {
        self.inner.slots.lock().get(key).is_some_and(|s| s.stale)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.slots.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn subscribe(&self, listener: impl Fn(&CacheChange) + Send + Sync + 'static) -> Subscription {
        self.inner.observers.subscribe(listener)
    }

    /// Store a fresh value.
    pub fn set(&self, key: &str, value: CacheValue) {
        let generation = self.inner.next_generation();
        self.inner.slots.lock().insert(
            key.to_string(),
            Slot {
                value,
                stale: false,
                generation,
            },
        );
        self.inner.observers.notify(&CacheChange::Set(vec![key.to_string()]));
    }

    /// Value for `key`, fetched when missing or stale.
    ///
    /// Concurrent callers that see the same slot generation share one fetch.
    pub async fn get(&self, key: &str) -> Result<CacheValue, CacheError> {
        let seen = {
            let slots = self.inner.slots.lock();
            match slots.get(key) {
                Some(slot) if !slot.stale => return Ok(slot.value.clone()),
                Some(slot) => Some(slot.generation),
                None => None,
            }
        };

        let load = {
            let mut in_flight = self.inner.in_flight.lock();
            match in_flight.get(key) {
                Some(pending) if pending.seen == seen => pending.load.clone(),
                _ => {
                    let load = Self::load(Arc::clone(&self.inner), key.to_string(), seen)
                        .boxed()
                        .shared();
                    in_flight.insert(
                        key.to_string(),
                        InFlight {
                            seen,
                            load: load.clone(),
                        },
                    );
                    load
                }
            }
        };
        load.await
    }

    /// Fetch `key` and commit it unless the slot moved past `seen`.
    async fn load(
        inner: Arc<CacheInner>,
        key: String,
        seen: Option<u64>,
    ) -> Result<CacheValue, CacheError> {
        let result = inner.fetcher.fetch(&key).await;
        {
            let mut in_flight = inner.in_flight.lock();
            if in_flight.get(&key).is_some_and(|pending| pending.seen == seen) {
                in_flight.remove(&key);
            }
        }
        let fetched = result.map_err(|message| CacheError::Fetch {
            key: key.clone(),
            message,
        })?;

        let committed = {
            let mut slots = inner.slots.lock();
            let current = slots.get(&key).map(|s| s.generation);
            if current == seen {
                let generation = inner.next_generation();
                slots.insert(
                    key.clone(),
                    Slot {
                        value: fetched.clone(),
                        stale: false,
                        generation,
                    },
                );
                true
            } else {
                tracing::debug!(key = %key, "cache changed during fetch, keeping newer value");
                false
            }
        };
        if committed {
            inner.observers.notify(&CacheChange::Refreshed(vec![key]));
        }
        Ok(fetched)
    }

    /// Insert or replace an entity in the collection at `key`, matched by `id`.
    ///
    /// New entities are prepended. For a detail key the value is replaced.
    /// Keys that were never loaded are left alone. Returns whether anything changed.
    pub fn patch_entity(&self, key: &str, entity: Value) -> bool {
        {
            let mut slots = self.inner.slots.lock();
            let Some(slot) = slots.get_mut(key) else {
                return false;
            };
            match &mut slot.value {
                CacheValue::Collection(items) => {
                    let Some(id) = entity_id(&entity).cloned() else {
                        tracing::debug!(key, "patch without id ignored");
                        return false;
                    };
                    match items.iter().position(|e| entity_id(e) == Some(&id)) {
                        Some(index) => items[index] = entity,
                        None => items.insert(0, entity),
                    }
                }
                CacheValue::Detail(value) => *value = entity,
            }
            slot.generation = self.inner.next_generation();
        }
        self.inner
            .observers
            .notify(&CacheChange::Patched(vec![key.to_string()]));
        true
    }

    /// Drop the entity with `id` from every collection and every detail slot
    /// that holds it. Returns the affected keys.
    pub fn remove_entity(&self, id: &Value) -> Vec<String> {
        let mut affected = Vec::new();
        {
            let mut slots = self.inner.slots.lock();
            let mut dropped = Vec::new();
            for (key, slot) in slots.iter_mut() {
                match &mut slot.value {
                    CacheValue::Collection(items) => {
                        let before = items.len();
                        items.retain(|e| entity_id(e) != Some(id));
                        if items.len() != before {
                            slot.generation = self.inner.next_generation();
                            affected.push(key.clone());
                        }
                    }
                    CacheValue::Detail(value) => {
                        if entity_id(value) == Some(id) {
                            dropped.push(key.clone());
                        }
                    }
                }
            }
            for key in dropped {
                slots.remove(&key);
                affected.push(key);
            }
        }
        affected.sort();
        if !affected.is_empty() {
            self.inner
                .observers
                .notify(&CacheChange::Removed(affected.clone()));
        }
        affected
    }

    pub fn invalidate(&self, key: &str) -> bool {
        !self.invalidate_many([key]).is_empty()
    }

    /// Mark every loaded key in `keys` stale in one step, with a single notice.
    pub fn invalidate_many<I, S>(&self, keys: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut marked = Vec::new();
        {
            let mut slots = self.inner.slots.lock();
            for key in keys {
                let key = key.as_ref();
                if let Some(slot) = slots.get_mut(key) {
                    slot.stale = true;
                    slot.generation = self.inner.next_generation();
                    if !marked.iter().any(|k| k == key) {
                        marked.push(key.to_string());
                    }
                }
            }
        }
        if !marked.is_empty() {
            tracing::debug!(keys = ?marked, "cache invalidated");
            self.inner
                .observers
                .notify(&CacheChange::Invalidated(marked.clone()));
        }
        marked
    }

    /// Refetch every stale key and commit the results together.
    ///
    /// If any fetch fails nothing is committed. Keys written while the fetches
    /// were running keep their newer value. Returns the refreshed keys.
    pub async fn refresh_stale(&self) -> Result<Vec<String>, CacheError> {
        let stale: Vec<(String, u64)> = {
            let slots = self.inner.slots.lock();
            let mut stale: Vec<(String, u64)> = slots
                .iter()
                .filter(|(_, s)| s.stale)
                .map(|(k, s)| (k.clone(), s.generation))
                .collect();
            stale.sort();
            stale
        };
        if stale.is_empty() {
            return Ok(Vec::new());
        }

        let fetches = stale.iter().map(|(key, _)| self.inner.fetcher.fetch(key));
        let results = join_all(fetches).await;

        let mut fetched = Vec::with_capacity(results.len());
        for ((key, generation), result) in stale.into_iter().zip(results) {
            match result {
                Ok(value) => fetched.push((key, generation, value)),
                Err(message) => return Err(CacheError::Fetch { key, message }),
            }
        }

        let mut refreshed = Vec::new();
        {
            let mut slots = self.inner.slots.lock();
            for (key, seen, value) in fetched {
                let Some(slot) = slots.get_mut(&key) else {
                    continue;
                };
                if slot.generation != seen {
                    continue;
                }
                *slot = Slot {
                    value,
                    stale: false,
                    generation: self.inner.next_generation(),
                };
                refreshed.push(key);
            }
        }
        if !refreshed.is_empty() {
            self.inner
                .observers
                .notify(&CacheChange::Refreshed(refreshed.clone()));
        }
        Ok(refreshed)
    }

    /// Apply a tentative local edit to a loaded key.
    ///
    /// Returns `None` when the key is not loaded. The edit stays unless
    /// [`Tentative::rollback`] is called.
    pub fn optimistic(&self, key: &str, mutate: impl FnOnce(&mut CacheValue)) -> Option<Tentative> {
        let tentative = {
            let mut slots = self.inner.slots.lock();
            let slot = slots.get_mut(key)?;
            let snapshot = slot.clone();
            mutate(&mut slot.value);
            slot.generation = self.inner.next_generation();
            Tentative {
                cache: self.clone(),
                key: key.to_string(),
                snapshot,
                generation: slot.generation,
            }
        };
        self.inner
            .observers
            .notify(&CacheChange::Set(vec![key.to_string()]));
        Some(tentative)
    }
}

/// An optimistic edit awaiting confirmation.
#[must_use = "a tentative edit is kept unless rolled back"]
pub struct Tentative {
    cache: Cache,
    key: String,
    snapshot: Slot,
    generation: u64,
}

impl Tentative {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Keep the edit.
    pub fn commit(self) {}

    /// Undo the edit.
    ///
    /// If the key changed after the edit (e.g. a server patch) the snapshot
    /// is out of date, so the key is marked stale instead.
    pub fn rollback(self) {
        let inner = &self.cache.inner;
        let restored = {
            let mut slots = inner.slots.lock();
            match slots.get_mut(&self.key) {
                Some(slot) if slot.generation == self.generation => {
                    *slot = Slot {
                        generation: inner.next_generation(),
                        ..self.snapshot
                    };
                    true
                }
                _ => false,
            }
        };
        if restored {
            inner
                .observers
                .notify(&CacheChange::RolledBack(vec![self.key]));
        } else {
            self.cache.invalidate(&self.key);
        }
    }
}

#[cfg(test)]
#[path = "cache_tests.rs"]
mod tests;
