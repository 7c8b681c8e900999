// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Top-level facade wiring every component together.
//!
//! ```text
//!                ┌──────────────┐
//!  execute ────► │   Gateway    │──► RpcClient ──► Transport
//!                └──────┬───────┘        │
//!                       │ queue          │ events
//!                       ▼                ▼
//!                ┌──────────────┐  ┌──────────────┐
//!                │ SyncManager  │─►│  Reconciler  │──► Cache
//!                └──────────────┘  └──────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use tether_core::{CommandQueue, DurableStore, SqliteStore};

use crate::cache::{Cache, CacheValue};
use crate::config::{ConfigError, EngineConfig};
use crate::connectivity::{ConnectivityMonitor, ReachabilityProbe};
use crate::gateway::{Delivery, FallbackClient, Gateway, NoFallback, Outcome, RpcFetcher, SubmitError};
use crate::observer::Subscription;
use crate::reconcile::{Reconciler, Rules};
use crate::rpc::{ConnectionState, NoToken, RpcClient, RpcError, TokenProvider};
use crate::sync::{SyncManager, SyncState};
use crate::transport::{Transport, WebSocketTransport};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to open command queue: {0}")]
    Store(#[from] tether_core::Error),
}

/// Collaborators supplied by the host application.
pub struct EngineOptions {
    pub rules: Rules,
    pub fallback: Arc<dyn FallbackClient>,
    pub tokens: Arc<dyn TokenProvider>,
    /// Shared monitor fed by the host's platform events. A fresh one
    /// (initially online) is created when absent.
    pub connectivity: Option<ConnectivityMonitor>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            rules: Rules::new(),
            fallback: Arc::new(NoFallback),
            tokens: Arc::new(NoToken),
            connectivity: None,
        }
    }
}

pub struct Engine {
    config: EngineConfig,
    queue: CommandQueue,
    connectivity: ConnectivityMonitor,
    rpc: RpcClient,
    sync: SyncManager,
    cache: Cache,
    reconciler: Reconciler,
    gateway: Gateway,
    probe: Option<JoinHandle<()>>,
    shutdown: CancellationToken,
    backgrounded_at: Mutex<Option<Instant>>,
    links: Mutex<Vec<Subscription>>,
}

impl Engine {
    /// Open the engine with a SQLite queue and a WebSocket transport.
    ///
    /// Must be called within a Tokio runtime.
    pub fn open(config: EngineConfig, options: EngineOptions) -> Result<Self, EngineError> {
        config.validate()?;
        let store = Arc::new(SqliteStore::open(&config.queue_path)?);
        Ok(Self::with_parts(config, options, store, WebSocketTransport::new()))
    }

    /// Assemble the engine from an already opened store and a transport.
    pub fn with_parts<T>(
        config: EngineConfig,
        options: EngineOptions,
        store: Arc<dyn DurableStore>,
        transport: T,
    ) -> Self
    where
        T: Transport + 'static,
    {
        let connectivity = options.connectivity.unwrap_or_default();
        let queue = CommandQueue::new(store);

        let rpc = RpcClient::spawn(transport, config.transport_config(), options.tokens);
        let follow = rpc.follow_connectivity(&connectivity);

        let sync = SyncManager::new(queue.clone(), connectivity.clone(), config.online_sync_delay());
        let delivery = Delivery::new(rpc.clone(), options.fallback);
        let cache = Cache::new(Arc::new(RpcFetcher::new(delivery.clone())));
        let reconciler = Reconciler::new(cache.clone(), options.rules);
        reconciler.attach(&rpc, &sync);
        sync.initialize(Arc::new(delivery.clone()), Some(&rpc));
        let gateway = Gateway::new(delivery, sync.clone(), connectivity.clone());

        let shutdown = CancellationToken::new();
        let probe = config
            .probe_interval()
            .and_then(|interval| ReachabilityProbe::for_url(&config.url, interval, config.probe_timeout()))
            .map(|probe| probe.spawn(connectivity.clone(), shutdown.child_token()));

        tracing::info!(url = %config.url, pending = sync.state().pending_count, "engine started");

        Engine {
            config,
            queue,
            connectivity,
            rpc,
            sync,
            cache,
            reconciler,
            gateway,
            probe,
            shutdown,
            backgrounded_at: Mutex::new(None),
            links: Mutex::new(vec![follow]),
        }
    }

    /// Select the scope to sync. `None` disconnects.
    pub fn set_scope(&self, scope: Option<String>) {
        self.rpc.set_scope(scope);
    }

    pub fn scope(&self) -> Option<String> {
        self.rpc.scope()
    }

    /// Issue a command in the current scope.
    pub async fn execute(&self, payload: Value) -> Result<Outcome, SubmitError> {
        let scope = self.scope().ok_or(SubmitError::NoScope)?;
        self.gateway.execute(&scope, payload).await
    }

    /// Issue a command with a tentative edit of cache `key`.
    pub async fn execute_optimistic(
        &self,
        key: &str,
        mutate: impl FnOnce(&mut CacheValue),
        payload: Value,
    ) -> Result<Outcome, SubmitError> {
        let scope = self.scope().ok_or(SubmitError::NoScope)?;
        self.gateway
            .execute_optimistic(&self.cache, key, mutate, &scope, payload)
            .await
    }

    pub async fn query(&self, payload: Value) -> Result<Value, RpcError> {
        self.gateway.query(payload).await
    }

    /// Drain the queue now. See [`SyncManager::sync`].
    pub async fn sync_now(&self) -> crate::sync::DrainOutcome {
        self.sync.sync().await
    }

    pub fn app_backgrounded(&self) {
        *self.backgrounded_at.lock() = Some(Instant::now());
    }

    /// Returns whether a reconnect was forced.
    pub fn app_foregrounded(&self) -> bool {
        let hidden_for = self
            .backgrounded_at
            .lock()
            .take()
            .map_or(Duration::ZERO, |at| at.elapsed());
        self.rpc.foregrounded(hidden_for)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    pub fn rpc(&self) -> &RpcClient {
        &self.rpc
    }

    pub fn sync(&self) -> &SyncManager {
        &self.sync
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    pub fn sync_state(&self) -> SyncState {
        self.sync.state()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.rpc.connection_state()
    }

    /// Stop background work and close the connection. Queued commands stay
    /// on disk for the next run.
    pub fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        self.links.lock().clear();
        self.sync.shutdown();
        self.reconciler.detach();
        self.rpc.shutdown();
        if let Some(probe) = &self.probe {
            probe.abort();
        }
        tracing::info!("engine stopped");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
