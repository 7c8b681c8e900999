// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! tether: local-first command sync engine.
//!
//! Commands issued while offline are persisted in a durable queue and
//! replayed in order once a connection is available. Requests and server
//! events share one WebSocket; responses are matched to requests by
//! correlation id, and events keep a local read cache current.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────┐   ┌────────────┐   ┌─────────────┐   ┌──────────┐
//! │  Gateway   │──►│ RpcClient  │──►│  Transport  │──►│  Remote  │
//! │ (execute)  │   │ (pending)  │◄──│   (trait)   │◄──│  Server  │
//! └─────┬──────┘   └─────┬──────┘   └─────────────┘   └──────────┘
//!       │ offline        │ events
//!       ▼                ▼
//! ┌────────────┐   ┌────────────┐
//! │CommandQueue│◄──│SyncManager │──► Reconciler ──► Cache
//! └────────────┘   └────────────┘
//! ```
//!
//! [`Engine`] wires everything together; each component can also be
//! constructed on its own.

pub mod cache;
pub mod config;
pub mod connectivity;
pub mod engine;
pub mod gateway;
pub mod observer;
pub mod pending;
pub mod reconcile;
pub mod rpc;
pub mod sync;
pub mod transport;

#[cfg(test)]
mod test_helpers;

pub use cache::{Cache, CacheChange, CacheEntry, CacheError, CacheValue, Fetcher, Tentative};
pub use config::{ConfigError, EngineConfig};
pub use connectivity::{ConnectivityMonitor, LinkQuality, NetworkStatus, ReachabilityProbe};
pub use engine::{Engine, EngineError, EngineOptions};
pub use gateway::{Delivery, FallbackClient, Gateway, NoFallback, Outcome, RpcFetcher, SubmitError};
pub use observer::{ObservedState, ObserverRegistry, Subscription};
pub use pending::CallState;
pub use reconcile::{Applied, Policy, Reconciler, Rules};
pub use rpc::{
    ConnectionState, NoToken, RpcClient, RpcError, StaticToken, TokenProvider, TransportConfig,
};
pub use sync::{
    CommandExecutor, DrainOutcome, Rejection, SkipReason, SyncManager, SyncState, SyncStatus,
};
pub use transport::{Transport, TransportError, WebSocketTransport};

pub use tether_core::{CommandQueue, DurableStore, MemoryStore, QueuedCommand, SqliteStore};
