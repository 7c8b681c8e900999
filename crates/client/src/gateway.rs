// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Command submission.
//!
//! [`Gateway::execute`] is the single entry point for issuing a command. It
//! prefers the socket, falls back to an out-of-band [`FallbackClient`], and
//! queues the command durably when neither can deliver it. A command the
//! server rejects is returned as an error and never queued.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use tether_core::protocol::{CommandBody, RequestKind};
use tether_core::QueuedCommand;

use crate::cache::{Cache, CacheValue, FetchFuture, Fetcher};
use crate::connectivity::ConnectivityMonitor;
use crate::rpc::{RpcClient, RpcError};
use crate::sync::{CommandExecutor, ExecuteFuture, SyncManager};

pub type FallbackFuture<'a> = Pin<Box<dyn Future<Output = Result<Value, RpcError>> + Send + 'a>>;

/// Plain request/response path used when the socket cannot deliver.
pub trait FallbackClient: Send + Sync {
    fn request(&self, kind: RequestKind, payload: Value) -> FallbackFuture<'_>;

    fn is_available(&self) -> bool {
        true
    }
}

/// Fallback that is never available.
pub struct NoFallback;

impl FallbackClient for NoFallback {
    fn request(&self, _kind: RequestKind, _payload: Value) -> FallbackFuture<'_> {
        Box::pin(async { Err(RpcError::NotConnected) })
    }

    fn is_available(&self) -> bool {
        false
    }
}

/// Result of a submitted command.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The server accepted the command.
    Acknowledged(Value),
    /// The command was persisted and will be delivered by the next drain.
    QueuedOffline(QueuedCommand),
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("command rejected: {0}")]
    Rejected(String),

    #[error("no scope selected")]
    NoScope,

    #[error("could not queue command: {0}")]
    Queue(#[from] tether_core::Error),
}

/// Socket-then-fallback delivery of single requests.
#[derive(Clone)]
pub struct Delivery {
    rpc: RpcClient,
    fallback: Arc<dyn FallbackClient>,
}

impl Delivery {
    pub fn new(rpc: RpcClient, fallback: Arc<dyn FallbackClient>) -> Self {
        Delivery { rpc, fallback }
    }

    pub fn rpc(&self) -> &RpcClient {
        &self.rpc
    }

    /// Send a request, trying the socket first.
    ///
    /// Only delivery failures move on to the fallback; a rejection is final.
    pub async fn request(&self, kind: RequestKind, payload: Value) -> Result<Value, RpcError> {
        if self.rpc.is_connected() {
            match self.rpc.send_request(kind, payload.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transport() => return Err(e),
                Err(e) => {
                    if !self.fallback.is_available() {
                        return Err(e);
                    }
                    tracing::debug!(error = %e, %kind, "socket delivery failed, using fallback");
                }
            }
        }
        self.fallback.request(kind, payload).await
    }

    /// Deliver one command.
    pub async fn send_command(&self, command: &QueuedCommand) -> Result<Value, RpcError> {
        let body = CommandBody::encode(&command.id, &command.scope_id, &command.payload);
        self.request(RequestKind::Command, body).await
    }

    pub async fn query(&self, payload: Value) -> Result<Value, RpcError> {
        self.request(RequestKind::Query, payload).await
    }
}

impl CommandExecutor for Delivery {
    fn execute(&self, command: &QueuedCommand) -> ExecuteFuture<'_> {
        let command = command.clone();
        Box::pin(async move { self.send_command(&command).await })
    }

    fn is_available(&self) -> bool {
        self.rpc.is_connected() || self.fallback.is_available()
    }
}

/// Loads cache keys with a `query` request of `{"key": key}`.
///
/// An array response becomes a collection; anything else a detail value.
pub struct RpcFetcher {
    delivery: Delivery,
}

impl RpcFetcher {
    pub fn new(delivery: Delivery) -> Self {
        RpcFetcher { delivery }
    }
}

impl Fetcher for RpcFetcher {
    fn fetch(&self, key: &str) -> FetchFuture<'_> {
        let payload = serde_json::json!({ "key": key });
        Box::pin(async move {
            match self.delivery.query(payload).await {
                Ok(Value::Array(items)) => Ok(CacheValue::Collection(items)),
                Ok(value) => Ok(CacheValue::Detail(value)),
                Err(e) => Err(e.to_string()),
            }
        })
    }
}

/// Entry point for issuing commands.
#[derive(Clone)]
pub struct Gateway {
    delivery: Delivery,
    sync: SyncManager,
    connectivity: ConnectivityMonitor,
}

impl Gateway {
    pub fn new(delivery: Delivery, sync: SyncManager, connectivity: ConnectivityMonitor) -> Self {
        Gateway {
            delivery,
            sync,
            connectivity,
        }
    }

    pub fn delivery(&self) -> &Delivery {
        &self.delivery
    }

    /// Issue a command under a fresh id.
    pub async fn execute(&self, scope_id: &str, payload: Value) -> Result<Outcome, SubmitError> {
        self.execute_with_id(Uuid::new_v4(), scope_id, payload).await
    }

    /// Issue a command under a caller-assigned id.
    ///
    /// Queued without a delivery attempt while offline or while older
    /// commands are still queued, so delivery order matches issue order.
    pub async fn execute_with_id(
        &self,
        id: Uuid,
        scope_id: &str,
        payload: Value,
    ) -> Result<Outcome, SubmitError> {
        if !self.connectivity.is_online() {
            return self.queue(id, scope_id, payload, "offline");
        }
        if self.sync.state().pending_count > 0 {
            let outcome = self.queue(id, scope_id, payload, "backlog pending");
            self.sync.request_sync();
            return outcome;
        }

        let command = QueuedCommand::new(id, scope_id, payload);
        match self.delivery.send_command(&command).await {
            Ok(value) => {
                tracing::debug!(%id, "command acknowledged");
                Ok(Outcome::Acknowledged(value))
            }
            Err(RpcError::Rejected(reason)) => {
                tracing::info!(%id, %reason, "command rejected");
                Err(SubmitError::Rejected(reason))
            }
            Err(e) => {
                let reason = e.to_string();
                self.queue(id, scope_id, command.payload, &reason)
            }
        }
    }

    /// Issue a command with a tentative cache edit that is undone on rejection.
    ///
    /// The edit is kept when the command is acknowledged or queued.
    pub async fn execute_optimistic(
        &self,
        cache: &Cache,
        key: &str,
        mutate: impl FnOnce(&mut CacheValue),
        scope_id: &str,
        payload: Value,
    ) -> Result<Outcome, SubmitError> {
        let tentative = cache.optimistic(key, mutate);
        let result = self.execute(scope_id, payload).await;
        if let Some(tentative) = tentative {
            match &result {
                Ok(_) => tentative.commit(),
                Err(_) => tentative.rollback(),
            }
        }
        result
    }

    pub async fn query(&self, payload: Value) -> Result<Value, RpcError> {
        self.delivery.query(payload).await
    }

    fn queue(
        &self,
        id: Uuid,
        scope_id: &str,
        payload: Value,
        reason: &str,
    ) -> Result<Outcome, SubmitError> {
        let queued = self.sync.enqueue_command(id, scope_id, payload)?;
        tracing::info!(%id, %reason, "command queued for later delivery");
        Ok(Outcome::QueuedOffline(queued))
    }
}

#[cfg(test)]
#[path = "gateway_tests.rs"]
mod tests;
