// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Draining the durable command queue.
//!
//! [`SyncManager`] decides when queued commands are replayed and publishes
//! drain progress as a [`SyncState`]. A drain runs when connectivity comes
//! back (after a short settle delay), when the transport connects, at
//! initialization if already online, or on demand through [`SyncManager::sync`].
//!
//! Commands are delivered strictly oldest-first. A delivered command is
//! removed; a command the server rejects is removed and reported through
//! [`SyncManager::on_rejection`]; a transport failure stops the drain and
//! leaves the remaining commands queued.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use tether_core::{CommandQueue, QueuedCommand};

use crate::connectivity::ConnectivityMonitor;
use crate::observer::{ObservedState, ObserverRegistry, Subscription};
use crate::rpc::{ConnectionState, RpcClient, RpcError};

/// Default settle delay between coming online and draining.
pub const DEFAULT_ONLINE_SYNC_DELAY: Duration = Duration::from_millis(500);

/// Boxed future returned by [`CommandExecutor::execute`].
pub type ExecuteFuture<'a> = Pin<Box<dyn Future<Output = Result<Value, RpcError>> + Send + 'a>>;

/// Delivers one queued command to the server.
pub trait CommandExecutor: Send + Sync {
    /// Deliver `command`. [`RpcError::Rejected`] means the server refused it;
    /// every other error is a delivery failure.
    fn execute(&self, command: &QueuedCommand) -> ExecuteFuture<'_>;

    /// Whether a delivery path is currently usable. Checked before each entry.
    fn is_available(&self) -> bool;
}

/// Drain status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncStatus {
    Idle,
    Syncing,
    Error(String),
}

/// Observable drain progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncState {
    pub status: SyncStatus,
    /// Number of commands still in the durable queue.
    pub pending_count: u32,
}

impl SyncState {
    pub fn is_syncing(&self) -> bool {
        self.status == SyncStatus::Syncing
    }
}

impl Default for SyncState {
    fn default() -> Self {
        SyncState {
            status: SyncStatus::Idle,
            pending_count: 0,
        }
    }
}

/// A queued command the server refused during a background drain.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub command: QueuedCommand,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Uninitialized,
    Offline,
    AlreadySyncing,
}

/// Result of one call to [`SyncManager::sync`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    Skipped(SkipReason),
    Completed {
        delivered: usize,
        rejected: usize,
    },
    /// Stopped early; the rest of the queue is kept.
    Interrupted {
        delivered: usize,
        rejected: usize,
        reason: String,
    },
}

struct SyncInner {
    queue: CommandQueue,
    connectivity: ConnectivityMonitor,
    online_sync_delay: Duration,
    executor: Mutex<Option<Arc<dyn CommandExecutor>>>,
    runtime: Mutex<Option<Handle>>,
    state: ObservedState<SyncState>,
    rejections: ObserverRegistry<Rejection>,
    syncing: AtomicBool,
    /// A sync was requested while a drain was running.
    rerun: AtomicBool,
    listening: AtomicBool,
    triggers: Mutex<Vec<Subscription>>,
    cancel: Mutex<CancellationToken>,
}

impl SyncInner {
    /// Apply `update` to the state and notify observers if it changed.
    fn publish(&self, update: impl FnOnce(&mut SyncState)) {
        self.state.update(update);
    }

    fn refresh_pending_count(&self) -> tether_core::Result<u32> {
        let count = self.queue.count()?;
        self.publish(|s| s.pending_count = count);
        Ok(count)
    }

    /// Run a drain on the runtime after `delay`.
    fn schedule(self: &Arc<Self>, delay: Duration, trigger: &'static str) {
        let Some(runtime) = self.runtime.lock().clone() else {
            tracing::debug!(trigger, "no runtime bound, sync not scheduled");
            return;
        };
        let cancel = self.cancel.lock().clone();
        let manager = SyncManager {
            inner: Arc::clone(self),
        };
        runtime.spawn(async move {
            if !delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            if cancel.is_cancelled() {
                return;
            }
            let outcome = manager.sync().await;
            tracing::debug!(trigger, ?outcome, "scheduled sync finished");
        });
    }
}

#[derive(Default)]
struct Tally {
    delivered: usize,
    rejected: usize,
}

/// Publishes a terminal state if a drain is dropped mid-flight.
struct DrainGuard<'a> {
    inner: &'a SyncInner,
    armed: bool,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.inner.syncing.store(false, Ordering::SeqCst);
        let count = self.inner.queue.count().ok();
        self.inner.publish(|s| {
            if let Some(count) = count {
                s.pending_count = count;
            }
            s.status = if s.pending_count > 0 {
                SyncStatus::Error("sync cancelled".to_string())
            } else {
                SyncStatus::Idle
            };
        });
    }
}

/// Coordinates draining of the command queue. Cheap to clone.
#[derive(Clone)]
pub struct SyncManager {
    inner: Arc<SyncInner>,
}

impl SyncManager {
    pub fn new(queue: CommandQueue, connectivity: ConnectivityMonitor, online_sync_delay: Duration) -> Self {
        let pending_count = match queue.count() {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(error = %e, "could not count queued commands");
                0
            }
        };
        SyncManager {
            inner: Arc::new(SyncInner {
                queue,
                connectivity,
                online_sync_delay,
                executor: Mutex::new(None),
                runtime: Mutex::new(None),
                state: ObservedState::new(SyncState {
                    status: SyncStatus::Idle,
                    pending_count,
                }),
                rejections: ObserverRegistry::new(),
                syncing: AtomicBool::new(false),
                rerun: AtomicBool::new(false),
                listening: AtomicBool::new(false),
                triggers: Mutex::new(Vec::new()),
                cancel: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    /// Bind the delivery path and start listening for sync triggers.
    ///
    /// Calling this again replaces the executor; trigger listeners are only
    /// registered the first time. Schedules a drain right away when online.
    pub fn initialize(&self, executor: Arc<dyn CommandExecutor>, rpc: Option<&RpcClient>) {
        *self.inner.executor.lock() = Some(executor);
        if let Ok(handle) = Handle::try_current() {
            *self.inner.runtime.lock() = Some(handle);
        }

        if !self.inner.listening.swap(true, Ordering::SeqCst) {
            let mut triggers = self.inner.triggers.lock();
            triggers.push(self.watch_connectivity());
            if let Some(rpc) = rpc {
                triggers.push(self.watch_connection(rpc));
            }
        }

        if let Err(e) = self.inner.refresh_pending_count() {
            tracing::warn!(error = %e, "could not count queued commands");
        }
        if self.inner.connectivity.is_online() {
            self.inner.schedule(Duration::ZERO, "initialize");
        }
    }

    fn watch_connectivity(&self) -> Subscription {
        let weak: Weak<SyncInner> = Arc::downgrade(&self.inner);
        let was_online = AtomicBool::new(self.inner.connectivity.is_online());
        self.inner.connectivity.subscribe(move |status| {
            let before = was_online.swap(status.is_online, Ordering::SeqCst);
            if status.is_online && !before {
                if let Some(inner) = weak.upgrade() {
                    inner.schedule(inner.online_sync_delay, "online");
                }
            }
        })
    }

    fn watch_connection(&self, rpc: &RpcClient) -> Subscription {
        let weak: Weak<SyncInner> = Arc::downgrade(&self.inner);
        let was_connected = AtomicBool::new(rpc.is_connected());
        rpc.on_state_change(move |state| {
            let connected = *state == ConnectionState::Connected;
            let before = was_connected.swap(connected, Ordering::SeqCst);
            if connected && !before {
                if let Some(inner) = weak.upgrade() {
                    inner.schedule(Duration::ZERO, "connected");
                }
            }
        })
    }

    pub fn state(&self) -> SyncState {
        self.inner.state.get()
    }

    /// Observe state changes. The listener is also invoked immediately with
    /// the current state.
    pub fn subscribe(&self, listener: impl Fn(&SyncState) + Send + Sync + 'static) -> Subscription {
        self.inner.state.subscribe_current(listener)
    }

    /// Observe commands rejected during a drain.
    pub fn on_rejection(&self, listener: impl Fn(&Rejection) + Send + Sync + 'static) -> Subscription {
        self.inner.rejections.subscribe(listener)
    }

    /// Persist a command and update the pending count.
    pub fn enqueue(&self, scope_id: &str, payload: Value) -> tether_core::Result<QueuedCommand> {
        let command = self.inner.queue.enqueue(scope_id, payload)?;
        self.inner.refresh_pending_count()?;
        Ok(command)
    }

    /// Persist a command under a caller-assigned id. Idempotent on `id`.
    pub fn enqueue_command(
        &self,
        id: Uuid,
        scope_id: &str,
        payload: Value,
    ) -> tether_core::Result<QueuedCommand> {
        let command = self.inner.queue.enqueue_with_id(id, scope_id, payload)?;
        self.inner.refresh_pending_count()?;
        Ok(command)
    }

    /// Re-read the queue size and publish it.
    pub fn refresh_pending_count(&self) -> tether_core::Result<u32> {
        self.inner.refresh_pending_count()
    }

    /// Schedule a drain on the bound runtime without waiting for it.
    pub fn request_sync(&self) {
        self.inner.schedule(Duration::ZERO, "request");
    }

    /// Drain the queue now.
    ///
    /// Does nothing when uninitialized, offline, or already draining. A call
    /// made while another drain runs makes that drain take one more pass.
    pub async fn sync(&self) -> DrainOutcome {
        let Some(executor) = self.inner.executor.lock().clone() else {
            return DrainOutcome::Skipped(SkipReason::Uninitialized);
        };
        if !self.inner.connectivity.is_online() {
            return DrainOutcome::Skipped(SkipReason::Offline);
        }
        if self.inner.syncing.swap(true, Ordering::SeqCst) {
            self.inner.rerun.store(true, Ordering::SeqCst);
            return DrainOutcome::Skipped(SkipReason::AlreadySyncing);
        }
        self.inner.rerun.store(false, Ordering::SeqCst);

        let mut guard = DrainGuard {
            inner: &self.inner,
            armed: true,
        };
        self.inner.publish(|s| s.status = SyncStatus::Syncing);
        tracing::debug!(pending = self.state().pending_count, "drain started");

        let mut tally = Tally::default();
        let interrupted = loop {
            if let Err(reason) = self.drain(executor.as_ref(), &mut tally).await {
                break Some(reason);
            }
            if !self.inner.rerun.swap(false, Ordering::SeqCst) {
                break None;
            }
            tracing::debug!("sync requested mid-drain, taking another pass");
        };
        guard.armed = false;

        // Clear the guard before publishing so a listener may start the next drain
        self.inner.syncing.store(false, Ordering::SeqCst);
        let count = match self.inner.queue.count() {
            Ok(count) => Some(count),
            Err(e) => {
                tracing::warn!(error = %e, "could not count queued commands");
                None
            }
        };
        self.inner.publish(|s| {
            if let Some(count) = count {
                s.pending_count = count;
            }
            s.status = match &interrupted {
                Some(reason) if s.pending_count > 0 => SyncStatus::Error(reason.clone()),
                _ => SyncStatus::Idle,
            };
        });

        match interrupted {
            Some(reason) => {
                tracing::warn!(%reason, delivered = tally.delivered, "drain interrupted");
                // A retry would hit the same failure; wait for the next trigger
                self.inner.rerun.store(false, Ordering::SeqCst);
                DrainOutcome::Interrupted {
                    delivered: tally.delivered,
                    rejected: tally.rejected,
                    reason,
                }
            }
            None => {
                tracing::info!(delivered = tally.delivered, rejected = tally.rejected, "drain complete");
                // Requested after the last pass but before the guard was released
                if self.inner.rerun.swap(false, Ordering::SeqCst) {
                    self.inner.schedule(Duration::ZERO, "rerun");
                }
                DrainOutcome::Completed {
                    delivered: tally.delivered,
                    rejected: tally.rejected,
                }
            }
        }
    }

    /// Deliver everything queued, oldest first. The queue is listed once per
    /// batch and listed again when the batch is used up, so commands queued
    /// mid-drain are picked up.
    async fn drain(&self, executor: &dyn CommandExecutor, tally: &mut Tally) -> Result<(), String> {
        loop {
            let batch = self.inner.queue.list_pending().map_err(|e| e.to_string())?;
            if batch.is_empty() {
                return Ok(());
            }

            for command in batch {
                if !self.inner.connectivity.is_online() {
                    return Err("went offline".to_string());
                }
                if !executor.is_available() {
                    return Err("transport unavailable".to_string());
                }

                match executor.execute(&command).await {
                    Ok(_) => {
                        tracing::debug!(id = %command.id, "command delivered");
                        tally.delivered += 1;
                    }
                    Err(RpcError::Rejected(reason)) => {
                        tracing::warn!(id = %command.id, %reason, "queued command rejected by server");
                        tally.rejected += 1;
                        self.inner.rejections.notify(&Rejection {
                            command: command.clone(),
                            reason,
                        });
                    }
                    Err(e) => return Err(e.to_string()),
                }

                self.inner
                    .queue
                    .remove(command.id)
                    .and_then(|()| self.inner.refresh_pending_count().map(|_| ()))
                    .map_err(|e| e.to_string())?;
            }
        }
    }

    /// Stop listening for triggers and cancel scheduled drains.
    pub fn shutdown(&self) {
        self.inner.triggers.lock().clear();
        let mut cancel = self.inner.cancel.lock();
        cancel.cancel();
        *cancel = CancellationToken::new();
        self.inner.listening.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
#[path = "sync_tests.rs"]
mod tests;
