// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Network reachability reporting.
//!
//! The monitor only reports state. Deciding whether to reconnect or sync is
//! left to whoever subscribes.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::observer::{ObservedState, Subscription};

/// Coarse link quality hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkQuality {
    Poor,
    Moderate,
    Good,
}

/// Reachability as last reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkStatus {
    pub is_online: bool,
    pub link_quality: Option<LinkQuality>,
}

impl NetworkStatus {
    pub fn online() -> Self {
        NetworkStatus {
            is_online: true,
            link_quality: None,
        }
    }

    pub fn offline() -> Self {
        NetworkStatus {
            is_online: false,
            link_quality: None,
        }
    }
}

/// Publishes network status changes to subscribers.
///
/// Subscribers are only notified when the status actually changes.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    status: ObservedState<NetworkStatus>,
}

impl ConnectivityMonitor {
    pub fn new(initial: NetworkStatus) -> Self {
        ConnectivityMonitor {
            status: ObservedState::new(initial),
        }
    }

    /// Current status.
    pub fn status(&self) -> NetworkStatus {
        self.status.get()
    }

    pub fn is_online(&self) -> bool {
        self.status().is_online
    }

    /// Record a new status. Returns true when it differs from the last one.
    pub fn report(&self, status: NetworkStatus) -> bool {
        let changed = self.status.set(status);
        if changed {
            tracing::debug!(online = status.is_online, quality = ?status.link_quality, "network status changed");
        }
        changed
    }

    /// Platform online/offline signal. Going offline clears the quality hint.
    pub fn set_online(&self, is_online: bool) -> bool {
        let link_quality = if is_online {
            self.status().link_quality
        } else {
            None
        };
        self.report(NetworkStatus {
            is_online,
            link_quality,
        })
    }

    /// Platform link-quality signal.
    pub fn set_link_quality(&self, link_quality: Option<LinkQuality>) -> bool {
        let is_online = self.status().is_online;
        self.report(NetworkStatus {
            is_online,
            link_quality,
        })
    }

    pub fn subscribe(&self, listener: impl Fn(&NetworkStatus) + Send + Sync + 'static) -> Subscription {
        self.status.subscribe(listener)
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(NetworkStatus::online())
    }
}

/// Periodic TCP reachability check for hosts without platform network events.
#[derive(Debug, Clone)]
pub struct ReachabilityProbe {
    target: String,
    interval: Duration,
    timeout: Duration,
}

impl ReachabilityProbe {
    /// Probe `target` (`host:port`) every `interval`.
    pub fn new(target: impl Into<String>, interval: Duration, timeout: Duration) -> Self {
        ReachabilityProbe {
            target: target.into(),
            interval,
            timeout,
        }
    }

    /// Build a probe for the host of a `ws://` or `wss://` URL.
    pub fn for_url(url: &str, interval: Duration, timeout: Duration) -> Option<Self> {
        let parsed = url::Url::parse(url).ok()?;
        let host = parsed.host_str()?;
        let port = parsed.port_or_known_default()?;
        Some(Self::new(format!("{host}:{port}"), interval, timeout))
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Try once to open a TCP connection to the target.
    pub async fn check(&self) -> bool {
        matches!(
            tokio::time::timeout(self.timeout, TcpStream::connect(&self.target)).await,
            Ok(Ok(_))
        )
    }

    /// Report probe results to `monitor` until `cancel` fires.
    pub fn spawn(self, monitor: ConnectivityMonitor, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let reachable = self.check().await;
                monitor.set_online(reachable);

                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(self.interval) => {}
                }
            }
        })
    }
}

#[cfg(test)]
#[path = "connectivity_tests.rs"]
mod tests;
