// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Request/response correlation over a single socket.
//!
//! [`RpcClient`] owns one [`Transport`] inside a background driver task. The
//! driver connects whenever a scope is set, reconnects after a fixed backoff
//! when the connection drops, and writes outbound frames. Callers issue
//! requests with [`RpcClient::send_request`]; the matching response is found
//! by correlation id. Every inbound frame, response or event, is also
//! broadcast to event subscribers.
//!
//! ```text
//!  send_request ──► PendingTable ──► outbound ──► driver ──► Transport
//!       ▲                                            │
//!       └──────── settle ◄── dispatch ◄──────────────┘──► event observers
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use tether_core::protocol::{ClientFrame, RequestKind, ServerFrame};

use crate::connectivity::ConnectivityMonitor;
use crate::observer::{ObserverRegistry, Subscription};
use crate::pending::{CallState, PendingTable, Settlement};
use crate::transport::Transport;

/// Error type for correlated requests.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    /// The socket is not connected; the request was never written.
    #[error("not connected to remote server")]
    NotConnected,

    /// No response arrived in time.
    #[error("request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The connection failed while the request was in flight.
    #[error("transport error: {0}")]
    Transport(String),

    /// The server answered and refused the request.
    #[error("rejected by server: {0}")]
    Rejected(String),

    #[error("correlation id already in flight: {0}")]
    DuplicateCorrelation(String),
}

impl RpcError {
    /// True for failures of the delivery path rather than of the request itself.
    ///
    /// Transport failures may be retried or queued; rejections may not.
    pub fn is_transport(&self) -> bool {
        !matches!(self, RpcError::Rejected(_))
    }
}

/// State of the physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Timing and endpoint settings for the socket.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Base WebSocket URL; `scope` and `token` are appended as query parameters.
    pub url: String,
    pub request_timeout: Duration,
    /// Time allowed for one connection attempt.
    pub connect_timeout: Duration,
    /// Fixed delay before retrying a failed or dropped connection.
    pub reconnect_delay: Duration,
    /// Liveness probe interval. `None` disables the heartbeat.
    pub heartbeat_interval: Option<Duration>,
    pub heartbeat_timeout: Duration,
    /// Minimum background time after which foregrounding forces a reconnect.
    pub foreground_reconnect_after: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            url: "ws://localhost:7890".to_string(),
            request_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(3),
            heartbeat_interval: Some(Duration::from_secs(30)),
            heartbeat_timeout: Duration::from_secs(10),
            foreground_reconnect_after: Duration::ZERO,
        }
    }
}

/// Source of the credential presented when connecting.
///
/// Called before every connection attempt. `None` means unauthenticated.
pub trait TokenProvider: Send + Sync {
    fn get_token(&self) -> Pin<Box<dyn Future<Output = Option<String>> + Send + '_>>;
}

/// Provider for unauthenticated connections.
pub struct NoToken;

impl TokenProvider for NoToken {
    fn get_token(&self) -> Pin<Box<dyn Future<Output = Option<String>> + Send + '_>> {
        Box::pin(async { None })
    }
}

/// Provider returning a fixed token.
pub struct StaticToken(pub String);

impl TokenProvider for StaticToken {
    fn get_token(&self) -> Pin<Box<dyn Future<Output = Option<String>> + Send + '_>> {
        let token = self.0.clone();
        Box::pin(async move { Some(token) })
    }
}

/// Messages from the public handle to the driver task.
#[derive(Debug)]
enum Control {
    Scope(Option<String>),
    /// Connect now instead of waiting out the backoff. `force` also tears
    /// down a connection that looks healthy.
    Reconnect { force: bool },
    /// The heartbeat of the given session failed.
    Dead { session: u64, reason: String },
}

/// How a connection attempt ended.
enum Attempt {
    Connected,
    Failed(String),
    /// Abandoned for a reconnect request or scope change; try again now.
    Restart,
    Shutdown,
}

/// Why a connected session ended.
enum SessionEnd {
    Shutdown,
    /// Reconnect immediately (scope change or forced reconnect).
    Immediate,
    /// Connection lost; reconnect after backoff.
    Lost(String),
}

struct RpcInner {
    config: TransportConfig,
    state: watch::Sender<ConnectionState>,
    state_observers: ObserverRegistry<ConnectionState>,
    events: ObserverRegistry<ServerFrame>,
    pending: Mutex<PendingTable>,
    outbound: Mutex<Option<mpsc::UnboundedSender<ClientFrame>>>,
    control: mpsc::UnboundedSender<Control>,
    scope: Mutex<Option<String>>,
    sequence: AtomicU64,
    shutdown: CancellationToken,
}

impl RpcInner {
    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            tracing::debug!(state = ?next, "connection state changed");
            self.state_observers.notify(&next);
        }
    }

    fn next_correlation_id(&self) -> String {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let random = Uuid::new_v4().simple().to_string();
        format!("{millis}-{seq}-{}", &random[..8])
    }

    fn dispatch(&self, frame: ServerFrame) {
        if let ServerFrame::Response(response) = &frame {
            let correlation_id = response.correlation_id.clone();
            match self.pending.lock().settle(response.clone()) {
                Settlement::Delivered(_) => {}
                Settlement::Unmatched(previous) => {
                    tracing::debug!(%correlation_id, ?previous, "dropping unmatched response");
                }
            }
        }
        self.events.notify(&frame);
    }
}

/// Removes the call from the pending table if the caller stops waiting.
struct PendingGuard<'a> {
    inner: &'a RpcInner,
    correlation_id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.inner.pending.lock().cancel(&self.correlation_id);
    }
}

/// Handle to the correlated socket. Cheap to clone.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<RpcInner>,
}

impl RpcClient {
    /// Start the driver task for `transport`. Must be called within a Tokio runtime.
    ///
    /// The client stays disconnected until a scope is set.
    pub fn spawn<T>(transport: T, config: TransportConfig, tokens: Arc<dyn TokenProvider>) -> Self
    where
        T: Transport + 'static,
    {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        let inner = Arc::new(RpcInner {
            config,
            state,
            state_observers: ObserverRegistry::new(),
            events: ObserverRegistry::new(),
            pending: Mutex::new(PendingTable::default()),
            outbound: Mutex::new(None),
            control: control_tx,
            scope: Mutex::new(None),
            sequence: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(drive(transport, Arc::clone(&inner), control_rx, tokens));
        RpcClient { inner }
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// Receiver that observes every connection state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Wait until the connection reaches `target`.
    pub async fn wait_for_state(&self, target: ConnectionState) {
        let mut rx = self.watch_state();
        let _ = rx.wait_for(|s| *s == target).await;
    }

    pub fn on_state_change(
        &self,
        listener: impl Fn(&ConnectionState) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.state_observers.subscribe(listener)
    }

    /// Receive every inbound frame, responses included.
    pub fn subscribe_events(
        &self,
        listener: impl Fn(&ServerFrame) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.events.subscribe(listener)
    }

    pub fn scope(&self) -> Option<String> {
        self.inner.scope.lock().clone()
    }

    /// Point the connection at a scope. `None` disconnects and stops reconnecting.
    pub fn set_scope(&self, scope: Option<String>) {
        {
            let mut current = self.inner.scope.lock();
            if *current == scope {
                return;
            }
            current.clone_from(&scope);
        }
        tracing::info!(scope = ?scope, "scope changed");
        let _ = self.inner.control.send(Control::Scope(scope));
    }

    /// The network came back: skip any remaining backoff.
    pub fn network_online(&self) {
        let _ = self.inner.control.send(Control::Reconnect { force: false });
    }

    /// The application returned to the foreground after `hidden_for`.
    ///
    /// A socket can look open while being dead after a long suspension, so
    /// the connection is torn down and reopened regardless of its state.
    /// Returns whether a reconnect was requested.
    pub fn foregrounded(&self, hidden_for: Duration) -> bool {
        if hidden_for < self.inner.config.foreground_reconnect_after {
            return false;
        }
        tracing::info!(hidden_ms = hidden_for.as_millis() as u64, "foregrounded, forcing reconnect");
        let _ = self.inner.control.send(Control::Reconnect { force: true });
        true
    }

    /// Ask the driver to reconnect whenever connectivity goes from offline to online.
    pub fn follow_connectivity(&self, monitor: &ConnectivityMonitor) -> Subscription {
        let weak = Arc::downgrade(&self.inner);
        let was_online = std::sync::atomic::AtomicBool::new(monitor.is_online());
        monitor.subscribe(move |status| {
            let before = was_online.swap(status.is_online, Ordering::SeqCst);
            if status.is_online && !before {
                if let Some(inner) = weak.upgrade() {
                    let _ = inner.control.send(Control::Reconnect { force: false });
                }
            }
        })
    }

    /// Issue a request and wait for its response.
    ///
    /// Fails immediately with [`RpcError::NotConnected`] unless connected, and
    /// with [`RpcError::Timeout`] when no response arrives within the
    /// configured request timeout.
    pub async fn send_request(&self, kind: RequestKind, payload: Value) -> Result<Value, RpcError> {
        self.request_with_timeout(kind, payload, self.inner.config.request_timeout)
            .await
    }

    async fn request_with_timeout(
        &self,
        kind: RequestKind,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        if !self.is_connected() {
            return Err(RpcError::NotConnected);
        }

        let (correlation_id, rx) = {
            let mut pending = self.inner.pending.lock();
            let mut id = self.inner.next_correlation_id();
            while pending.contains(&id) {
                id = self.inner.next_correlation_id();
            }
            let rx = pending.register(&id, kind)?;
            (id, rx)
        };
        let _guard = PendingGuard {
            inner: &self.inner,
            correlation_id: correlation_id.clone(),
        };

        let frame = ClientFrame::new(correlation_id.clone(), kind, payload);
        let queued = self
            .inner
            .outbound
            .lock()
            .as_ref()
            .is_some_and(|tx| tx.send(frame).is_ok());
        if !queued {
            return Err(RpcError::NotConnected);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RpcError::Transport("call dropped by driver".to_string())),
            Err(_) => {
                self.inner.pending.lock().time_out(&correlation_id);
                tracing::debug!(%correlation_id, %kind, "request timed out");
                Err(RpcError::Timeout(timeout))
            }
        }
    }

    /// Send a command.
    pub async fn command(&self, payload: Value) -> Result<Value, RpcError> {
        self.send_request(RequestKind::Command, payload).await
    }

    /// Send a query.
    pub async fn query(&self, payload: Value) -> Result<Value, RpcError> {
        self.send_request(RequestKind::Query, payload).await
    }

    /// Server wall clock in milliseconds since the Unix epoch.
    pub async fn server_timestamp(&self) -> Result<i64, RpcError> {
        let value = self
            .send_request(RequestKind::ServerTimestamp, Value::Null)
            .await?;
        value
            .as_i64()
            .ok_or_else(|| RpcError::Transport(format!("malformed server timestamp: {value}")))
    }

    /// State of a call by correlation id, if still known.
    pub fn call_state(&self, correlation_id: &str) -> Option<CallState> {
        self.inner.pending.lock().state(correlation_id)
    }

    /// Number of requests awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Stop the driver and close the connection.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

/// Build the connection URL for a scope.
pub fn connection_url(base: &str, scope: &str, token: Option<&str>) -> Result<String, url::ParseError> {
    let mut url = url::Url::parse(base)?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("scope", scope);
        if let Some(token) = token {
            query.append_pair("token", token);
        }
    }
    Ok(url.into())
}

/// Driver task: owns the transport for the lifetime of the client.
async fn drive<T: Transport>(
    mut transport: T,
    inner: Arc<RpcInner>,
    mut control: mpsc::UnboundedReceiver<Control>,
    tokens: Arc<dyn TokenProvider>,
) {
    let mut scope: Option<String> = None;
    let mut session: u64 = 0;

    loop {
        // No scope means no reason to be connected
        let Some(current) = scope.clone() else {
            tokio::select! {
                _ = inner.shutdown.cancelled() => break,
                ctrl = control.recv() => match ctrl {
                    Some(Control::Scope(next)) => scope = next,
                    Some(_) => {}
                    None => break,
                },
            }
            continue;
        };

        inner.set_state(ConnectionState::Connecting);
        let token = tokens.get_token().await;
        let attempt = match connection_url(&inner.config.url, &current, token.as_deref()) {
            Ok(url) => connect(&mut transport, &inner, &mut control, &mut scope, &url).await,
            Err(e) => Attempt::Failed(format!("invalid url '{}': {e}", inner.config.url)),
        };

        match attempt {
            Attempt::Connected => {}
            Attempt::Shutdown => break,
            Attempt::Restart => {
                tracing::debug!(scope = %current, "connection attempt abandoned");
                let _ = transport.disconnect().await;
                if scope.is_none() {
                    inner.set_state(ConnectionState::Disconnected);
                }
                continue;
            }
            Attempt::Failed(reason) => {
                tracing::warn!(scope = %current, %reason, "connection attempt failed");
                let _ = transport.disconnect().await;
                inner.set_state(ConnectionState::Disconnected);
                if !backoff(&inner, &mut control, &mut scope).await {
                    break;
                }
                continue;
            }
        }

        session += 1;
        let (tx, mut rx) = mpsc::unbounded_channel();
        *inner.outbound.lock() = Some(tx);
        inner.set_state(ConnectionState::Connected);
        tracing::info!(scope = %current, session, "connected");

        let heartbeat = inner
            .config
            .heartbeat_interval
            .map(|interval| tokio::spawn(heartbeat(Arc::clone(&inner), session, interval)));

        let end = run_session(&mut transport, &inner, &mut rx, &mut control, &mut scope, session).await;

        if let Some(handle) = heartbeat {
            handle.abort();
        }
        // Outbound first: a racing send_request then sees NotConnected
        *inner.outbound.lock() = None;
        let _ = transport.disconnect().await;
        let aborted = inner.pending.lock().abort_all("connection closed");
        inner.set_state(ConnectionState::Disconnected);

        match end {
            SessionEnd::Shutdown => break,
            SessionEnd::Immediate => {
                tracing::debug!(session, aborted, "session closed for reconnect");
            }
            SessionEnd::Lost(reason) => {
                tracing::warn!(session, aborted, %reason, "connection lost");
                if !backoff(&inner, &mut control, &mut scope).await {
                    break;
                }
            }
        }
    }

    *inner.outbound.lock() = None;
    inner.pending.lock().abort_all("client shut down");
    let _ = transport.disconnect().await;
    inner.set_state(ConnectionState::Disconnected);
    tracing::debug!("rpc driver stopped");
}

/// One connection attempt, bounded by the connect timeout.
///
/// Reconnect requests and scope changes abandon the attempt. Reconnect
/// requests still queued once the socket is open are dropped, since the new
/// session already satisfies them.
async fn connect<T: Transport>(
    transport: &mut T,
    inner: &RpcInner,
    control: &mut mpsc::UnboundedReceiver<Control>,
    scope: &mut Option<String>,
    url: &str,
) -> Attempt {
    let timeout = inner.config.connect_timeout;
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    let connecting = transport.connect(url);
    tokio::pin!(connecting);

    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => return Attempt::Shutdown,
            result = &mut connecting => match result {
                Ok(()) => break,
                Err(e) => return Attempt::Failed(e.to_string()),
            },
            _ = &mut deadline => {
                return Attempt::Failed(format!("connect timed out after {}ms", timeout.as_millis()));
            }
            ctrl = control.recv() => match ctrl {
                None => return Attempt::Shutdown,
                Some(Control::Scope(next)) => {
                    if next != *scope {
                        *scope = next;
                        return Attempt::Restart;
                    }
                }
                Some(Control::Reconnect { .. }) => return Attempt::Restart,
                Some(Control::Dead { .. }) => {}
            },
        }
    }

    // Anything else queued so far targets an earlier session
    let mut restart = false;
    while let Ok(ctrl) = control.try_recv() {
        if let Control::Scope(next) = ctrl {
            if next != *scope {
                *scope = next;
                restart = true;
            }
        }
    }
    if restart {
        Attempt::Restart
    } else {
        Attempt::Connected
    }
}

async fn run_session<T: Transport>(
    transport: &mut T,
    inner: &RpcInner,
    outbound: &mut mpsc::UnboundedReceiver<ClientFrame>,
    control: &mut mpsc::UnboundedReceiver<Control>,
    scope: &mut Option<String>,
    session: u64,
) -> SessionEnd {
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => return SessionEnd::Shutdown,

            ctrl = control.recv() => match ctrl {
                None => return SessionEnd::Shutdown,
                Some(Control::Scope(next)) => {
                    if next != *scope {
                        *scope = next;
                        return SessionEnd::Immediate;
                    }
                }
                Some(Control::Reconnect { force: true }) => return SessionEnd::Immediate,
                Some(Control::Reconnect { force: false }) => {}
                Some(Control::Dead { session: dead, reason }) => {
                    if dead == session {
                        return SessionEnd::Lost(reason);
                    }
                }
            },

            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    return SessionEnd::Lost("outbound channel closed".to_string());
                };
                if let Err(e) = transport.send(frame).await {
                    return SessionEnd::Lost(e.to_string());
                }
            }

            received = transport.recv() => match received {
                Ok(Some(frame)) => inner.dispatch(frame),
                Ok(None) => return SessionEnd::Lost("closed by server".to_string()),
                Err(e) => return SessionEnd::Lost(e.to_string()),
            },
        }
    }
}

/// Wait out the reconnect delay. Returns false when the client shuts down.
///
/// Returns early on a reconnect trigger or a scope change.
async fn backoff(
    inner: &RpcInner,
    control: &mut mpsc::UnboundedReceiver<Control>,
    scope: &mut Option<String>,
) -> bool {
    let sleep = tokio::time::sleep(inner.config.reconnect_delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => return false,
            _ = &mut sleep => return true,
            ctrl = control.recv() => match ctrl {
                None => return false,
                Some(Control::Scope(next)) => {
                    if next != *scope {
                        *scope = next;
                        return true;
                    }
                }
                Some(Control::Reconnect { .. }) => return true,
                Some(Control::Dead { .. }) => {}
            },
        }
    }
}

/// Periodically prove the connection is alive with a timestamp request.
async fn heartbeat(inner: Arc<RpcInner>, session: u64, interval: Duration) {
    let client = RpcClient {
        inner: Arc::clone(&inner),
    };
    loop {
        tokio::time::sleep(interval).await;
        let result = client
            .request_with_timeout(
                RequestKind::ServerTimestamp,
                Value::Null,
                inner.config.heartbeat_timeout,
            )
            .await;
        match result {
            // A rejection still proves the server is there
            Ok(_) | Err(RpcError::Rejected(_)) => {}
            Err(e) => {
                let _ = inner.control.send(Control::Dead {
                    session,
                    reason: format!("heartbeat failed: {e}"),
                });
                return;
            }
        }
    }
}

#[cfg(test)]
#[path = "rpc_tests.rs"]
mod tests;
