// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Shared test helpers: a channel-backed transport and a scripted executor.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use tether_core::protocol::{ClientFrame, Response, ServerEvent, ServerFrame};
use tether_core::QueuedCommand;

use crate::rpc::RpcError;
use crate::sync::{CommandExecutor, ExecuteFuture};
use crate::transport::{Transport, TransportError, TransportFuture};

type AutoReply = Arc<dyn Fn(&ClientFrame) -> Vec<ServerFrame> + Send + Sync>;

#[derive(Default)]
struct ServerState {
    /// Sender half of the live connection's inbound channel.
    inbound: Option<mpsc::UnboundedSender<ServerFrame>>,
    refuse: bool,
    /// Connection attempts never finish.
    hang: bool,
    connects: usize,
    urls: Vec<String>,
    sent: Vec<ClientFrame>,
    auto_reply: Option<AutoReply>,
}

/// Transport whose peer is a [`MockServer`] in the same test.
pub struct MockTransport {
    server: Arc<Mutex<ServerState>>,
    outgoing: mpsc::UnboundedSender<ClientFrame>,
    inbound: Option<mpsc::UnboundedReceiver<ServerFrame>>,
}

/// Test-side handle that plays the remote server.
pub struct MockServer {
    state: Arc<Mutex<ServerState>>,
    outgoing: tokio::sync::Mutex<mpsc::UnboundedReceiver<ClientFrame>>,
}

impl MockTransport {
    pub fn pair() -> (MockTransport, MockServer) {
        let state = Arc::new(Mutex::new(ServerState::default()));
        let (tx, rx) = mpsc::unbounded_channel();
        (
            MockTransport {
                server: Arc::clone(&state),
                outgoing: tx,
                inbound: None,
            },
            MockServer {
                state,
                outgoing: tokio::sync::Mutex::new(rx),
            },
        )
    }
}

impl Transport for MockTransport {
    fn connect(&mut self, url: &str) -> TransportFuture<'_, ()> {
        let url = url.to_string();
        Box::pin(async move {
            let hang = {
                let mut server = self.server.lock();
                server.urls.push(url);
                server.hang
            };
            if hang {
                std::future::pending::<()>().await;
            }
            let mut server = self.server.lock();
            if server.refuse {
                return Err(TransportError::ConnectionFailed("mock refused".into()));
            }
            let (tx, rx) = mpsc::unbounded_channel();
            server.inbound = Some(tx);
            server.connects += 1;
            self.inbound = Some(rx);
            Ok(())
        })
    }

    fn disconnect(&mut self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            self.inbound = None;
            Ok(())
        })
    }

    fn send(&mut self, frame: ClientFrame) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            if self.inbound.is_none() {
                return Err(TransportError::ConnectionClosed);
            }
            let answered = {
                let mut server = self.server.lock();
                server.sent.push(frame.clone());
                let replies = server.auto_reply.clone().map(|f| f(&frame)).unwrap_or_default();
                if let Some(tx) = &server.inbound {
                    for reply in &replies {
                        let _ = tx.send(reply.clone());
                    }
                }
                !replies.is_empty()
            };
            if !answered {
                let _ = self.outgoing.send(frame);
            }
            Ok(())
        })
    }

    fn recv(&mut self) -> TransportFuture<'_, Option<ServerFrame>> {
        Box::pin(async move {
            let rx = self.inbound.as_mut().ok_or(TransportError::ConnectionClosed)?;
            match rx.recv().await {
                Some(frame) => Ok(Some(frame)),
                None => {
                    self.inbound = None;
                    Ok(None)
                }
            }
        })
    }

    fn is_connected(&self) -> bool {
        self.inbound.is_some()
    }
}

impl MockServer {
    /// Next frame the client wrote that was not auto-answered.
    pub async fn next_frame(&self) -> ClientFrame {
        tokio::time::timeout(Duration::from_secs(60), self.outgoing.lock().await.recv())
            .await
            .expect("timed out waiting for client frame")
            .expect("transport dropped")
    }

    /// Push a frame to the connected client. Returns false when not connected.
    pub fn push(&self, frame: impl Into<ServerFrame>) -> bool {
        match &self.state.lock().inbound {
            Some(tx) => tx.send(frame.into()).is_ok(),
            None => false,
        }
    }

    pub fn reply_ok(&self, frame: &ClientFrame, data: Value) -> bool {
        self.push(Response::ok(frame.correlation_id.clone(), data))
    }

    pub fn reply_err(&self, frame: &ClientFrame, reason: &str) -> bool {
        self.push(Response::err(frame.correlation_id.clone(), reason))
    }

    pub fn push_event(&self, event_type: &str, data: Option<Value>) -> bool {
        self.push(ServerEvent {
            event_type: event_type.to_string(),
            data,
        })
    }

    /// Close the connection from the server side.
    pub fn drop_connection(&self) {
        self.state.lock().inbound = None;
    }

    /// Refuse (or accept again) future connection attempts.
    pub fn set_refuse(&self, refuse: bool) {
        self.state.lock().refuse = refuse;
    }

    /// Make future connection attempts hang (or complete again).
    pub fn set_hang(&self, hang: bool) {
        self.state.lock().hang = hang;
    }

    /// Answer matching frames immediately instead of queueing them for [`next_frame`].
    ///
    /// [`next_frame`]: MockServer::next_frame
    pub fn auto_reply(&self, f: impl Fn(&ClientFrame) -> Option<ServerFrame> + Send + Sync + 'static) {
        self.auto_reply_many(move |frame| f(frame).into_iter().collect());
    }

    /// Like [`auto_reply`](MockServer::auto_reply), but each frame may produce
    /// several inbound frames (e.g. an event followed by the response).
    pub fn auto_reply_many(&self, f: impl Fn(&ClientFrame) -> Vec<ServerFrame> + Send + Sync + 'static) {
        self.state.lock().auto_reply = Some(Arc::new(f));
    }

    /// Acknowledge every frame with `{}`.
    pub fn ack_everything(&self) {
        self.auto_reply(|frame| Some(Response::ok(frame.correlation_id.clone(), json!({})).into()));
    }

    pub fn connects(&self) -> usize {
        self.state.lock().connects
    }

    pub fn urls(&self) -> Vec<String> {
        self.state.lock().urls.clone()
    }

    pub fn sent(&self) -> Vec<ClientFrame> {
        self.state.lock().sent.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().inbound.is_some()
    }
}

/// Executor that replays scripted outcomes and records what it ran.
#[derive(Clone, Default)]
pub struct ScriptedExecutor {
    inner: Arc<Mutex<ScriptState>>,
}

#[derive(Default)]
struct ScriptState {
    outcomes: VecDeque<Result<Value, RpcError>>,
    executed: Vec<QueuedCommand>,
    unavailable: bool,
    /// After this many executions, report unavailable.
    available_for: Option<usize>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue outcomes returned in order; once exhausted every call succeeds.
    pub fn script(&self, outcomes: impl IntoIterator<Item = Result<Value, RpcError>>) {
        self.inner.lock().outcomes.extend(outcomes);
    }

    pub fn set_available(&self, available: bool) {
        self.inner.lock().unavailable = !available;
    }

    /// Report unavailable once `n` commands have been executed.
    pub fn available_for(&self, n: usize) {
        self.inner.lock().available_for = Some(n);
    }

    pub fn executed(&self) -> Vec<QueuedCommand> {
        self.inner.lock().executed.clone()
    }

    pub fn executed_ids(&self) -> Vec<uuid::Uuid> {
        self.inner.lock().executed.iter().map(|c| c.id).collect()
    }
}

impl CommandExecutor for ScriptedExecutor {
    fn execute(&self, command: &QueuedCommand) -> ExecuteFuture<'_> {
        let outcome = {
            let mut state = self.inner.lock();
            state.executed.push(command.clone());
            state.outcomes.pop_front().unwrap_or_else(|| Ok(json!({})))
        };
        Box::pin(async move {
            tokio::task::yield_now().await;
            outcome
        })
    }

    fn is_available(&self) -> bool {
        let state = self.inner.lock();
        if state.unavailable {
            return false;
        }
        state
            .available_for
            .is_none_or(|n| state.executed.len() < n)
    }
}
