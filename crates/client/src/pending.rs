// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Table of in-flight requests keyed by correlation id.
//!
//! Each call moves through `Pending -> Resolved | Rejected | TimedOut |
//! Cancelled | Aborted` exactly once. Settled ids are kept in a bounded history
//! so a late or duplicate response can be told apart from garbage.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use serde_json::Value;
use tokio::sync::oneshot;

use tether_core::protocol::{RequestKind, Response};

use crate::rpc::RpcError;

/// Default number of settled calls remembered.
pub const DEFAULT_HISTORY: usize = 256;

/// Lifecycle state of a correlated call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Pending,
    Resolved,
    Rejected,
    TimedOut,
    /// The caller stopped waiting.
    Cancelled,
    /// The connection went away while the call was in flight.
    Aborted,
}

/// What happened to an inbound response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Delivered to the waiting caller, leaving the call in this state.
    Delivered(CallState),
    /// No call was waiting. Carries the earlier outcome if still remembered.
    Unmatched(Option<CallState>),
}

pub(crate) type CallResult = Result<Value, RpcError>;

struct PendingCall {
    kind: RequestKind,
    registered_at: Instant,
    completion: oneshot::Sender<CallResult>,
}

/// In-flight calls plus a short memory of settled ones.
pub struct PendingTable {
    calls: HashMap<String, PendingCall>,
    settled: VecDeque<(String, CallState)>,
    history: usize,
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY)
    }
}

impl PendingTable {
    pub fn new(history: usize) -> Self {
        PendingTable {
            calls: HashMap::new(),
            settled: VecDeque::new(),
            history,
        }
    }

    pub fn contains(&self, correlation_id: &str) -> bool {
        self.calls.contains_key(correlation_id)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Register a new call. Fails if the id is already in flight.
    pub fn register(
        &mut self,
        correlation_id: &str,
        kind: RequestKind,
    ) -> Result<oneshot::Receiver<CallResult>, RpcError> {
        if self.contains(correlation_id) {
            return Err(RpcError::DuplicateCorrelation(correlation_id.to_string()));
        }
        let (completion, rx) = oneshot::channel();
        self.calls.insert(
            correlation_id.to_string(),
            PendingCall {
                kind,
                registered_at: Instant::now(),
                completion,
            },
        );
        Ok(rx)
    }

    /// Deliver a server response to its waiting call.
    pub fn settle(&mut self, response: Response) -> Settlement {
        let Some(call) = self.calls.remove(&response.correlation_id) else {
            return Settlement::Unmatched(self.state(&response.correlation_id));
        };

        let result = response.clone().into_result().map_err(RpcError::Rejected);
        let state = if result.is_ok() {
            CallState::Resolved
        } else {
            CallState::Rejected
        };
        tracing::trace!(
            correlation_id = %response.correlation_id,
            kind = %call.kind,
            elapsed_ms = call.registered_at.elapsed().as_millis() as u64,
            ?state,
            "call settled"
        );
        // The caller may have stopped listening; nothing to do then
        let _ = call.completion.send(result);
        self.remember(response.correlation_id, state);
        Settlement::Delivered(state)
    }

    /// Mark a call as timed out. Returns false if it had already settled.
    pub fn time_out(&mut self, correlation_id: &str) -> bool {
        self.finish(correlation_id, CallState::TimedOut)
    }

    /// Forget a call whose caller went away. No-op once settled.
    pub fn cancel(&mut self, correlation_id: &str) -> bool {
        self.finish(correlation_id, CallState::Cancelled)
    }

    /// Fail every in-flight call with a transport error.
    pub fn abort_all(&mut self, reason: &str) -> usize {
        let calls: Vec<(String, PendingCall)> = self.calls.drain().collect();
        let count = calls.len();
        for (id, call) in calls {
            let _ = call
                .completion
                .send(Err(RpcError::Transport(reason.to_string())));
            self.remember(id, CallState::Aborted);
        }
        count
    }

    /// Current or remembered state of a call.
    pub fn state(&self, correlation_id: &str) -> Option<CallState> {
        if self.contains(correlation_id) {
            return Some(CallState::Pending);
        }
        self.settled
            .iter()
            .rev()
            .find(|(id, _)| id == correlation_id)
            .map(|(_, state)| *state)
    }

    fn finish(&mut self, correlation_id: &str, state: CallState) -> bool {
        if self.calls.remove(correlation_id).is_none() {
            return false;
        }
        self.remember(correlation_id.to_string(), state);
        true
    }

    fn remember(&mut self, correlation_id: String, state: CallState) {
        if self.history == 0 {
            return;
        }
        while self.settled.len() >= self.history {
            self.settled.pop_front();
        }
        self.settled.push_back((correlation_id, state));
    }
}

#[cfg(test)]
#[path = "pending_tests.rs"]
mod tests;
