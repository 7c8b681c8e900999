// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Tests for command submission.

#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]

use super::*;
use crate::connectivity::NetworkStatus;
use crate::rpc::{ConnectionState, NoToken, TransportConfig};
use crate::sync::DEFAULT_ONLINE_SYNC_DELAY;
use crate::test_helpers::{MockServer, MockTransport};
use parking_lot::Mutex;
use serde_json::json;
use tether_core::protocol::Response;
use tether_core::{CommandQueue, MemoryStore};

struct RecordingFallback {
    calls: Mutex<Vec<(RequestKind, Value)>>,
    reply: Result<Value, RpcError>,
}

impl RecordingFallback {
    fn replying(reply: Result<Value, RpcError>) -> Arc<Self> {
        Arc::new(RecordingFallback {
            calls: Mutex::new(Vec::new()),
            reply,
        })
    }
}

impl FallbackClient for RecordingFallback {
    fn request(&self, kind: RequestKind, payload: Value) -> FallbackFuture<'_> {
        self.calls.lock().push((kind, payload));
        let reply = self.reply.clone();
        Box::pin(async move { reply })
    }
}

struct Harness {
    server: MockServer,
    rpc: RpcClient,
    queue: CommandQueue,
    sync: SyncManager,
    gateway: Gateway,
}

async fn harness(online: bool, connect: bool, fallback: Arc<dyn FallbackClient>) -> Harness {
    let (transport, server) = MockTransport::pair();
    let rpc = RpcClient::spawn(
        transport,
        TransportConfig {
            heartbeat_interval: None,
            ..TransportConfig::default()
        },
        Arc::new(NoToken),
    );
    if connect {
        rpc.set_scope(Some("room-1".to_string()));
        rpc.wait_for_state(ConnectionState::Connected).await;
    }
    let connectivity = ConnectivityMonitor::new(if online {
        NetworkStatus::online()
    } else {
        NetworkStatus::offline()
    });
    let queue = CommandQueue::new(Arc::new(MemoryStore::new()));
    let sync = SyncManager::new(queue.clone(), connectivity.clone(), DEFAULT_ONLINE_SYNC_DELAY);
    let gateway = Gateway::new(Delivery::new(rpc.clone(), fallback), sync.clone(), connectivity);
    Harness {
        server,
        rpc,
        queue,
        sync,
        gateway,
    }
}

fn post(text: &str) -> Value {
    json!({"action": "post", "text": text})
}

#[tokio::test]
async fn offline_command_is_queued_without_sending() {
    let h = harness(false, true, Arc::new(NoFallback)).await;

    let outcome = h.gateway.execute("room-1", post("hi")).await.unwrap();

    let Outcome::QueuedOffline(queued) = outcome else {
        panic!("expected queued outcome");
    };
    assert_eq!(h.queue.list_pending().unwrap(), vec![queued]);
    assert_eq!(h.sync.state().pending_count, 1);
    assert!(h.server.sent().is_empty());
}

#[tokio::test]
async fn connected_command_is_acknowledged() {
    let h = harness(true, true, Arc::new(NoFallback)).await;
    h.server
        .auto_reply(|f| Some(Response::ok(f.correlation_id.clone(), json!({"ok": true})).into()));

    let outcome = h.gateway.execute("room-1", post("hi")).await.unwrap();

    assert_eq!(outcome, Outcome::Acknowledged(json!({"ok": true})));
    let sent = h.server.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind, RequestKind::Command);
    assert_eq!(sent[0].payload["action"], "post");
    assert_eq!(sent[0].payload["scope_id"], "room-1");
    assert!(sent[0].payload["id"].is_string());
    assert!(h.queue.is_empty().unwrap());
}

#[tokio::test]
async fn rejected_command_is_returned_not_queued() {
    let h = harness(true, true, Arc::new(NoFallback)).await;
    h.server
        .auto_reply(|f| Some(Response::err(f.correlation_id.clone(), "not allowed").into()));

    let err = h.gateway.execute("room-1", post("hi")).await.unwrap_err();

    assert!(matches!(err, SubmitError::Rejected(ref r) if r == "not allowed"));
    assert!(h.queue.is_empty().unwrap());
}

#[tokio::test(start_paused = true)]
async fn unanswered_command_is_queued_under_same_id() {
    let h = harness(true, true, Arc::new(NoFallback)).await;
    let id = Uuid::new_v4();

    let outcome = h.gateway.execute_with_id(id, "room-1", post("hi")).await.unwrap();

    let Outcome::QueuedOffline(queued) = outcome else {
        panic!("expected queued outcome");
    };
    assert_eq!(queued.id, id);
    assert_eq!(h.server.sent()[0].payload["id"], id.to_string());
}

#[tokio::test]
async fn disconnected_command_uses_fallback() {
    let fallback = RecordingFallback::replying(Ok(json!({"via": "fallback"})));
    let h = harness(true, false, fallback.clone()).await;

    let outcome = h.gateway.execute("room-1", post("hi")).await.unwrap();

    assert_eq!(outcome, Outcome::Acknowledged(json!({"via": "fallback"})));
    let calls = fallback.calls.lock();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, RequestKind::Command);
    assert_eq!(calls[0].1["text"], "hi");
}

#[tokio::test]
async fn fallback_transport_failure_queues() {
    let fallback = RecordingFallback::replying(Err(RpcError::Transport("503".to_string())));
    let h = harness(true, false, fallback).await;

    let outcome = h.gateway.execute("room-1", post("hi")).await.unwrap();

    assert!(matches!(outcome, Outcome::QueuedOffline(_)));
    assert_eq!(h.queue.count().unwrap(), 1);
}

#[tokio::test]
async fn fallback_rejection_is_returned() {
    let fallback = RecordingFallback::replying(Err(RpcError::Rejected("bad".to_string())));
    let h = harness(true, false, fallback).await;

    let err = h.gateway.execute("room-1", post("hi")).await.unwrap_err();

    assert!(matches!(err, SubmitError::Rejected(_)));
    assert!(h.queue.is_empty().unwrap());
}

#[tokio::test]
async fn new_command_waits_behind_backlog() {
    let h = harness(true, true, Arc::new(NoFallback)).await;
    h.server.ack_everything();
    let first = h.sync.enqueue("room-1", post("first")).unwrap();

    let outcome = h.gateway.execute("room-1", post("second")).await.unwrap();
    let Outcome::QueuedOffline(second) = outcome else {
        panic!("expected queued outcome");
    };
    assert!(h.server.sent().is_empty());

    h.sync
        .initialize(Arc::new(h.gateway.delivery().clone()), Some(&h.rpc));
    h.sync.sync().await;

    let sent: Vec<Value> = h.server.sent().iter().map(|f| f.payload["id"].clone()).collect();
    assert_eq!(sent, vec![json!(first.id.to_string()), json!(second.id.to_string())]);
    assert!(h.queue.is_empty().unwrap());
}

#[tokio::test]
async fn optimistic_edit_rolls_back_on_rejection() {
    let h = harness(true, true, Arc::new(NoFallback)).await;
    h.server
        .auto_reply(|f| Some(Response::err(f.correlation_id.clone(), "no").into()));
    let cache = Cache::new(Arc::new(RpcFetcher::new(h.gateway.delivery().clone())));
    cache.set("room-1:messages", CacheValue::Collection(vec![json!({"id": 1})]));

    let result = h
        .gateway
        .execute_optimistic(
            &cache,
            "room-1:messages",
            |v| {
                if let CacheValue::Collection(items) = v {
                    items.insert(0, json!({"id": 2}));
                }
            },
            "room-1",
            post("hi"),
        )
        .await;

    assert!(result.is_err());
    assert_eq!(
        cache.peek("room-1:messages").unwrap().value,
        CacheValue::Collection(vec![json!({"id": 1})])
    );
}

#[tokio::test]
async fn optimistic_edit_is_kept_when_queued() {
    let h = harness(false, false, Arc::new(NoFallback)).await;
    let cache = Cache::new(Arc::new(RpcFetcher::new(h.gateway.delivery().clone())));
    cache.set("room-1:messages", CacheValue::Collection(Vec::new()));

    let outcome = h
        .gateway
        .execute_optimistic(
            &cache,
            "room-1:messages",
            |v| *v = CacheValue::Collection(vec![json!({"id": "tmp"})]),
            "room-1",
            post("hi"),
        )
        .await
        .unwrap();

    assert!(matches!(outcome, Outcome::QueuedOffline(_)));
    assert_eq!(
        cache.peek("room-1:messages").unwrap().value,
        CacheValue::Collection(vec![json!({"id": "tmp"})])
    );
}

#[tokio::test]
async fn rpc_fetcher_maps_arrays_to_collections() {
    let h = harness(true, true, Arc::new(NoFallback)).await;
    h.server.auto_reply(|f| {
        let data = if f.payload["key"] == "list" {
            json!([{"id": 1}])
        } else {
            json!({"id": 1})
        };
        Some(Response::ok(f.correlation_id.clone(), data).into())
    });
    let cache = Cache::new(Arc::new(RpcFetcher::new(h.gateway.delivery().clone())));

    assert_eq!(
        cache.get("list").await.unwrap(),
        CacheValue::Collection(vec![json!({"id": 1})])
    );
    assert_eq!(cache.get("one").await.unwrap(), CacheValue::Detail(json!({"id": 1})));
    assert_eq!(h.server.sent()[0].kind, RequestKind::Query);
}

#[tokio::test]
async fn disconnected_query_without_fallback_fails() {
    let h = harness(true, false, Arc::new(NoFallback)).await;

    let err = h.gateway.query(json!({"key": "x"})).await.unwrap_err();

    assert_eq!(err, RpcError::NotConnected);
}
