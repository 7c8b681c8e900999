// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]

use super::*;
use serde_json::json;
use tether_core::MemoryStore;

fn command(id: &str) -> CommandBody {
    CommandBody::decode(&json!({"id": id, "scope_id": "room-1", "action": "post", "text": id}))
        .unwrap()
}

fn memory_state() -> ServerState {
    ServerState::with_store(Arc::new(MemoryStore::new()), None)
}

#[tokio::test]
async fn apply_records_command_in_order() {
    let state = memory_state();

    state.apply("room-1", command("a")).await.unwrap();
    state.apply("room-1", command("b")).await.unwrap();

    let ids: Vec<String> = state
        .applied("room-1")
        .unwrap()
        .into_iter()
        .map(|c| c.command.id)
        .collect();
    assert_eq!(ids, vec!["a", "b"]);
    assert!(state.applied("room-2").unwrap().is_empty());
}

#[tokio::test]
async fn redelivered_command_is_duplicate() {
    let state = memory_state();

    let first = state.apply("room-1", command("a")).await.unwrap();
    let second = state.apply("room-1", command("a")).await.unwrap();

    assert!(matches!(first, ApplyOutcome::Applied(_)));
    assert_eq!(second, ApplyOutcome::Duplicate);
    assert_eq!(state.applied("room-1").unwrap().len(), 1);
}

#[tokio::test]
async fn same_id_in_another_scope_is_applied() {
    let state = memory_state();

    state.apply("room-1", command("a")).await.unwrap();
    let other = state.apply("room-2", command("a")).await.unwrap();

    assert!(matches!(other, ApplyOutcome::Applied(_)));
}

#[tokio::test]
async fn apply_broadcasts_to_scope_only() {
    let state = memory_state();
    let mut room1 = state.subscribe("room-1").await;
    let mut room2 = state.subscribe("room-2").await;

    state.apply("room-1", command("a")).await.unwrap();

    match room1.try_recv().unwrap() {
        ServerFrame::Event(event) => {
            assert_eq!(event.event_type, COMMAND_APPLIED);
            let data = event.data.unwrap();
            assert_eq!(data["id"], "a");
            assert_eq!(data["text"], "a");
            assert!(data["applied_at"].as_i64().unwrap() > 0);
        }
        other => panic!("expected event, got {other:?}"),
    }
    assert!(room2.try_recv().is_err());
}

#[tokio::test]
async fn duplicate_is_not_broadcast() {
    let state = memory_state();
    let mut rx = state.subscribe("room-1").await;

    state.apply("room-1", command("a")).await.unwrap();
    state.apply("room-1", command("a")).await.unwrap();

    assert!(rx.try_recv().is_ok());
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn applied_commands_survive_reopen() {
    let temp = tempfile::tempdir().unwrap();

    {
        let state = ServerState::new(temp.path(), None).unwrap();
        state.apply("room-1", command("a")).await.unwrap();
    }

    let state = ServerState::new(temp.path(), None).unwrap();
    assert_eq!(
        state.apply("room-1", command("a")).await.unwrap(),
        ApplyOutcome::Duplicate
    );
    assert_eq!(state.applied("room-1").unwrap()[0].command.action, "post");
}

#[test]
fn token_check() {
    let open = memory_state();
    assert!(open.authorize(None));
    assert!(open.authorize(Some("anything")));

    let locked = ServerState::with_store(Arc::new(MemoryStore::new()), Some("s3cret".into()));
    assert!(locked.authorize(Some("s3cret")));
    assert!(!locked.authorize(Some("wrong")));
    assert!(!locked.authorize(None));
}
