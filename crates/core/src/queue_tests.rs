// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Tests for the durable command queue.

#![allow(clippy::unwrap_used)]

use super::*;
use crate::error::Error;
use crate::store::{MemoryStore, SqliteStore};
use serde_json::json;
use tempfile::tempdir;

fn memory_queue() -> (Arc<MemoryStore>, CommandQueue) {
    let store = Arc::new(MemoryStore::new());
    let queue = CommandQueue::new(store.clone());
    (store, queue)
}

fn actions(queue: &CommandQueue) -> Vec<String> {
    queue
        .list_pending()
        .unwrap()
        .into_iter()
        .map(|c| c.payload["action"].as_str().unwrap().to_string())
        .collect()
}

#[test]
fn enqueue_and_list_in_order() {
    let (_, queue) = memory_queue();
    assert!(queue.is_empty().unwrap());

    for action in ["a", "b", "c"] {
        queue.enqueue("room-1", json!({"action": action})).unwrap();
    }

    assert_eq!(queue.count().unwrap(), 3);
    assert_eq!(actions(&queue), vec!["a", "b", "c"]);
}

#[test]
fn enqueue_returns_what_is_stored() {
    let (_, queue) = memory_queue();
    let command = queue.enqueue("room-1", json!({"action": "a"})).unwrap();

    assert_eq!(queue.get(command.id).unwrap(), Some(command.clone()));
    assert_eq!(queue.list_pending().unwrap(), vec![command]);
}

#[test]
fn enqueue_with_same_id_is_idempotent() {
    let (_, queue) = memory_queue();
    let id = Uuid::new_v4();

    let first = queue.enqueue_with_id(id, "room-1", json!({"action": "a"})).unwrap();
    let second = queue.enqueue_with_id(id, "room-1", json!({"action": "changed"})).unwrap();

    assert_eq!(first, second);
    assert_eq!(queue.count().unwrap(), 1);
    assert_eq!(actions(&queue), vec!["a"]);
}

#[test]
fn remove_is_idempotent() {
    let (_, queue) = memory_queue();
    let a = queue.enqueue("s", json!({"action": "a"})).unwrap();
    queue.enqueue("s", json!({"action": "b"})).unwrap();

    queue.remove(a.id).unwrap();
    queue.remove(a.id).unwrap();
    queue.remove(Uuid::new_v4()).unwrap();

    assert_eq!(actions(&queue), vec!["b"]);
}

#[test]
fn enqueue_fails_loudly_when_store_unavailable() {
    let (store, queue) = memory_queue();
    store.set_available(false);

    let err = queue.enqueue("s", json!({"action": "a"})).unwrap_err();
    assert!(matches!(err, Error::Unavailable(_)));

    store.set_available(true);
    assert!(queue.is_empty().unwrap());
}

#[test]
fn commands_survive_restart_in_order() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("queue.db");

    let ids: Vec<Uuid> = {
        let queue = CommandQueue::new(Arc::new(SqliteStore::open(&path).unwrap()));
        ["a", "b", "c"]
            .iter()
            .map(|a| queue.enqueue("room-1", json!({"action": a})).unwrap().id)
            .collect()
    };

    let queue = CommandQueue::new(Arc::new(SqliteStore::open(&path).unwrap()));
    let pending: Vec<Uuid> = queue.list_pending().unwrap().iter().map(|c| c.id).collect();
    assert_eq!(pending, ids);
    assert_eq!(actions(&queue), vec!["a", "b", "c"]);
}

#[test]
fn created_at_round_trips_through_sqlite() {
    let queue = CommandQueue::new(Arc::new(SqliteStore::open_in_memory().unwrap()));
    let command = queue.enqueue("s", json!({"action": "a"})).unwrap();
    assert_eq!(queue.get(command.id).unwrap().unwrap().created_at, command.created_at);
}

#[test]
fn older_timestamp_sorts_first_even_if_inserted_later() {
    let (store, queue) = memory_queue();
    queue.enqueue("s", json!({"action": "new"})).unwrap();

    let mut old = QueuedCommand::new(Uuid::new_v4(), "s", json!({"action": "old"}));
    old.created_at -= chrono::Duration::seconds(60);
    store
        .put(COLLECTION, &old.id.to_string(), &serde_json::to_value(&old).unwrap())
        .unwrap();

    assert_eq!(actions(&queue), vec!["old", "new"]);
}
