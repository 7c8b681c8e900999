// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

#![allow(clippy::unwrap_used)]

use super::*;
use serde_json::json;

#[tokio::test]
async fn resolve_delivers_data() {
    let mut table = PendingTable::default();
    let rx = table.register("c-1", RequestKind::Query).unwrap();

    let outcome = table.settle(Response::ok("c-1", json!([1, 2])));
    assert_eq!(outcome, Settlement::Delivered(CallState::Resolved));
    assert_eq!(rx.await.unwrap().unwrap(), json!([1, 2]));
    assert_eq!(table.state("c-1"), Some(CallState::Resolved));
    assert!(table.is_empty());
}

#[tokio::test]
async fn reject_delivers_rejection() {
    let mut table = PendingTable::default();
    let rx = table.register("c-1", RequestKind::Command).unwrap();

    let outcome = table.settle(Response::err("c-1", "forbidden"));
    assert_eq!(outcome, Settlement::Delivered(CallState::Rejected));
    assert_eq!(
        rx.await.unwrap().unwrap_err(),
        RpcError::Rejected("forbidden".into())
    );
}

#[test]
fn duplicate_registration_fails() {
    let mut table = PendingTable::default();
    let _rx = table.register("c-1", RequestKind::Query).unwrap();
    assert!(matches!(
        table.register("c-1", RequestKind::Query),
        Err(RpcError::DuplicateCorrelation(_))
    ));
    assert_eq!(table.len(), 1);
}

#[test]
fn late_response_after_timeout_is_unmatched() {
    let mut table = PendingTable::default();
    let _rx = table.register("c-1", RequestKind::Query).unwrap();

    assert!(table.time_out("c-1"));
    assert!(!table.time_out("c-1"));
    assert_eq!(
        table.settle(Response::ok("c-1", json!(null))),
        Settlement::Unmatched(Some(CallState::TimedOut))
    );
}

#[test]
fn duplicate_response_is_unmatched() {
    let mut table = PendingTable::default();
    let _rx = table.register("c-1", RequestKind::Query).unwrap();
    table.settle(Response::ok("c-1", json!(1)));

    assert_eq!(
        table.settle(Response::ok("c-1", json!(2))),
        Settlement::Unmatched(Some(CallState::Resolved))
    );
}

#[test]
fn unknown_response_is_unmatched() {
    let mut table = PendingTable::default();
    assert_eq!(
        table.settle(Response::ok("never-sent", json!(1))),
        Settlement::Unmatched(None)
    );
}

#[test]
fn cancel_after_settle_is_noop() {
    let mut table = PendingTable::default();
    let _rx = table.register("c-1", RequestKind::Query).unwrap();
    table.settle(Response::ok("c-1", json!(1)));

    assert!(!table.cancel("c-1"));
    assert_eq!(table.state("c-1"), Some(CallState::Resolved));
}

#[tokio::test]
async fn abort_all_rejects_with_transport_error() {
    let mut table = PendingTable::default();
    let a = table.register("a", RequestKind::Command).unwrap();
    let b = table.register("b", RequestKind::Query).unwrap();

    assert_eq!(table.abort_all("connection closed"), 2);
    assert!(table.is_empty());

    for rx in [a, b] {
        let err = rx.await.unwrap().unwrap_err();
        assert!(err.is_transport());
    }
    assert_eq!(table.state("a"), Some(CallState::Aborted));
}

#[test]
fn history_is_bounded() {
    let mut table = PendingTable::new(2);
    for id in ["a", "b", "c"] {
        let _rx = table.register(id, RequestKind::Query).unwrap();
        table.time_out(id);
    }
    assert_eq!(table.state("a"), None);
    assert_eq!(table.state("b"), Some(CallState::TimedOut));
    assert_eq!(table.state("c"), Some(CallState::TimedOut));
}
