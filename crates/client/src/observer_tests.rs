// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]

use super::*;
use std::sync::atomic::{AtomicUsize, Ordering};

fn counter() -> Arc<AtomicUsize> {
    Arc::new(AtomicUsize::new(0))
}

#[test]
fn notifies_all_listeners() {
    let registry = ObserverRegistry::<u32>::new();
    let sum = counter();

    let s1 = {
        let sum = sum.clone();
        registry.subscribe(move |v| {
            sum.fetch_add(*v as usize, Ordering::SeqCst);
        })
    };
    let s2 = {
        let sum = sum.clone();
        registry.subscribe(move |v| {
            sum.fetch_add(*v as usize * 10, Ordering::SeqCst);
        })
    };

    registry.notify(&2);
    assert_eq!(sum.load(Ordering::SeqCst), 22);
    assert_eq!(registry.len(), 2);
    drop((s1, s2));
}

#[test]
fn dropping_subscription_unsubscribes() {
    let registry = ObserverRegistry::<()>::new();
    let calls = counter();

    let sub = {
        let calls = calls.clone();
        registry.subscribe(move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
        })
    };
    registry.notify(&());
    drop(sub);
    registry.notify(&());

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(registry.is_empty());
}

#[test]
fn explicit_unsubscribe_and_detach() {
    let registry = ObserverRegistry::<()>::new();
    registry.subscribe(|_| {}).unsubscribe();
    assert!(registry.is_empty());

    registry.subscribe(|_| {}).detach();
    assert_eq!(registry.len(), 1);
}

#[test]
fn panicking_listener_does_not_starve_others() {
    let registry = ObserverRegistry::<()>::new();
    let calls = counter();

    let _bad = registry.subscribe(|_| panic!("listener bug"));
    let _good = {
        let calls = calls.clone();
        registry.subscribe(move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
        })
    };

    registry.notify(&());
    registry.notify(&());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn listener_may_unsubscribe_reentrantly() {
    let registry = ObserverRegistry::<()>::new();
    let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
    let calls = counter();

    let sub = {
        let slot = slot.clone();
        let calls = calls.clone();
        registry.subscribe(move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            slot.lock().take();
        })
    };
    *slot.lock() = Some(sub);

    registry.notify(&());
    registry.notify(&());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn subscription_outliving_registry_is_harmless() {
    let registry = ObserverRegistry::<()>::new();
    let sub = registry.subscribe(|_| {});
    drop(registry);
    sub.unsubscribe();
}

#[test]
fn observed_state_skips_unchanged_values() {
    let state = ObservedState::new(1u32);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let _sub = {
        let seen = seen.clone();
        state.subscribe(move |v| seen.lock().push(*v))
    };

    assert!(!state.set(1));
    assert!(state.set(2));
    assert!(!state.update(|v| *v = 2));

    assert_eq!(*seen.lock(), vec![2]);
    assert_eq!(state.get(), 2);
}

#[test]
fn subscribe_current_receives_value_first() {
    let state = ObservedState::new("idle".to_string());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let _sub = {
        let seen = seen.clone();
        state.subscribe_current(move |v: &String| seen.lock().push(v.clone()))
    };
    state.set("syncing".to_string());

    assert_eq!(*seen.lock(), vec!["idle", "syncing"]);
}

#[test]
fn concurrent_updates_converge_on_latest() {
    let state = ObservedState::new(0u32);
    let (entered_tx, entered_rx) = std::sync::mpsc::channel();
    let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
    let release_rx = Mutex::new(release_rx);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let _sub = {
        let seen = seen.clone();
        state.subscribe(move |v| {
            if *v == 1 {
                entered_tx.send(()).unwrap();
                release_rx.lock().recv().unwrap();
            }
            seen.lock().push(*v);
        })
    };

    let first = {
        let state = state.clone();
        std::thread::spawn(move || state.set(1))
    };
    entered_rx.recv().unwrap();
    // Handed to the running delivery instead of overtaking it
    assert!(state.set(2));
    assert!(seen.lock().is_empty());
    release_tx.send(()).unwrap();
    first.join().unwrap();

    assert_eq!(*seen.lock(), vec![1, 2]);
    assert_eq!(state.get(), 2);
}

#[test]
fn reentrant_update_is_delivered_after_current_round() {
    let state = ObservedState::new(0u32);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let _first = {
        let state = state.clone();
        let seen = seen.clone();
        state.clone().subscribe(move |v| {
            seen.lock().push(("first", *v));
            if *v == 1 {
                state.set(2);
            }
        })
    };
    let _second = {
        let seen = seen.clone();
        state.subscribe(move |v| seen.lock().push(("second", *v)))
    };

    state.set(1);

    assert_eq!(
        *seen.lock(),
        vec![("first", 1), ("second", 1), ("first", 2), ("second", 2)]
    );
}
