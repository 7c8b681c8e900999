// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! tether-core: Shared library for the tether sync engine
//!
//! This crate provides the wire protocol, the durable store abstraction and
//! the durable command queue used by both the tether client and the
//! tether-remote relay server.

pub mod error;
pub mod protocol;
pub mod queue;
pub mod store;

pub use error::{Error, Result};
pub use protocol::{ClientFrame, CommandBody, RequestKind, Response, ServerEvent, ServerFrame};
pub use queue::{CommandQueue, QueuedCommand};
pub use store::{DurableStore, MemoryStore, SqliteStore, INSERTION_ORDER};
