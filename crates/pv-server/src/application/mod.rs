//! Application layer: everything between a socket and a data point.
//!
//! - [`registry`] – server ids, free lists and the session table.
//! - [`session`] – one peer: send path, channel lists, outbound queues.
//! - [`channel`] – channel records and their put-notify slot.
//! - [`events`] – subscriptions and update coalescing.
//! - [`dispatch`] – request decoding and the per-command handlers.
//! - [`context`] – the process-wide [`ServerContext`](context::ServerContext).
//! - [`report`] – the leveled diagnostic report.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod channel;
pub mod context;
pub mod data_source;
pub mod dispatch;
pub mod events;
pub mod message_buffer;
pub mod pool;
pub mod registry;
pub mod report;
pub mod session;

/// Locks `m`, recovering the guard if a previous holder panicked.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
