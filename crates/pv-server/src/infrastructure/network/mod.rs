//! Network infrastructure of the server.
//!
//! # Sub-modules
//!
//! - **`cast_server`** – Answers UDP SEARCH datagrams on one socket.  Runs on
//!   a dedicated thread with a blocking socket and a read timeout, applies
//!   the ignore list and the address-family policy, and sweeps provisional
//!   channels when the socket goes quiet.
//!
//! - **`beacon`** – Sends the periodic "server is up" datagram to every
//!   beacon destination, fast at first and then at the steady period.
//!
//! - **`tcp_server`** – Accepts client circuits.  Each accepted connection
//!   becomes a [`Session`](crate::application::session::Session) served by a
//!   reader task and an outbound task.

use std::net::SocketAddr;

use thiserror::Error;

pub mod beacon;
pub mod cast_server;
pub mod tcp_server;

/// Error type for socket setup.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// A socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// A service thread could not be started.
    #[error("failed to spawn service thread: {0}")]
    Spawn(#[source] std::io::Error),

    /// A service stopped before reporting that it was ready.
    #[error("service on {0} stopped during startup")]
    NotReady(SocketAddr),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Returns `true` for OS timeout / would-block errors that should be retried.
pub(crate) fn is_timeout_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}
