//! Beacon sender.
//!
//! Every beacon is the same small datagram: the server's TCP port, its
//! minor revision and a wrapping counter (see [`Beacon`]).  Clients use the
//! counter to notice a restarted server and the arrival rate to notice a
//! dead one.
//!
//! Delays follow a [`BeaconSchedule`]: 20 ms, 40 ms, 80 ms … up to the
//! steady period.  While the server is paused no beacon is sent and the
//! schedule is reset, so resuming starts with a fast burst again.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use pv_core::protocol::{Beacon, SequenceCounter};
use pv_core::BeaconSchedule;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::application::context::{ControlState, ServerContext};

use super::NetworkError;

/// Poll interval while the server is paused.
const PAUSE_POLL: Duration = Duration::from_millis(100);

/// One unbound-port socket per address family in use.
#[derive(Debug, Default)]
pub struct BeaconSockets {
    v4: Option<UdpSocket>,
    v6: Option<UdpSocket>,
}

impl BeaconSockets {
    /// Binds the sockets needed to reach `destinations`.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::Bind`] if a socket cannot be bound.
    pub async fn bind(destinations: &[SocketAddr]) -> Result<Self, NetworkError> {
        let mut sockets = Self::default();
        if destinations.iter().any(SocketAddr::is_ipv4) {
            let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));
            let socket = UdpSocket::bind(addr)
                .await
                .map_err(|source| NetworkError::Bind { addr, source })?;
            socket.set_broadcast(true)?;
            sockets.v4 = Some(socket);
        }
        if destinations.iter().any(SocketAddr::is_ipv6) {
            let addr = SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0));
            let socket = UdpSocket::bind(addr)
                .await
                .map_err(|source| NetworkError::Bind { addr, source })?;
            sockets.v6 = Some(socket);
        }
        Ok(sockets)
    }

    fn for_dest(&self, dest: &SocketAddr) -> Option<&UdpSocket> {
        if dest.is_ipv4() {
            self.v4.as_ref()
        } else {
            self.v6.as_ref()
        }
    }
}

/// Last send error per destination, so each distinct failure is logged once.
#[derive(Debug, Default)]
struct SendErrors {
    last: HashMap<SocketAddr, String>,
}

impl SendErrors {
    fn failed(&mut self, dest: SocketAddr, error: &std::io::Error) {
        let text = error.to_string();
        if self.last.get(&dest) != Some(&text) {
            warn!("beacon send to {dest} failed: {text}");
            self.last.insert(dest, text);
        }
    }

    fn succeeded(&mut self, dest: SocketAddr) {
        if self.last.remove(&dest).is_some() {
            info!("beacon send to {dest} ok again");
        }
    }
}

/// Sends beacons until the control state becomes `exit`.
///
/// `ready` fires once the task is running.
pub async fn run_beacons(
    ctx: Arc<ServerContext>,
    sockets: BeaconSockets,
    destinations: Vec<SocketAddr>,
    mut schedule: BeaconSchedule,
    ready: oneshot::Sender<()>,
) {
    let mut control = ctx.subscribe_control();
    let counter = SequenceCounter::new();
    let mut errors = SendErrors::default();
    let _ = ready.send(());
    info!(
        "beacons to {} destination(s), steady period {:?}",
        destinations.len(),
        schedule.steady()
    );

    loop {
        match ctx.control_state() {
            ControlState::Exit => break,
            ControlState::Run => {}
            ControlState::Init | ControlState::Pause => {
                schedule.reset();
                tokio::select! {
                    _ = tokio::time::sleep(PAUSE_POLL) => {}
                    changed = control.changed() => if changed.is_err() { break },
                }
                continue;
            }
        }

        let datagram = Beacon::new(ctx.server_port(), counter.next()).encode();
        for dest in &destinations {
            let Some(socket) = sockets.for_dest(dest) else {
                continue;
            };
            match socket.send_to(&datagram, *dest).await {
                Ok(_) => errors.succeeded(*dest),
                Err(e) => errors.failed(*dest, &e),
            }
        }

        let delay = schedule.next_delay();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            changed = control.changed() => if changed.is_err() { break },
        }
    }

    debug!("beacon task stopped");
}

// ── Tests ─────────────────────────────────────────────────────────────────────
