//! Server startup and shutdown.
//!
//! [`start`] binds every socket, starts the services and waits for each of
//! them to report readiness before switching the control state to `run`:
//!
//! ```text
//! start()
//!  ├─ TCP listener per interface   (first one may fall back to an ephemeral port)
//!  ├─ UDP discovery per interface  (thread pv-udp-<n>, plus one per broadcast address)
//!  ├─ beacon task
//!  └─ acceptor task per listener
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;

use pv_core::BeaconSchedule;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::application::context::{ControlState, InterfaceSummary, NetworkSummary, ServerContext};
use crate::application::data_source::{AccessControl, DataSource};
use crate::infrastructure::network::beacon::{run_beacons, BeaconSockets};
use crate::infrastructure::network::cast_server::{bind_discovery_socket, CastServer, DiscoveryFilter};
use crate::infrastructure::network::tcp_server::{bind_listener, run_acceptor};
use crate::infrastructure::network::NetworkError;
use crate::infrastructure::storage::config::{ConfigError, ServerConfig};

/// Error type for server startup.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    #[error("socket address unavailable: {0}")]
    Io(#[from] std::io::Error),
}

/// A running server.
pub struct ServerHandle {
    ctx: Arc<ServerContext>,
    tcp: Vec<SocketAddr>,
    udp: Vec<SocketAddr>,
    tasks: Vec<JoinHandle<()>>,
    threads: Vec<thread::JoinHandle<()>>,
}

impl ServerHandle {
    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    /// Addresses the TCP listeners are bound to.
    pub fn tcp_addrs(&self) -> &[SocketAddr] {
        &self.tcp
    }

    /// Addresses the discovery sockets are bound to.
    pub fn udp_addrs(&self) -> &[SocketAddr] {
        &self.udp
    }

    /// Switches to `exit` and waits for every service to stop.
    pub async fn shutdown(self) {
        self.ctx.set_control_state(ControlState::Exit);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("service task ended abnormally: {e}");
            }
        }
        let threads = self.threads;
        let joined = tokio::task::spawn_blocking(move || {
            for handle in threads {
                if handle.join().is_err() {
                    warn!("discovery thread panicked");
                }
            }
        })
        .await;
        if let Err(e) = joined {
            warn!("discovery threads not joined: {e}");
        }
        for session in self.ctx.registry().sessions() {
            if !session.is_closed() {
                self.ctx.destroy_session(&session);
            }
        }
        info!("server stopped");
    }
}

/// Binds and starts every service described by `config`.
///
/// # Errors
///
/// Returns [`StartupError`] for a malformed address in the configuration or
/// when a required socket cannot be bound.
pub async fn start(
    config: &ServerConfig,
    source: Arc<dyn DataSource>,
    access: Arc<dyn AccessControl>,
) -> Result<ServerHandle, StartupError> {
    let ctx = ServerContext::new(config.context_settings(), source, access);
    let interfaces = config.interfaces()?;
    let beacon_addresses = config.beacon_addresses()?;
    let filter = DiscoveryFilter {
        policy: config.family_policy(),
        ignore: config.ignore_list()?,
    };

    // ── TCP listeners ─────────────────────────────────────────────────────────
    let mut port = config.server.port;
    let mut listeners = Vec::with_capacity(interfaces.len());
    for (n, intf) in interfaces.iter().enumerate() {
        let listener = bind_listener(SocketAddr::new(intf.ip, port), n == 0).await?;
        if n == 0 {
            port = listener.local_addr()?.port();
            ctx.set_server_port(port);
        }
        listeners.push(listener);
    }

    // ── UDP discovery ─────────────────────────────────────────────────────────
    let mut threads = Vec::new();
    let mut udp_ready = Vec::new();
    let mut summaries = Vec::with_capacity(interfaces.len());
    for (intf, listener) in interfaces.iter().zip(&listeners) {
        let socket = bind_discovery_socket(SocketAddr::new(intf.ip, config.server.port))?;
        let udp = socket.local_addr()?;
        let mut sockets = vec![socket];

        let mut broadcast = None;
        if let Some(bcast) = intf.broadcast {
            let addr = SocketAddr::new(bcast, udp.port());
            match bind_discovery_socket(addr) {
                Ok(socket) => {
                    broadcast = Some(addr);
                    sockets.push(socket);
                }
                Err(e) => warn!("no discovery on broadcast address: {e}"),
            }
        }

        for socket in sockets {
            let (ready_tx, ready_rx) = oneshot::channel();
            let addr = socket.local_addr()?;
            let server = CastServer::new(Arc::clone(&ctx), socket, filter.clone())?;
            let index = threads.len();
            threads.push(server.spawn(index, ready_tx)?);
            udp_ready.push((addr, ready_rx));
        }

        summaries.push(InterfaceSummary {
            tcp: listener.local_addr()?,
            udp,
            broadcast,
        });
    }

    // ── Beacons ───────────────────────────────────────────────────────────────
    let mut tasks = Vec::new();
    let beacon_sockets = BeaconSockets::bind(&beacon_addresses).await?;
    let (beacon_tx, beacon_rx) = oneshot::channel();
    tasks.push(tokio::spawn(run_beacons(
        Arc::clone(&ctx),
        beacon_sockets,
        beacon_addresses.clone(),
        BeaconSchedule::with_period(config.beacon_period()),
        beacon_tx,
    )));

    // ── Acceptors ─────────────────────────────────────────────────────────────
    let mut tcp_ready = Vec::new();
    for listener in listeners {
        let addr = listener.local_addr()?;
        let (ready_tx, ready_rx) = oneshot::channel();
        tasks.push(tokio::spawn(run_acceptor(Arc::clone(&ctx), listener, ready_tx)));
        tcp_ready.push((addr, ready_rx));
    }

    // ── Readiness ─────────────────────────────────────────────────────────────
    let mut udp = Vec::with_capacity(udp_ready.len());
    for (addr, ready) in udp_ready {
        udp.push(ready.await.map_err(|_| NetworkError::NotReady(addr))?);
    }
    let mut tcp = Vec::with_capacity(tcp_ready.len());
    for (addr, ready) in tcp_ready {
        tcp.push(ready.await.map_err(|_| NetworkError::NotReady(addr))?);
    }
    if beacon_rx.await.is_err() {
        warn!("beacon task stopped during startup");
    }

    ctx.set_network(NetworkSummary {
        interfaces: summaries,
        beacon_addresses,
        ignore_list: filter.ignore.entries().to_vec(),
        family_policy: filter.policy.label().to_string(),
    });
    ctx.set_control_state(ControlState::Run);
    info!("server running on TCP port {port}");

    Ok(ServerHandle {
        ctx,
        tcp,
        udp,
        tasks,
        threads,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
