//! The process-wide server context.
//!
//! One [`ServerContext`] is built at startup and shared as `Arc` by every
//! service.  It owns the [`ResourceRegistry`], the data-source and
//! access-control collaborators, and the control state that starts, pauses
//! and stops the services.
//!
//! # Control state (for beginners)
//!
//! The control state lives in a `tokio::sync::watch` channel.  Async services
//! `select!` on [`watch::Receiver::changed`]; the discovery threads, which
//! are plain OS threads, read [`ServerContext::control_state`] once per poll
//! interval instead.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use pv_core::protocol::DEFAULT_SERVER_PORT;
use pv_core::{ChannelEvent, ChannelList, ChannelState, TransitionError};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::channel::Channel;
use super::data_source::{AccessControl, DataSource};
use super::lock;
use super::registry::{RegistryLimits, ResourceRegistry};
use super::session::Session;

/// Provisional channels older than this are swept.
pub const PROVISIONAL_TTL: Duration = Duration::from_secs(60);

/// How long a WRITE_NOTIFY waits for the previous put on its channel.
pub const PUT_NOTIFY_TIMEOUT: Duration = Duration::from_secs(60);

/// Default outbound backlog above which updates are coalesced.
pub const DEFAULT_BACKLOG_LIMIT: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    /// Services are binding their sockets.
    Init,
    Run,
    /// Discovery discards requests, beacons stop, the acceptor waits.
    Pause,
    Exit,
}

#[derive(Debug, Clone)]
pub struct ContextSettings {
    pub limits: RegistryLimits,
    pub backlog_limit: usize,
    pub put_timeout: Duration,
    pub provisional_ttl: Duration,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            limits: RegistryLimits::default(),
            backlog_limit: DEFAULT_BACKLOG_LIMIT,
            put_timeout: PUT_NOTIFY_TIMEOUT,
            provisional_ttl: PROVISIONAL_TTL,
        }
    }
}

/// Endpoints of one interface, as shown by the report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceSummary {
    pub tcp: SocketAddr,
    pub udp: SocketAddr,
    pub broadcast: Option<SocketAddr>,
}

/// Network facts published by the services once bound.
#[derive(Debug, Clone, Default)]
pub struct NetworkSummary {
    pub interfaces: Vec<InterfaceSummary>,
    pub beacon_addresses: Vec<SocketAddr>,
    pub ignore_list: Vec<SocketAddr>,
    pub family_policy: String,
}

pub struct ServerContext {
    registry: Arc<ResourceRegistry>,
    source: Arc<dyn DataSource>,
    access: Arc<dyn AccessControl>,
    settings: ContextSettings,
    control: watch::Sender<ControlState>,
    server_port: AtomicU16,
    network: Mutex<NetworkSummary>,
}

impl ServerContext {
    pub fn new(
        settings: ContextSettings,
        source: Arc<dyn DataSource>,
        access: Arc<dyn AccessControl>,
    ) -> Arc<Self> {
        let (control, _) = watch::channel(ControlState::Init);
        Arc::new(Self {
            registry: Arc::new(ResourceRegistry::new(settings.limits.clone())),
            source,
            access,
            settings,
            control,
            server_port: AtomicU16::new(DEFAULT_SERVER_PORT),
            network: Mutex::new(NetworkSummary::default()),
        })
    }

    pub fn registry(&self) -> &Arc<ResourceRegistry> {
        &self.registry
    }

    pub fn source(&self) -> &Arc<dyn DataSource> {
        &self.source
    }

    pub fn access(&self) -> &Arc<dyn AccessControl> {
        &self.access
    }

    pub fn settings(&self) -> &ContextSettings {
        &self.settings
    }

    // ── Control state ─────────────────────────────────────────────────────────

    pub fn control_state(&self) -> ControlState {
        *self.control.borrow()
    }

    pub fn set_control_state(&self, state: ControlState) {
        let previous = self.control.send_replace(state);
        if previous != state {
            info!("server control state {previous:?} -> {state:?}");
        }
    }

    pub fn subscribe_control(&self) -> watch::Receiver<ControlState> {
        self.control.subscribe()
    }

    /// TCP port clients connect to; the port actually bound.
    pub fn server_port(&self) -> u16 {
        self.server_port.load(Ordering::Relaxed)
    }

    pub fn set_server_port(&self, port: u16) {
        self.server_port.store(port, Ordering::Relaxed);
    }

    pub fn network(&self) -> NetworkSummary {
        lock(&self.network).clone()
    }

    pub fn set_network(&self, network: NetworkSummary) {
        *lock(&self.network) = network;
    }

    /// `(channels, TCP circuits)`.
    pub fn stats(&self) -> (usize, usize) {
        self.registry.stats()
    }

    // ── Access rights ─────────────────────────────────────────────────────────

    /// Re-evaluates the rights of every TCP channel and schedules the
    /// resulting ACCESS_RIGHTS (or deferred connect) replies.
    pub fn access_rights_changed(&self) {
        for session in self.registry.sessions().into_iter().filter(|s| s.is_tcp()) {
            let identity = session.identity();
            let mut lists = session.channels();
            for chan in lists.all() {
                chan.set_rights(self.access.rights(chan.name(), &identity.user, &identity.host));
                if let Err(e) = lists.relist(&chan, ChannelEvent::RightsChanged) {
                    warn!(sid = chan.sid(), "rights change ignored: {e}");
                }
                let readable = chan.can_read();
                for entry in chan.events() {
                    if readable {
                        entry.set_enabled(true);
                        entry.post(true);
                    } else {
                        entry.post(true);
                        entry.set_enabled(false);
                    }
                }
            }
            drop(lists);
            session.wake();
        }
    }

    // ── Channel teardown ──────────────────────────────────────────────────────

    /// Cancels the events and the put-notify slot of `chan`.
    pub fn release_channel_resources(&self, chan: &Channel) {
        for entry in chan.take_events() {
            entry.cancel(chan);
            self.registry.release_event(entry);
        }
        let record = chan.put_notify().take();
        if let Some(record) = record {
            if record.busy {
                debug!(sid = chan.sid(), "put notify abandoned with its channel");
            }
            self.registry.release_put_notify(record);
        }
    }

    /// Takes `chan` off `session`'s lists and shuts it down.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError`] when the channel was on neither list.
    pub fn detach_channel(&self, session: &Session, chan: &Channel) -> Result<(), TransitionError> {
        let mut lists = session.channels();
        if lists.membership(chan.sid()) == ChannelList::Detached {
            return Err(TransitionError {
                from: chan.state(),
                event: ChannelEvent::Shutdown,
            });
        }
        lists.remove(chan.sid());
        chan.transition(ChannelEvent::Shutdown).map(|_| ())
    }

    /// Tears a session down: every channel is destroyed and its id released,
    /// the buffers go back to their pools and the session is unregistered.
    pub fn destroy_session(&self, session: &Arc<Session>) {
        session.close();
        let channels = session.channels().drain();
        let count = channels.len();
        for chan in channels {
            self.release_channel_resources(&chan);
            if let Err(e) = chan.transition(ChannelEvent::Shutdown) {
                warn!(sid = chan.sid(), "{e}");
            }
            if let Err(e) = self.registry.release_channel(chan) {
                warn!(peer = %session.peer(), "channel release during teardown: {e}");
            }
        }
        drop(session.take_pending_events());
        drop(session.take_put_replies());
        session.release_buffers();
        self.registry.unregister_session(session);
        info!(peer = %session.peer(), channels = count, "session closed");
    }

    // ── Provisional channels ──────────────────────────────────────────────────

    /// Finds the provisional channel created for `name` by a search from
    /// `host` and takes it off its discovery session.
    pub fn adopt_provisional(&self, name: &str, host: IpAddr) -> Option<Arc<Channel>> {
        let host = host.to_canonical();
        for session in self.registry.sessions().iter().filter(|s| !s.is_tcp()) {
            let mut lists = session.channels();
            let sid = lists
                .active()
                .find(|c| c.name() == name && c.origin().is_some_and(|o| o.ip().to_canonical() == host))
                .map(|c| c.sid());
            if let Some(chan) = sid.and_then(|sid| lists.remove(sid)) {
                return Some(chan);
            }
        }
        None
    }

    /// Releases the provisional channels of `session` older than the
    /// configured time to live.  Returns how many were swept.
    pub fn sweep_provisional(&self, session: &Session) -> usize {
        self.sweep_provisional_at(session, Instant::now())
    }

    pub fn sweep_provisional_at(&self, session: &Session, now: Instant) -> usize {
        let ttl = self.settings.provisional_ttl;
        let expired = session
            .channels()
            .extract_if(|c| now.saturating_duration_since(c.created_at()) > ttl);
        let count = expired.len();
        for chan in expired {
            if chan.state() != ChannelState::Shutdown {
                if let Err(e) = chan.transition(ChannelEvent::Shutdown) {
                    warn!(sid = chan.sid(), "{e}");
                }
            }
            if let Err(e) = self.registry.release_channel(chan) {
                warn!("provisional channel release: {e}");
            }
        }
        if count > 0 {
            debug!(count, "provisional channels expired");
        }
        count
    }
}

impl std::fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerContext")
            .field("control", &self.control_state())
            .field("server_port", &self.server_port())
            .field("registry", &self.registry)
            .finish()
    }
}
