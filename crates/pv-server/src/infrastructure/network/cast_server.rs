//! UDP discovery ("cast server").
//!
//! Each discovery socket is owned by one [`CastServer`] running on its own
//! thread.  For every datagram it:
//!
//! 1. Drops it if the source is ignore-listed or of a family the
//!    [`FamilyPolicy`] refuses.
//! 2. Sends the reply batch still buffered for the previous peer, if the
//!    source differs.
//! 3. Resets the per-datagram state and hands the bytes to the dispatcher,
//!    which answers SEARCH hits with the server port and a provisional
//!    server id.
//!
//! Whenever the socket has nothing more queued, the batch is sent and
//! provisional channels older than their time to live are released.
//!
//! # Why a blocking thread (for beginners)
//!
//! The socket is used with plain blocking `recv_from` calls and a 500 ms
//! read timeout, so it lives on a dedicated OS thread rather than on the
//! Tokio runtime.  Each timeout is a chance to look at the control state and
//! to run the idle work, so `exit` is honoured within one poll interval.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use pv_core::{FamilyPolicy, IgnoreList};
use tokio::sync::oneshot;
use tracing::{debug, error, info, trace, warn};

use crate::application::context::{ControlState, ServerContext};
use crate::application::dispatch::{process_messages, Request};
use crate::application::message_buffer::MessageBuffer;
use crate::application::session::Session;

use super::{is_timeout_error, NetworkError};

/// Read timeout of a discovery socket.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Pause after a receive error that is not a timeout.
const RECV_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// The datagram socket seen by the discovery loop.
#[cfg_attr(test, mockall::automock)]
pub trait DatagramTransport: Send {
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    fn send_to(&self, buf: &[u8], dest: SocketAddr) -> io::Result<usize>;

    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Whether another datagram is already queued.
    fn has_pending(&self) -> bool;
}

impl DatagramTransport for UdpSocket {
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf)
    }

    fn send_to(&self, buf: &[u8], dest: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, buf, dest)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }

    fn has_pending(&self) -> bool {
        if self.set_nonblocking(true).is_err() {
            return false;
        }
        let mut probe = [0u8; 1];
        let pending = match self.peek_from(&mut probe) {
            Ok(_) => true,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => false,
            // A pending error is also something for recv_from to report.
            Err(_) => true,
        };
        if let Err(e) = self.set_nonblocking(false) {
            warn!("discovery socket left non-blocking: {e}");
        }
        pending
    }
}

/// Binds a discovery socket with the poll interval as its read timeout.
///
/// # Errors
///
/// Returns [`NetworkError::Bind`] if the address is taken or unavailable.
pub fn bind_discovery_socket(addr: SocketAddr) -> Result<UdpSocket, NetworkError> {
    let socket = UdpSocket::bind(addr).map_err(|source| NetworkError::Bind { addr, source })?;
    socket.set_read_timeout(Some(POLL_INTERVAL))?;
    Ok(socket)
}

// ── Filter ────────────────────────────────────────────────────────────────────

/// Which sources are answered.
#[derive(Debug, Clone)]
pub struct DiscoveryFilter {
    pub policy: FamilyPolicy,
    pub ignore: IgnoreList,
}

impl DiscoveryFilter {
    pub fn admits(&self, source: &SocketAddr) -> bool {
        !self.ignore.is_ignored(source) && self.policy.accepts(source)
    }
}

// ── Server ────────────────────────────────────────────────────────────────────

pub struct CastServer<T: DatagramTransport> {
    ctx: Arc<ServerContext>,
    session: Arc<Session>,
    transport: T,
    filter: DiscoveryFilter,
    recv: MessageBuffer,
}

impl<T: DatagramTransport> CastServer<T> {
    /// Creates the server and its discovery session.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::Io`] if the transport has no local address.
    pub fn new(ctx: Arc<ServerContext>, transport: T, filter: DiscoveryFilter) -> Result<Self, NetworkError> {
        let local = transport.local_addr()?;
        let session = Session::udp(ctx.registry(), local);
        Ok(Self {
            ctx,
            session,
            transport,
            filter,
            recv: MessageBuffer::udp_receive(),
        })
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Registers the session, reports readiness and runs the loop on a
    /// thread named `pv-udp-<index>`.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::Spawn`] if the thread cannot be created.
    pub fn spawn(self, index: usize, ready: oneshot::Sender<SocketAddr>) -> Result<JoinHandle<()>, NetworkError>
    where
        T: 'static,
    {
        std::thread::Builder::new()
            .name(format!("pv-udp-{index}"))
            .spawn(move || {
                self.ctx.registry().register_session(Arc::clone(&self.session));
                let _ = ready.send(self.session.peer());
                self.run();
            })
            .map_err(NetworkError::Spawn)
    }

    /// The receive loop; returns when the control state becomes `exit`.
    pub fn run(mut self) {
        info!("discovery listening on UDP {}", self.session.peer());

        loop {
            let state = self.ctx.control_state();
            if state == ControlState::Exit {
                break;
            }

            self.recv.reset();
            let (len, src) = match self.transport.recv_from(self.recv.space_mut()) {
                Ok(pair) => pair,
                Err(e) if is_timeout_error(&e) || e.kind() == io::ErrorKind::Interrupted => {
                    self.idle();
                    continue;
                }
                Err(e) => {
                    error!("discovery recv error on {}: {e}", self.session.peer());
                    std::thread::sleep(RECV_ERROR_BACKOFF);
                    continue;
                }
            };

            if self.ctx.control_state() != ControlState::Run {
                trace!("discarding {len} bytes from {src} while not running");
                continue;
            }
            self.recv.fill(len);
            self.process_datagram(src);

            if !self.transport.has_pending() {
                self.idle();
            }
        }

        self.idle();
        self.ctx.destroy_session(&self.session);
        info!("discovery on UDP {} stopped", self.session.peer());
    }

    /// Handles the datagram from `src` already in the receive buffer.
    fn process_datagram(&mut self, src: SocketAddr) {
        if !self.filter.admits(&src) {
            trace!("discovery datagram from {src} filtered");
            return;
        }

        {
            let mut tx = self.session.send();
            if tx.reply_to() != Some(src) {
                if tx.has_replies() {
                    tx.seal();
                }
                tx.set_reply_to(src);
            }
            tx.set_seq_no(0);
        }
        self.transmit();

        self.session.set_minor_version(0);
        self.session.touch_recv();
        let received_at = unix_time_secs();

        let req = Request {
            ctx: &self.ctx,
            session: &self.session,
            peer: src,
        };
        let mut drain = 0;
        match process_messages(&req, &mut self.recv, &mut drain) {
            Ok(_) => {
                let left = self.recv.unread_len();
                if left > 0 {
                    debug!("partial (damaged?) UDP message from {src}: {left} bytes left");
                }
            }
            Err(e) => {
                warn!("UDP request from {src} at {received_at:.6} rejected: {e}");
            }
        }
    }

    /// Sends the buffered batch and expires old provisional channels.
    fn idle(&mut self) {
        self.session.flush();
        self.transmit();
        self.ctx.sweep_provisional(&self.session);
    }

    /// Writes every sealed frame, outside the send lock.
    fn transmit(&self) {
        let frames = self.session.send().take_frames();
        for frame in frames {
            let Some(dest) = frame.dest else {
                continue;
            };
            match self.transport.send_to(&frame.bytes, dest) {
                Ok(_) => self.session.touch_send(),
                Err(e) => warn!("discovery reply to {dest} failed: {e}"),
            }
        }
    }
}

/// Returns the current time as seconds since the Unix epoch.
fn unix_time_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::context::ContextSettings;
    use crate::application::data_source::OpenAccess;
    use crate::infrastructure::data::memory_source::{MemoryDataSource, PointValue};
    use pv_core::protocol::codec::{decode_message, encode_message, name_payload};
    use pv_core::protocol::{Command, Header, DO_REPLY, MINOR_PROTOCOL_REVISION};
    use std::sync::Mutex;

    type Sent = Arc<Mutex<Vec<(Vec<u8>, SocketAddr)>>>;

    fn context() -> Arc<ServerContext> {
        let source = MemoryDataSource::new();
        source.add_point("temp", PointValue::Double(vec![20.5]));
        let ctx = ServerContext::new(ContextSettings::default(), Arc::new(source), Arc::new(OpenAccess));
        ctx.set_server_port(5064);
        ctx
    }

    fn open_filter() -> DiscoveryFilter {
        DiscoveryFilter {
            policy: FamilyPolicy {
                accept_v4: true,
                accept_v6: true,
            },
            ignore: IgnoreList::default(),
        }
    }

    fn recording_transport(sent: &Sent) -> MockDatagramTransport {
        let mut transport = MockDatagramTransport::new();
        transport
            .expect_local_addr()
            .returning(|| Ok("127.0.0.1:5064".parse().unwrap()));
        let sink = Arc::clone(sent);
        transport.expect_send_to().returning(move |bytes, dest| {
            sink.lock().unwrap().push((bytes.to_vec(), dest));
            Ok(bytes.len())
        });
        transport
    }

    fn search_datagram(name: &str, cid: u32, seq_no: u32) -> Vec<u8> {
        let version = Header::new(Command::Version)
            .with_element_count(u32::from(MINOR_PROTOCOL_REVISION))
            .with_cid(seq_no);
        let payload = name_payload(name);
        let search = Header::new(Command::Search)
            .with_payload_size(payload.len() as u32)
            .with_data_type(DO_REPLY)
            .with_element_count(u32::from(MINOR_PROTOCOL_REVISION))
            .with_cid(cid)
            .with_available(cid);
        let mut bytes = encode_message(&version, &[]);
        bytes.extend(encode_message(&search, &payload));
        bytes
    }

    fn feed<T: DatagramTransport>(server: &mut CastServer<T>, bytes: &[u8], src: SocketAddr) {
        server.recv.reset();
        server.recv.space_mut()[..bytes.len()].copy_from_slice(bytes);
        server.recv.fill(bytes.len());
        server.process_datagram(src);
    }

    #[test]
    fn test_search_hit_replies_with_port_and_fresh_server_id() {
        // Arrange
        let ctx = context();
        let sent = Sent::default();
        let mut server = CastServer::new(Arc::clone(&ctx), recording_transport(&sent), open_filter()).unwrap();
        let client: SocketAddr = "127.0.0.1:40001".parse().unwrap();

        // Act
        feed(&mut server, &search_datagram("temp", 7, 42), client);
        server.idle();

        // Assert
        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let (bytes, dest) = &sent[0];
        assert_eq!(*dest, client);
        let (version, _, used) = decode_message(bytes, false).unwrap();
        assert_eq!(version.command, Command::Version as u16);
        assert_eq!(version.cid, 42, "sequence number echoed");
        let (reply, payload, _) = decode_message(&bytes[used..], false).unwrap();
        assert_eq!(reply.command, Command::Search as u16);
        assert_eq!(reply.data_type, 5064);
        assert_eq!(reply.available, 7);
        assert_eq!(&payload[..2], &MINOR_PROTOCOL_REVISION.to_be_bytes());
        let chan = ctx.registry().lookup(reply.cid).expect("provisional channel registered");
        assert_eq!(chan.name(), "temp");
        assert_eq!(server.session().channel_count(), 1);
    }

    #[test]
    fn test_search_miss_sends_nothing() {
        // Arrange
        let ctx = context();
        let sent = Sent::default();
        let mut server = CastServer::new(Arc::clone(&ctx), recording_transport(&sent), open_filter()).unwrap();

        // Act
        feed(&mut server, &search_datagram("missing", 7, 1), "127.0.0.1:40001".parse().unwrap());
        server.idle();

        // Assert
        assert!(sent.lock().unwrap().is_empty());
        assert_eq!(ctx.registry().channel_count(), 0);
        assert_eq!(server.session().last_search(), "missing");
    }

    #[test]
    fn test_ignored_source_is_dropped_unread() {
        // Arrange
        let ctx = context();
        let sent = Sent::default();
        let client: SocketAddr = "127.0.0.1:40001".parse().unwrap();
        let filter = DiscoveryFilter {
            ignore: IgnoreList::new(vec!["127.0.0.1:0".parse().unwrap()]),
            ..open_filter()
        };
        let mut server = CastServer::new(Arc::clone(&ctx), recording_transport(&sent), filter).unwrap();

        // Act
        feed(&mut server, &search_datagram("temp", 7, 1), client);
        server.idle();

        // Assert
        assert!(sent.lock().unwrap().is_empty());
        assert_eq!(ctx.registry().channel_count(), 0);
    }

    #[test]
    fn test_refused_family_is_dropped() {
        let ctx = context();
        let sent = Sent::default();
        let filter = DiscoveryFilter {
            policy: FamilyPolicy {
                accept_v4: false,
                accept_v6: true,
            },
            ignore: IgnoreList::default(),
        };
        let mut server = CastServer::new(Arc::clone(&ctx), recording_transport(&sent), filter).unwrap();

        feed(&mut server, &search_datagram("temp", 7, 1), "127.0.0.1:40001".parse().unwrap());
        server.idle();

        assert!(sent.lock().unwrap().is_empty());
    }

    #[test]
    fn test_reply_for_previous_peer_is_sent_before_next_datagram() {
        // Arrange
        let ctx = context();
        let sent = Sent::default();
        let mut server = CastServer::new(Arc::clone(&ctx), recording_transport(&sent), open_filter()).unwrap();
        let a: SocketAddr = "127.0.0.1:40001".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:40002".parse().unwrap();

        // Act
        feed(&mut server, &search_datagram("temp", 1, 10), a);
        let sent_after_a = sent.lock().unwrap().len();
        feed(&mut server, &search_datagram("temp", 2, 20), b);
        let sent_after_b = sent.lock().unwrap().len();
        server.idle();

        // Assert
        assert_eq!(sent_after_a, 0, "A's reply waits for a quiet socket");
        assert_eq!(sent_after_b, 1, "A's reply flushed when B arrives");
        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].1, a);
        assert_eq!(sent[1].1, b);
        let (version, _, used) = decode_message(&sent[0].0, false).unwrap();
        assert_eq!(version.cid, 10, "A's batch keeps A's sequence number");
        let (reply, _, _) = decode_message(&sent[0].0[used..], false).unwrap();
        assert_eq!(reply.available, 1);
    }

    #[test]
    fn test_search_without_version_from_old_client_is_ignored() {
        // Arrange
        let ctx = context();
        let sent = Sent::default();
        let mut server = CastServer::new(Arc::clone(&ctx), recording_transport(&sent), open_filter()).unwrap();
        let bytes = search_datagram("temp", 7, 1);

        // Act: skip the leading VERSION header
        feed(&mut server, &bytes[16..], "127.0.0.1:40001".parse().unwrap());
        server.idle();

        // Assert
        assert!(sent.lock().unwrap().is_empty());
        assert_eq!(ctx.registry().channel_count(), 0);
    }

    #[test]
    fn test_run_exits_on_exit_state_and_unregisters() {
        // Arrange
        let ctx = context();
        let mut transport = MockDatagramTransport::new();
        transport
            .expect_local_addr()
            .returning(|| Ok("127.0.0.1:5064".parse().unwrap()));
        let exit_ctx = Arc::clone(&ctx);
        transport.expect_recv_from().returning(move |_| {
            exit_ctx.set_control_state(ControlState::Exit);
            Err(io::Error::new(io::ErrorKind::WouldBlock, "timeout"))
        });
        let server = CastServer::new(Arc::clone(&ctx), transport, open_filter()).unwrap();
        ctx.registry().register_session(Arc::clone(server.session()));
        ctx.set_control_state(ControlState::Run);

        // Act
        server.run();

        // Assert
        assert!(ctx.registry().sessions().is_empty());
    }
}
