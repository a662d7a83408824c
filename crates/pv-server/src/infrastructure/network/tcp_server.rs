//! TCP acceptor and per-session tasks.
//!
//! Every accepted connection becomes a [`Session`] served by two tasks:
//!
//! ```text
//!   socket ──read──▶ reader task ──process_messages──▶ send buffer
//!                                                          │ seal + wake
//!   socket ◀─write── outbound task ◀── outbound_labor ◀────┘
//! ```
//!
//! The reader owns the receive buffer and is the only one to tear the
//! session down.  The outbound task completes puts, sends access-rights
//! updates and deferred subscription updates, and writes the sealed frames.
//! When it stops (write error or closed session) it drops a oneshot sender;
//! the reader sees that and tears down.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use pv_core::protocol::{Command, Header, MINOR_PROTOCOL_REVISION};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::application::channel::Channel;
use crate::application::context::{ControlState, ServerContext};
use crate::application::dispatch::{abandon_put, outbound_labor, process_messages, start_put, Outcome, Request};
use crate::application::message_buffer::{BufferClass, MessageBuffer};
use crate::application::session::Session;

use super::NetworkError;

/// Poll interval of the acceptor while the server is paused.
const PAUSE_POLL: Duration = Duration::from_millis(100);

/// Pause after a failed `accept`.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_secs(15);

/// Pause after a write that ran out of socket buffer space.
const NO_BUFFER_BACKOFF: Duration = Duration::from_secs(15);

/// Binds a listener on `addr`.  With `allow_fallback`, a busy port is
/// replaced by an ephemeral one.
///
/// # Errors
///
/// Returns [`NetworkError::Bind`] if no port could be bound.
pub async fn bind_listener(addr: SocketAddr, allow_fallback: bool) -> Result<TcpListener, NetworkError> {
    match TcpListener::bind(addr).await {
        Ok(listener) => Ok(listener),
        Err(e) if allow_fallback && addr.port() != 0 => {
            warn!("TCP port {} unavailable ({e}), falling back to an ephemeral port", addr.port());
            let any = SocketAddr::new(addr.ip(), 0);
            TcpListener::bind(any)
                .await
                .map_err(|source| NetworkError::Bind { addr: any, source })
        }
        Err(source) => Err(NetworkError::Bind { addr, source }),
    }
}

/// Accepts clients until the control state becomes `exit`.
///
/// `ready` receives the bound address once the loop is running.
pub async fn run_acceptor(ctx: Arc<ServerContext>, listener: TcpListener, ready: oneshot::Sender<SocketAddr>) {
    let local = match listener.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            error!("TCP listener has no local address: {e}");
            return;
        }
    };
    let mut control = ctx.subscribe_control();
    let _ = ready.send(local);
    info!("accepting clients on TCP {local}");

    loop {
        match ctx.control_state() {
            ControlState::Exit => break,
            ControlState::Run => {}
            ControlState::Init | ControlState::Pause => {
                tokio::select! {
                    _ = tokio::time::sleep(PAUSE_POLL) => {}
                    changed = control.changed() => if changed.is_err() { break },
                }
                continue;
            }
        }

        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => start_session(&ctx, stream, peer),
                Err(e) => {
                    error!("accept error on {local}: {e}");
                    tokio::select! {
                        _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => {}
                        changed = control.changed() => if changed.is_err() { break },
                    }
                }
            },
            changed = control.changed() => if changed.is_err() { break },
        }
    }

    info!("acceptor on TCP {local} stopped");
}

/// Creates and registers a session for `stream` and starts its tasks.
/// The first message queued is the server's VERSION.  A session that
/// cannot get its buffers is refused.
pub fn start_session(ctx: &Arc<ServerContext>, stream: TcpStream, peer: SocketAddr) {
    let session = match Session::tcp(ctx.registry(), peer, ctx.settings().backlog_limit) {
        Ok(session) => session,
        Err(e) => {
            warn!("refusing client {peer}: {e}");
            return;
        }
    };
    let recv = match ctx.registry().acquire_small_buffer() {
        Ok(data) => MessageBuffer::new(data, BufferClass::Small),
        Err(e) => {
            warn!("refusing client {peer}: {e}");
            session.release_buffers();
            return;
        }
    };
    if let Err(e) = stream.set_nodelay(true) {
        debug!("TCP_NODELAY on {peer}: {e}");
    }

    let version = Header::new(Command::Version).with_element_count(u32::from(MINOR_PROTOCOL_REVISION));
    if let Err(e) = session.send().push_header(version) {
        warn!("initial version message to {peer} dropped: {e}");
    }
    ctx.registry().register_session(Arc::clone(&session));
    info!("client {peer} connected");

    let (reader, writer) = stream.into_split();
    let (stopped_tx, stopped_rx) = oneshot::channel();
    tokio::spawn(outbound_task(Arc::clone(&session), writer, stopped_tx));
    tokio::spawn(reader_task(Arc::clone(ctx), session, reader, recv, stopped_rx));
}

// ── Reader ────────────────────────────────────────────────────────────────────

async fn reader_task(
    ctx: Arc<ServerContext>,
    session: Arc<Session>,
    mut reader: OwnedReadHalf,
    mut buf: MessageBuffer,
    mut outbound_stopped: oneshot::Receiver<()>,
) {
    let peer = session.peer();
    let mut control = ctx.subscribe_control();
    let mut drain = 0usize;

    loop {
        buf.compact();
        if buf.remaining() == 0 {
            error!("receive buffer of {peer} full without a complete message");
            break;
        }
        let read = tokio::select! {
            read = reader.read(buf.space_mut()) => read,
            _ = &mut outbound_stopped => break,
            _ = wait_for_exit(&mut control) => break,
        };
        match read {
            Ok(0) => {
                debug!("client {peer} closed the connection");
                break;
            }
            Ok(n) => {
                buf.fill(n);
                session.touch_recv();
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("read from {peer} failed: {e}");
                break;
            }
        }

        if let Err(e) = handle_input(&ctx, &session, &mut buf, &mut drain).await {
            warn!("closing session with {peer}: {e}");
            break;
        }
        session.flush();
        session.set_recv_pending(buf.unread_len());
        if session.is_closed() {
            break;
        }
    }

    session.flush();
    let (class, data) = (buf.class(), buf.take_allocation());
    ctx.registry().release_buffer(class, data);
    ctx.destroy_session(&session);
}

/// Processes the buffered requests, waiting out a put that must be
/// serialised behind the previous one on its channel.
async fn handle_input(
    ctx: &ServerContext,
    session: &Arc<Session>,
    buf: &mut MessageBuffer,
    drain: &mut usize,
) -> Result<(), crate::application::dispatch::DispatchError> {
    let peer = session.peer();
    loop {
        let outcome = {
            let req = Request { ctx, session, peer };
            process_messages(&req, buf, drain)?
        };
        let parked = match outcome {
            Outcome::NeedMore => return Ok(()),
            Outcome::Parked(parked) => parked,
        };

        session.flush();
        if !wait_for_put(session, &parked.channel, ctx.settings().put_timeout).await {
            abandon_put(session, &parked.channel);
        }
        if session.is_closed() {
            return Ok(());
        }
        let req = Request { ctx, session, peer };
        start_put(&req, &parked.channel, &parked.request, &parked.payload)?;
    }
}

/// Waits until `chan` has no put in progress.  Returns `false` on timeout.
async fn wait_for_put(session: &Session, chan: &Channel, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while chan.put_busy() && !session.is_closed() {
        if tokio::time::timeout_at(deadline, session.put_idle()).await.is_err() {
            return !chan.put_busy();
        }
    }
    true
}

async fn wait_for_exit(control: &mut watch::Receiver<ControlState>) {
    loop {
        if *control.borrow_and_update() == ControlState::Exit {
            return;
        }
        if control.changed().await.is_err() {
            return;
        }
    }
}

// ── Outbound ──────────────────────────────────────────────────────────────────

async fn outbound_task(session: Arc<Session>, mut writer: OwnedWriteHalf, _stopped: oneshot::Sender<()>) {
    let peer = session.peer();
    loop {
        session.work_signalled().await;
        // A closing session still gets the frames sealed before teardown,
        // such as the error reply that caused it.
        let closing = session.is_closed();
        if !closing {
            outbound_labor(&session);
        }

        let frames = session.send().take_frames();
        for frame in frames {
            if let Err(e) = write_frame(&mut writer, &frame.bytes).await {
                debug!("write to {peer} failed: {e}");
                session.close();
                return;
            }
            session.frames_written(frame.bytes.len());
        }
        if closing {
            break;
        }
        if session.pending_event_count() > 0 && !session.is_flow_controlled() {
            session.wake();
        }
    }
    let _ = writer.shutdown().await;
}

async fn write_frame(writer: &mut OwnedWriteHalf, bytes: &[u8]) -> io::Result<()> {
    let mut written = 0;
    while written < bytes.len() {
        match writer.write(&bytes[written..]).await {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if is_no_buffer_space(&e) => {
                warn!("socket out of buffer space, retrying in {NO_BUFFER_BACKOFF:?}");
                tokio::time::sleep(NO_BUFFER_BACKOFF).await;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Whether `e` is ENOBUFS.
fn is_no_buffer_space(e: &io::Error) -> bool {
    #[cfg(target_os = "linux")]
    const ENOBUFS: Option<i32> = Some(105);
    #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
    const ENOBUFS: Option<i32> = Some(55);
    #[cfg(windows)]
    const ENOBUFS: Option<i32> = Some(10055);
    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "ios", target_os = "freebsd", windows)))]
    const ENOBUFS: Option<i32> = None;

    ENOBUFS.is_some() && e.raw_os_error() == ENOBUFS
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::context::ContextSettings;
    use crate::application::data_source::OpenAccess;
    use crate::application::registry::RegistryLimits;
    use crate::infrastructure::data::memory_source::MemoryDataSource;

    fn context(limits: RegistryLimits) -> Arc<ServerContext> {
        let settings = ContextSettings {
            limits,
            ..ContextSettings::default()
        };
        ServerContext::new(settings, Arc::new(MemoryDataSource::new()), Arc::new(OpenAccess))
    }

    #[test]
    fn test_is_no_buffer_space_ignores_other_errors() {
        // Arrange
        let e = io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe");

        // Act / Assert
        assert!(!is_no_buffer_space(&e));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_is_no_buffer_space_recognises_enobufs() {
        assert!(is_no_buffer_space(&io::Error::from_raw_os_error(105)));
    }

    #[tokio::test]
    async fn test_bind_listener_falls_back_when_port_is_busy() {
        // Arrange
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let busy = taken.local_addr().unwrap();

        // Act
        let listener = bind_listener(busy, true).await.unwrap();

        // Assert
        assert_ne!(listener.local_addr().unwrap().port(), busy.port());
        assert!(bind_listener(busy, false).await.is_err());
    }

    #[tokio::test]
    async fn test_client_without_buffers_is_refused() {
        // Arrange: room for the send buffer but not the receive buffer
        let ctx = context(RegistryLimits {
            max_buffers: Some(1),
            ..RegistryLimits::default()
        });
        ctx.set_control_state(ControlState::Run);
        let listener = bind_listener("127.0.0.1:0".parse().unwrap(), false).await.unwrap();
        let (ready_tx, ready_rx) = oneshot::channel();
        let acceptor = tokio::spawn(run_acceptor(Arc::clone(&ctx), listener, ready_tx));
        let addr = ready_rx.await.unwrap();

        // Act
        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut byte = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(2), client.read(&mut byte))
            .await
            .expect("refused connection is closed");

        // Assert
        assert!(matches!(read, Ok(0) | Err(_)));
        assert!(ctx.registry().sessions().is_empty());
        ctx.set_control_state(ControlState::Exit);
        acceptor.await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_put_times_out_while_busy() {
        // Arrange
        let ctx = context(RegistryLimits::default());
        let session = Session::tcp(ctx.registry(), "127.0.0.1:1".parse().unwrap(), 1024).unwrap();
        let point = Arc::new(crate::application::data_source::DetachedPoint);
        let chan = ctx
            .registry()
            .create_channel(crate::application::channel::ChannelInit {
                cid: 1,
                name: "busy".into(),
                point,
                rights: pv_core::AccessRights::READ_WRITE,
                origin: None,
                session: session.weak(),
            })
            .unwrap();
        let mut record = ctx.registry().acquire_put_notify().unwrap();
        record.busy = true;
        *chan.put_notify() = Some(record);

        // Act
        let idle = wait_for_put(&session, &chan, Duration::from_millis(50)).await;

        // Assert
        assert!(!idle);
    }
}
