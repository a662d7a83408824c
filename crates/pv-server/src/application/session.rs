//! Sessions: one TCP circuit, or the shared discovery endpoint of one UDP
//! socket.
//!
//! # Locks
//!
//! A session has three locks that matter:
//!
//! - the **channel-list lock** guarding its two channel sets,
//! - the **send lock** guarding the send buffer, the sealed frames and the
//!   UDP reply address,
//! - the registry lock, owned by the [`ResourceRegistry`].
//!
//! They nest only in that order.  The receive buffer belongs to the single
//! reader of the session and has no lock.  No lock is ever held across a
//! socket call: the send path seals messages into [`OutboundFrame`]s under
//! the send lock and the socket owner writes them after letting go.
//!
//! # UDP batches
//!
//! A discovery reply batch always starts with a VERSION header.  When the
//! batch is sealed the header either carries the request's sequence number
//! (peers at minor version 11 or later) or is stripped.  A batch holding
//! nothing but that header is never sent.

use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError, Weak};
use std::time::{Duration, Instant};

use pv_core::protocol::codec::{align8, encode_header_form, encode_header_into, needs_large_header};
use pv_core::protocol::{
    large_array_supported, sequence_numbers_supported, status, Command, Header, HEADER_SIZE,
    LARGE_HEADER_SIZE, MAX_DIAGNOSTIC_LEN, MAX_TCP, MINOR_PROTOCOL_REVISION, NO_ID,
    SEQUENCE_NO_IS_VALID,
};
use pv_core::{ChannelEvent, ChannelList, ChannelState, TransitionError};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{error, warn};

use super::channel::Channel;
use super::events::EventEntry;
use super::lock;
use super::message_buffer::{BufferClass, MessageBuffer};
use super::registry::{ResourceError, ResourceRegistry};

/// Transport of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
}

/// A reply could not be placed in the send buffer.
#[derive(Debug, Error)]
pub enum ComposeError {
    /// A large-array message for a peer older than minor version 9.
    #[error("array too large for this client")]
    ArrayTooLargeForClient,

    #[error("message of {needed} bytes exceeds the {max}-byte send buffer")]
    TooLarge { needed: usize, max: usize },

    #[error("no large send buffer available: {0}")]
    Resource(#[source] ResourceError),
}

impl ComposeError {
    /// Status code reported to the client.
    pub fn status(&self) -> u32 {
        match self {
            ComposeError::ArrayTooLargeForClient => status::ARRAY_16K_CLIENT,
            ComposeError::TooLarge { .. } => status::TOLARGE,
            ComposeError::Resource(_) => status::ALLOCMEM,
        }
    }
}

/// Sealed bytes ready for the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    /// Datagram destination; `None` on a TCP circuit.
    pub dest: Option<SocketAddr>,
    pub bytes: Vec<u8>,
}

/// User and host names a client reported.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub user: String,
    pub host: String,
}

// ── Channel lists ─────────────────────────────────────────────────────────────

/// The two channel sets of a session, keyed by server id.
#[derive(Debug, Default)]
pub struct ChannelLists {
    active: BTreeMap<u32, Arc<Channel>>,
    pending_ar: BTreeMap<u32, Arc<Channel>>,
}

impl ChannelLists {
    /// Inserts `chan` into the list its state selects.  A detached channel
    /// is not inserted.
    pub fn insert(&mut self, chan: Arc<Channel>) {
        match chan.state().list() {
            ChannelList::Active => {
                self.active.insert(chan.sid(), chan);
            }
            ChannelList::PendingAccessUpdate => {
                self.pending_ar.insert(chan.sid(), chan);
            }
            ChannelList::Detached => {}
        }
    }

    pub fn remove(&mut self, sid: u32) -> Option<Arc<Channel>> {
        self.active.remove(&sid).or_else(|| self.pending_ar.remove(&sid))
    }

    pub fn get(&self, sid: u32) -> Option<&Arc<Channel>> {
        self.active.get(&sid).or_else(|| self.pending_ar.get(&sid))
    }

    /// Which list currently holds `sid`.
    pub fn membership(&self, sid: u32) -> ChannelList {
        if self.active.contains_key(&sid) {
            ChannelList::Active
        } else if self.pending_ar.contains_key(&sid) {
            ChannelList::PendingAccessUpdate
        } else {
            ChannelList::Detached
        }
    }

    /// Applies `event` to a channel of this session and moves it to the list
    /// its new state selects.
    pub fn relist(&mut self, chan: &Arc<Channel>, event: ChannelEvent) -> Result<ChannelState, TransitionError> {
        let next = chan.transition(event)?;
        self.remove(chan.sid());
        self.insert(Arc::clone(chan));
        Ok(next)
    }

    pub fn len(&self) -> usize {
        self.active.len() + self.pending_ar.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn active(&self) -> impl Iterator<Item = &Arc<Channel>> {
        self.active.values()
    }

    pub fn pending_access_update(&self) -> impl Iterator<Item = &Arc<Channel>> {
        self.pending_ar.values()
    }

    pub fn all(&self) -> Vec<Arc<Channel>> {
        self.active.values().chain(self.pending_ar.values()).cloned().collect()
    }

    /// Empties the pending list.
    pub fn take_pending_access_update(&mut self) -> Vec<Arc<Channel>> {
        std::mem::take(&mut self.pending_ar).into_values().collect()
    }

    /// Empties both lists.
    pub fn drain(&mut self) -> Vec<Arc<Channel>> {
        let mut all: Vec<_> = std::mem::take(&mut self.active).into_values().collect();
        all.extend(std::mem::take(&mut self.pending_ar).into_values());
        all
    }

    /// Removes and returns every channel matching `pred`.
    pub fn extract_if(&mut self, mut pred: impl FnMut(&Arc<Channel>) -> bool) -> Vec<Arc<Channel>> {
        let sids: Vec<u32> = self
            .active
            .values()
            .chain(self.pending_ar.values())
            .filter(|c| pred(c))
            .map(|c| c.sid())
            .collect();
        sids.into_iter().filter_map(|sid| self.remove(sid)).collect()
    }
}

// ── Send state ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct Reservation {
    large: bool,
    header: Header,
    capacity: usize,
}

pub(crate) struct SendState {
    buf: MessageBuffer,
    pending: Option<Reservation>,
    frames: VecDeque<OutboundFrame>,
    reply_to: Option<SocketAddr>,
    seq_no: u32,
    udp: bool,
}

impl SendState {
    fn new(buf: MessageBuffer, transport: Transport) -> Self {
        let mut state = Self {
            buf,
            pending: None,
            frames: VecDeque::new(),
            reply_to: None,
            seq_no: 0,
            udp: transport == Transport::Udp,
        };
        state.begin_batch();
        state
    }

    fn begin_batch(&mut self) {
        if !self.udp {
            return;
        }
        let version = Header::new(Command::Version).with_element_count(u32::from(MINOR_PROTOCOL_REVISION));
        if let Ok(n) = encode_header_into(&version, self.buf.space_mut()) {
            self.buf.fill(n);
        }
    }
}

fn header_size(large: bool) -> usize {
    if large {
        LARGE_HEADER_SIZE
    } else {
        HEADER_SIZE
    }
}

/// Exclusive access to a session's send buffer.
///
/// A reply is composed in three steps: [`reserve`](Self::reserve) a header
/// and payload region, fill [`payload_mut`](Self::payload_mut) (optionally
/// patching the header with [`set_cid`](Self::set_cid) or
/// [`set_count`](Self::set_count)), then [`commit`](Self::commit) the bytes
/// actually used.  A new reservation abandons an uncommitted one.
pub struct SendGuard<'a> {
    session: &'a Session,
    state: MutexGuard<'a, SendState>,
}

impl SendGuard<'_> {
    /// Reserves room for `header` and a payload of `header.payload_size`
    /// bytes, flushing or growing the buffer when needed.
    ///
    /// # Errors
    ///
    /// See [`ComposeError`].
    pub fn reserve(&mut self, header: Header) -> Result<(), ComposeError> {
        self.state.pending = None;
        let capacity = align8(header.payload_size as usize);
        let large = needs_large_header(capacity as u32, header.element_count);
        if large && !large_array_supported(self.session.minor_version()) {
            return Err(ComposeError::ArrayTooLargeForClient);
        }
        let hdr_len = header_size(large);
        let needed = hdr_len + capacity;
        if self.state.buf.remaining() < needed {
            self.seal();
            if self.state.buf.remaining() < needed {
                self.grow(needed)?;
            }
        }
        self.state.buf.space_mut()[hdr_len..needed].fill(0);
        self.state.pending = Some(Reservation {
            large,
            header: Header {
                payload_size: capacity as u32,
                ..header
            },
            capacity,
        });
        Ok(())
    }

    /// Payload region of the current reservation.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        let (hdr_len, capacity) = match self.state.pending {
            Some(res) => (header_size(res.large), res.capacity),
            None => return &mut [],
        };
        &mut self.state.buf.space_mut()[hdr_len..hdr_len + capacity]
    }

    /// Overwrites the `cid` slot of the reserved header (status of a reply).
    pub fn set_cid(&mut self, cid: u32) {
        if let Some(res) = self.state.pending.as_mut() {
            res.header.cid = cid;
        }
    }

    /// Overwrites the element count of the reserved header.
    pub fn set_count(&mut self, count: u32) {
        if let Some(res) = self.state.pending.as_mut() {
            res.header.element_count = count;
        }
    }

    /// Commits the reservation with `payload_len` bytes of payload.  The
    /// size may shrink but never grow past the reservation.
    pub fn commit(&mut self, payload_len: usize) {
        let Some(res) = self.state.pending.take() else {
            return;
        };
        let size = align8(payload_len).min(res.capacity);
        let used = payload_len.min(size);
        let hdr_len = header_size(res.large);
        let header = Header {
            payload_size: size as u32,
            ..res.header
        };
        let space = self.state.buf.space_mut();
        if let Err(e) = encode_header_form(&header, res.large, space) {
            error!("dropping reply with command {}: {e}", header.command);
            return;
        }
        space[hdr_len + used..hdr_len + size].fill(0);
        self.state.buf.fill(hdr_len + size);
    }

    /// Reserves room for `header` with a payload of `size` bytes.
    ///
    /// # Errors
    ///
    /// [`ComposeError::TooLarge`] when `size` cannot be carried in a message
    /// header at all, otherwise as [`SendGuard::reserve`].
    pub fn reserve_sized(&mut self, header: Header, size: usize) -> Result<(), ComposeError> {
        let too_large = || ComposeError::TooLarge {
            needed: size,
            max: self.max_message(),
        };
        u32::try_from(align8(size)).map_err(|_| too_large())?;
        let payload_size = u32::try_from(size).map_err(|_| too_large())?;
        self.reserve(header.with_payload_size(payload_size))
    }

    /// Composes a complete message in one step.
    pub fn push(&mut self, header: Header, payload: &[u8]) -> Result<(), ComposeError> {
        self.reserve(header.with_payload_size(payload.len() as u32))?;
        self.payload_mut()[..payload.len()].copy_from_slice(payload);
        self.commit(payload.len());
        Ok(())
    }

    /// Composes a message without payload.
    pub fn push_header(&mut self, header: Header) -> Result<(), ComposeError> {
        self.push(header, &[])
    }

    /// Sends an ERROR message echoing `request` with `status` and a
    /// diagnostic text.
    pub fn send_error(&mut self, request: &Header, status: u32, diagnostic: &str) {
        let cid = match request.kind() {
            Some(
                Command::EventAdd
                | Command::EventCancel
                | Command::Read
                | Command::ReadNotify
                | Command::Write
                | Command::WriteNotify,
            ) => self
                .session
                .registry
                .lookup(request.cid)
                .map_or(NO_ID, |chan| chan.cid()),
            Some(Command::Search) => request.cid,
            _ => NO_ID,
        };

        let large = needs_large_header(request.payload_size, request.element_count)
            && large_array_supported(self.session.minor_version());
        let echoed = if large {
            *request
        } else {
            Header {
                payload_size: request.payload_size.min(0xFFFE),
                element_count: request.element_count.min(0xFFFE),
                ..*request
            }
        };
        let mut echo = [0u8; LARGE_HEADER_SIZE];
        let echo_len = encode_header_form(&echoed, large, &mut echo).unwrap_or(0);

        let text = truncate_utf8(diagnostic, MAX_DIAGNOSTIC_LEN - 1);
        let mut payload = Vec::with_capacity(echo_len + text.len() + 1);
        payload.extend_from_slice(&echo[..echo_len]);
        payload.extend_from_slice(text.as_bytes());
        payload.push(0);

        let header = Header::new(Command::Error).with_cid(cid).with_available(status);
        if let Err(e) = self.push(header, &payload) {
            error!(
                "unable to deliver error \"{}\" to {}: {e}",
                status::message(status),
                self.session.peer()
            );
        }
    }

    /// Seals committed messages into a frame.
    pub fn seal(&mut self) {
        self.state.pending = None;
        let state = &mut *self.state;
        if state.udp {
            if state.buf.len() <= HEADER_SIZE {
                return;
            }
            let bytes = if sequence_numbers_supported(self.session.minor_version()) {
                let version = Header::new(Command::Version)
                    .with_data_type(SEQUENCE_NO_IS_VALID)
                    .with_element_count(u32::from(MINOR_PROTOCOL_REVISION))
                    .with_cid(state.seq_no);
                if let Err(e) = encode_header_into(&version, state.buf.committed_mut()) {
                    error!("sequence number header not written: {e}");
                }
                state.buf.committed().to_vec()
            } else {
                state.buf.committed()[HEADER_SIZE..].to_vec()
            };
            match state.reply_to {
                Some(dest) => state.frames.push_back(OutboundFrame {
                    dest: Some(dest),
                    bytes,
                }),
                None => warn!("discarding {} reply bytes without a destination", bytes.len()),
            }
            state.buf.reset();
            state.begin_batch();
        } else if !state.buf.is_empty() {
            let bytes = state.buf.committed().to_vec();
            self.session.backlog.fetch_add(bytes.len(), Ordering::Relaxed);
            state.frames.push_back(OutboundFrame { dest: None, bytes });
            state.buf.reset();
            self.session.wake();
        }
    }

    /// Removes every sealed frame, oldest first.
    pub fn take_frames(&mut self) -> Vec<OutboundFrame> {
        self.state.frames.drain(..).collect()
    }

    /// Destination of the batch being composed.
    pub fn reply_to(&self) -> Option<SocketAddr> {
        self.state.reply_to
    }

    pub fn set_reply_to(&mut self, dest: SocketAddr) {
        self.state.reply_to = Some(dest);
    }

    pub fn set_seq_no(&mut self, seq_no: u32) {
        self.state.seq_no = seq_no;
    }

    /// Whether the batch holds more than its leading VERSION header.
    pub fn has_replies(&self) -> bool {
        let floor = if self.state.udp { HEADER_SIZE } else { 0 };
        self.state.buf.len() > floor
    }

    /// Largest message the buffer can ever hold, for diagnostics.
    pub fn max_message(&self) -> usize {
        if self.state.udp {
            self.state.buf.capacity()
        } else {
            self.session.registry.large_buffer_size().unwrap_or(MAX_TCP)
        }
    }

    fn grow(&mut self, needed: usize) -> Result<(), ComposeError> {
        let registry = &self.session.registry;
        let large = match registry.large_buffer_size() {
            Some(size) if !self.state.udp && self.state.buf.class() == BufferClass::Small => size,
            _ => {
                return Err(ComposeError::TooLarge {
                    needed,
                    max: self.state.buf.capacity(),
                })
            }
        };
        if needed > large {
            return Err(ComposeError::TooLarge { needed, max: large });
        }
        let data = registry.acquire_large_buffer().map_err(ComposeError::Resource)?;
        let old = self.state.buf.expand(data, BufferClass::Large);
        registry.release_buffer(BufferClass::Small, old);
        Ok(())
    }
}

fn truncate_utf8(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

// ── Session ───────────────────────────────────────────────────────────────────

pub struct Session {
    id: u64,
    transport: Transport,
    /// Peer of a TCP circuit, local address of a UDP endpoint.
    peer: SocketAddr,
    created_at: Instant,
    minor_version: AtomicU16,
    priority: AtomicU16,
    identity: Mutex<Identity>,
    last_send: Mutex<Instant>,
    last_recv: Mutex<Instant>,
    send: Mutex<SendState>,
    channels: Mutex<ChannelLists>,
    put_replies: Mutex<VecDeque<Arc<Channel>>>,
    pending_events: Mutex<Vec<Arc<EventEntry>>>,
    flow_control: AtomicBool,
    closed: AtomicBool,
    backlog: AtomicUsize,
    backlog_limit: usize,
    recv_pending: AtomicUsize,
    wake: Notify,
    put_idle: Notify,
    last_search: Mutex<String>,
    registry: Arc<ResourceRegistry>,
    me: Weak<Session>,
}

impl Session {
    /// Creates a TCP session with a small send buffer from the pool.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError`] when no send buffer is available.
    pub fn tcp(
        registry: &Arc<ResourceRegistry>,
        peer: SocketAddr,
        backlog_limit: usize,
    ) -> Result<Arc<Session>, ResourceError> {
        let data = registry.acquire_small_buffer()?;
        let buf = MessageBuffer::new(data, BufferClass::Small);
        Ok(Self::build(registry, Transport::Tcp, peer, buf, backlog_limit))
    }

    /// Creates the discovery session of one UDP socket bound to `local`.
    pub fn udp(registry: &Arc<ResourceRegistry>, local: SocketAddr) -> Arc<Session> {
        Self::build(registry, Transport::Udp, local, MessageBuffer::udp_send(), usize::MAX)
    }

    fn build(
        registry: &Arc<ResourceRegistry>,
        transport: Transport,
        peer: SocketAddr,
        buf: MessageBuffer,
        backlog_limit: usize,
    ) -> Arc<Session> {
        let id = registry.next_session_id();
        let now = Instant::now();
        Arc::new_cyclic(|me| Session {
            id,
            transport,
            peer,
            created_at: now,
            minor_version: AtomicU16::new(0),
            priority: AtomicU16::new(0),
            identity: Mutex::new(Identity::default()),
            last_send: Mutex::new(now),
            last_recv: Mutex::new(now),
            send: Mutex::new(SendState::new(buf, transport)),
            channels: Mutex::new(ChannelLists::default()),
            put_replies: Mutex::new(VecDeque::new()),
            pending_events: Mutex::new(Vec::new()),
            flow_control: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            backlog: AtomicUsize::new(0),
            backlog_limit,
            recv_pending: AtomicUsize::new(0),
            wake: Notify::new(),
            put_idle: Notify::new(),
            last_search: Mutex::new(String::new()),
            registry: Arc::clone(registry),
            me: me.clone(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn is_tcp(&self) -> bool {
        self.transport == Transport::Tcp
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn weak(&self) -> Weak<Session> {
        self.me.clone()
    }

    pub fn registry(&self) -> &Arc<ResourceRegistry> {
        &self.registry
    }

    pub fn uptime(&self) -> Duration {
        self.created_at.elapsed()
    }

    // ── Negotiated parameters ─────────────────────────────────────────────────

    /// Minor protocol version of the peer; 0 until announced.
    pub fn minor_version(&self) -> u16 {
        self.minor_version.load(Ordering::Relaxed)
    }

    pub fn set_minor_version(&self, minor: u16) {
        self.minor_version.store(minor, Ordering::Relaxed);
    }

    pub fn priority(&self) -> u16 {
        self.priority.load(Ordering::Relaxed)
    }

    pub fn set_priority(&self, priority: u16) {
        self.priority.store(priority, Ordering::Relaxed);
    }

    pub fn identity(&self) -> Identity {
        lock(&self.identity).clone()
    }

    pub fn set_user(&self, user: &str) {
        lock(&self.identity).user = user.to_string();
    }

    pub fn set_host(&self, host: &str) {
        lock(&self.identity).host = host.to_string();
    }

    // ── Timestamps ────────────────────────────────────────────────────────────

    pub fn touch_send(&self) {
        *lock(&self.last_send) = Instant::now();
    }

    pub fn touch_recv(&self) {
        *lock(&self.last_recv) = Instant::now();
    }

    pub fn since_last_send(&self) -> Duration {
        lock(&self.last_send).elapsed()
    }

    pub fn since_last_recv(&self) -> Duration {
        lock(&self.last_recv).elapsed()
    }

    pub fn last_recv(&self) -> Instant {
        *lock(&self.last_recv)
    }

    // ── Send path ─────────────────────────────────────────────────────────────

    /// Takes the send lock.
    pub fn send(&self) -> SendGuard<'_> {
        SendGuard {
            session: self,
            state: lock(&self.send),
        }
    }

    /// Takes the send lock only if it is free.
    pub fn try_send(&self) -> Option<SendGuard<'_>> {
        let state = match self.send.try_lock() {
            Ok(state) => state,
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
            Err(TryLockError::WouldBlock) => return None,
        };
        Some(SendGuard { session: self, state })
    }

    /// Seals whatever is buffered.
    pub fn flush(&self) {
        self.send().seal();
    }

    /// Bytes composed but not yet sealed.
    pub fn undelivered_bytes(&self) -> usize {
        lock(&self.send).buf.len()
    }

    pub fn send_buffer_class(&self) -> BufferClass {
        lock(&self.send).buf.class()
    }

    /// Sealed bytes not yet written to the socket.
    pub fn backlog(&self) -> usize {
        self.backlog.load(Ordering::Relaxed)
    }

    pub fn backlog_exceeded(&self) -> bool {
        self.backlog() > self.backlog_limit
    }

    /// Records `n` bytes written to the socket.
    pub fn frames_written(&self, n: usize) {
        let _ = self
            .backlog
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |b| Some(b.saturating_sub(n)));
        self.touch_send();
    }

    /// Unprocessed request bytes, published by the reader for diagnostics.
    pub fn set_recv_pending(&self, n: usize) {
        self.recv_pending.store(n, Ordering::Relaxed);
    }

    pub fn recv_pending(&self) -> usize {
        self.recv_pending.load(Ordering::Relaxed)
    }

    // ── Channels ──────────────────────────────────────────────────────────────

    /// Takes the channel-list lock.
    pub fn channels(&self) -> MutexGuard<'_, ChannelLists> {
        lock(&self.channels)
    }

    pub fn channel_count(&self) -> usize {
        self.channels().len()
    }

    // ── Outbound labor ────────────────────────────────────────────────────────

    /// Asks the outbound worker to run.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Resolves once [`wake`](Self::wake) was called.
    pub async fn work_signalled(&self) {
        self.wake.notified().await;
    }

    pub fn set_flow_control(&self, on: bool) {
        self.flow_control.store(on, Ordering::Relaxed);
    }

    pub fn is_flow_controlled(&self) -> bool {
        self.flow_control.load(Ordering::Relaxed)
    }

    pub fn queue_event(&self, entry: Arc<EventEntry>) {
        lock(&self.pending_events).push(entry);
    }

    pub fn take_pending_events(&self) -> Vec<Arc<EventEntry>> {
        std::mem::take(&mut *lock(&self.pending_events))
    }

    pub fn pending_event_count(&self) -> usize {
        lock(&self.pending_events).len()
    }

    pub fn queue_put_reply(&self, chan: Arc<Channel>) {
        lock(&self.put_replies).push_back(chan);
    }

    pub fn take_put_replies(&self) -> Vec<Arc<Channel>> {
        lock(&self.put_replies).drain(..).collect()
    }

    /// Signals the reader that a put completed.
    pub fn notify_put_idle(&self) {
        self.put_idle.notify_one();
    }

    /// Resolves once [`notify_put_idle`](Self::notify_put_idle) was called.
    pub async fn put_idle(&self) {
        self.put_idle.notified().await;
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.wake();
        self.notify_put_idle();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns the send buffer to its pool.
    pub fn release_buffers(&self) {
        let mut state = lock(&self.send);
        let class = state.buf.class();
        let data = state.buf.take_allocation();
        self.registry.release_buffer(class, data);
    }

    // ── Discovery ─────────────────────────────────────────────────────────────

    pub fn set_last_search(&self, name: &str) {
        let mut last = lock(&self.last_search);
        last.clear();
        last.push_str(name);
    }

    pub fn last_search(&self) -> String {
        lock(&self.last_search).clone()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("transport", &self.transport)
            .field("peer", &self.peer)
            .field("minor_version", &self.minor_version())
            .finish()
    }
}
