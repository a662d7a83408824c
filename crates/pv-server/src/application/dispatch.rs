//! Request decoding and the per-command handlers.
//!
//! [`process_messages`] walks the unread bytes of a receive buffer, frames
//! complete messages and calls the handler registered for each command.
//! TCP and UDP have separate handler tables; on UDP only VERSION and SEARCH
//! do anything.
//!
//! # Handler results (for beginners)
//!
//! A handler returns `Ok(Flow::Continue)` to go on with the next message
//! and `Err(..)` when the session (TCP) or the rest of the datagram (UDP)
//! must be abandoned.  Errors the client should hear about are sent as ERROR
//! replies *before* returning, so an `Err` only decides what happens to the
//! connection.
//!
//! WRITE_NOTIFY is the one request that can wait: when the channel already
//! has a put in flight the handler returns [`Flow::Park`] and the TCP reader
//! waits for the put to finish before [`start_put`] is called.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use pv_core::protocol::codec::{decode_monitor_request, read_name};
use pv_core::protocol::{
    large_array_supported, sequence_numbers_supported, status, version_supported, Command, Header,
    DO_REPLY, HEADER_SIZE, MAX_NAME_LEN, MAX_PRIORITY, MINOR_PROTOCOL_REVISION, NO_ID,
};
use pv_core::{decode_header, ChannelEvent, ChannelState, ProtocolError, TransitionError};
use thiserror::Error;
use tracing::{debug, error, trace, warn};

use super::channel::{Channel, ChannelInit};
use super::context::ServerContext;
use super::data_source::{dbr, DataSourceError, PutCompletion};
use super::events::{compose_read_reply, EventInit};
use super::message_buffer::{BufferClass, MessageBuffer};
use super::registry::ResourceError;
use super::session::Session;

/// Everything a handler needs to know about where a request came from.
pub struct Request<'a> {
    pub ctx: &'a ServerContext,
    pub session: &'a Arc<Session>,
    /// Sender of the request; the datagram source on UDP.
    pub peer: SocketAddr,
}

/// A WRITE_NOTIFY waiting for the previous put on its channel.
#[derive(Debug)]
pub struct ParkedPut {
    pub channel: Arc<Channel>,
    pub request: Header,
    pub payload: Vec<u8>,
}

/// What the reader does after a handler returns.
#[derive(Debug)]
pub enum Flow {
    Continue,
    Park(ParkedPut),
}

/// Why [`process_messages`] stopped.
#[derive(Debug)]
pub enum Outcome {
    /// Every complete message was handled; more bytes are needed.
    NeedMore,
    /// A put must wait; the remaining bytes stay unread.
    Parked(ParkedPut),
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unsupported protocol minor version {0}")]
    UnsupportedVersion(u16),

    #[error("priority {0} out of range")]
    BadPriority(u16),

    #[error("unknown or foreign server id {0}")]
    BadResourceId(u32),

    #[error("invalid request code {0}")]
    BadCommand(u16),

    #[error("invalid transfer type {0}")]
    BadType(u16),

    #[error("bad name: {0}")]
    BadName(String),

    #[error("resources exhausted: {0}")]
    Resource(#[from] ResourceError),

    #[error("too few free resources to advertise '{0}'")]
    CannotAdvertise(String),

    #[error("channel {sid} in unexpected state: {source}")]
    Transition {
        sid: u32,
        #[source]
        source: TransitionError,
    },

    #[error("misaligned message of {0} bytes")]
    Misaligned(usize),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("unknown subscription {0}")]
    BadMonitorId(u32),

    #[error("put rejected: {0}")]
    Put(#[from] DataSourceError),
}

type Handler = fn(&Request<'_>, &Header, &[u8]) -> Result<Flow, DispatchError>;

const TCP_HANDLERS: [Handler; 28] = [
    tcp_version,   // 0 VERSION
    event_add,     // 1 EVENT_ADD
    event_cancel,  // 2 EVENT_CANCEL
    read,          // 3 READ
    write,         // 4 WRITE
    bad_tcp_cmd,   // 5 SNAPSHOT
    search_tcp,    // 6 SEARCH
    bad_tcp_cmd,   // 7 BUILD
    events_off,    // 8 EVENTS_OFF
    events_on,     // 9 EVENTS_ON
    read_sync,     // 10 READ_SYNC
    bad_tcp_cmd,   // 11 ERROR
    clear_channel, // 12 CLEAR_CHANNEL
    bad_tcp_cmd,   // 13 RSRV_IS_UP
    bad_tcp_cmd,   // 14 NOT_FOUND
    read_notify,   // 15 READ_NOTIFY
    bad_tcp_cmd,   // 16 READ_BUILD
    bad_tcp_cmd,   // 17 REPEATER_CONFIRM
    create_channel, // 18 CREATE_CHAN
    write_notify,  // 19 WRITE_NOTIFY
    client_name,   // 20 CLIENT_NAME
    host_name,     // 21 HOST_NAME
    bad_tcp_cmd,   // 22 ACCESS_RIGHTS
    echo,          // 23 ECHO
    bad_tcp_cmd,   // 24 REPEATER_REGISTER
    bad_tcp_cmd,   // 25 SIGNAL
    bad_tcp_cmd,   // 26 CREATE_CH_FAIL
    bad_tcp_cmd,   // 27 SERVER_DISCONN
];

const UDP_HANDLERS: [Handler; 28] = {
    let mut table: [Handler; 28] = [bad_udp_cmd as Handler; 28];
    table[Command::Version as usize] = udp_version;
    table[Command::Search as usize] = search_udp;
    table
};

// ── Framing loop ──────────────────────────────────────────────────────────────

/// Handles every complete message in `buf`.
///
/// `drain` counts bytes of an oversized or refused message that are still
/// to be skipped; it carries over between calls.
///
/// # Errors
///
/// Returns the first handler or framing error; the caller drops the TCP
/// session or the rest of the datagram.
pub fn process_messages(
    req: &Request<'_>,
    buf: &mut MessageBuffer,
    drain: &mut usize,
) -> Result<Outcome, DispatchError> {
    if *drain > 0 {
        let unread = buf.unread_len();
        if *drain >= unread {
            *drain -= unread;
            buf.advance(unread);
            return Ok(Outcome::NeedMore);
        }
        buf.advance(*drain);
        *drain = 0;
    }

    let tcp = req.session.is_tcp();
    loop {
        let left = buf.unread_len();
        if left < HEADER_SIZE {
            return Ok(Outcome::NeedMore);
        }
        let minor = req.session.minor_version();
        let (header, hdr_len) = match decode_header(buf.unread(), large_array_supported(minor)) {
            Ok(decoded) => decoded,
            Err(ProtocolError::InsufficientData { .. }) => return Ok(Outcome::NeedMore),
            Err(e) => return Err(e.into()),
        };
        let msg_size = hdr_len + header.payload_size as usize;

        if header.command != Command::Version as u16 && !version_supported(minor) {
            if !tcp {
                return Err(DispatchError::UnsupportedVersion(minor));
            }
            // The connection stays open so the client does not reconnect in a loop.
            req.session.send().send_error(
                &header,
                status::DEFUNCT,
                &format!("CAS: Client version {minor} too old"),
            );
            log_header("client version too old", req, &header);
            *drain = msg_size.saturating_sub(left);
            buf.advance(left);
            return Ok(Outcome::NeedMore);
        }

        if msg_size % 8 != 0 {
            if tcp {
                req.session
                    .send()
                    .send_error(&header, status::INTERNAL, "CAS: Missaligned protocol rejected");
                log_header("misaligned protocol rejected", req, &header);
            }
            return Err(DispatchError::Misaligned(msg_size));
        }

        if msg_size > buf.capacity() {
            expand_receive_buffer(req.session, buf, msg_size);
            if msg_size > buf.capacity() {
                if tcp {
                    let max = req.session.registry().large_buffer_size().unwrap_or(buf.capacity());
                    req.session.send().send_error(
                        &header,
                        status::TOLARGE,
                        &format!("CAS: Server unable to load large request message. Max bytes={max}"),
                    );
                    log_header("server unable to load large request message", req, &header);
                }
                *drain = msg_size - left;
                buf.advance(left);
                return Ok(Outcome::NeedMore);
            }
        }

        if msg_size > left {
            return Ok(Outcome::NeedMore);
        }

        trace!(
            peer = %req.peer,
            command = header.command,
            size = header.payload_size,
            "request"
        );
        let table = if tcp { &TCP_HANDLERS } else { &UDP_HANDLERS };
        let flow = match table.get(usize::from(header.command)) {
            Some(handler) => handler(req, &header, &buf.unread()[hdr_len..msg_size])?,
            None if tcp => return bad_tcp_cmd(req, &header, &[]).map(|_| Outcome::NeedMore),
            None => return Err(DispatchError::BadCommand(header.command)),
        };
        buf.advance(msg_size);
        if let Flow::Park(parked) = flow {
            return Ok(Outcome::Parked(parked));
        }
    }
}

fn expand_receive_buffer(session: &Session, buf: &mut MessageBuffer, needed: usize) {
    if buf.class() != BufferClass::Small {
        return;
    }
    let registry = session.registry();
    match registry.large_buffer_size() {
        Some(size) if size >= needed => match registry.acquire_large_buffer() {
            Ok(data) => {
                let old = buf.expand(data, BufferClass::Large);
                registry.release_buffer(BufferClass::Small, old);
            }
            Err(e) => warn!(peer = %session.peer(), "no large receive buffer: {e}"),
        },
        _ => {}
    }
}

fn log_header(context: &str, req: &Request<'_>, h: &Header) {
    warn!(
        "{context}: peer={} cmd={} size={} type={} count={} cid={} available={}",
        req.peer, h.command, h.payload_size, h.data_type, h.element_count, h.cid, h.available
    );
}

// ── Lookups ───────────────────────────────────────────────────────────────────

/// The channel named by the request's `cid` slot, if it belongs to this
/// session.
fn owned_channel(req: &Request<'_>, h: &Header) -> Option<Arc<Channel>> {
    req.ctx
        .registry()
        .lookup(h.cid)
        .filter(|chan| chan.is_owned_by(req.session))
}

fn bad_resource_id(req: &Request<'_>, h: &Header) -> DispatchError {
    log_header("bad resource id", req, h);
    req.session.send().send_error(h, status::INTERNAL, "Bad Resource ID");
    DispatchError::BadResourceId(h.cid)
}

// ── Generic commands ──────────────────────────────────────────────────────────

fn bad_tcp_cmd(req: &Request<'_>, h: &Header, _payload: &[u8]) -> Result<Flow, DispatchError> {
    let text = "CAS: invalid (damaged?) request code from TCP";
    log_header(text, req, h);
    req.session.send().send_error(h, status::INTERNAL, text);
    Err(DispatchError::BadCommand(h.command))
}

fn bad_udp_cmd(_req: &Request<'_>, h: &Header, _payload: &[u8]) -> Result<Flow, DispatchError> {
    Err(DispatchError::BadCommand(h.command))
}

fn tcp_version(req: &Request<'_>, h: &Header, _payload: &[u8]) -> Result<Flow, DispatchError> {
    let minor = h.element_count as u16;
    if !version_supported(minor) {
        return Err(DispatchError::UnsupportedVersion(minor));
    }
    if h.data_type > MAX_PRIORITY {
        return Err(DispatchError::BadPriority(h.data_type));
    }
    req.session.set_minor_version(minor);
    req.session.set_priority(h.data_type);
    Ok(Flow::Continue)
}

fn udp_version(req: &Request<'_>, h: &Header, _payload: &[u8]) -> Result<Flow, DispatchError> {
    let minor = h.element_count as u16;
    if !version_supported(minor) {
        return Err(DispatchError::UnsupportedVersion(minor));
    }
    req.session.set_minor_version(minor);
    let seq_no = if sequence_numbers_supported(minor) { h.cid } else { 0 };
    req.session.send().set_seq_no(seq_no);
    Ok(Flow::Continue)
}

fn echo(req: &Request<'_>, h: &Header, payload: &[u8]) -> Result<Flow, DispatchError> {
    if let Err(e) = req.session.send().push(*h, payload) {
        warn!(peer = %req.peer, "echo reply dropped: {e}");
    }
    Ok(Flow::Continue)
}

fn read_sync(req: &Request<'_>, h: &Header, _payload: &[u8]) -> Result<Flow, DispatchError> {
    if let Err(e) = req.session.send().push_header(*h) {
        warn!(peer = %req.peer, "read sync reply dropped: {e}");
    }
    Ok(Flow::Continue)
}

fn events_on(req: &Request<'_>, _h: &Header, _payload: &[u8]) -> Result<Flow, DispatchError> {
    req.session.set_flow_control(false);
    req.session.wake();
    Ok(Flow::Continue)
}

fn events_off(req: &Request<'_>, _h: &Header, _payload: &[u8]) -> Result<Flow, DispatchError> {
    req.session.set_flow_control(true);
    Ok(Flow::Continue)
}

fn host_name(req: &Request<'_>, h: &Header, payload: &[u8]) -> Result<Flow, DispatchError> {
    let Some(name) = identity_text(
        req,
        h,
        payload,
        "attempts to use protocol to set host name after creating first channel ignored by server",
        "bad (very long) host name",
    )?
    else {
        return Ok(Flow::Continue);
    };
    debug!(peer = %req.peer, host = %name, "client host name");
    req.session.set_host(&name);
    Ok(Flow::Continue)
}

fn client_name(req: &Request<'_>, h: &Header, payload: &[u8]) -> Result<Flow, DispatchError> {
    let Some(name) = identity_text(
        req,
        h,
        payload,
        "attempts to use protocol to set user name after creating first channel ignored by server",
        "a very long user name was specified",
    )?
    else {
        return Ok(Flow::Continue);
    };
    debug!(peer = %req.peer, user = %name, "client user name");
    req.session.set_user(&name);
    Ok(Flow::Continue)
}

/// Validates a HOST_NAME or CLIENT_NAME payload.  `Ok(None)` means the
/// request was refused with an error reply but the session goes on.
fn identity_text(
    req: &Request<'_>,
    h: &Header,
    payload: &[u8],
    too_late: &str,
    too_long: &str,
) -> Result<Option<String>, DispatchError> {
    if req.session.channel_count() > 0 {
        req.session.send().send_error(h, status::INTERNAL, too_late);
        return Ok(None);
    }
    let len = payload
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(payload.len().saturating_sub(1));
    if payload.is_empty() || len + 1 > MAX_NAME_LEN {
        log_header(too_long, req, h);
        req.session.send().send_error(h, status::INTERNAL, too_long);
        return Err(DispatchError::BadName(too_long.to_string()));
    }
    Ok(Some(String::from_utf8_lossy(&payload[..len]).into_owned()))
}

// ── Discovery ─────────────────────────────────────────────────────────────────

fn search_tcp(req: &Request<'_>, h: &Header, payload: &[u8]) -> Result<Flow, DispatchError> {
    let minor = h.element_count as u16;
    if !version_supported(minor) {
        return Err(DispatchError::UnsupportedVersion(minor));
    }
    if payload.len() <= 1 {
        return Ok(Flow::Continue);
    }
    let name = read_name(payload)?;

    let mut tx = req.session.send();
    if req.ctx.source().resolve(name).is_none() {
        if h.data_type == DO_REPLY {
            let reply = Header {
                command: Command::NotFound as u16,
                payload_size: 0,
                ..*h
            };
            if let Err(e) = tx.push_header(reply) {
                warn!(peer = %req.peer, "not-found reply dropped: {e}");
            }
        }
        return Ok(Flow::Continue);
    }
    if !req.ctx.registry().can_advertise() {
        tx.send_error(h, status::ALLOCMEM, "Server memory exhausted");
        return Ok(Flow::Continue);
    }
    let reply = Header::new(Command::Search)
        .with_data_type(req.ctx.server_port())
        .with_cid(NO_ID)
        .with_available(h.available);
    if let Err(e) = tx.push_header(reply) {
        warn!(peer = %req.peer, "search reply dropped: {e}");
    }
    Ok(Flow::Continue)
}

/// A UDP search hit creates a provisional channel owned by the discovery
/// session; a later CREATE_CHAN from the same host adopts it.
fn search_udp(req: &Request<'_>, h: &Header, payload: &[u8]) -> Result<Flow, DispatchError> {
    let minor = h.element_count as u16;
    if !version_supported(minor) {
        return Err(DispatchError::UnsupportedVersion(minor));
    }
    if payload.len() <= 1 {
        debug!(peer = %req.peer, "empty name in UDP search request");
        return Ok(Flow::Continue);
    }
    let name = read_name(payload)?;
    req.session.set_last_search(name);

    let Some(point) = req.ctx.source().resolve(name) else {
        return Ok(Flow::Continue);
    };
    if !req.ctx.registry().can_advertise() {
        return Err(DispatchError::CannotAdvertise(name.to_string()));
    }
    let chan = req.ctx.registry().create_channel(ChannelInit {
        cid: h.cid,
        name: name.to_string(),
        point,
        rights: pv_core::AccessRights::NONE,
        origin: Some(req.peer),
        session: req.session.weak(),
    })?;
    let sid = chan.sid();
    req.session.channels().insert(chan);

    let reply = Header::new(Command::Search)
        .with_data_type(req.ctx.server_port())
        .with_cid(sid)
        .with_available(h.available);
    if let Err(e) = req
        .session
        .send()
        .push(reply, &MINOR_PROTOCOL_REVISION.to_be_bytes())
    {
        warn!(peer = %req.peer, "search reply dropped: {e}");
    }
    Ok(Flow::Continue)
}

// ── Channels ──────────────────────────────────────────────────────────────────

fn create_channel(req: &Request<'_>, h: &Header, payload: &[u8]) -> Result<Flow, DispatchError> {
    let minor = h.available as u16;
    if !version_supported(minor) {
        return Err(DispatchError::UnsupportedVersion(minor));
    }
    req.session.set_minor_version(minor);
    if payload.len() <= 1 {
        log_header("empty name in create channel request", req, h);
        return Ok(Flow::Continue);
    }
    let name = read_name(payload)?;

    let identity = req.session.identity();
    let rights = req.ctx.access().rights(name, &identity.user, &identity.host);

    let chan = match req.ctx.adopt_provisional(name, req.peer.ip()) {
        Some(chan) => {
            trace!(sid = chan.sid(), name, "provisional channel adopted");
            chan.set_cid(h.cid);
            chan.set_rights(rights);
            chan.set_session(req.session.weak());
            chan
        }
        None => {
            let Some(point) = req.ctx.source().resolve(name) else {
                let reply = Header::new(Command::CreateChanFail).with_cid(h.cid);
                if let Err(e) = req.session.send().push_header(reply) {
                    warn!(peer = %req.peer, "create-channel failure reply dropped: {e}");
                }
                return Ok(Flow::Continue);
            };
            let created = req.ctx.registry().create_channel(ChannelInit {
                cid: h.cid,
                name: name.to_string(),
                point,
                rights,
                origin: None,
                session: req.session.weak(),
            });
            match created {
                Ok(chan) => chan,
                Err(e) => {
                    warn!(peer = %req.peer, name, "no memory to create new channel: {e}");
                    req.session.send().send_error(h, status::ALLOCMEM, name);
                    return Err(e.into());
                }
            }
        }
    };

    if req.ctx.access().is_active() {
        let mut lists = req.session.channels();
        chan.transition(ChannelEvent::RightsChanged)
            .map_err(|source| DispatchError::Transition { sid: chan.sid(), source })?;
        lists.insert(chan);
        drop(lists);
        req.session.wake();
    } else {
        {
            let mut lists = req.session.channels();
            chan.transition(ChannelEvent::ConnectReplySent)
                .map_err(|source| DispatchError::Transition { sid: chan.sid(), source })?;
            lists.insert(Arc::clone(&chan));
        }
        claim_reply(req.session, &chan);
    }
    Ok(Flow::Continue)
}

/// ACCESS_RIGHTS followed by CREATE_CHAN.
pub(crate) fn claim_reply(session: &Session, chan: &Channel) {
    let mut tx = session.send();
    let rights = Header::new(Command::AccessRights)
        .with_cid(chan.cid())
        .with_available(chan.effective_rights().0);
    if let Err(e) = tx.push_header(rights) {
        error!(peer = %session.peer(), "access rights reply dropped: {e}");
        return;
    }
    let mut count = chan.point().element_count();
    if count >= 0xFFFF && !large_array_supported(session.minor_version()) {
        count = 0xFFFE;
    }
    let created = Header::new(Command::CreateChan)
        .with_data_type(chan.point().native_type())
        .with_element_count(count)
        .with_cid(chan.cid())
        .with_available(chan.sid());
    if let Err(e) = tx.push_header(created) {
        error!(peer = %session.peer(), "create channel reply dropped: {e}");
    }
}

pub(crate) fn access_rights_reply(session: &Session, chan: &Channel) {
    let reply = Header::new(Command::AccessRights)
        .with_cid(chan.cid())
        .with_available(chan.effective_rights().0);
    if let Err(e) = session.send().push_header(reply) {
        error!(peer = %session.peer(), "access rights reply dropped: {e}");
    }
}

fn clear_channel(req: &Request<'_>, h: &Header, _payload: &[u8]) -> Result<Flow, DispatchError> {
    let Some(chan) = owned_channel(req, h) else {
        return Err(bad_resource_id(req, h));
    };
    req.ctx.release_channel_resources(&chan);

    let reply = Header::new(Command::ClearChannel)
        .with_data_type(h.data_type)
        .with_element_count(h.element_count)
        .with_cid(h.cid)
        .with_available(h.available);
    if let Err(e) = req.session.send().push_header(reply) {
        warn!(peer = %req.peer, "clear channel reply dropped: {e}");
    }

    if let Err(source) = req.ctx.detach_channel(req.session, &chan) {
        req.session.send().send_error(
            h,
            status::INTERNAL,
            "channel was in strange state or corrupted during cleanup",
        );
        return Err(DispatchError::Transition { sid: chan.sid(), source });
    }
    if let Err(e) = req.ctx.registry().release_channel(chan) {
        warn!(peer = %req.peer, "bad resource id during channel clear: {e}");
        return Err(bad_resource_id(req, h));
    }
    Ok(Flow::Continue)
}

// ── Reads and writes ──────────────────────────────────────────────────────────

fn read(req: &Request<'_>, h: &Header, _payload: &[u8]) -> Result<Flow, DispatchError> {
    let Some(chan) = owned_channel(req, h) else {
        return Err(bad_resource_id(req, h));
    };
    let mut tx = req.session.send();
    if !dbr::is_valid(h.data_type) {
        tx.send_error(h, status::BADTYPE, chan.name());
        return Err(DispatchError::BadType(h.data_type));
    }
    let size = dbr::payload_size(h.data_type, h.element_count).unwrap_or(usize::MAX);
    let header = Header {
        cid: chan.cid(),
        ..*h
    };
    if let Err(e) = tx.reserve_sized(header, size) {
        let text = format!(
            "server unable to load read response into protocol buffer PV=\"{}\" max bytes={}",
            chan.name(),
            tx.max_message()
        );
        tx.send_error(h, e.status(), &text);
        return Ok(Flow::Continue);
    }
    if !chan.can_read() {
        tx.send_error(h, status::NORDACCESS, chan.name());
        return Ok(Flow::Continue);
    }
    let bytes = match chan.point().read(h.data_type, h.element_count) {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!(name = chan.name(), "read failed: {e}");
            tx.send_error(h, status::GETFAIL, chan.name());
            return Ok(Flow::Continue);
        }
    };
    let payload = tx.payload_mut();
    let n = bytes.len().min(payload.len());
    payload[..n].copy_from_slice(&bytes[..n]);
    if h.data_type == dbr::STRING && h.element_count == 1 {
        let len = payload[..n].iter().position(|&b| b == 0).unwrap_or(n);
        tx.commit(len + 1);
    } else {
        tx.commit(size);
    }
    Ok(Flow::Continue)
}

fn read_notify(req: &Request<'_>, h: &Header, _payload: &[u8]) -> Result<Flow, DispatchError> {
    let Some(chan) = owned_channel(req, h) else {
        return Err(bad_resource_id(req, h));
    };
    if !dbr::is_valid(h.data_type) {
        log_header("bad read notify data type", req, h);
        return Err(DispatchError::BadType(h.data_type));
    }
    compose_read_reply(&mut req.session.send(), &chan, h);
    Ok(Flow::Continue)
}

fn write(req: &Request<'_>, h: &Header, payload: &[u8]) -> Result<Flow, DispatchError> {
    let Some(chan) = owned_channel(req, h) else {
        return Err(bad_resource_id(req, h));
    };
    if !chan.can_write() {
        req.session.send().send_error(h, status::NOWTACCESS, chan.name());
        return Ok(Flow::Continue);
    }
    if !dbr::is_valid(h.data_type) {
        log_header("invalid data type", req, h);
        req.session.send().send_error(h, status::BADTYPE, chan.name());
        return Err(DispatchError::BadType(h.data_type));
    }
    match chan.point().write(h.data_type, h.element_count, payload) {
        Ok(()) => Ok(Flow::Continue),
        Err(e @ (DataSourceError::Conversion(_) | DataSourceError::BadType(_))) => {
            log_header("invalid data type", req, h);
            req.session.send().send_error(h, e.put_status(), chan.name());
            Err(e.into())
        }
        Err(e) => {
            debug!(name = chan.name(), "put failed: {e}");
            req.session.send().send_error(h, status::PUTFAIL, chan.name());
            Ok(Flow::Continue)
        }
    }
}

// ── Put notify ────────────────────────────────────────────────────────────────

fn write_notify(req: &Request<'_>, h: &Header, payload: &[u8]) -> Result<Flow, DispatchError> {
    let Some(chan) = owned_channel(req, h) else {
        return Err(bad_resource_id(req, h));
    };
    if !dbr::is_valid(h.data_type) {
        log_header("bad put notify data type", req, h);
        put_notify_reply(req.session, h, status::BADTYPE);
        return Err(DispatchError::BadType(h.data_type));
    }
    if !chan.can_write() {
        put_notify_reply(req.session, h, status::NOWTACCESS);
        return Ok(Flow::Continue);
    }
    if chan.put_busy() {
        return Ok(Flow::Park(ParkedPut {
            channel: chan,
            request: *h,
            payload: payload.to_vec(),
        }));
    }
    start_put(req, &chan, h, payload)
}

/// Hands a WRITE_NOTIFY to the data point.  The completion reply is sent by
/// the outbound worker.
pub fn start_put(
    req: &Request<'_>,
    chan: &Arc<Channel>,
    h: &Header,
    payload: &[u8],
) -> Result<Flow, DispatchError> {
    let generation = {
        let mut slot = chan.put_notify();
        let record = match slot.take() {
            Some(record) => slot.insert(record),
            None => match req.ctx.registry().acquire_put_notify() {
                Ok(record) => slot.insert(record),
                Err(e) => {
                    drop(slot);
                    log_header("no memory to initiate put notify", req, h);
                    put_notify_reply(req.session, h, status::ALLOCMEM);
                    return Err(e.into());
                }
            },
        };
        record.busy = true;
        record.queued = false;
        record.request = *h;
        record.status = status::NORMAL;
        record.generation = record.generation.wrapping_add(1);
        record.generation
    };

    let weak = Arc::downgrade(chan);
    let done: PutCompletion = Box::new(move |result| put_completed(&weak, generation, result));
    chan.point().write_notify(h.data_type, h.element_count, payload, done);
    Ok(Flow::Continue)
}

fn put_completed(chan: &Weak<Channel>, generation: u64, result: Result<(), DataSourceError>) {
    let Some(chan) = chan.upgrade() else {
        return;
    };
    {
        let mut slot = chan.put_notify();
        let Some(record) = slot.as_mut() else {
            return;
        };
        if record.generation != generation || !record.busy || record.queued {
            return;
        }
        record.queued = true;
        record.status = match result {
            Ok(()) => status::NORMAL,
            Err(e) => {
                debug!(name = chan.name(), "put notify failed: {e}");
                status::PUTFAIL
            }
        };
    }
    if let Some(session) = chan.session() {
        session.queue_put_reply(Arc::clone(&chan));
        session.wake();
    }
}

/// Gives up on a put that did not complete in time and tells the client.
/// A late completion of it is ignored.
pub fn abandon_put(session: &Session, chan: &Channel) {
    let stale = {
        let mut slot = chan.put_notify();
        match slot.as_mut() {
            Some(record) if record.busy => {
                record.busy = false;
                record.queued = false;
                record.generation = record.generation.wrapping_add(1);
                Some(record.request)
            }
            _ => None,
        }
    };
    if let Some(request) = stale {
        warn!(peer = %session.peer(), name = chan.name(), "put callback time out");
        put_notify_reply(session, &request, status::PUTCBINPROG);
    }
}

/// WRITE_NOTIFY reply; the status travels in the `cid` slot.
fn put_notify_reply(session: &Session, request: &Header, status: u32) {
    let reply = Header::new(Command::WriteNotify)
        .with_data_type(request.data_type)
        .with_element_count(request.element_count)
        .with_cid(status)
        .with_available(request.available);
    if let Err(e) = session.send().push_header(reply) {
        error!(peer = %session.peer(), "put notify reply dropped: {e}");
    }
}

// ── Subscriptions ─────────────────────────────────────────────────────────────

fn event_add(req: &Request<'_>, h: &Header, payload: &[u8]) -> Result<Flow, DispatchError> {
    let Some(chan) = owned_channel(req, h) else {
        return Err(bad_resource_id(req, h));
    };
    if !dbr::is_valid(h.data_type) {
        log_header("bad event add data type", req, h);
        return Err(DispatchError::BadType(h.data_type));
    }
    let monitor = decode_monitor_request(payload)?;

    let created = req.ctx.registry().create_event(EventInit {
        request: *h,
        mask: monitor.mask,
        channel: Arc::downgrade(&chan),
        session: req.session.weak(),
    });
    let entry = match created {
        Ok(entry) => entry,
        Err(e) => {
            log_header("no memory to add subscription", req, h);
            req.session.send().send_error(h, status::ALLOCMEM, chan.name());
            return Err(e.into());
        }
    };

    chan.add_event(Arc::clone(&entry));
    let id = chan.point().subscribe(monitor.mask, entry.listener());
    entry.set_subscription(id);
    entry.post(true);
    entry.set_enabled(chan.can_read());
    Ok(Flow::Continue)
}

fn event_cancel(req: &Request<'_>, h: &Header, _payload: &[u8]) -> Result<Flow, DispatchError> {
    let Some(chan) = owned_channel(req, h) else {
        return Err(bad_resource_id(req, h));
    };
    let Some(entry) = chan.remove_event(h.available) else {
        req.session.send().send_error(h, status::BADMONID, chan.name());
        return Err(DispatchError::BadMonitorId(h.available));
    };
    entry.cancel(&chan);
    if let Err(e) = req.session.send().push_header(*entry.template()) {
        warn!(peer = %req.peer, "event cancel reply dropped: {e}");
    }
    req.ctx.registry().release_event(entry);
    Ok(Flow::Continue)
}

// ── Outbound labor ────────────────────────────────────────────────────────────

/// Work done by a session's outbound worker each time it is woken:
/// completed puts, pending access-rights updates, then deferred
/// subscription updates.  Leaves everything sealed.
pub fn outbound_labor(session: &Session) {
    let completed = session.take_put_replies();
    if !completed.is_empty() {
        for chan in completed {
            let reply = {
                let mut slot = chan.put_notify();
                match slot.as_mut() {
                    Some(record) if record.queued => {
                        record.queued = false;
                        record.busy = false;
                        Some((record.request, record.status))
                    }
                    _ => None,
                }
            };
            if let Some((request, status)) = reply {
                put_notify_reply(session, &request, status);
            }
        }
        session.notify_put_idle();
    }

    send_access_rights_updates(session);

    if !session.is_flow_controlled() && !session.backlog_exceeded() {
        let pending = session.take_pending_events();
        if !pending.is_empty() {
            let mut tx = session.send();
            for entry in pending {
                entry.deliver(&mut tx);
            }
        }
    }
    session.flush();
}

fn send_access_rights_updates(session: &Session) {
    let mut lists = session.channels();
    for chan in lists.take_pending_access_update() {
        match chan.state() {
            ChannelState::PendConnectRespUpdatePendAR => claim_reply(session, &chan),
            ChannelState::InServiceUpdatePendAR => access_rights_reply(session, &chan),
            other => warn!(sid = chan.sid(), "unexpected state {other:?} awaiting rights update"),
        }
        if let Err(e) = chan.transition(ChannelEvent::UpdateCompleted) {
            error!(sid = chan.sid(), "{e}");
        }
        lists.insert(chan);
    }
}
