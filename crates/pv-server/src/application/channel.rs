//! Channel records: one session bound to one named data point.
//!
//! Records are pooled by the [`ResourceRegistry`](super::registry::ResourceRegistry).
//! A record is bound to a server id and a point when it leaves the pool and
//! scrubbed when it returns.  While bound it is shared as `Arc<Channel>` by
//! the registry's id table and by exactly one of its session's two lists.
//!
//! The state lives in an atomic so that readers (the report, the dispatcher)
//! never need the channel-list lock, but every state change goes through
//! [`Channel::transition`] while that lock is held.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use pv_core::protocol::{Header, NO_ID};
use pv_core::{AccessRights, ChannelEvent, ChannelState, TransitionError};

use super::data_source::{DataPoint, DetachedPoint};
use super::events::EventEntry;
use super::lock;
use super::pool::Recycle;
use super::session::Session;

// ── Put notify ────────────────────────────────────────────────────────────────

/// The single outstanding WRITE_NOTIFY of a channel.
#[derive(Debug, Default)]
pub struct PutNotify {
    /// A put was handed to the data point and has not been answered yet.
    pub busy: bool,
    /// The completion was queued for the outbound worker.
    pub queued: bool,
    /// Request header of the put being served.
    pub request: Header,
    /// Completion outcome status, valid once `queued` is set.
    pub status: u32,
    /// Bumped on every put so a late completion of a cancelled put is
    /// recognised and ignored.
    pub generation: u64,
}

impl Recycle for PutNotify {
    fn scrub(&mut self) {
        self.busy = false;
        self.queued = false;
        self.request = Header::default();
        self.status = 0;
    }
}

// ── Channel ───────────────────────────────────────────────────────────────────

/// Everything needed to bind a pooled record.
pub struct ChannelInit {
    pub cid: u32,
    pub name: String,
    pub point: Arc<dyn DataPoint>,
    pub rights: AccessRights,
    /// Requesting peer of a provisional channel created by discovery.
    pub origin: Option<SocketAddr>,
    pub session: Weak<Session>,
}

pub struct Channel {
    sid: u32,
    name: String,
    point: Arc<dyn DataPoint>,
    created_at: Instant,
    origin: Option<SocketAddr>,
    cid: AtomicU32,
    session: Mutex<Weak<Session>>,
    state: AtomicU8,
    rights: AtomicU32,
    events: Mutex<Vec<Arc<EventEntry>>>,
    put_notify: Mutex<Option<PutNotify>>,
}

impl Channel {
    /// An unbound record, as kept in the pool.
    pub fn blank() -> Self {
        Self {
            sid: NO_ID,
            name: String::new(),
            point: Arc::new(DetachedPoint),
            created_at: Instant::now(),
            origin: None,
            cid: AtomicU32::new(NO_ID),
            session: Mutex::new(Weak::new()),
            state: AtomicU8::new(ChannelState::Invalid as u8),
            rights: AtomicU32::new(AccessRights::NONE.0),
            events: Mutex::new(Vec::new()),
            put_notify: Mutex::new(None),
        }
    }

    /// Binds a pooled record to `sid` and `init`; the channel starts in
    /// `PendConnectResp`.
    pub(crate) fn bind(&mut self, sid: u32, init: ChannelInit) {
        let state = ChannelState::Invalid
            .apply(ChannelEvent::Created)
            .unwrap_or(ChannelState::PendConnectResp);
        self.sid = sid;
        self.name = init.name;
        self.point = init.point;
        self.created_at = Instant::now();
        self.origin = init.origin;
        *self.cid.get_mut() = init.cid;
        *self.session.get_mut().unwrap_or_else(|e| e.into_inner()) = init.session;
        *self.state.get_mut() = state as u8;
        *self.rights.get_mut() = init.rights.0;
    }

    pub fn sid(&self) -> u32 {
        self.sid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn point(&self) -> &Arc<dyn DataPoint> {
        &self.point
    }

    pub fn cid(&self) -> u32 {
        self.cid.load(Ordering::Relaxed)
    }

    pub fn set_cid(&self, cid: u32) {
        self.cid.store(cid, Ordering::Relaxed);
    }

    pub fn origin(&self) -> Option<SocketAddr> {
        self.origin
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        lock(&self.session).upgrade()
    }

    /// Whether the channel belongs to `session`.
    pub fn is_owned_by(&self, session: &Session) -> bool {
        self.session()
            .is_some_and(|owner| std::ptr::eq(Arc::as_ptr(&owner), session))
    }

    /// Moves the channel to another session.  The caller removes it from the
    /// old session's list and inserts it into the new one.
    pub fn set_session(&self, session: Weak<Session>) {
        *lock(&self.session) = session;
    }

    pub fn state(&self) -> ChannelState {
        ChannelState::try_from(self.state.load(Ordering::Acquire)).unwrap_or(ChannelState::Invalid)
    }

    /// Applies `event` to the stored state.  Must be called with the owning
    /// session's channel-list lock held.
    pub fn transition(&self, event: ChannelEvent) -> Result<ChannelState, TransitionError> {
        let next = self.state().apply(event)?;
        self.state.store(next as u8, Ordering::Release);
        Ok(next)
    }

    pub fn rights(&self) -> AccessRights {
        AccessRights(self.rights.load(Ordering::Relaxed))
    }

    pub fn set_rights(&self, rights: AccessRights) {
        self.rights.store(rights.0, Ordering::Relaxed);
    }

    pub fn can_read(&self) -> bool {
        self.rights().can_read()
    }

    /// Write access also requires a point that accepts writes at all.
    pub fn can_write(&self) -> bool {
        self.rights().can_write() && self.point.is_writable()
    }

    /// Rights bits as sent in ACCESS_RIGHTS replies.
    pub fn effective_rights(&self) -> AccessRights {
        AccessRights::new(self.can_read(), self.can_write())
    }

    // ── Subscriptions ─────────────────────────────────────────────────────────

    pub fn add_event(&self, entry: Arc<EventEntry>) {
        lock(&self.events).push(entry);
    }

    /// Detaches the subscription whose client id is `available`.
    pub fn remove_event(&self, available: u32) -> Option<Arc<EventEntry>> {
        let mut events = lock(&self.events);
        let pos = events.iter().position(|e| e.subscription_id() == available)?;
        Some(events.remove(pos))
    }

    pub fn take_events(&self) -> Vec<Arc<EventEntry>> {
        std::mem::take(&mut *lock(&self.events))
    }

    pub fn events(&self) -> Vec<Arc<EventEntry>> {
        lock(&self.events).clone()
    }

    pub fn event_count(&self) -> usize {
        lock(&self.events).len()
    }

    // ── Put notify ────────────────────────────────────────────────────────────

    pub fn put_notify(&self) -> MutexGuard<'_, Option<PutNotify>> {
        lock(&self.put_notify)
    }

    /// Whether a put is still awaiting its completion reply.
    pub fn put_busy(&self) -> bool {
        self.put_notify().as_ref().is_some_and(|p| p.busy)
    }
}

impl Recycle for Channel {
    fn scrub(&mut self) {
        self.sid = NO_ID;
        self.name.clear();
        self.point = Arc::new(DetachedPoint);
        self.origin = None;
        *self.cid.get_mut() = NO_ID;
        *self.session.get_mut().unwrap_or_else(|e| e.into_inner()) = Weak::new();
        *self.state.get_mut() = ChannelState::Invalid as u8;
        *self.rights.get_mut() = AccessRights::NONE.0;
        self.events.get_mut().unwrap_or_else(|e| e.into_inner()).clear();
        *self.put_notify.get_mut().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("sid", &self.sid)
            .field("cid", &self.cid())
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init(name: &str) -> ChannelInit {
        ChannelInit {
            cid: 7,
            name: name.to_string(),
            point: Arc::new(DetachedPoint),
            rights: AccessRights::READ_WRITE,
            origin: None,
            session: Weak::new(),
        }
    }

    #[test]
    fn test_bind_starts_pending_connect() {
        // Arrange
        let mut chan = Channel::blank();

        // Act
        chan.bind(42, init("temp"));

        // Assert
        assert_eq!(chan.sid(), 42);
        assert_eq!(chan.cid(), 7);
        assert_eq!(chan.name(), "temp");
        assert_eq!(chan.state(), ChannelState::PendConnectResp);
    }

    #[test]
    fn test_transition_rejects_skips() {
        let mut chan = Channel::blank();
        chan.bind(1, init("a"));

        let err = chan.transition(ChannelEvent::UpdateCompleted).unwrap_err();

        assert_eq!(err.from, ChannelState::PendConnectResp);
        assert_eq!(chan.state(), ChannelState::PendConnectResp);
    }

    #[test]
    fn test_scrub_clears_identity() {
        // Arrange
        let mut chan = Channel::blank();
        chan.bind(9, init("b"));
        *chan.put_notify() = Some(PutNotify::default());

        // Act
        chan.scrub();

        // Assert
        assert_eq!(chan.sid(), NO_ID);
        assert!(chan.name().is_empty());
        assert_eq!(chan.state(), ChannelState::Invalid);
        assert!(chan.put_notify().is_none());
    }

    #[test]
    fn test_detached_point_is_never_writable() {
        let mut chan = Channel::blank();
        chan.bind(3, init("c"));
        assert!(chan.rights().can_write());
        assert!(!chan.can_write());
    }
}
