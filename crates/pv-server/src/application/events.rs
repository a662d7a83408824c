//! Subscriptions (monitors) and update delivery.
//!
//! An [`EventEntry`] remembers the EVENT_ADD request that created it and
//! replays it as a READ_NOTIFY-style reply whenever its point changes.
//!
//! # Coalescing
//!
//! Change notifications arrive on the data source's threads and must never
//! block.  [`EventEntry::post`] only *tries* the session's send lock.  When
//! the lock is busy, the client asked for EVENTS_OFF, or too many sealed
//! bytes are still waiting for the socket, the entry is marked modified and
//! queued on its session once.  The outbound worker later delivers it with
//! whatever value the point holds then, so a burst of changes collapses into
//! one update instead of being lost.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use pv_core::protocol::{status, Command, Header};
use tracing::trace;

use super::channel::Channel;
use super::data_source::{dbr, ChangeListener, SubscriptionId};
use super::lock;
use super::pool::Recycle;
use super::session::{SendGuard, Session};

/// Everything needed to bind a pooled entry.
pub struct EventInit {
    /// The EVENT_ADD request header.
    pub request: Header,
    pub mask: u16,
    pub channel: Weak<Channel>,
    pub session: Weak<Session>,
}

pub struct EventEntry {
    template: Header,
    mask: u16,
    payload_size: usize,
    channel: Weak<Channel>,
    session: Weak<Session>,
    subscription: Mutex<Option<SubscriptionId>>,
    enabled: AtomicBool,
    modified: AtomicBool,
    cancelled: AtomicBool,
}

impl EventEntry {
    /// An unbound entry, as kept in the pool.
    pub fn blank() -> Self {
        Self {
            template: Header::default(),
            mask: 0,
            payload_size: 0,
            channel: Weak::new(),
            session: Weak::new(),
            subscription: Mutex::new(None),
            enabled: AtomicBool::new(false),
            modified: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        }
    }

    pub(crate) fn bind(&mut self, init: EventInit) {
        self.payload_size = dbr::payload_size(init.request.data_type, init.request.element_count).unwrap_or(0);
        self.template = init.request;
        self.mask = init.mask;
        self.channel = init.channel;
        self.session = init.session;
        *self.enabled.get_mut() = false;
        *self.modified.get_mut() = false;
        *self.cancelled.get_mut() = false;
    }

    /// Client-chosen subscription id (the request's `available` field).
    pub fn subscription_id(&self) -> u32 {
        self.template.available
    }

    /// The request this entry replays.
    pub fn template(&self) -> &Header {
        &self.template
    }

    pub fn mask(&self) -> u16 {
        self.mask
    }

    /// Payload bytes of one update before autosizing.
    pub fn payload_size(&self) -> usize {
        self.payload_size
    }

    pub fn set_subscription(&self, id: SubscriptionId) {
        *lock(&self.subscription) = Some(id);
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn is_modified(&self) -> bool {
        self.modified.load(Ordering::Acquire)
    }

    /// Stops delivery and drops the point's registration.
    pub fn cancel(&self, chan: &Channel) {
        self.cancelled.store(true, Ordering::Release);
        if let Some(id) = lock(&self.subscription).take() {
            chan.point().unsubscribe(id);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Hook handed to the data point.
    pub fn listener(self: &Arc<Self>) -> Arc<dyn ChangeListener> {
        Arc::new(EventListener {
            entry: Arc::downgrade(self),
        })
    }

    /// Delivers the current value, or queues the entry when the session
    /// cannot take it now.  `force` posts even while disabled.
    pub fn post(self: &Arc<Self>, force: bool) {
        if self.is_cancelled() || (!force && !self.is_enabled()) || self.is_modified() {
            return;
        }
        let Some(session) = self.session.upgrade() else {
            return;
        };
        if session.is_closed() {
            return;
        }
        if session.is_flow_controlled() || session.backlog_exceeded() {
            self.defer(&session);
            return;
        }
        let Some(chan) = self.channel.upgrade() else {
            return;
        };
        match session.try_send() {
            Some(mut tx) => {
                compose_read_reply(&mut tx, &chan, &self.template);
                drop(tx);
                session.wake();
            }
            None => self.defer(&session),
        };
    }

    /// Sends the latest value of a queued entry.  Called by the outbound
    /// worker with the send lock held.
    pub(crate) fn deliver(&self, tx: &mut SendGuard<'_>) {
        self.modified.store(false, Ordering::Release);
        if self.is_cancelled() {
            return;
        }
        if let Some(chan) = self.channel.upgrade() {
            compose_read_reply(tx, &chan, &self.template);
        }
    }

    fn defer(self: &Arc<Self>, session: &Session) {
        if !self.modified.swap(true, Ordering::AcqRel) {
            trace!(subscription = self.subscription_id(), "update deferred");
            session.queue_event(Arc::clone(self));
            session.wake();
        }
    }
}

impl Recycle for EventEntry {
    fn scrub(&mut self) {
        self.template = Header::default();
        self.mask = 0;
        self.payload_size = 0;
        self.channel = Weak::new();
        self.session = Weak::new();
        *self.subscription.get_mut().unwrap_or_else(|e| e.into_inner()) = None;
        *self.enabled.get_mut() = false;
        *self.modified.get_mut() = false;
        *self.cancelled.get_mut() = false;
    }
}

impl std::fmt::Debug for EventEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEntry")
            .field("subscription", &self.subscription_id())
            .field("mask", &self.mask)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

struct EventListener {
    entry: Weak<EventEntry>,
}

impl ChangeListener for EventListener {
    fn on_data_changed(&self) {
        if let Some(entry) = self.entry.upgrade() {
            entry.post(false);
        }
    }
}

// ── Read replies ──────────────────────────────────────────────────────────────

/// Composes a read reply (subscription update or READ_NOTIFY) for `request`.
///
/// The status travels in the `cid` slot.  A count of 0 asks for as many
/// elements as the point holds and the reply shrinks to what was read.
pub(crate) fn compose_read_reply(tx: &mut SendGuard<'_>, chan: &Channel, request: &Header) {
    let autosize = request.element_count == 0;
    let count = if autosize {
        chan.point().element_count()
    } else {
        request.element_count
    };
    let size = dbr::payload_size(request.data_type, count).unwrap_or(usize::MAX);
    let header = Header {
        element_count: count,
        cid: status::NORMAL,
        ..*request
    };

    if let Err(e) = tx.reserve_sized(header, size) {
        let what = if request.command == Command::ReadNotify as u16 {
            "read"
        } else {
            "subscription update"
        };
        let text = format!(
            "server unable to load {what} response into protocol buffer PV=\"{}\" max bytes={}",
            chan.name(),
            tx.max_message()
        );
        tx.send_error(request, e.status(), &text);
        return;
    }

    if !chan.can_read() {
        tx.set_cid(status::NORDACCESS);
        tx.commit(size);
        return;
    }

    match chan.point().read(request.data_type, count) {
        Ok(bytes) => {
            let payload = tx.payload_mut();
            let n = bytes.len().min(payload.len());
            payload[..n].copy_from_slice(&bytes[..n]);
            if autosize {
                let elem = dbr::element_size(request.data_type).unwrap_or(1).max(1);
                tx.set_count((n / elem) as u32);
                tx.commit(n);
            } else {
                tx.commit(size);
            }
        }
        Err(e) => {
            trace!(name = chan.name(), "read for update failed: {e}");
            tx.set_cid(status::GETFAIL);
            if autosize {
                tx.set_count(0);
                tx.commit(0);
            } else {
                tx.commit(size);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::channel::ChannelInit;
    use crate::application::data_source::{DataPoint, DataSourceError, PutCompletion};
    use crate::application::registry::{RegistryLimits, ResourceRegistry};
    use pv_core::protocol::codec::decode_message;
    use pv_core::AccessRights;

    struct FixedPoint {
        values: Vec<i32>,
    }

    impl DataPoint for FixedPoint {
        fn name(&self) -> &str {
            "fixed"
        }
        fn native_type(&self) -> u16 {
            dbr::LONG
        }
        fn element_count(&self) -> u32 {
            self.values.len() as u32
        }
        fn read(&self, data_type: u16, count: u32) -> Result<Vec<u8>, DataSourceError> {
            if data_type != dbr::LONG {
                return Err(DataSourceError::BadType(data_type));
            }
            Ok(self
                .values
                .iter()
                .take(count as usize)
                .flat_map(|v| v.to_be_bytes())
                .collect())
        }
        fn write(&self, _t: u16, _c: u32, _p: &[u8]) -> Result<(), DataSourceError> {
            Ok(())
        }
        fn write_notify(&self, _t: u16, _c: u32, _p: &[u8], done: PutCompletion) {
            done(Ok(()));
        }
        fn subscribe(&self, _mask: u16, _listener: Arc<dyn ChangeListener>) -> SubscriptionId {
            1
        }
        fn unsubscribe(&self, _id: SubscriptionId) {}
    }

    fn setup(rights: AccessRights) -> (Arc<Session>, Arc<Channel>) {
        let registry = Arc::new(ResourceRegistry::new(RegistryLimits::default()));
        let session = Session::tcp(&registry, "127.0.0.1:1".parse().unwrap(), 1 << 20).unwrap();
        session.set_minor_version(13);
        let chan = registry
            .create_channel(ChannelInit {
                cid: 4,
                name: "fixed".into(),
                point: Arc::new(FixedPoint { values: vec![1, 2, 3] }),
                rights,
                origin: None,
                session: session.weak(),
            })
            .unwrap();
        (session, chan)
    }

    fn subscription(session: &Arc<Session>, chan: &Arc<Channel>, count: u32) -> Arc<EventEntry> {
        let request = Header::new(Command::EventAdd)
            .with_data_type(dbr::LONG)
            .with_element_count(count)
            .with_cid(chan.sid())
            .with_available(77);
        session
            .registry()
            .create_event(EventInit {
                request,
                mask: 1,
                channel: Arc::downgrade(chan),
                session: session.weak(),
            })
            .unwrap()
    }

    fn sent(session: &Session) -> Vec<(Header, Vec<u8>)> {
        session.flush();
        let bytes: Vec<u8> = session.send().take_frames().into_iter().flat_map(|f| f.bytes).collect();
        let mut rest = &bytes[..];
        let mut out = Vec::new();
        while !rest.is_empty() {
            let (h, p, n) = decode_message(rest, true).unwrap();
            out.push((h, p.to_vec()));
            rest = &rest[n..];
        }
        out
    }

    #[test]
    fn test_post_composes_update_from_template() {
        // Arrange
        let (session, chan) = setup(AccessRights::READ_WRITE);
        let entry = subscription(&session, &chan, 0);
        entry.set_enabled(true);

        // Act
        entry.post(false);

        // Assert
        let replies = sent(&session);
        assert_eq!(replies.len(), 1);
        let (h, payload) = &replies[0];
        assert_eq!(h.command, Command::EventAdd as u16);
        assert_eq!(h.cid, status::NORMAL);
        assert_eq!(h.available, 77);
        assert_eq!(h.element_count, 3);
        assert_eq!(&payload[..12], &[0, 0, 0, 1, 0, 0, 0, 2, 0, 0, 0, 3]);
    }

    #[test]
    fn test_disabled_entry_posts_only_when_forced() {
        let (session, chan) = setup(AccessRights::READ_WRITE);
        let entry = subscription(&session, &chan, 1);

        entry.post(false);
        assert!(sent(&session).is_empty());

        entry.post(true);
        assert_eq!(sent(&session).len(), 1);
    }

    #[test]
    fn test_no_read_access_sends_zeroed_payload() {
        // Arrange
        let (session, chan) = setup(AccessRights::NONE);
        let entry = subscription(&session, &chan, 2);

        // Act
        entry.post(true);

        // Assert
        let (h, payload) = &sent(&session)[0];
        assert_eq!(h.cid, status::NORDACCESS);
        assert_eq!(payload, &vec![0u8; 8]);
    }

    #[test]
    fn test_flow_control_coalesces_updates() {
        // Arrange
        let (session, chan) = setup(AccessRights::READ_WRITE);
        let entry = subscription(&session, &chan, 1);
        entry.set_enabled(true);
        session.set_flow_control(true);

        // Act
        entry.post(false);
        entry.post(false);
        entry.post(false);

        // Assert
        assert!(sent(&session).is_empty());
        let queued = session.take_pending_events();
        assert_eq!(queued.len(), 1);
        queued[0].deliver(&mut session.send());
        assert!(!entry.is_modified());
        assert_eq!(sent(&session).len(), 1);
    }

    #[test]
    fn test_busy_send_lock_defers_instead_of_blocking() {
        let (session, chan) = setup(AccessRights::READ_WRITE);
        let entry = subscription(&session, &chan, 1);
        entry.set_enabled(true);

        let held = session.send();
        entry.post(false);
        drop(held);

        assert_eq!(session.pending_event_count(), 1);
    }

    #[test]
    fn test_failed_read_with_autosize_sends_empty_payload() {
        // Arrange
        let (session, chan) = setup(AccessRights::READ_WRITE);
        let request = Header::new(Command::ReadNotify)
            .with_data_type(dbr::DOUBLE)
            .with_element_count(0)
            .with_cid(chan.sid())
            .with_available(9);

        // Act
        compose_read_reply(&mut session.send(), &chan, &request);

        // Assert
        let (h, payload) = &sent(&session)[0];
        assert_eq!(h.cid, status::GETFAIL);
        assert_eq!(h.element_count, 0);
        assert!(payload.is_empty());
    }

    #[test]
    fn test_cancelled_entry_is_silent() {
        let (session, chan) = setup(AccessRights::READ_WRITE);
        let entry = subscription(&session, &chan, 1);
        entry.set_enabled(true);

        entry.cancel(&chan);
        entry.post(true);

        assert!(sent(&session).is_empty());
    }
}
