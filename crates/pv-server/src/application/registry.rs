//! Resource registry: the server-id table, the free lists and the session
//! table, all behind one lock.
//!
//! Ids come from a wrapping counter that skips ids still in use and the
//! reserved [`NO_ID`].  The live channel count is only changed under the
//! lock, so it always equals the number of allocated ids.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use pv_core::protocol::{MAX_TCP, NO_ID};
use thiserror::Error;
use tracing::{trace, warn};

use super::channel::{Channel, ChannelInit, PutNotify};
use super::events::{EventEntry, EventInit};
use super::lock;
use super::message_buffer::{large_buffer_size, BufferClass};
use super::pool::{FreeList, PoolError, PoolStats};
use super::session::{Session, Transport};

const CHANNEL_BLOCK: usize = 512;
const EVENT_BLOCK: usize = 512;
const PUT_NOTIFY_BLOCK: usize = 512;
const SMALL_BUFFER_BLOCK: usize = 16;
const SESSION_TABLE_BLOCK: usize = 8;

/// Free event slots discovery requires before it advertises a channel.
const MIN_FREE_EVENTS_FOR_SEARCH: usize = 11;

/// Upper bounds on pooled resources.  `None` means unbounded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryLimits {
    pub max_channels: Option<usize>,
    pub max_events: Option<usize>,
    pub max_put_notify: Option<usize>,
    pub max_buffers: Option<usize>,
    /// Largest array payload served; sizes the large buffer class.
    pub max_array_bytes: usize,
}

impl Default for RegistryLimits {
    fn default() -> Self {
        Self {
            max_channels: None,
            max_events: None,
            max_put_notify: None,
            max_buffers: None,
            max_array_bytes: MAX_TCP,
        }
    }
}

/// Errors returned by the registry.  All are retryable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("server id space exhausted")]
    IdSpaceExhausted,

    #[error("unknown server id {0}")]
    UnknownId(u32),
}

struct RegistryInner {
    bucket: HashMap<u32, Arc<Channel>>,
    next_id: u32,
    id_space: u32,
    channel_count: usize,
    channels: FreeList<Channel>,
    events: FreeList<EventEntry>,
    put_notify: FreeList<PutNotify>,
    small_buffers: FreeList<Vec<u8>>,
    large_buffers: Option<FreeList<Vec<u8>>>,
    large_size: Option<usize>,
    sessions: Vec<Arc<Session>>,
    next_session_id: u64,
}

pub struct ResourceRegistry {
    inner: Mutex<RegistryInner>,
}

impl ResourceRegistry {
    pub fn new(limits: RegistryLimits) -> Self {
        Self::with_id_space(limits, NO_ID)
    }

    /// Registry whose ids wrap below `id_space`; small spaces let tests
    /// reach exhaustion.
    pub fn with_id_space(limits: RegistryLimits, id_space: u32) -> Self {
        let large_size = large_buffer_size(limits.max_array_bytes);
        let large_buffers = large_size.map(|size| {
            FreeList::new("large buffer", 1, limits.max_buffers, move || vec![0u8; size])
        });
        let inner = RegistryInner {
            bucket: HashMap::new(),
            next_id: 0,
            id_space: id_space.max(1),
            channel_count: 0,
            channels: FreeList::new("channel", CHANNEL_BLOCK, limits.max_channels, Channel::blank),
            events: FreeList::new("event", EVENT_BLOCK, limits.max_events, EventEntry::blank),
            put_notify: FreeList::new(
                "put notify",
                PUT_NOTIFY_BLOCK,
                limits.max_put_notify,
                PutNotify::default,
            ),
            small_buffers: FreeList::new("small buffer", SMALL_BUFFER_BLOCK, limits.max_buffers, || {
                vec![0u8; MAX_TCP]
            }),
            large_buffers,
            large_size,
            sessions: Vec::with_capacity(SESSION_TABLE_BLOCK),
            next_session_id: 1,
        };
        Self {
            inner: Mutex::new(inner),
        }
    }

    fn inner(&self) -> MutexGuard<'_, RegistryInner> {
        lock(&self.inner)
    }

    // ── Channels ──────────────────────────────────────────────────────────────

    /// Takes a channel record from the pool, binds it to a fresh id and
    /// enters it in the id table.
    ///
    /// # Errors
    ///
    /// [`ResourceError::Pool`] when the channel pool is exhausted,
    /// [`ResourceError::IdSpaceExhausted`] when every id is taken.
    pub fn create_channel(&self, init: ChannelInit) -> Result<Arc<Channel>, ResourceError> {
        let mut inner = self.inner();
        let sid = inner.allocate_id()?;
        let mut record = inner.channels.acquire()?;
        record.bind(sid, init);
        let chan = Arc::new(record);
        inner.bucket.insert(sid, Arc::clone(&chan));
        inner.channel_count += 1;
        trace!(sid, name = chan.name(), "channel created");
        Ok(chan)
    }

    pub fn lookup(&self, sid: u32) -> Option<Arc<Channel>> {
        self.inner().bucket.get(&sid).cloned()
    }

    /// Releases the id of `chan` and returns the record to the pool once no
    /// one else holds it.
    ///
    /// # Errors
    ///
    /// [`ResourceError::UnknownId`] when the id was already released.
    pub fn release_channel(&self, chan: Arc<Channel>) -> Result<(), ResourceError> {
        let sid = chan.sid();
        let mut inner = self.inner();
        match inner.bucket.get(&sid) {
            Some(entry) if Arc::ptr_eq(entry, &chan) => {}
            _ => return Err(ResourceError::UnknownId(sid)),
        }
        inner.bucket.remove(&sid);
        inner.channel_count -= 1;
        match Arc::try_unwrap(chan) {
            Ok(record) => inner.channels.release(record),
            Err(_) => inner.channels.forget(),
        }
        trace!(sid, "channel released");
        Ok(())
    }

    /// Live channel count.
    pub fn channel_count(&self) -> usize {
        self.inner().channel_count
    }

    /// Number of ids in the table; equal to [`channel_count`](Self::channel_count).
    pub fn allocated_ids(&self) -> usize {
        self.inner().bucket.len()
    }

    /// Whether discovery may advertise one more channel.
    pub fn can_advertise(&self) -> bool {
        let inner = self.inner();
        inner.channels.has_capacity(1) && inner.events.has_capacity(MIN_FREE_EVENTS_FOR_SEARCH)
    }

    // ── Events and put notify ─────────────────────────────────────────────────

    pub fn create_event(&self, init: EventInit) -> Result<Arc<EventEntry>, ResourceError> {
        let mut record = self.inner().events.acquire()?;
        record.bind(init);
        Ok(Arc::new(record))
    }

    pub fn release_event(&self, entry: Arc<EventEntry>) {
        let mut inner = self.inner();
        match Arc::try_unwrap(entry) {
            Ok(record) => inner.events.release(record),
            Err(_) => inner.events.forget(),
        }
    }

    pub fn acquire_put_notify(&self) -> Result<PutNotify, ResourceError> {
        Ok(self.inner().put_notify.acquire()?)
    }

    pub fn release_put_notify(&self, record: PutNotify) {
        self.inner().put_notify.release(record);
    }

    // ── Buffers ───────────────────────────────────────────────────────────────

    pub fn acquire_small_buffer(&self) -> Result<Vec<u8>, ResourceError> {
        Ok(self.inner().small_buffers.acquire()?)
    }

    /// A buffer of the large class.
    ///
    /// # Errors
    ///
    /// [`ResourceError::Pool`] when the pool is exhausted or no large class
    /// is configured.
    pub fn acquire_large_buffer(&self) -> Result<Vec<u8>, ResourceError> {
        let mut inner = self.inner();
        match inner.large_buffers.as_mut() {
            Some(pool) => Ok(pool.acquire()?),
            None => Err(ResourceError::Pool(PoolError::Exhausted {
                pool: "large buffer",
                limit: 0,
            })),
        }
    }

    /// Size of the large buffer class, `None` when small buffers already
    /// hold the largest array.
    pub fn large_buffer_size(&self) -> Option<usize> {
        self.inner().large_size
    }

    pub fn release_buffer(&self, class: BufferClass, data: Vec<u8>) {
        let mut inner = self.inner();
        match class {
            BufferClass::Small if data.len() == MAX_TCP => inner.small_buffers.release(data),
            BufferClass::Large => match inner.large_buffers.as_mut() {
                Some(pool) => pool.release(data),
                None => warn!("large buffer returned without a large pool"),
            },
            _ => {}
        }
    }

    // ── Sessions ──────────────────────────────────────────────────────────────

    pub fn next_session_id(&self) -> u64 {
        let mut inner = self.inner();
        let id = inner.next_session_id;
        inner.next_session_id += 1;
        id
    }

    pub fn register_session(&self, session: Arc<Session>) {
        self.inner().sessions.push(session);
    }

    pub fn unregister_session(&self, session: &Session) {
        self.inner()
            .sessions
            .retain(|s| !std::ptr::eq(Arc::as_ptr(s), session));
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.inner().sessions.clone()
    }

    /// `(channel_count, circuit_count)` read under one lock.
    pub fn stats(&self) -> (usize, usize) {
        let inner = self.inner();
        let circuits = inner
            .sessions
            .iter()
            .filter(|s| s.transport() == Transport::Tcp)
            .count();
        (inner.channel_count, circuits)
    }

    pub fn pool_stats(&self) -> Vec<PoolStats> {
        let inner = self.inner();
        let mut stats = vec![
            inner.channels.stats(),
            inner.events.stats(),
            inner.put_notify.stats(),
            inner.small_buffers.stats(),
        ];
        if let Some(large) = inner.large_buffers.as_ref() {
            stats.push(large.stats());
        }
        stats
    }

    /// Capacity of the id table, for the report.
    pub fn table_capacity(&self) -> usize {
        self.inner().bucket.capacity()
    }
}

impl RegistryInner {
    fn allocate_id(&mut self) -> Result<u32, ResourceError> {
        let space = u64::from(self.id_space);
        if self.bucket.len() as u64 >= space {
            return Err(ResourceError::IdSpaceExhausted);
        }
        for _ in 0..space {
            let candidate = self.next_id;
            self.next_id = if candidate.wrapping_add(1) >= self.id_space {
                0
            } else {
                candidate + 1
            };
            if candidate != NO_ID && !self.bucket.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
        Err(ResourceError::IdSpaceExhausted)
    }
}

impl std::fmt::Debug for ResourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (channels, circuits) = self.stats();
        f.debug_struct("ResourceRegistry")
            .field("channels", &channels)
            .field("circuits", &circuits)
            .finish()
    }
}
