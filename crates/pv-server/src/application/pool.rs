//! Typed free lists.
//!
//! Channels, subscriptions, put-notify records and message buffers are
//! recycled rather than dropped.  A pool hands out an owned value; releasing
//! it scrubs every field that could point back at its last owner and keeps
//! the allocation for the next request.
//!
//! # Capacity (for beginners)
//!
//! A pool grows one block at a time.  With an upper limit configured it stops
//! growing once `limit` items exist, which is how the server turns memory
//! pressure into a polite refusal instead of an abort: discovery stays silent
//! and channel creation replies with an allocation error.

use thiserror::Error;

/// Values that can be returned to a [`FreeList`].
pub trait Recycle {
    /// Clears ownership and identity fields before the value is reused.
    fn scrub(&mut self);
}

impl Recycle for Vec<u8> {
    // Contents are overwritten by the next user.
    fn scrub(&mut self) {}
}

/// A pool could not supply an item.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("{pool} pool exhausted ({limit} items in use)")]
    Exhausted { pool: &'static str, limit: usize },
}

/// Counters reported by the diagnostic report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub name: &'static str,
    /// Items handed out and not yet returned.
    pub outstanding: usize,
    /// Items ready for reuse.
    pub free: usize,
    /// Upper bound on live items, if any.
    pub limit: Option<usize>,
}

/// Fixed-block free list of `T`.
pub struct FreeList<T> {
    name: &'static str,
    free: Vec<T>,
    outstanding: usize,
    block: usize,
    limit: Option<usize>,
    make: Box<dyn Fn() -> T + Send>,
}

impl<T: Recycle> FreeList<T> {
    /// Creates an empty pool that grows by `block` items built with `make`.
    pub fn new(
        name: &'static str,
        block: usize,
        limit: Option<usize>,
        make: impl Fn() -> T + Send + 'static,
    ) -> Self {
        Self {
            name,
            free: Vec::new(),
            outstanding: 0,
            block: block.max(1),
            limit,
            make: Box::new(make),
        }
    }

    /// Pops a free item, growing the pool by one block when it is empty.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Exhausted`] when the upper limit is reached.
    pub fn acquire(&mut self) -> Result<T, PoolError> {
        if self.free.is_empty() {
            self.grow()?;
        }
        match self.free.pop() {
            Some(item) => {
                self.outstanding += 1;
                Ok(item)
            }
            None => Err(self.exhausted()),
        }
    }

    /// Scrubs `item` and keeps it for reuse.
    pub fn release(&mut self, mut item: T) {
        item.scrub();
        self.outstanding = self.outstanding.saturating_sub(1);
        self.free.push(item);
    }

    /// Accounts for an item that will never come back, e.g. one still shared
    /// by a late callback when its owner was destroyed.
    pub fn forget(&mut self) {
        self.outstanding = self.outstanding.saturating_sub(1);
    }

    /// Whether `n` more items could be acquired right now.
    pub fn has_capacity(&self, n: usize) -> bool {
        match self.limit {
            None => true,
            Some(limit) => self.free.len() + limit.saturating_sub(self.live()) >= n,
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            name: self.name,
            outstanding: self.outstanding,
            free: self.free.len(),
            limit: self.limit,
        }
    }

    fn live(&self) -> usize {
        self.outstanding + self.free.len()
    }

    fn grow(&mut self) -> Result<(), PoolError> {
        let room = match self.limit {
            Some(limit) => limit.saturating_sub(self.live()),
            None => self.block,
        };
        let n = room.min(self.block);
        if n == 0 {
            return Err(self.exhausted());
        }
        self.free.extend((0..n).map(|_| (self.make)()));
        Ok(())
    }

    fn exhausted(&self) -> PoolError {
        PoolError::Exhausted {
            pool: self.name,
            limit: self.limit.unwrap_or(self.live()),
        }
    }
}
