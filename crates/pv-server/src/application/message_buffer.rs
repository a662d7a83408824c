//! Byte buffers with a read cursor, used for both directions of a session.
//!
//! ```text
//! data: [ consumed | unread (stk..cnt) | free (cnt..) ]
//! ```
//!
//! A receive buffer is filled at `cnt` and consumed from `stk`.  A send
//! buffer only uses `cnt` as the committed length.

use pv_core::protocol::{LARGE_HEADER_SIZE, MAX_TCP, MAX_UDP_RECV, MAX_UDP_SEND};

/// Large buffers are a whole number of pages.
const LARGE_BUFFER_ALIGN: usize = 4096;

/// Size class of a buffer, reported by diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferClass {
    /// [`MAX_TCP`] bytes.
    Small,
    /// Sized from the configured maximum array bytes.
    Large,
    /// Datagram buffers of a discovery session.
    Udp,
}

/// Large-buffer size for `max_array_bytes`, or `None` when the small class
/// already covers it.
pub fn large_buffer_size(max_array_bytes: usize) -> Option<usize> {
    let needed = max_array_bytes + LARGE_HEADER_SIZE;
    let rounded = needed.div_ceil(LARGE_BUFFER_ALIGN) * LARGE_BUFFER_ALIGN;
    (rounded > MAX_TCP).then_some(rounded)
}

#[derive(Debug)]
pub struct MessageBuffer {
    data: Vec<u8>,
    stk: usize,
    cnt: usize,
    class: BufferClass,
}

impl MessageBuffer {
    /// Wraps a pooled allocation; its length is the capacity.
    pub fn new(data: Vec<u8>, class: BufferClass) -> Self {
        Self {
            data,
            stk: 0,
            cnt: 0,
            class,
        }
    }

    pub fn udp_receive() -> Self {
        Self::new(vec![0; MAX_UDP_RECV], BufferClass::Udp)
    }

    pub fn udp_send() -> Self {
        Self::new(vec![0; MAX_UDP_SEND], BufferClass::Udp)
    }

    pub fn class(&self) -> BufferClass {
        self.class
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes received and not yet processed.
    pub fn unread(&self) -> &[u8] {
        &self.data[self.stk..self.cnt]
    }

    pub fn unread_len(&self) -> usize {
        self.cnt - self.stk
    }

    /// Marks `n` unread bytes as processed.
    pub fn advance(&mut self, n: usize) {
        self.stk = (self.stk + n).min(self.cnt);
    }

    /// Free space at the end of the buffer.
    pub fn space_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.cnt..]
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.cnt
    }

    /// Records `n` bytes written into [`space_mut`](Self::space_mut).
    pub fn fill(&mut self, n: usize) {
        self.cnt = (self.cnt + n).min(self.data.len());
    }

    /// Moves unread bytes to the front so the whole tail is free.
    pub fn compact(&mut self) {
        if self.stk > 0 {
            self.data.copy_within(self.stk..self.cnt, 0);
            self.cnt -= self.stk;
            self.stk = 0;
        }
    }

    /// Drops everything.
    pub fn reset(&mut self) {
        self.stk = 0;
        self.cnt = 0;
    }

    /// Committed bytes of a send buffer.
    pub fn committed(&self) -> &[u8] {
        &self.data[..self.cnt]
    }

    pub fn committed_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.cnt]
    }

    pub fn len(&self) -> usize {
        self.cnt
    }

    pub fn is_empty(&self) -> bool {
        self.cnt == 0
    }

    /// Truncates the committed length of a send buffer.
    pub fn truncate(&mut self, len: usize) {
        self.cnt = len.min(self.cnt);
        self.stk = self.stk.min(self.cnt);
    }

    /// Switches to a bigger allocation, keeping unread bytes at the front.
    /// Returns the allocation that was replaced so it can go back to its pool.
    pub fn expand(&mut self, mut data: Vec<u8>, class: BufferClass) -> Vec<u8> {
        let unread = self.cnt - self.stk;
        data[..unread].copy_from_slice(&self.data[self.stk..self.cnt]);
        let old = std::mem::replace(&mut self.data, data);
        self.stk = 0;
        self.cnt = unread;
        self.class = class;
        old
    }

    /// Hands the allocation back, leaving the buffer empty.
    pub fn take_allocation(&mut self) -> Vec<u8> {
        self.reset();
        std::mem::take(&mut self.data)
    }
}
