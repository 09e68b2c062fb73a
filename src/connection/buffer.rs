//! Fixed-capacity FIFO for frames sent while the socket is not open.
//!
//! When the buffer is full, pushing a new frame evicts the oldest one and
//! hands it back to the caller. Memory stays bounded at `capacity` frames no
//! matter how long a reconnection storm lasts.

// Rust guideline compliant 2026-02

use std::collections::VecDeque;

use crate::protocol::Frame;

/// Bounded drop-oldest frame queue.
#[derive(Debug)]
pub struct OutboundBuffer {
    frames: VecDeque<Frame>,
    capacity: usize,
}

impl OutboundBuffer {
    /// Create a buffer holding at most `capacity` frames.
    ///
    /// # Panics
    ///
    /// Panics if `capacity == 0`.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "OutboundBuffer capacity must be > 0");
        Self {
            // Pre-allocate a modest chunk; VecDeque grows lazily.
            frames: VecDeque::with_capacity(capacity.min(64)),
            capacity,
        }
    }

    /// Append a frame, returning the evicted oldest frame if the buffer was full.
    pub fn push(&mut self, frame: Frame) -> Option<Frame> {
        let evicted = if self.frames.len() >= self.capacity {
            self.frames.pop_front()
        } else {
            None
        };
        self.frames.push_back(frame);
        evicted
    }

    /// Put a frame back at the head (used when a flush write fails).
    ///
    /// Returns the frame dropped from the tail if the buffer was full.
    pub fn push_front(&mut self, frame: Frame) -> Option<Frame> {
        let evicted = if self.frames.len() >= self.capacity {
            self.frames.pop_back()
        } else {
            None
        };
        self.frames.push_front(frame);
        evicted
    }

    /// Remove the oldest frame.
    pub fn pop(&mut self) -> Option<Frame> {
        self.frames.pop_front()
    }

    /// Number of buffered frames.
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// True if nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Discard everything, returning what was buffered (oldest first).
    pub fn clear(&mut self) -> Vec<Frame> {
        self.frames.drain(..).collect()
    }

    /// Configured maximum number of frames.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
