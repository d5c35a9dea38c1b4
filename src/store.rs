// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use thiserror::Error;

/// An opaque handle to one picture buffer in a [`PictureStore`].
pub type BufferId = usize;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("no free buffer available")]
    NoFreeBuffer,
    #[error("invalid buffer id {0}")]
    InvalidBufferId(BufferId),
}

/// The reasons a buffer can be held.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BufferRole {
    /// The decoder is still writing the picture.
    Decode,
    /// The picture is marked as a reference.
    Reference,
    /// The picture is queued for or handed out to display.
    Display,
}

impl BufferRole {
    fn mask(self) -> u8 {
        match self {
            BufferRole::Decode => 1 << 0,
            BufferRole::Reference => 1 << 1,
            BufferRole::Display => 1 << 2,
        }
    }
}

/// A pool of picture buffers with per-role accounting and a display queue.
///
/// [`PictureStore::allocate`] hands out a free buffer holding the `Decode`
/// role. A buffer returns to the free pool once every role holding it has
/// been released.
pub trait PictureStore {
    /// The total number of buffers in the pool.
    fn capacity(&self) -> usize;

    /// Grabs a free buffer for decoding.
    fn allocate(&mut self) -> Result<BufferId, StoreError>;

    /// Adds `role` to the holders of `buffer_id`.
    fn retain(&mut self, buffer_id: BufferId, role: BufferRole) -> Result<(), StoreError>;

    /// Drops `role` from the holders of `buffer_id`.
    fn release(&mut self, buffer_id: BufferId, role: BufferRole) -> Result<(), StoreError>;

    /// Queues `buffer_id` for display as `display_seq`.
    fn enqueue(&mut self, buffer_id: BufferId, display_seq: u64);

    /// Pops the queued buffer with the lowest display sequence number.
    fn dequeue(&mut self) -> Option<(BufferId, u64)>;

    /// Returns every buffer to the free pool and empties the display queue.
    fn reset(&mut self);
}

/// The in-memory [`PictureStore`] used by the tests and by callers that do
/// not bring their own buffer management.
#[derive(Debug, Default)]
pub struct BufferPool {
    /// One role mask per buffer. A zero mask means the buffer is free.
    roles: Vec<u8>,
    queue: Vec<(BufferId, u64)>,
}

impl BufferPool {
    pub fn new(capacity: usize) -> Self {
        BufferPool { roles: vec![0; capacity], queue: Vec::new() }
    }
}

impl PictureStore for BufferPool {
    fn capacity(&self) -> usize {
        self.roles.len()
    }

    fn allocate(&mut self) -> Result<BufferId, StoreError> {
        let buffer_id =
            self.roles.iter().position(|&mask| mask == 0).ok_or(StoreError::NoFreeBuffer)?;
        self.roles[buffer_id] = BufferRole::Decode.mask();
        Ok(buffer_id)
    }

    fn retain(&mut self, buffer_id: BufferId, role: BufferRole) -> Result<(), StoreError> {
        let mask = self.roles.get_mut(buffer_id).ok_or(StoreError::InvalidBufferId(buffer_id))?;
        *mask |= role.mask();
        Ok(())
    }

    fn release(&mut self, buffer_id: BufferId, role: BufferRole) -> Result<(), StoreError> {
        let mask = self.roles.get_mut(buffer_id).ok_or(StoreError::InvalidBufferId(buffer_id))?;
        *mask &= !role.mask();
        Ok(())
    }

    fn enqueue(&mut self, buffer_id: BufferId, display_seq: u64) {
        self.queue.push((buffer_id, display_seq));
    }

    fn dequeue(&mut self) -> Option<(BufferId, u64)> {
        let index = self
            .queue
            .iter()
            .enumerate()
            .min_by_key(|(_, (_, display_seq))| *display_seq)
            .map(|(index, _)| index)?;
        Some(self.queue.swap_remove(index))
    }

    fn reset(&mut self) {
        self.roles.fill(0);
        self.queue.clear();
    }
}
