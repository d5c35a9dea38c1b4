// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::Arc;
use std::sync::Mutex;

use thiserror::Error;

use crate::dpb::DPB_MAX_SIZE;
use crate::store::BufferId;
use crate::store::BufferRole;
use crate::store::PictureStore;
use crate::store::StoreError;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DisplayError {
    #[error("no free display slot")]
    MapFull,
    #[error("too many consecutive missing frame_nums")]
    GapsInFrameNum,
}

/// What occupies a pending display slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisplayId {
    /// A decoded picture in the given buffer.
    Buffer(BufferId),
    /// A stand-in for a picture synthesized over a frame_num gap. It takes
    /// part in the ordering but is never displayed.
    NonExisting,
}

#[derive(Clone, Copy, Debug)]
struct DisplaySlot {
    id: DisplayId,
    display_key: i64,
    frame_num: i32,
    progressive: bool,
}

/// A picture released from decode order, ready for the application.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DisplayFrame {
    pub buffer_id: BufferId,
    /// Position in display order. Strictly increasing, starting at 1.
    pub display_seq: u64,
    pub progressive: bool,
}

/// Reorders decoded pictures into display order.
///
/// Pictures wait here keyed by their POC offset into the current display
/// epoch. Once enough pictures are pending to cover the stream's reorder
/// depth, the lowest key is assigned the next display sequence number.
#[derive(Debug, Default)]
pub struct DisplayMap {
    slots: [Option<DisplaySlot>; DPB_MAX_SIZE],
    display_delay: usize,
    max_dec_frame_buffering: usize,
    cur_display_seq: u64,
    prev_max_display_seq: i64,
    max_poc: i32,
}

impl DisplayMap {
    /// Resets the map for a new coded sequence.
    pub fn configure(&mut self, display_delay: usize, max_dec_frame_buffering: usize) {
        *self = Default::default();
        self.display_delay = display_delay;
        self.max_dec_frame_buffering = max_dec_frame_buffering;
    }

    pub fn max_dec_frame_buffering(&self) -> usize {
        self.max_dec_frame_buffering
    }

    /// The number of pictures waiting for a display sequence number.
    pub fn pending(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    /// Accounts for the POC of the picture about to be queued. A POC of zero
    /// closes the current display epoch, so that pictures of the restarted
    /// POC sequence keep displaying after the pending ones.
    pub fn track_poc(&mut self, pic_order_cnt: i32) {
        if pic_order_cnt >= self.max_poc {
            self.max_poc = pic_order_cnt;
        }

        if pic_order_cnt == 0 {
            self.bump_epoch();
        }
    }

    /// Moves the key base past every key handed out in the closing epoch.
    fn bump_epoch(&mut self) {
        self.prev_max_display_seq +=
            i64::from(self.max_poc) + self.max_dec_frame_buffering as i64 + 1;
        self.max_poc = 0;
    }

    /// Queues a picture for display ordering, keyed by its POC within the
    /// current epoch.
    pub fn insert(
        &mut self,
        id: DisplayId,
        pic_order_cnt: i32,
        frame_num: i32,
        progressive: bool,
    ) -> Result<(), DisplayError> {
        let display_key = self.prev_max_display_seq + i64::from(pic_order_cnt);
        let slot =
            self.slots.iter_mut().find(|s| s.is_none()).ok_or(DisplayError::MapFull)?;

        log::debug!("Picture with display key {} is pending display", display_key);
        *slot = Some(DisplaySlot { id, display_key, frame_num, progressive });

        Ok(())
    }

    /// Assigns the next display sequence number to the pending picture with
    /// the lowest key, once enough pictures are pending to cover the reorder
    /// depth of the stream.
    pub fn assign_display_seq(&mut self) -> Result<Option<DisplayFrame>, DisplayError> {
        if self.pending() < self.display_delay {
            return Ok(None);
        }

        let index = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| match s {
                Some(DisplaySlot { id: DisplayId::Buffer(_), display_key, .. }) => {
                    Some((i, *display_key))
                }
                _ => None,
            })
            .min_by_key(|&(_, display_key)| display_key)
            .map(|(i, _)| i);

        let Some(index) = index else {
            // Nothing displayable. If gap stand-ins alone fill the table the
            // stream is missing too many pictures to ever make progress.
            if self.pending() >= self.max_dec_frame_buffering {
                return Err(DisplayError::GapsInFrameNum);
            }

            return Ok(None);
        };

        match self.slots[index].take() {
            Some(DisplaySlot { id: DisplayId::Buffer(buffer_id), progressive, .. }) => {
                self.cur_display_seq += 1;
                log::debug!(
                    "Assigned display seq {} to buffer {}",
                    self.cur_display_seq,
                    buffer_id
                );
                Ok(Some(DisplayFrame {
                    buffer_id,
                    display_seq: self.cur_display_seq,
                    progressive,
                }))
            }
            _ => Ok(None),
        }
    }

    /// Flushes the table in key order. Pictures get their display sequence
    /// numbers, gap stand-ins are discarded. A new epoch starts afterwards.
    pub fn drain(&mut self) -> Vec<DisplayFrame> {
        let mut frames = Vec::new();

        while let Some(index) = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|slot| (i, slot.display_key)))
            .min_by_key(|&(_, display_key)| display_key)
            .map(|(i, _)| i)
        {
            if let Some(DisplaySlot { id: DisplayId::Buffer(buffer_id), progressive, .. }) =
                self.slots[index].take()
            {
                self.cur_display_seq += 1;
                frames.push(DisplayFrame {
                    buffer_id,
                    display_seq: self.cur_display_seq,
                    progressive,
                });
            }
        }

        self.bump_epoch();
        frames
    }

    /// Drops the pending stand-in for the non-existing picture with the
    /// given frame_num, if it is still waiting.
    pub fn remove_nonexisting(&mut self, frame_num: i32) -> bool {
        let slot = self.slots.iter_mut().find(|s| {
            s.as_ref().map_or(false, |slot| {
                slot.id == DisplayId::NonExisting && slot.frame_num == frame_num
            })
        });

        match slot {
            Some(slot) => {
                *slot = None;
                true
            }
            None => false,
        }
    }
}

/// State shared between the decoding thread and the display consumer.
#[derive(Debug)]
pub(crate) struct SharedStore<P: PictureStore> {
    pub(crate) pool: P,
    pub(crate) progressive: Vec<bool>,
    pub(crate) share_map: Vec<bool>,
    pub(crate) share_buffers: bool,
}

impl<P: PictureStore> SharedStore<P> {
    pub(crate) fn new(pool: P, share_buffers: bool) -> Self {
        let capacity = pool.capacity();
        SharedStore {
            pool,
            progressive: vec![true; capacity],
            share_map: vec![false; capacity],
            share_buffers,
        }
    }

    /// Queues `frame` for the consumer thread.
    pub(crate) fn push(&mut self, frame: DisplayFrame) {
        if let Some(progressive) = self.progressive.get_mut(frame.buffer_id) {
            *progressive = frame.progressive;
        }

        self.pool.enqueue(frame.buffer_id, frame.display_seq);
    }

    pub(crate) fn reset(&mut self) {
        self.pool.reset();
        self.progressive.fill(true);
        self.share_map.fill(false);
    }
}

/// Consumer side of the display queue. Cheap to clone and safe to poll from
/// another thread while decoding continues.
#[derive(Debug)]
pub struct DisplayHandle<P: PictureStore> {
    pub(crate) shared: Arc<Mutex<SharedStore<P>>>,
}

impl<P: PictureStore> Clone for DisplayHandle<P> {
    fn clone(&self) -> Self {
        DisplayHandle { shared: Arc::clone(&self.shared) }
    }
}

impl<P: PictureStore> DisplayHandle<P> {
    /// Takes the next picture in display order, if one is ready.
    pub fn next_picture(&self) -> Option<DisplayFrame> {
        let mut shared = self.shared.lock().unwrap();
        let (buffer_id, display_seq) = shared.pool.dequeue()?;
        let progressive = shared.progressive.get(buffer_id).copied().unwrap_or(true);

        Some(DisplayFrame { buffer_id, display_seq, progressive })
    }

    /// Hands `frame` back once the application is done displaying it.
    ///
    /// With buffer sharing enabled the buffer stays with the application
    /// until the decoder reclaims it before its next picture.
    pub fn release_picture(&self, frame: DisplayFrame) -> Result<(), StoreError> {
        let mut shared = self.shared.lock().unwrap();

        if shared.share_buffers {
            let slot = shared
                .share_map
                .get_mut(frame.buffer_id)
                .ok_or(StoreError::InvalidBufferId(frame.buffer_id))?;
            *slot = true;

            Ok(())
        } else {
            shared.pool.release(frame.buffer_id, BufferRole::Display)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::Mutex;

    use crate::display::DisplayError;
    use crate::display::DisplayFrame;
    use crate::display::DisplayHandle;
    use crate::display::DisplayId;
    use crate::display::DisplayMap;
    use crate::display::SharedStore;
    use crate::store::BufferPool;
    use crate::store::BufferRole;
    use crate::store::PictureStore;

    #[test]
    fn reorder_delay_and_sequence() {
        let mut map = DisplayMap::default();
        map.configure(2, 4);

        map.track_poc(4);
        map.insert(DisplayId::Buffer(0), 4, 1, true).unwrap();
        assert_eq!(map.assign_display_seq(), Ok(None));

        // Two pictures pending covers the delay. The lowest POC goes first.
        map.track_poc(2);
        map.insert(DisplayId::Buffer(1), 2, 2, true).unwrap();
        let frame = map.assign_display_seq().unwrap().unwrap();
        assert_eq!((frame.buffer_id, frame.display_seq), (1, 1));

        map.track_poc(6);
        map.insert(DisplayId::Buffer(2), 6, 3, true).unwrap();
        let frame = map.assign_display_seq().unwrap().unwrap();
        assert_eq!((frame.buffer_id, frame.display_seq), (0, 2));

        let frames = map.drain();
        let order: Vec<_> = frames.iter().map(|f| (f.buffer_id, f.display_seq)).collect();
        assert_eq!(order, vec![(2, 3)]);
    }

    #[test]
    fn poc_restart_keeps_display_order() {
        let mut map = DisplayMap::default();
        map.configure(0, 4);

        map.track_poc(0);
        map.insert(DisplayId::Buffer(0), 0, 0, true).unwrap();
        let first = map.assign_display_seq().unwrap().unwrap();

        map.track_poc(4);
        map.insert(DisplayId::Buffer(1), 4, 1, true).unwrap();
        let second = map.assign_display_seq().unwrap().unwrap();

        // An IDR restarts the POC sequence at zero. Its key must still land
        // past everything of the previous epoch.
        map.track_poc(0);
        map.insert(DisplayId::Buffer(2), 0, 0, true).unwrap();
        let third = map.assign_display_seq().unwrap().unwrap();

        assert_eq!(
            (first.display_seq, second.display_seq, third.display_seq),
            (1, 2, 3)
        );
    }

    #[test]
    fn gap_standins_cannot_be_displayed() {
        let mut map = DisplayMap::default();
        map.configure(1, 2);

        map.insert(DisplayId::NonExisting, 0, 1, true).unwrap();
        assert_eq!(map.assign_display_seq(), Ok(None));

        map.insert(DisplayId::NonExisting, 0, 2, true).unwrap();
        assert_eq!(map.assign_display_seq(), Err(DisplayError::GapsInFrameNum));

        // Nothing was freed by the failed attempt.
        assert_eq!(map.pending(), 2);
    }

    #[test]
    fn drain_discards_gap_standins() {
        let mut map = DisplayMap::default();
        map.configure(4, 4);

        map.track_poc(2);
        map.insert(DisplayId::Buffer(0), 2, 0, true).unwrap();
        map.insert(DisplayId::NonExisting, 0, 1, true).unwrap();
        map.track_poc(4);
        map.insert(DisplayId::Buffer(1), 4, 2, false).unwrap();

        let frames = map.drain();
        let order: Vec<_> = frames.iter().map(|f| (f.buffer_id, f.display_seq)).collect();
        assert_eq!(order, vec![(0, 1), (1, 2)]);
        assert_eq!(map.pending(), 0);
        assert!(!frames[1].progressive);
    }

    #[test]
    fn remove_gap_standin() {
        let mut map = DisplayMap::default();
        map.configure(1, 4);

        map.insert(DisplayId::NonExisting, 0, 7, true).unwrap();
        map.insert(DisplayId::Buffer(3), 2, 8, true).unwrap();

        assert!(map.remove_nonexisting(7));
        assert!(!map.remove_nonexisting(7));
        assert_eq!(map.pending(), 1);

        let frame = map.assign_display_seq().unwrap().unwrap();
        assert_eq!(frame.buffer_id, 3);
    }

    #[test]
    fn handle_crosses_threads() {
        let pool = BufferPool::new(2);
        let shared = Arc::new(Mutex::new(SharedStore::new(pool, false)));
        {
            let mut shared = shared.lock().unwrap();
            let id = shared.pool.allocate().unwrap();
            shared.pool.retain(id, BufferRole::Display).unwrap();
            shared.push(DisplayFrame { buffer_id: id, display_seq: 1, progressive: false });
        }

        let handle = DisplayHandle { shared };
        let consumer = handle.clone();
        let frame =
            std::thread::spawn(move || consumer.next_picture()).join().unwrap().unwrap();
        assert_eq!(frame.display_seq, 1);
        assert!(!frame.progressive);

        handle.release_picture(frame).unwrap();
        assert!(handle.next_picture().is_none());
    }

    #[test]
    fn shared_buffers_release_is_deferred() {
        let pool = BufferPool::new(1);
        let shared = Arc::new(Mutex::new(SharedStore::new(pool, true)));
        {
            let mut shared = shared.lock().unwrap();
            let id = shared.pool.allocate().unwrap();
            shared.pool.retain(id, BufferRole::Display).unwrap();
            shared.push(DisplayFrame { buffer_id: id, display_seq: 1, progressive: true });
        }

        let handle = DisplayHandle { shared: Arc::clone(&shared) };
        let frame = handle.next_picture().unwrap();
        handle.release_picture(frame).unwrap();

        // The buffer is only flagged for the decoder to reclaim.
        let mut shared = shared.lock().unwrap();
        assert!(shared.share_map[0]);
        assert!(shared.pool.allocate().is_err());
    }
}
