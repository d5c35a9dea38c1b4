// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::Mutex;

use thiserror::Error;

use crate::display::DisplayFrame;
use crate::display::DisplayHandle;
use crate::display::DisplayId;
use crate::display::DisplayMap;
use crate::display::SharedStore;
use crate::dpb::Dpb;
use crate::dpb::DpbEntry;
use crate::dpb::MmcoError;
use crate::dpb::DPB_MAX_SIZE;
use crate::picture::Field;
use crate::picture::IsIdr;
use crate::picture::PictureData;
use crate::picture::Reference;
use crate::poc::PocContext;
use crate::slice::MaxLongTermFrameIdx;
use crate::slice::SliceHeader;
use crate::sps::Sps;
use crate::store::BufferId;
use crate::store::BufferRole;
use crate::store::PictureStore;
use crate::DpbError;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GapError {
    #[error("invalid frame_num: {0}")]
    InvalidFrameNum(i32),
    #[error("no free slot to track a frame_num gap")]
    GapTableFull,
}

#[derive(Clone, Copy, Debug)]
struct GapRange {
    start: i32,
    end: i32,
    pictures: u8,
}

/// Bookkeeping for the synthetic pictures injected over frame_num gaps.
///
/// Each range remembers how many of its stand-ins still sit in the DPB, so
/// that its slot can be reused once the last one ages out.
#[derive(Debug, Default)]
struct GapTracker {
    slots: [Option<GapRange>; DPB_MAX_SIZE],
}

impl GapTracker {
    /// Claims a slot for the frame_nums `start..=end` in decode order.
    fn reserve(&mut self, start: i32, end: i32) -> Result<usize, GapError> {
        let index =
            self.slots.iter().position(|s| s.is_none()).ok_or(GapError::GapTableFull)?;
        self.slots[index] = Some(GapRange { start, end, pictures: 0 });

        Ok(index)
    }

    fn increment(&mut self, index: usize) {
        if let Some(range) = &mut self.slots[index] {
            range.pictures += 1;
        }
    }

    /// Rebases the tracked ranges the way reference pic_nums are rebased, so
    /// that they keep matching the frame_num_wrap values of their pictures.
    fn remap(&mut self, cur_frame_num: i32, max_frame_num: i32) {
        for range in self.slots.iter_mut().flatten() {
            if range.start > cur_frame_num {
                range.start -= max_frame_num;
            }
            if range.end > cur_frame_num {
                range.end -= max_frame_num;
            }
        }
    }

    /// Notes that the stand-in with the given frame_num_wrap left the DPB.
    fn release(&mut self, frame_num_wrap: i32) {
        for slot in &mut self.slots {
            let Some(range) = slot else { continue };
            if frame_num_wrap < range.start || frame_num_wrap > range.end {
                continue;
            }

            range.pictures = range.pictures.saturating_sub(1);
            if range.pictures == 0 {
                *slot = None;
            }

            return;
        }
    }

    fn clear(&mut self) {
        self.slots = Default::default();
    }
}

struct CurrentPicture {
    pic: PictureData,
    buffer_id: BufferId,
    sps: Rc<Sps>,
}

/// Drives the DPB for one coded video sequence after another: POC
/// derivation, reference marking, frame_num gap recovery and display
/// bumping.
///
/// One thread decodes, calling [`DpbManager::begin_picture`] and
/// [`DpbManager::finish_picture`] around each picture. A consumer, possibly
/// on another thread, pulls pictures in display order through a
/// [`DisplayHandle`].
pub struct DpbManager<P: PictureStore> {
    sps: Option<Rc<Sps>>,
    dpb: Dpb,
    display: DisplayMap,
    gaps: GapTracker,
    poc: PocContext,
    cur_pic: Option<CurrentPicture>,
    max_long_term_frame_idx: MaxLongTermFrameIdx,
    ref_pic_list: Vec<DpbEntry>,
    shared: Arc<Mutex<SharedStore<P>>>,
}

impl<P: PictureStore> DpbManager<P> {
    /// Builds a manager decoding into `store`. With `share_buffers` the
    /// consumer's buffer releases are deferred until the decoder reclaims
    /// them.
    pub fn new(store: P, share_buffers: bool) -> Self {
        DpbManager {
            sps: None,
            dpb: Default::default(),
            display: Default::default(),
            gaps: Default::default(),
            poc: Default::default(),
            cur_pic: None,
            max_long_term_frame_idx: Default::default(),
            ref_pic_list: Vec::new(),
            shared: Arc::new(Mutex::new(SharedStore::new(store, share_buffers))),
        }
    }

    /// A cloneable handle for consuming pictures in display order.
    pub fn display_handle(&self) -> DisplayHandle<P> {
        DisplayHandle { shared: Arc::clone(&self.shared) }
    }

    /// Takes the next picture in display order, if one is ready.
    pub fn next_display_picture(&self) -> Option<DisplayFrame> {
        self.display_handle().next_picture()
    }

    /// The reference pictures predicting from the DPB, in the default order
    /// of clause 8.2.4.2.1.
    pub fn reference_list(&self) -> &[DpbEntry] {
        &self.ref_pic_list
    }

    /// Starts decoding a picture: applies `sps`, recovers any frame_num
    /// gap, derives the POC and allocates the buffer to decode into.
    pub fn begin_picture(
        &mut self,
        sps: &Rc<Sps>,
        hdr: &SliceHeader,
    ) -> Result<BufferId, DpbError> {
        if let Some(abandoned) = self.cur_pic.take() {
            log::debug!("Abandoning unfinished picture POC {}", abandoned.pic.pic_order_cnt);
            self.shared
                .lock()
                .unwrap()
                .pool
                .release(abandoned.buffer_id, BufferRole::Decode)?;
        }

        self.reclaim_shared()?;
        self.activate_sps(sps)?;

        // An IDR legitimately restarts the frame numbering.
        if hdr.idr_pic_flag {
            self.poc.prev_ref.frame_num = 0;
        }

        let frame_num = i32::from(hdr.frame_num);
        let max_frame_num = sps.max_frame_num() as i32;
        let prev_ref_frame_num = self.poc.prev_ref.frame_num;
        let next_expected = (prev_ref_frame_num + 1) % max_frame_num;

        if frame_num != prev_ref_frame_num
            && frame_num != next_expected
            && !(hdr.idr_pic_flag && next_expected >= frame_num)
        {
            self.handle_frame_num_gap(sps, frame_num)?;
        }

        let mut pic = PictureData::new_from_slice(hdr);
        self.poc.compute_pic_order_count(&mut pic, sps)?;
        log::debug!(
            "Starting picture, frame_num {}, POC {}",
            pic.frame_num,
            pic.pic_order_cnt
        );

        let buffer_id = self.shared.lock().unwrap().pool.allocate()?;

        self.dpb.update_pic_nums(frame_num, max_frame_num, &pic);
        self.gaps.remap(frame_num, max_frame_num);
        self.ref_pic_list = self.dpb.default_index_list();

        self.cur_pic = Some(CurrentPicture { pic, buffer_id, sps: Rc::clone(sps) });

        Ok(buffer_id)
    }

    /// Finishes the picture started by [`DpbManager::begin_picture`]: runs
    /// reference marking, queues the picture for display and stores it in
    /// the DPB if it is a reference.
    pub fn finish_picture(&mut self) -> Result<(), DpbError> {
        let CurrentPicture { pic, buffer_id, sps } =
            self.cur_pic.take().ok_or(DpbError::NoCurrentPicture)?;

        log::debug!("Finishing picture POC {}", pic.pic_order_cnt);

        let result = self.commit_picture(pic, buffer_id, &sps);

        // Decoding into the buffer is over either way; a dropped picture
        // must not starve the pool.
        self.shared.lock().unwrap().pool.release(buffer_id, BufferRole::Decode)?;
        self.ref_pic_list = self.dpb.default_index_list();

        result
    }

    fn commit_picture(
        &mut self,
        mut pic: PictureData,
        buffer_id: BufferId,
        sps: &Sps,
    ) -> Result<(), DpbError> {
        if pic.nal_ref_idc != 0 {
            self.reference_pic_marking(&mut pic, sps)?;
            self.poc.fill_prev_ref_info(&pic);
        }

        self.poc.fill_prev_info(&pic);
        self.purge_unused()?;

        if pic.has_mmco_5 {
            // 8.2.5.4.5 empties the DPB, so everything pending displays
            // ahead of the re-rooted sequence.
            self.drain_display();
        }

        self.display.track_poc(pic.pic_order_cnt);
        self.display.insert(
            DisplayId::Buffer(buffer_id),
            pic.pic_order_cnt,
            pic.frame_num,
            matches!(pic.field, Field::Frame),
        )?;
        self.shared.lock().unwrap().pool.retain(buffer_id, BufferRole::Display)?;

        if pic.is_ref() {
            self.shared.lock().unwrap().pool.retain(buffer_id, BufferRole::Reference)?;
            if let Err(err) = self.dpb.store_picture(Rc::new(RefCell::new(pic)), Some(buffer_id))
            {
                self.shared.lock().unwrap().pool.release(buffer_id, BufferRole::Reference)?;
                return Err(err.into());
            }
        }

        if let Some(frame) = self.display.assign_display_seq()? {
            self.shared.lock().unwrap().push(frame);
        }

        Ok(())
    }

    /// Empties the DPB and sends every pending picture out in display
    /// order, as at end of stream or before a seek.
    pub fn flush(&mut self) -> Result<(), DpbError> {
        log::debug!("Flushing the DPB");

        self.dpb.mark_all_ref_pics_as_unused();
        self.gaps.clear();
        self.max_long_term_frame_idx = MaxLongTermFrameIdx::NoLongTermFrameIndices;
        self.poc.reset_after_flush();

        self.purge_unused()?;
        self.drain_display();
        self.ref_pic_list.clear();

        Ok(())
    }

    /// Releases the buffers the consumer handed back while buffer sharing
    /// is on.
    fn reclaim_shared(&mut self) -> Result<(), DpbError> {
        let mut shared = self.shared.lock().unwrap();
        if !shared.share_buffers {
            return Ok(());
        }

        let shared = &mut *shared;
        for (buffer_id, returned) in shared.share_map.iter_mut().enumerate() {
            if std::mem::take(returned) {
                shared.pool.release(buffer_id, BufferRole::Display)?;
            }
        }

        Ok(())
    }

    fn needs_reinit(old: &Sps, new: &Sps) -> bool {
        old.pic_width_in_mbs_minus1 != new.pic_width_in_mbs_minus1
            || old.pic_height_in_map_units_minus1 != new.pic_height_in_map_units_minus1
            || old.level_idc != new.level_idc
            || old.profile_idc != new.profile_idc
            || old.frame_mbs_only_flag != new.frame_mbs_only_flag
    }

    /// Applies `sps`, restarting the whole session if the coded sequence
    /// changed shape.
    fn activate_sps(&mut self, sps: &Rc<Sps>) -> Result<(), DpbError> {
        if let Some(old) = &self.sps {
            if !Self::needs_reinit(old, sps) {
                self.sps = Some(Rc::clone(sps));
                return Ok(());
            }
        }

        self.flush()?;

        let capacity = {
            let mut shared = self.shared.lock().unwrap();
            shared.reset();
            shared.pool.capacity()
        };

        let max_dec_frame_buffering = sps
            .max_dpb_frames()
            .min(usize::from(sps.max_num_ref_frames))
            .min(capacity)
            .clamp(1, DPB_MAX_SIZE);

        let mut display_delay =
            std::cmp::min(sps.max_num_order_frames() as usize, max_dec_frame_buffering);
        if sps.vui_parameters_present_flag && sps.vui_parameters.bitstream_restriction_flag {
            let mut vui_delay = sps.vui_parameters.max_num_reorder_frames as usize + 1;
            if !sps.frame_mbs_only_flag {
                vui_delay *= 2;
            }
            display_delay = std::cmp::min(display_delay, vui_delay);
        }

        log::debug!(
            "Stream needs {} buffers, display delay is {}",
            max_dec_frame_buffering,
            display_delay
        );

        self.dpb.clear();
        self.dpb.set_max_num_pics(max_dec_frame_buffering);
        self.display.configure(display_delay, max_dec_frame_buffering);
        self.gaps.clear();
        self.poc = Default::default();
        self.max_long_term_frame_idx = Default::default();
        self.ref_pic_list.clear();
        self.sps = Some(Rc::clone(sps));

        Ok(())
    }

    /// The reference marking process of clause 8.2.5.
    fn reference_pic_marking(
        &mut self,
        pic: &mut PictureData,
        sps: &Sps,
    ) -> Result<(), DpbError> {
        if matches!(pic.is_idr, IsIdr::Yes { .. }) {
            self.dpb.mark_all_ref_pics_as_unused();
            self.gaps.clear();

            if pic.ref_pic_marking.long_term_reference_flag {
                pic.set_reference(Reference::LongTerm);
                pic.long_term_frame_idx = 0;
                self.max_long_term_frame_idx = MaxLongTermFrameIdx::Idx(0);
            } else {
                pic.set_reference(Reference::ShortTerm);
                self.max_long_term_frame_idx = MaxLongTermFrameIdx::NoLongTermFrameIndices;
            }
        } else if pic.ref_pic_marking.adaptive_ref_pic_marking_mode_flag {
            self.handle_memory_management_ops(pic)?;
            // The op list may unmark nothing; the window still has to make
            // room before the current picture is stored.
            self.dpb.sliding_window_marking(usize::from(sps.max_num_ref_frames))?;
        } else {
            self.dpb.sliding_window_marking(usize::from(sps.max_num_ref_frames))?;
        }

        Ok(())
    }

    /// Clause 8.2.5.4: applies the stream's explicit marking operations.
    fn handle_memory_management_ops(&mut self, pic: &mut PictureData) -> Result<(), DpbError> {
        let markings = pic.ref_pic_marking.clone();

        for marking in &markings.inner {
            match marking.memory_management_control_operation {
                0 => break,
                1 => self.dpb.mmco_op_1(pic, marking)?,
                2 => self.dpb.mmco_op_2(marking)?,
                3 => self.dpb.mmco_op_3(pic, marking)?,
                4 => self.max_long_term_frame_idx = self.dpb.mmco_op_4(marking),
                5 => self.mmco_op_5(pic),
                6 => self.dpb.mmco_op_6(pic, marking),
                other => return Err(MmcoError::UnknownOperation(other).into()),
            }
        }

        Ok(())
    }

    /// Memory management control operation 5: unmark every reference and
    /// restart the picture numbering and POC from the current picture.
    fn mmco_op_5(&mut self, pic: &mut PictureData) {
        self.dpb.mark_all_ref_pics_as_unused();
        self.gaps.clear();
        self.max_long_term_frame_idx = MaxLongTermFrameIdx::NoLongTermFrameIndices;

        pic.has_mmco_5 = true;
        pic.frame_num = 0;
        pic.pic_num = 0;

        match pic.field {
            Field::Frame => {
                let poc = pic.pic_order_cnt;
                pic.top_field_order_cnt -= poc;
                pic.bottom_field_order_cnt -= poc;
                pic.pic_order_cnt =
                    std::cmp::min(pic.top_field_order_cnt, pic.bottom_field_order_cnt);
            }
            Field::Top => {
                pic.top_field_order_cnt = 0;
                pic.pic_order_cnt = 0;
            }
            Field::Bottom => {
                pic.bottom_field_order_cnt = 0;
                pic.pic_order_cnt = 0;
            }
        }
    }

    /// Clause 8.2.5.2: synthesizes short term references for the frame_nums
    /// skipped between the previous reference picture and `frame_num`.
    fn handle_frame_num_gap(&mut self, sps: &Sps, frame_num: i32) -> Result<(), DpbError> {
        if self.dpb.is_empty() {
            return Ok(());
        }

        if !sps.gaps_in_frame_num_value_allowed_flag {
            return Err(GapError::InvalidFrameNum(frame_num).into());
        }

        log::debug!("frame_num gap detected");

        let max_frame_num = sps.max_frame_num() as i32;
        let mut unused_short_term_frame_num =
            (self.poc.prev_ref.frame_num + 1) % max_frame_num;

        let gap_start = unused_short_term_frame_num;
        let gap_end = (frame_num + max_frame_num - 1) % max_frame_num;
        let gap_index = self.gaps.reserve(gap_start, gap_end)?;

        while unused_short_term_frame_num != frame_num {
            self.purge_unused()?;

            let mut pic = PictureData::new_non_existing(unused_short_term_frame_num);

            if sps.pic_order_cnt_type != 0 {
                self.poc.compute_pic_order_count(&mut pic, sps)?;
                self.display.track_poc(pic.pic_order_cnt);
                self.poc.fill_prev_info(&pic);
            }

            // A saturated table needs a picture bumped out to make room.
            if self.display.pending() >= self.display.max_dec_frame_buffering() {
                if let Some(frame) = self.display.assign_display_seq()? {
                    self.shared.lock().unwrap().push(frame);
                }
            }

            self.display.insert(
                DisplayId::NonExisting,
                pic.pic_order_cnt,
                pic.frame_num,
                true,
            )?;
            self.gaps.increment(gap_index);

            self.dpb.update_pic_nums(unused_short_term_frame_num, max_frame_num, &pic);
            self.dpb.sliding_window_marking(usize::from(sps.max_num_ref_frames))?;
            // The window only unmarks its victim; it must actually leave
            // the DPB before the stand-in takes the slot.
            self.purge_unused()?;

            pic.set_reference(Reference::ShortTerm);
            self.dpb.store_picture(Rc::new(RefCell::new(pic)), None)?;

            unused_short_term_frame_num = (unused_short_term_frame_num + 1) % max_frame_num;
        }

        Ok(())
    }

    /// Drops unmarked pictures from the DPB, releasing whatever they held.
    fn purge_unused(&mut self) -> Result<(), DpbError> {
        let removed = self.dpb.remove_unused();
        if removed.is_empty() {
            return Ok(());
        }

        let mut shared = self.shared.lock().unwrap();
        for entry in removed {
            let pic = entry.pic.borrow();

            if pic.nonexisting {
                self.display.remove_nonexisting(pic.frame_num);
                self.gaps.release(pic.frame_num_wrap);
            }

            if let Some(buffer_id) = entry.buffer_id {
                shared.pool.release(buffer_id, BufferRole::Reference)?;
            }
        }

        Ok(())
    }

    fn drain_display(&mut self) {
        let frames = self.display.drain();
        if frames.is_empty() {
            return;
        }

        let mut shared = self.shared.lock().unwrap();
        for frame in frames {
            shared.push(frame);
        }
    }
}
