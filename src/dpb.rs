// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::cell::Ref;
use std::cell::RefCell;
use std::cell::RefMut;
use std::rc::Rc;

use thiserror::Error;

use crate::picture::Field;
use crate::picture::PictureData;
use crate::picture::Reference;
use crate::slice::MaxLongTermFrameIdx;
use crate::slice::RefPicMarkingInner;
use crate::store::BufferId;

// All levels of table A-1 allow at most 16 reference frames.
pub const DPB_MAX_SIZE: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StorePictureError {
    #[error("DPB is full")]
    DpbIsFull,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MmcoError {
    #[error("could not find a ShortTerm picture to mark in the DPB")]
    NoShortTermPic,
    #[error("picture expected to be marked as LongTerm is not")]
    ExpectedMarked,
    #[error("unknown memory_management_control_operation: {0}")]
    UnknownOperation(u8),
}

/// An entry in the DPB: the picture bookkeeping plus the handle of the
/// buffer backing its pixel data. Non-existing pictures carry no buffer.
#[derive(Clone, Debug)]
pub struct DpbEntry {
    pub pic: Rc<RefCell<PictureData>>,
    pub buffer_id: Option<BufferId>,
}

/// The set of pictures held for referencing, indexed and aged per clauses
/// 8.2.4 and 8.2.5.
#[derive(Debug, Default)]
pub struct Dpb {
    entries: Vec<DpbEntry>,
    max_num_pics: usize,
}

impl Dpb {
    /// Returns the entries currently held.
    pub fn entries(&self) -> &Vec<DpbEntry> {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn set_max_num_pics(&mut self, max_num_pics: usize) {
        self.max_num_pics = max_num_pics;
    }

    pub fn max_num_pics(&self) -> usize {
        self.max_num_pics
    }

    /// An iterator over the pictures stored in the DPB.
    fn pictures(&self) -> impl Iterator<Item = Ref<'_, PictureData>> {
        self.entries.iter().map(|e| e.pic.borrow())
    }

    /// A mutable iterator over the pictures stored in the DPB.
    fn pictures_mut(&mut self) -> impl Iterator<Item = RefMut<'_, PictureData>> {
        self.entries.iter().map(|e| e.pic.borrow_mut())
    }

    /// The number of entries currently marked as reference.
    pub fn num_ref_pics(&self) -> usize {
        self.pictures().filter(|p| p.is_ref()).count()
    }

    /// Stores a picture in the DPB.
    pub fn store_picture(
        &mut self,
        pic: Rc<RefCell<PictureData>>,
        buffer_id: Option<BufferId>,
    ) -> Result<(), StorePictureError> {
        if self.entries.len() >= self.max_num_pics {
            return Err(StorePictureError::DpbIsFull);
        }

        log::debug!(
            "Stored picture POC {}, the DPB length is {}",
            pic.borrow().pic_order_cnt,
            self.entries.len() + 1
        );
        self.entries.push(DpbEntry { pic, buffer_id });

        Ok(())
    }

    /// Updates pic_num, frame_num_wrap and long_term_pic_num of every
    /// reference entry relative to the current picture, per clause 8.2.4.1.
    pub fn update_pic_nums(
        &mut self,
        frame_num: i32,
        max_frame_num: i32,
        current_pic: &PictureData,
    ) {
        for mut pic in self.pictures_mut() {
            if !pic.is_ref() {
                continue;
            }

            if *pic.reference() == Reference::LongTerm {
                pic.long_term_pic_num = if matches!(current_pic.field, Field::Frame) {
                    pic.long_term_frame_idx
                } else if current_pic.field == pic.field {
                    2 * pic.long_term_frame_idx + 1
                } else {
                    2 * pic.long_term_frame_idx
                };
            } else {
                pic.frame_num_wrap = if pic.frame_num > frame_num {
                    pic.frame_num - max_frame_num
                } else {
                    pic.frame_num
                };

                pic.pic_num = if matches!(current_pic.field, Field::Frame) {
                    pic.frame_num_wrap
                } else if pic.field == current_pic.field {
                    2 * pic.frame_num_wrap + 1
                } else {
                    2 * pic.frame_num_wrap
                };
            }
        }
    }

    /// Finds the short term reference picture with the given `pic_num`.
    pub fn find_short_term_with_pic_num(&self, pic_num: i32) -> Option<&DpbEntry> {
        let position = self
            .pictures()
            .position(|p| matches!(p.reference(), Reference::ShortTerm) && p.pic_num == pic_num)?;

        Some(&self.entries[position])
    }

    /// Finds the long term reference picture with the given
    /// `long_term_pic_num`.
    pub fn find_long_term_with_long_term_pic_num(
        &self,
        long_term_pic_num: u32,
    ) -> Option<&DpbEntry> {
        let position = self.pictures().position(|p| {
            matches!(p.reference(), Reference::LongTerm)
                && p.long_term_pic_num == long_term_pic_num
        })?;

        Some(&self.entries[position])
    }

    fn find_long_term_with_long_term_frame_idx(
        &self,
        long_term_frame_idx: u32,
    ) -> Option<&DpbEntry> {
        let position = self.pictures().position(|p| {
            matches!(p.reference(), Reference::LongTerm)
                && p.long_term_frame_idx == long_term_frame_idx
        })?;

        Some(&self.entries[position])
    }

    /// Unmarks every reference picture, per the IDR and MMCO 5 paths of
    /// clause 8.2.5.
    pub fn mark_all_ref_pics_as_unused(&mut self) {
        for mut pic in self.pictures_mut() {
            pic.set_reference(Reference::None);
        }
    }

    /// The sliding window process of clause 8.2.5.3: while the DPB holds
    /// `max_num_ref_frames` references, unmark the short term one with the
    /// lowest frame_num_wrap.
    pub fn sliding_window_marking(&self, max_num_ref_frames: usize) -> Result<(), MmcoError> {
        let max_num_ref_frames = std::cmp::max(max_num_ref_frames, 1);
        let mut num_ref_pics = self.num_ref_pics();

        while num_ref_pics >= max_num_ref_frames {
            let to_unmark = self
                .entries
                .iter()
                .filter(|e| matches!(e.pic.borrow().reference(), Reference::ShortTerm))
                .min_by_key(|e| e.pic.borrow().frame_num_wrap)
                .ok_or(MmcoError::NoShortTermPic)?;

            to_unmark.pic.borrow_mut().set_reference(Reference::None);
            num_ref_pics -= 1;
        }

        Ok(())
    }

    /// Memory management control operation 1: unmark a short term picture.
    pub fn mmco_op_1(
        &self,
        pic: &PictureData,
        marking: &RefPicMarkingInner,
    ) -> Result<(), MmcoError> {
        let pic_num_x = pic.pic_num - (marking.difference_of_pic_nums_minus1 as i32 + 1);

        let to_mark =
            self.find_short_term_with_pic_num(pic_num_x).ok_or(MmcoError::NoShortTermPic)?;

        to_mark.pic.borrow_mut().set_reference(Reference::None);

        Ok(())
    }

    /// Memory management control operation 2: unmark a long term picture.
    pub fn mmco_op_2(&self, marking: &RefPicMarkingInner) -> Result<(), MmcoError> {
        let to_mark = self
            .find_long_term_with_long_term_pic_num(marking.long_term_pic_num)
            .ok_or(MmcoError::ExpectedMarked)?;

        to_mark.pic.borrow_mut().set_reference(Reference::None);

        Ok(())
    }

    /// Memory management control operation 3: make a short term picture a
    /// long term one with the given index.
    pub fn mmco_op_3(
        &self,
        pic: &PictureData,
        marking: &RefPicMarkingInner,
    ) -> Result<(), MmcoError> {
        let pic_num_x = pic.pic_num - (marking.difference_of_pic_nums_minus1 as i32 + 1);

        // A long term reference already using the index is unmarked first.
        if let Some(old) =
            self.find_long_term_with_long_term_frame_idx(marking.long_term_frame_idx)
        {
            old.pic.borrow_mut().set_reference(Reference::None);
        }

        let to_mark =
            self.find_short_term_with_pic_num(pic_num_x).ok_or(MmcoError::NoShortTermPic)?;

        let mut to_mark = to_mark.pic.borrow_mut();
        to_mark.set_reference(Reference::LongTerm);
        to_mark.long_term_frame_idx = marking.long_term_frame_idx;

        Ok(())
    }

    /// Memory management control operation 4: update the maximum long term
    /// frame index, unmarking any long term reference above it.
    pub fn mmco_op_4(&self, marking: &RefPicMarkingInner) -> MaxLongTermFrameIdx {
        for entry in &self.entries {
            let mut pic = entry.pic.borrow_mut();
            if matches!(pic.reference(), Reference::LongTerm)
                && marking.max_long_term_frame_idx < pic.long_term_frame_idx
            {
                pic.set_reference(Reference::None);
            }
        }

        marking.max_long_term_frame_idx
    }

    /// Memory management control operation 6: mark the current picture as a
    /// long term reference with the given index.
    pub fn mmco_op_6(&self, pic: &mut PictureData, marking: &RefPicMarkingInner) {
        if let Some(old) =
            self.find_long_term_with_long_term_frame_idx(marking.long_term_frame_idx)
        {
            old.pic.borrow_mut().set_reference(Reference::None);
        }

        pic.set_reference(Reference::LongTerm);
        pic.long_term_frame_idx = marking.long_term_frame_idx;
    }

    /// Removes every entry no longer marked as reference, returning them so
    /// the caller can release the resources they held.
    pub fn remove_unused(&mut self) -> Vec<DpbEntry> {
        let entries = std::mem::take(&mut self.entries);
        let (kept, removed): (Vec<_>, Vec<_>) =
            entries.into_iter().partition(|e| e.pic.borrow().is_ref());
        self.entries = kept;

        for entry in &removed {
            log::debug!("Removing POC {} from the DPB", entry.pic.borrow().pic_order_cnt);
        }

        removed
    }

    /// The default reference picture order of clause 8.2.4.2.1: short term
    /// references by descending pic_num, then long term references by
    /// ascending long_term_frame_idx.
    pub fn default_index_list(&self) -> Vec<DpbEntry> {
        let mut short_term: Vec<_> = self
            .entries
            .iter()
            .filter(|e| matches!(e.pic.borrow().reference(), Reference::ShortTerm))
            .cloned()
            .collect();
        short_term.sort_by_key(|e| std::cmp::Reverse(e.pic.borrow().pic_num));

        let mut long_term: Vec<_> = self
            .entries
            .iter()
            .filter(|e| matches!(e.pic.borrow().reference(), Reference::LongTerm))
            .cloned()
            .collect();
        long_term.sort_by_key(|e| e.pic.borrow().long_term_frame_idx);

        short_term.extend(long_term);
        short_term
    }

    /// Clears the DPB, keeping its configured limits.
    pub fn clear(&mut self) {
        log::debug!("Clearing the DPB");
        let max_num_pics = self.max_num_pics;
        *self = Default::default();
        self.max_num_pics = max_num_pics;
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use crate::dpb::Dpb;
    use crate::dpb::MmcoError;
    use crate::dpb::StorePictureError;
    use crate::dpb::DPB_MAX_SIZE;
    use crate::picture::PictureData;
    use crate::picture::Reference;
    use crate::slice::MaxLongTermFrameIdx;
    use crate::slice::RefPicMarkingInner;
    use crate::slice::SliceHeader;

    fn short_term(frame_num: u16) -> Rc<RefCell<PictureData>> {
        let pic = PictureData::new_from_slice(&SliceHeader {
            nal_ref_idc: 1,
            frame_num,
            ..Default::default()
        });
        Rc::new(RefCell::new(pic))
    }

    fn current(frame_num: u16) -> PictureData {
        let mut pic = PictureData::new_from_slice(&SliceHeader {
            nal_ref_idc: 1,
            frame_num,
            ..Default::default()
        });
        pic.pic_num = pic.frame_num;
        pic
    }

    fn dpb_with_frame_nums(frame_nums: &[u16]) -> Dpb {
        let mut dpb = Dpb::default();
        dpb.set_max_num_pics(DPB_MAX_SIZE);
        for &frame_num in frame_nums {
            dpb.store_picture(short_term(frame_num), None).unwrap();
        }
        dpb
    }

    #[test]
    fn pic_num_wraparound() {
        let mut dpb = dpb_with_frame_nums(&[14, 15]);

        // frame_num wrapped: references numerically above the current
        // picture get negative pic_nums.
        let cur = current(2);
        dpb.update_pic_nums(2, 16, &cur);

        let pic_nums: Vec<_> = dpb.entries().iter().map(|e| e.pic.borrow().pic_num).collect();
        assert_eq!(pic_nums, vec![-2, -1]);
    }

    #[test]
    fn store_up_to_capacity() {
        let mut dpb = Dpb::default();
        dpb.set_max_num_pics(DPB_MAX_SIZE);

        for frame_num in 0..DPB_MAX_SIZE as u16 {
            dpb.store_picture(short_term(frame_num), None).unwrap();
        }

        assert_eq!(
            dpb.store_picture(short_term(16), None),
            Err(StorePictureError::DpbIsFull)
        );
        assert_eq!(dpb.len(), DPB_MAX_SIZE);
    }

    #[test]
    fn sliding_window_unmarks_lowest() {
        let mut dpb = dpb_with_frame_nums(&[1, 2, 3]);
        let cur = current(4);
        dpb.update_pic_nums(4, 16, &cur);

        dpb.sliding_window_marking(3).unwrap();

        assert_eq!(dpb.num_ref_pics(), 2);
        assert!(!dpb.entries()[0].pic.borrow().is_ref());
        assert!(dpb.entries()[1].pic.borrow().is_ref());
    }

    #[test]
    fn mmco_unmark_short_term() {
        let mut dpb = dpb_with_frame_nums(&[3, 4]);
        let cur = current(5);
        dpb.update_pic_nums(5, 16, &cur);

        let marking = RefPicMarkingInner {
            memory_management_control_operation: 1,
            difference_of_pic_nums_minus1: 1,
            ..Default::default()
        };
        dpb.mmco_op_1(&cur, &marking).unwrap();

        assert!(!dpb.entries()[0].pic.borrow().is_ref());
        assert!(dpb.entries()[1].pic.borrow().is_ref());

        // Unmarking it twice cannot work.
        assert_eq!(dpb.mmco_op_1(&cur, &marking), Err(MmcoError::NoShortTermPic));
    }

    #[test]
    fn mmco_convert_then_unmark_long_term() {
        let mut dpb = dpb_with_frame_nums(&[3]);
        let cur = current(5);
        dpb.update_pic_nums(5, 16, &cur);

        let marking = RefPicMarkingInner {
            memory_management_control_operation: 3,
            difference_of_pic_nums_minus1: 1,
            long_term_frame_idx: 2,
            ..Default::default()
        };
        dpb.mmco_op_3(&cur, &marking).unwrap();
        assert_eq!(*dpb.entries()[0].pic.borrow().reference(), Reference::LongTerm);

        // A frame's long_term_pic_num is its long_term_frame_idx.
        dpb.update_pic_nums(5, 16, &cur);
        let marking = RefPicMarkingInner {
            memory_management_control_operation: 2,
            long_term_pic_num: 2,
            ..Default::default()
        };
        dpb.mmco_op_2(&marking).unwrap();
        assert!(!dpb.entries()[0].pic.borrow().is_ref());

        assert_eq!(dpb.mmco_op_2(&marking), Err(MmcoError::ExpectedMarked));
    }

    #[test]
    fn mmco_max_long_term_frame_idx() {
        let dpb = dpb_with_frame_nums(&[0, 1, 2]);
        for (idx, entry) in dpb.entries().iter().enumerate() {
            let mut pic = entry.pic.borrow_mut();
            pic.set_reference(Reference::LongTerm);
            pic.long_term_frame_idx = idx as u32;
        }

        let marking = RefPicMarkingInner {
            memory_management_control_operation: 4,
            max_long_term_frame_idx: MaxLongTermFrameIdx::Idx(1),
            ..Default::default()
        };
        assert_eq!(dpb.mmco_op_4(&marking), MaxLongTermFrameIdx::Idx(1));
        assert_eq!(dpb.num_ref_pics(), 2);

        let marking = RefPicMarkingInner {
            memory_management_control_operation: 4,
            max_long_term_frame_idx: MaxLongTermFrameIdx::NoLongTermFrameIndices,
            ..Default::default()
        };
        dpb.mmco_op_4(&marking);
        assert_eq!(dpb.num_ref_pics(), 0);
    }

    #[test]
    fn mmco_mark_current_long_term() {
        let dpb = dpb_with_frame_nums(&[0]);
        dpb.entries()[0].pic.borrow_mut().set_reference(Reference::LongTerm);

        let mut cur = current(1);
        let marking = RefPicMarkingInner {
            memory_management_control_operation: 6,
            long_term_frame_idx: 0,
            ..Default::default()
        };
        dpb.mmco_op_6(&mut cur, &marking);

        // The index holder is replaced by the current picture.
        assert!(!dpb.entries()[0].pic.borrow().is_ref());
        assert_eq!(*cur.reference(), Reference::LongTerm);
        assert_eq!(cur.long_term_frame_idx, 0);
    }

    #[test]
    fn remove_unused_returns_removed() {
        let mut dpb = dpb_with_frame_nums(&[0, 1, 2]);
        dpb.entries()[1].pic.borrow_mut().set_reference(Reference::None);

        let removed = dpb.remove_unused();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].pic.borrow().frame_num, 1);
        assert_eq!(dpb.len(), 2);
    }

    #[test]
    fn default_index_list_order() {
        let mut dpb = dpb_with_frame_nums(&[1, 3, 2]);
        let cur = current(4);
        dpb.update_pic_nums(4, 16, &cur);

        for (idx, frame_num) in [(1u32, 10u16), (0u32, 11u16)] {
            let lt = short_term(frame_num);
            {
                let mut pic = lt.borrow_mut();
                pic.set_reference(Reference::LongTerm);
                pic.long_term_frame_idx = idx;
            }
            dpb.store_picture(lt, None).unwrap();
        }

        let list = dpb.default_index_list();
        let pic_nums: Vec<_> = list[..3].iter().map(|e| e.pic.borrow().pic_num).collect();
        assert_eq!(pic_nums, vec![3, 2, 1]);
        let lt_idx: Vec<_> =
            list[3..].iter().map(|e| e.pic.borrow().long_term_frame_idx).collect();
        assert_eq!(lt_idx, vec![0, 1]);
    }
}
