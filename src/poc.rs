// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Picture order count derivation, clause 8.2.1.

use enumn::N;
use thiserror::Error;

use crate::picture::Field;
use crate::picture::IsIdr;
use crate::picture::PictureData;
use crate::sps::Sps;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PocError {
    #[error("invalid pic_order_cnt_type: {0}")]
    InvalidPicOrderCntType(u8),
}

/// The three mutually exclusive derivation processes of clause 8.2.1.
#[derive(N, Copy, Clone, Debug, PartialEq, Eq)]
pub enum PicOrderCntType {
    Type0 = 0,
    Type1 = 1,
    Type2 = 2,
}

/// State carried over from the previous reference picture in decoding order,
/// used by the type 0 process.
#[derive(Clone, Debug, Default)]
pub struct PrevReferencePicInfo {
    pub frame_num: i32,
    pub has_mmco_5: bool,
    pub top_field_order_cnt: i32,
    pub pic_order_cnt_msb: i32,
    pub pic_order_cnt_lsb: i32,
    pub field: Field,
}

/// State carried over from the previous picture in decoding order, used by
/// the type 1 and type 2 processes.
#[derive(Clone, Copy, Debug, Default)]
pub struct PrevPicInfo {
    pub frame_num: i32,
    pub frame_num_offset: i32,
    pub has_mmco_5: bool,
}

/// The decoding history the derivation runs against.
///
/// The history is threaded explicitly: the caller refreshes it with
/// [`PocContext::fill_prev_ref_info`] and [`PocContext::fill_prev_info`] once
/// the corresponding picture completes.
#[derive(Clone, Debug, Default)]
pub struct PocContext {
    pub prev_ref: PrevReferencePicInfo,
    pub prev: PrevPicInfo,
}

impl PocContext {
    /// Derives TopFieldOrderCnt, BottomFieldOrderCnt and the final
    /// PicOrderCnt of `pic`.
    pub fn compute_pic_order_count(
        &self,
        pic: &mut PictureData,
        sps: &Sps,
    ) -> Result<(), PocError> {
        let poc_type = PicOrderCntType::n(sps.pic_order_cnt_type)
            .ok_or(PocError::InvalidPicOrderCntType(sps.pic_order_cnt_type))?;

        match poc_type {
            PicOrderCntType::Type0 => self.compute_type0(pic, sps),
            PicOrderCntType::Type1 => self.compute_type1(pic, sps),
            PicOrderCntType::Type2 => self.compute_type2(pic, sps),
        }

        pic.pic_order_cnt = match pic.field {
            Field::Frame => std::cmp::min(pic.top_field_order_cnt, pic.bottom_field_order_cnt),
            Field::Top => pic.top_field_order_cnt,
            Field::Bottom => pic.bottom_field_order_cnt,
        };

        Ok(())
    }

    // Clause 8.2.1.1.
    fn compute_type0(&self, pic: &mut PictureData, sps: &Sps) {
        let max_pic_order_cnt_lsb = sps.max_pic_order_cnt_lsb();

        let prev_pic_order_cnt_msb;
        let prev_pic_order_cnt_lsb;
        if matches!(pic.is_idr, IsIdr::Yes { .. }) {
            prev_pic_order_cnt_msb = 0;
            prev_pic_order_cnt_lsb = 0;
        } else if self.prev_ref.has_mmco_5 {
            if !matches!(self.prev_ref.field, Field::Bottom) {
                prev_pic_order_cnt_msb = 0;
                prev_pic_order_cnt_lsb = self.prev_ref.top_field_order_cnt;
            } else {
                prev_pic_order_cnt_msb = 0;
                prev_pic_order_cnt_lsb = 0;
            }
        } else {
            prev_pic_order_cnt_msb = self.prev_ref.pic_order_cnt_msb;
            prev_pic_order_cnt_lsb = self.prev_ref.pic_order_cnt_lsb;
        }

        // Equation 8-3.
        if pic.pic_order_cnt_lsb < prev_pic_order_cnt_lsb
            && prev_pic_order_cnt_lsb - pic.pic_order_cnt_lsb >= max_pic_order_cnt_lsb / 2
        {
            pic.pic_order_cnt_msb = prev_pic_order_cnt_msb + max_pic_order_cnt_lsb;
        } else if pic.pic_order_cnt_lsb > prev_pic_order_cnt_lsb
            && pic.pic_order_cnt_lsb - prev_pic_order_cnt_lsb >= max_pic_order_cnt_lsb / 2
        {
            pic.pic_order_cnt_msb = prev_pic_order_cnt_msb - max_pic_order_cnt_lsb;
        } else {
            pic.pic_order_cnt_msb = prev_pic_order_cnt_msb;
        }

        if !matches!(pic.field, Field::Bottom) {
            pic.top_field_order_cnt = pic.pic_order_cnt_msb + pic.pic_order_cnt_lsb;
        }

        if !matches!(pic.field, Field::Top) {
            if matches!(pic.field, Field::Frame) {
                pic.bottom_field_order_cnt =
                    pic.top_field_order_cnt + pic.delta_pic_order_cnt_bottom;
            } else {
                pic.bottom_field_order_cnt = pic.pic_order_cnt_msb + pic.pic_order_cnt_lsb;
            }
        }
    }

    // Clause 8.2.1.2.
    fn compute_type1(&self, pic: &mut PictureData, sps: &Sps) {
        let max_frame_num = sps.max_frame_num() as i32;

        // FrameNumOffset, 8-6.
        if matches!(pic.is_idr, IsIdr::Yes { .. }) {
            pic.frame_num_offset = 0;
        } else {
            let prev_frame_num_offset =
                if self.prev.has_mmco_5 { 0 } else { self.prev.frame_num_offset };

            pic.frame_num_offset = if self.prev.frame_num > pic.frame_num {
                prev_frame_num_offset + max_frame_num
            } else {
                prev_frame_num_offset
            };
        }

        // AbsFrameNum, 8-7.
        let mut abs_frame_num = if sps.num_ref_frames_in_pic_order_cnt_cycle != 0 {
            pic.frame_num_offset + pic.frame_num
        } else {
            0
        };

        if pic.nal_ref_idc == 0 && abs_frame_num > 0 {
            abs_frame_num -= 1;
        }

        // ExpectedPicOrderCnt, 8-9/8-10.
        let mut expected_pic_order_cnt = 0;
        if abs_frame_num > 0 {
            let num_ref_frames = i32::from(sps.num_ref_frames_in_pic_order_cnt_cycle);
            let pic_order_cnt_cycle_cnt = (abs_frame_num - 1) / num_ref_frames;
            let frame_num_in_pic_order_cnt_cycle = (abs_frame_num - 1) % num_ref_frames;

            expected_pic_order_cnt =
                pic_order_cnt_cycle_cnt * sps.expected_delta_per_pic_order_cnt_cycle();

            for i in 0..=frame_num_in_pic_order_cnt_cycle {
                expected_pic_order_cnt += sps.offset_for_ref_frame[i as usize];
            }
        }

        if pic.nal_ref_idc == 0 {
            expected_pic_order_cnt += sps.offset_for_non_ref_pic;
        }

        match pic.field {
            Field::Frame => {
                pic.top_field_order_cnt = expected_pic_order_cnt + pic.delta_pic_order_cnt0;
                pic.bottom_field_order_cnt = pic.top_field_order_cnt
                    + sps.offset_for_top_to_bottom_field
                    + pic.delta_pic_order_cnt1;
            }
            Field::Top => {
                pic.top_field_order_cnt = expected_pic_order_cnt + pic.delta_pic_order_cnt0;
            }
            Field::Bottom => {
                pic.bottom_field_order_cnt = expected_pic_order_cnt
                    + sps.offset_for_top_to_bottom_field
                    + pic.delta_pic_order_cnt0;
            }
        }
    }

    // Clause 8.2.1.3.
    fn compute_type2(&self, pic: &mut PictureData, sps: &Sps) {
        let max_frame_num = sps.max_frame_num() as i32;

        // FrameNumOffset, 8-11.
        if matches!(pic.is_idr, IsIdr::Yes { .. }) {
            pic.frame_num_offset = 0;
        } else {
            let prev_frame_num_offset =
                if self.prev.has_mmco_5 { 0 } else { self.prev.frame_num_offset };

            pic.frame_num_offset = if self.prev.frame_num > pic.frame_num {
                prev_frame_num_offset + max_frame_num
            } else {
                prev_frame_num_offset
            };
        }

        // tempPicOrderCnt, 8-12.
        let temp_pic_order_cnt = if matches!(pic.is_idr, IsIdr::Yes { .. }) {
            0
        } else if pic.nal_ref_idc == 0 {
            2 * (pic.frame_num_offset + pic.frame_num) - 1
        } else {
            2 * (pic.frame_num_offset + pic.frame_num)
        };

        match pic.field {
            Field::Frame => {
                pic.top_field_order_cnt = temp_pic_order_cnt;
                pic.bottom_field_order_cnt = temp_pic_order_cnt;
            }
            Field::Top => pic.top_field_order_cnt = temp_pic_order_cnt,
            Field::Bottom => pic.bottom_field_order_cnt = temp_pic_order_cnt,
        }
    }

    /// Captures the state of a just-decoded reference picture.
    pub fn fill_prev_ref_info(&mut self, pic: &PictureData) {
        self.prev_ref = PrevReferencePicInfo {
            frame_num: pic.frame_num,
            has_mmco_5: pic.has_mmco_5,
            top_field_order_cnt: pic.top_field_order_cnt,
            pic_order_cnt_msb: pic.pic_order_cnt_msb,
            pic_order_cnt_lsb: pic.pic_order_cnt_lsb,
            field: pic.field,
        };
    }

    /// Captures the state of any just-decoded picture.
    pub fn fill_prev_info(&mut self, pic: &PictureData) {
        self.prev = PrevPicInfo {
            frame_num: pic.frame_num,
            frame_num_offset: pic.frame_num_offset,
            has_mmco_5: pic.has_mmco_5,
        };
    }

    /// Re-roots the history as if the previous picture carried a
    /// memory_management_control_operation equal to 5, so the next picture
    /// restarts counting from zero. Used when flushing outside the bitstream.
    pub fn reset_after_flush(&mut self) {
        self.prev_ref = PrevReferencePicInfo { has_mmco_5: true, ..Default::default() };
        self.prev = PrevPicInfo { has_mmco_5: true, ..Default::default() };
    }
}

#[cfg(test)]
mod tests {
    use crate::picture::Field;
    use crate::picture::PictureData;
    use crate::poc::PocContext;
    use crate::poc::PocError;
    use crate::slice::SliceHeader;
    use crate::sps::SpsBuilder;

    fn frame(idr: bool, frame_num: u16, lsb: u16, nal_ref_idc: u8) -> PictureData {
        PictureData::new_from_slice(&SliceHeader {
            idr_pic_flag: idr,
            nal_ref_idc,
            frame_num,
            pic_order_cnt_lsb: lsb,
            ..Default::default()
        })
    }

    #[test]
    fn type0_idr_then_next() {
        let sps = SpsBuilder::new()
            .pic_order_cnt_type(0)
            .max_frame_num(16)
            .max_pic_order_cnt_lsb(16)
            .build();
        let mut ctx = PocContext::default();

        let mut idr = frame(true, 0, 0, 3);
        ctx.compute_pic_order_count(&mut idr, &sps).unwrap();
        assert_eq!(idr.pic_order_cnt, 0);
        ctx.fill_prev_ref_info(&idr);
        ctx.fill_prev_info(&idr);

        let mut pic = frame(false, 1, 2, 3);
        ctx.compute_pic_order_count(&mut pic, &sps).unwrap();
        assert_eq!(pic.pic_order_cnt_msb, 0);
        assert_eq!(pic.pic_order_cnt, 2);
    }

    #[test]
    fn type0_msb_wraparound() {
        let sps = SpsBuilder::new()
            .pic_order_cnt_type(0)
            .max_frame_num(16)
            .max_pic_order_cnt_lsb(16)
            .build();
        let mut ctx = PocContext::default();

        // The previous reference picture sat just below the lsb wrap point.
        ctx.prev_ref.pic_order_cnt_lsb = 14;

        // The lsb wraps forward, so the msb must grow by MaxPicOrderCntLsb.
        let mut pic = frame(false, 8, 2, 3);
        ctx.compute_pic_order_count(&mut pic, &sps).unwrap();
        assert_eq!(pic.pic_order_cnt_msb, 16);
        assert_eq!(pic.pic_order_cnt, 18);
        ctx.fill_prev_ref_info(&pic);

        // A jump backwards past half the range lowers the msb again.
        let mut pic = frame(false, 8, 14, 0);
        ctx.compute_pic_order_count(&mut pic, &sps).unwrap();
        assert_eq!(pic.pic_order_cnt_msb, 0);
        assert_eq!(pic.pic_order_cnt, 14);
    }

    #[test]
    fn type0_msb_correction_at_half_range() {
        let sps = SpsBuilder::new()
            .pic_order_cnt_type(0)
            .max_frame_num(16)
            .max_pic_order_cnt_lsb(16)
            .build();

        // A backward jump of exactly half the lsb range already counts as
        // a wrap.
        let mut ctx = PocContext::default();
        ctx.prev_ref.pic_order_cnt_lsb = 8;
        let mut pic = frame(false, 1, 0, 3);
        ctx.compute_pic_order_count(&mut pic, &sps).unwrap();
        assert_eq!(pic.pic_order_cnt_msb, 16);
        assert_eq!(pic.pic_order_cnt, 16);

        // And so does a forward jump of exactly half.
        let ctx = PocContext::default();
        let mut pic = frame(false, 1, 8, 3);
        ctx.compute_pic_order_count(&mut pic, &sps).unwrap();
        assert_eq!(pic.pic_order_cnt_msb, -16);
        assert_eq!(pic.pic_order_cnt, -8);
    }

    #[test]
    fn type0_after_mmco5() {
        let sps = SpsBuilder::new()
            .pic_order_cnt_type(0)
            .max_frame_num(16)
            .max_pic_order_cnt_lsb(64)
            .build();
        let mut ctx = PocContext::default();

        // The previous reference picture zeroed its counts with MMCO 5; its
        // top field order count becomes the new lsb origin.
        ctx.prev_ref.has_mmco_5 = true;
        ctx.prev_ref.field = Field::Frame;
        ctx.prev_ref.top_field_order_cnt = 2;

        let mut pic = frame(false, 1, 6, 3);
        ctx.compute_pic_order_count(&mut pic, &sps).unwrap();
        assert_eq!(pic.pic_order_cnt_msb, 0);
        assert_eq!(pic.pic_order_cnt, 6);

        // A bottom field with MMCO 5 resets the origin to zero instead.
        ctx.prev_ref.field = Field::Bottom;
        let mut pic = frame(false, 1, 4, 3);
        ctx.compute_pic_order_count(&mut pic, &sps).unwrap();
        assert_eq!(pic.pic_order_cnt, 4);
    }

    #[test]
    fn type1_expected_poc() {
        let sps = SpsBuilder::new()
            .pic_order_cnt_type(1)
            .max_frame_num(16)
            .offsets_for_ref_frames(&[2])
            .offset_for_non_ref_pic(-1)
            .build();
        let mut ctx = PocContext::default();

        let mut idr = frame(true, 0, 0, 3);
        ctx.compute_pic_order_count(&mut idr, &sps).unwrap();
        assert_eq!(idr.pic_order_cnt, 0);
        ctx.fill_prev_info(&idr);

        let mut pic = frame(false, 1, 0, 3);
        ctx.compute_pic_order_count(&mut pic, &sps).unwrap();
        assert_eq!(pic.pic_order_cnt, 2);
        ctx.fill_prev_info(&pic);

        let mut pic = frame(false, 2, 0, 3);
        ctx.compute_pic_order_count(&mut pic, &sps).unwrap();
        assert_eq!(pic.pic_order_cnt, 4);
        ctx.fill_prev_info(&pic);

        // Non-reference pictures take the previous cycle slot plus
        // offset_for_non_ref_pic.
        let mut pic = frame(false, 2, 0, 0);
        ctx.compute_pic_order_count(&mut pic, &sps).unwrap();
        assert_eq!(pic.pic_order_cnt, 1);
    }

    #[test]
    fn type2_decode_order() {
        let sps = SpsBuilder::new().pic_order_cnt_type(2).max_frame_num(16).build();
        let mut ctx = PocContext::default();

        let mut idr = frame(true, 0, 0, 3);
        ctx.compute_pic_order_count(&mut idr, &sps).unwrap();
        assert_eq!(idr.pic_order_cnt, 0);
        ctx.fill_prev_info(&idr);

        let mut pic = frame(false, 15, 0, 3);
        ctx.compute_pic_order_count(&mut pic, &sps).unwrap();
        assert_eq!(pic.pic_order_cnt, 30);
        ctx.fill_prev_info(&pic);

        // frame_num wrapped, so FrameNumOffset absorbs MaxFrameNum, and
        // non-reference pictures order just below their successor.
        let mut pic = frame(false, 0, 0, 0);
        ctx.compute_pic_order_count(&mut pic, &sps).unwrap();
        assert_eq!(pic.frame_num_offset, 16);
        assert_eq!(pic.pic_order_cnt, 31);
    }

    #[test]
    fn invalid_poc_type() {
        let sps = SpsBuilder::new().pic_order_cnt_type(3).max_frame_num(16).build();
        let ctx = PocContext::default();

        let mut pic = frame(false, 0, 0, 3);
        assert_eq!(
            ctx.compute_pic_order_count(&mut pic, &sps),
            Err(PocError::InvalidPicOrderCntType(3))
        );
    }
}
