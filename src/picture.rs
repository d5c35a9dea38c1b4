// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::slice::RefPicMarking;
use crate::slice::SliceHeader;

/// The reference status of a picture, per H.264 clause 8.2.5.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Reference {
    #[default]
    None,
    ShortTerm,
    LongTerm,
}

/// Whether a picture is a full frame or a single parity field.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Field {
    #[default]
    Frame,
    Top,
    Bottom,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum IsIdr {
    #[default]
    No,
    Yes {
        idr_pic_id: u16,
    },
}

/// All the bookkeeping the DPB keeps for one decoded picture.
///
/// `pic_num`, `frame_num_wrap` and `long_term_pic_num` are only valid after
/// the last call to `Dpb::update_pic_nums()`, as they are recomputed relative
/// to every new picture per clause 8.2.4.1.
#[derive(Clone, Debug, Default)]
pub struct PictureData {
    pub nal_ref_idc: u8,
    pub is_idr: IsIdr,

    pub frame_num: i32,
    pub pic_num: i32,
    pub frame_num_wrap: i32,
    pub long_term_pic_num: u32,
    pub long_term_frame_idx: u32,

    pub pic_order_cnt_lsb: i32,
    pub pic_order_cnt_msb: i32,
    pub delta_pic_order_cnt_bottom: i32,
    pub delta_pic_order_cnt0: i32,
    pub delta_pic_order_cnt1: i32,
    pub frame_num_offset: i32,
    pub top_field_order_cnt: i32,
    pub bottom_field_order_cnt: i32,
    pub pic_order_cnt: i32,

    pub field: Field,

    /// Synthesized to fill a frame_num gap. Not backed by a buffer and never
    /// eligible for display.
    pub nonexisting: bool,

    pub ref_pic_marking: RefPicMarking,
    pub has_mmco_5: bool,

    reference: Reference,
}

impl PictureData {
    pub fn new_from_slice(hdr: &SliceHeader) -> Self {
        let field = if hdr.field_pic_flag {
            if hdr.bottom_field_flag {
                Field::Bottom
            } else {
                Field::Top
            }
        } else {
            Field::Frame
        };

        let is_idr = if hdr.idr_pic_flag {
            IsIdr::Yes { idr_pic_id: hdr.idr_pic_id }
        } else {
            IsIdr::No
        };

        // Reference pictures start out short term; an MMCO or the IDR
        // long_term_reference_flag may promote them at end of picture.
        let reference = if hdr.nal_ref_idc != 0 {
            Reference::ShortTerm
        } else {
            Reference::None
        };

        PictureData {
            nal_ref_idc: hdr.nal_ref_idc,
            is_idr,
            frame_num: i32::from(hdr.frame_num),
            pic_order_cnt_lsb: i32::from(hdr.pic_order_cnt_lsb),
            delta_pic_order_cnt_bottom: hdr.delta_pic_order_cnt_bottom,
            delta_pic_order_cnt0: hdr.delta_pic_order_cnt[0],
            delta_pic_order_cnt1: hdr.delta_pic_order_cnt[1],
            field,
            ref_pic_marking: hdr.ref_pic_marking.clone(),
            reference,
            ..Default::default()
        }
    }

    /// Builds a "non-existing" picture as per clause 8.2.5.2, used to keep
    /// the reference and POC state consistent across a frame_num gap.
    pub fn new_non_existing(frame_num: i32) -> Self {
        PictureData {
            frame_num,
            nonexisting: true,
            nal_ref_idc: 1,
            ..Default::default()
        }
    }

    pub fn is_ref(&self) -> bool {
        !matches!(self.reference, Reference::None)
    }

    pub fn reference(&self) -> &Reference {
        &self.reference
    }

    pub fn set_reference(&mut self, reference: Reference) {
        log::debug!("Set reference of POC {} to {:?}", self.pic_order_cnt, reference);
        self.reference = reference;
    }
}
