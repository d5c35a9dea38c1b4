// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

/// A newtype used to describe the maximum long term frame index in the
/// `dec_ref_pic_marking()` syntax.
///
/// `max_long_term_frame_idx_plus1` equal to 0 means "no long term frame
/// indices", any other value `x` means a maximum index of `x - 1`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum MaxLongTermFrameIdx {
    #[default]
    NoLongTermFrameIndices,
    Idx(u32),
}

impl MaxLongTermFrameIdx {
    /// Conversion from the `max_long_term_frame_idx_plus1` syntax element.
    pub fn from_value_plus1(value: u32) -> Self {
        match value {
            0 => MaxLongTermFrameIdx::NoLongTermFrameIndices,
            value_plus1 => MaxLongTermFrameIdx::Idx(value_plus1 - 1),
        }
    }

    /// Conversion to the `max_long_term_frame_idx_plus1` syntax element.
    pub fn to_value_plus1(self) -> u32 {
        match self {
            MaxLongTermFrameIdx::NoLongTermFrameIndices => 0,
            MaxLongTermFrameIdx::Idx(idx) => idx + 1,
        }
    }
}

impl PartialEq<u32> for MaxLongTermFrameIdx {
    fn eq(&self, other: &u32) -> bool {
        match self {
            MaxLongTermFrameIdx::NoLongTermFrameIndices => false,
            MaxLongTermFrameIdx::Idx(idx) => idx.eq(other),
        }
    }
}

impl PartialOrd<u32> for MaxLongTermFrameIdx {
    fn partial_cmp(&self, other: &u32) -> Option<std::cmp::Ordering> {
        match self {
            MaxLongTermFrameIdx::NoLongTermFrameIndices => Some(std::cmp::Ordering::Less),
            MaxLongTermFrameIdx::Idx(idx) => idx.partial_cmp(other),
        }
    }
}

/// One entry of the `dec_ref_pic_marking()` adaptive marking loop.
///
/// Which of the remaining fields is meaningful depends on
/// `memory_management_control_operation`, see table 7-9.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicMarkingInner {
    pub memory_management_control_operation: u8,
    pub difference_of_pic_nums_minus1: u32,
    pub long_term_pic_num: u32,
    pub long_term_frame_idx: u32,
    pub max_long_term_frame_idx: MaxLongTermFrameIdx,
}

/// The `dec_ref_pic_marking()` data for one picture.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicMarking {
    /// Only set for IDR pictures.
    pub no_output_of_prior_pics_flag: bool,
    /// Only set for IDR pictures. When set the IDR picture is kept as a long
    /// term reference with frame index 0.
    pub long_term_reference_flag: bool,
    /// When set, `inner` carries explicit memory management control
    /// operations. Otherwise the sliding window process applies.
    pub adaptive_ref_pic_marking_mode_flag: bool,
    pub inner: Vec<RefPicMarkingInner>,
}

/// The subset of the slice header consumed by the DPB. Produced by whatever
/// parses the bitstream, no parsing happens in this crate.
#[derive(Clone, Debug, Default)]
pub struct SliceHeader {
    /// Whether the NAL unit carrying this slice is an IDR slice.
    pub idr_pic_flag: bool,
    pub idr_pic_id: u16,
    pub nal_ref_idc: u8,

    pub frame_num: u16,
    pub field_pic_flag: bool,
    pub bottom_field_flag: bool,

    pub pic_order_cnt_lsb: u16,
    pub delta_pic_order_cnt_bottom: i32,
    pub delta_pic_order_cnt: [i32; 2],

    pub ref_pic_marking: RefPicMarking,
}

#[cfg(test)]
mod tests {
    use crate::slice::MaxLongTermFrameIdx;

    #[test]
    fn max_long_term_frame_idx_conversion() {
        assert_eq!(
            MaxLongTermFrameIdx::from_value_plus1(0),
            MaxLongTermFrameIdx::NoLongTermFrameIndices
        );
        assert_eq!(MaxLongTermFrameIdx::from_value_plus1(1), MaxLongTermFrameIdx::Idx(0));
        assert_eq!(MaxLongTermFrameIdx::from_value_plus1(5), MaxLongTermFrameIdx::Idx(4));

        assert_eq!(MaxLongTermFrameIdx::NoLongTermFrameIndices.to_value_plus1(), 0);
        assert_eq!(MaxLongTermFrameIdx::Idx(4).to_value_plus1(), 5);
    }

    #[test]
    fn max_long_term_frame_idx_cmp() {
        // "No long term frame indices" compares below any index.
        assert!(MaxLongTermFrameIdx::NoLongTermFrameIndices < 0u32);
        assert!(MaxLongTermFrameIdx::Idx(1) < 2u32);
        assert!(MaxLongTermFrameIdx::Idx(2) == 2u32);
        assert!(MaxLongTermFrameIdx::Idx(3) > 2u32);
    }
}
