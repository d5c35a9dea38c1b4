// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::rc::Rc;

use enumn::N;

use crate::dpb::DPB_MAX_SIZE;

/// The level limits of table A-1, as signaled by `level_idc`.
#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    L1B = 9,
    #[default]
    L1 = 10,
    L1_1 = 11,
    L1_2 = 12,
    L1_3 = 13,
    L2 = 20,
    L2_1 = 21,
    L2_2 = 22,
    L3 = 30,
    L3_1 = 31,
    L3_2 = 32,
    L4 = 40,
    L4_1 = 41,
    L4_2 = 42,
    L5 = 50,
    L5_1 = 51,
    L5_2 = 52,
    L6 = 60,
    L6_1 = 61,
    L6_2 = 62,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VuiParams {
    pub bitstream_restriction_flag: bool,
    pub max_num_reorder_frames: u32,
    pub max_dec_frame_buffering: u32,
}

/// The sequence parameter set fields the DPB depends on. Immutable for the
/// whole coded video sequence, shared as `Rc<Sps>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sps {
    pub seq_parameter_set_id: u8,
    pub profile_idc: u8,
    pub constraint_set3_flag: bool,
    pub level_idc: Level,

    pub log2_max_frame_num_minus4: u8,
    pub pic_order_cnt_type: u8,
    pub log2_max_pic_order_cnt_lsb_minus4: u8,
    pub offset_for_non_ref_pic: i32,
    pub offset_for_top_to_bottom_field: i32,
    pub num_ref_frames_in_pic_order_cnt_cycle: u8,
    pub offset_for_ref_frame: [i32; 255],

    pub max_num_ref_frames: u8,
    pub gaps_in_frame_num_value_allowed_flag: bool,

    pub pic_width_in_mbs_minus1: u16,
    pub pic_height_in_map_units_minus1: u16,
    pub frame_mbs_only_flag: bool,

    pub vui_parameters_present_flag: bool,
    pub vui_parameters: VuiParams,
}

impl Sps {
    pub fn max_frame_num(&self) -> u32 {
        1 << (self.log2_max_frame_num_minus4 + 4)
    }

    pub fn max_pic_order_cnt_lsb(&self) -> i32 {
        1 << (self.log2_max_pic_order_cnt_lsb_minus4 + 4)
    }

    /// ExpectedDeltaPerPicOrderCntCycle, equation 8-12.
    pub fn expected_delta_per_pic_order_cnt_cycle(&self) -> i32 {
        let num = usize::from(self.num_ref_frames_in_pic_order_cnt_cycle);
        self.offset_for_ref_frame[..num].iter().sum()
    }

    /// The maximum number of frames the DPB can hold for this sequence, per
    /// the MaxDpbMbs column of table A-1.
    pub fn max_dpb_frames(&self) -> usize {
        let profile = self.profile_idc;
        let mut level = self.level_idc;

        // A.3.1/A.3.2: for these profiles level 1b is signaled as level 1.1
        // with constraint_set3_flag set.
        if matches!(level, Level::L1_1)
            && (profile == 66 || profile == 77 || profile == 88)
            && self.constraint_set3_flag
        {
            level = Level::L1B;
        }

        // Table A-1, MaxDpbMbs.
        let max_dpb_mbs = match level {
            Level::L1B => 396,
            Level::L1 => 396,
            Level::L1_1 => 900,
            Level::L1_2 => 2376,
            Level::L1_3 => 2376,
            Level::L2 => 2376,
            Level::L2_1 => 4752,
            Level::L2_2 => 8100,
            Level::L3 => 8100,
            Level::L3_1 => 18000,
            Level::L3_2 => 20480,
            Level::L4 => 32768,
            Level::L4_1 => 32768,
            Level::L4_2 => 34816,
            Level::L5 => 110400,
            Level::L5_1 => 184320,
            Level::L5_2 => 184320,
            Level::L6 => 696320,
            Level::L6_1 => 696320,
            Level::L6_2 => 696320,
        };

        let width_mb = usize::from(self.pic_width_in_mbs_minus1) + 1;
        let height_mb = usize::from(self.pic_height_in_map_units_minus1) + 1;

        let max_dpb_frames = std::cmp::min(max_dpb_mbs / (width_mb * height_mb), DPB_MAX_SIZE);
        let mut max_dpb_frames = std::cmp::max(max_dpb_frames, usize::from(self.max_num_ref_frames));

        if self.vui_parameters_present_flag && self.vui_parameters.bitstream_restriction_flag {
            max_dpb_frames =
                std::cmp::max(1, self.vui_parameters.max_dec_frame_buffering as usize);
        }

        max_dpb_frames
    }

    /// The maximum number of frames that may precede any frame in decoding
    /// order and follow it in output order, per E.2.1.
    pub fn max_num_order_frames(&self) -> u32 {
        let vui = &self.vui_parameters;
        let present = self.vui_parameters_present_flag && vui.bitstream_restriction_flag;

        if present {
            vui.max_num_reorder_frames
        } else {
            let profile = self.profile_idc;
            if (profile == 44
                || profile == 86
                || profile == 100
                || profile == 110
                || profile == 122
                || profile == 244)
                && self.constraint_set3_flag
            {
                0
            } else {
                self.max_dpb_frames() as u32
            }
        }
    }
}

impl Default for Sps {
    // See https://github.com/rust-lang/rust/issues/26925 for why this cannot
    // simply be derived.
    fn default() -> Self {
        Self {
            seq_parameter_set_id: 0,
            profile_idc: 0,
            constraint_set3_flag: false,
            level_idc: Default::default(),
            log2_max_frame_num_minus4: 0,
            pic_order_cnt_type: 0,
            log2_max_pic_order_cnt_lsb_minus4: 0,
            offset_for_non_ref_pic: 0,
            offset_for_top_to_bottom_field: 0,
            num_ref_frames_in_pic_order_cnt_cycle: 0,
            offset_for_ref_frame: [0; 255],
            max_num_ref_frames: 0,
            gaps_in_frame_num_value_allowed_flag: false,
            pic_width_in_mbs_minus1: 0,
            pic_height_in_map_units_minus1: 0,
            frame_mbs_only_flag: false,
            vui_parameters_present_flag: false,
            vui_parameters: Default::default(),
        }
    }
}

/// A convenience builder for [`Sps`] structs, mostly useful for tests and
/// callers that hand-craft sequence parameters instead of parsing them.
#[derive(Default)]
pub struct SpsBuilder(Sps);

impl SpsBuilder {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn seq_parameter_set_id(mut self, value: u8) -> Self {
        self.0.seq_parameter_set_id = value;
        self
    }

    pub fn profile_idc(mut self, value: u8) -> Self {
        self.0.profile_idc = value;
        self
    }

    pub fn constraint_set3_flag(mut self, value: bool) -> Self {
        self.0.constraint_set3_flag = value;
        self
    }

    pub fn level_idc(mut self, value: Level) -> Self {
        self.0.level_idc = value;
        self
    }

    /// Sets `log2_max_frame_num_minus4` from the intended MaxFrameNum, which
    /// must be a power of two in `[16, 65536]`.
    pub fn max_frame_num(mut self, value: u32) -> Self {
        self.0.log2_max_frame_num_minus4 = value.ilog2() as u8 - 4u8;
        self
    }

    pub fn pic_order_cnt_type(mut self, value: u8) -> Self {
        self.0.pic_order_cnt_type = value;
        self
    }

    /// Sets `log2_max_pic_order_cnt_lsb_minus4` from the intended
    /// MaxPicOrderCntLsb, which must be a power of two in `[16, 65536]`.
    pub fn max_pic_order_cnt_lsb(mut self, value: u32) -> Self {
        self.0.log2_max_pic_order_cnt_lsb_minus4 = value.ilog2() as u8 - 4u8;
        self
    }

    pub fn offset_for_non_ref_pic(mut self, value: i32) -> Self {
        self.0.offset_for_non_ref_pic = value;
        self
    }

    pub fn offset_for_top_to_bottom_field(mut self, value: i32) -> Self {
        self.0.offset_for_top_to_bottom_field = value;
        self
    }

    /// Sets both `num_ref_frames_in_pic_order_cnt_cycle` and the
    /// corresponding offsets.
    pub fn offsets_for_ref_frames(mut self, offsets: &[i32]) -> Self {
        self.0.num_ref_frames_in_pic_order_cnt_cycle = offsets.len() as u8;
        self.0.offset_for_ref_frame[..offsets.len()].copy_from_slice(offsets);
        self
    }

    pub fn max_num_ref_frames(mut self, value: u8) -> Self {
        self.0.max_num_ref_frames = value;
        self
    }

    pub fn gaps_in_frame_num_value_allowed_flag(mut self, value: bool) -> Self {
        self.0.gaps_in_frame_num_value_allowed_flag = value;
        self
    }

    /// Sets the picture dimensions in macroblock units from a resolution in
    /// pixels.
    pub fn resolution(mut self, width: u32, height: u32) -> Self {
        self.0.pic_width_in_mbs_minus1 = (width.div_ceil(16) - 1) as u16;
        self.0.pic_height_in_map_units_minus1 = (height.div_ceil(16) - 1) as u16;
        self
    }

    pub fn frame_mbs_only_flag(mut self, value: bool) -> Self {
        self.0.frame_mbs_only_flag = value;
        self
    }

    /// Sets the VUI bitstream restriction reorder bounds.
    pub fn max_num_reorder_frames(mut self, value: u32) -> Self {
        self.0.vui_parameters_present_flag = true;
        self.0.vui_parameters.bitstream_restriction_flag = true;
        self.0.vui_parameters.max_num_reorder_frames = value;
        self
    }

    /// Sets the VUI bitstream restriction DPB bound.
    pub fn max_dec_frame_buffering(mut self, value: u32) -> Self {
        self.0.vui_parameters_present_flag = true;
        self.0.vui_parameters.bitstream_restriction_flag = true;
        self.0.vui_parameters.max_dec_frame_buffering = value;
        self
    }

    pub fn build(self) -> Rc<Sps> {
        Rc::new(self.0)
    }
}
