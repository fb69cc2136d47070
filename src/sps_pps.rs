// Copyright 2022-2023 Andrew D. Straw.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Sequence and picture parameter sets, constrained to what Baseline profile
//! with CAVLC entropy coding and one reference picture actually needs.

use alloc::vec;
use bitvec::prelude::{BitVec, Msb0};

use crate::bitreader::BitReader;
use crate::golomb::BitVecGolomb;
use crate::nal_unit::RbspData;
use crate::{Error, Result};

/// `profile_idc == 66`: Baseline.
pub const BASELINE_PROFILE_IDC: u8 = 66;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sps {
    pub seq_parameter_set_id: u32,
    pub pic_width_in_mbs_minus1: u32,
    pub pic_height_in_map_units_minus1: u32,
    pub log2_max_frame_num_minus4: u32,
}

impl Sps {
    pub fn new(
        seq_parameter_set_id: u32,
        pic_width_in_mbs_minus1: u32,
        pic_height_in_map_units_minus1: u32,
        log2_max_frame_num_minus4: u32,
    ) -> Self {
        Self {
            seq_parameter_set_id,
            pic_width_in_mbs_minus1,
            pic_height_in_map_units_minus1,
            log2_max_frame_num_minus4,
        }
    }

    pub fn log2_max_frame_num(&self) -> u32 {
        self.log2_max_frame_num_minus4 + 4
    }

    pub fn width(&self) -> u32 {
        (self.pic_width_in_mbs_minus1 + 1) * 16
    }
    pub fn height(&self) -> u32 {
        (self.pic_height_in_map_units_minus1 + 1) * 16
    }

    pub fn to_rbsp(&self) -> RbspData {
        // constraint_set0_flag..reserved_zero_2bits = 0, level_idc = 10, as
        // the Baseline conformance window this crate targets never needs a
        // higher level.
        let start = vec![BASELINE_PROFILE_IDC, 0x00, 10];
        let mut bv: BitVec<u8, Msb0> = BitVec::from_vec(start);

        bv.extend_exp_golomb(self.seq_parameter_set_id);
        bv.extend_exp_golomb(self.log2_max_frame_num_minus4);

        // pic_order_cnt_type = 2: derived directly from frame_num, the
        // simplest option and the only one this crate's single-reference
        // IPPPPP GOP structure needs.
        bv.extend_exp_golomb(2u32);

        // max_num_ref_frames = 1
        bv.extend_exp_golomb(1u32);
        // gaps_in_frame_num_value_allowed_flag = 0
        bv.push(false);

        bv.extend_exp_golomb(self.pic_width_in_mbs_minus1);
        bv.extend_exp_golomb(self.pic_height_in_map_units_minus1);

        // frame_mbs_only_flag = 1
        bv.push(true);
        // direct_8x8_inference_flag = 0
        bv.push(false);
        // frame_cropping_flag = 0 (no cropping; dimensions are exact MB multiples)
        bv.push(false);
        // vui_parameters_present_flag = 0
        bv.push(false);

        // rbsp_stop_one_bit
        bv.push(true);

        RbspData::new(bv.into_vec())
    }

    pub fn from_rbsp(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(underflow());
        }
        let profile_idc = data[0];
        if profile_idc != BASELINE_PROFILE_IDC {
            return Err(Error::UnsupportedProfile {
                profile_idc,
                #[cfg(feature = "backtrace")]
                backtrace: std::backtrace::Backtrace::capture(),
            });
        }
        let mut r = BitReader::new(&data[3..]);
        let seq_parameter_set_id = r.read_ue()?;
        let log2_max_frame_num_minus4 = r.read_ue()?;
        let pic_order_cnt_type = r.read_ue()?;
        if pic_order_cnt_type != 2 {
            return Err(Error::UnsupportedParameter {
                msg: "only pic_order_cnt_type == 2 is supported",
                #[cfg(feature = "backtrace")]
                backtrace: std::backtrace::Backtrace::capture(),
            });
        }
        let _max_num_ref_frames = r.read_ue()?;
        let _gaps_allowed = r.read_bit()?;
        let pic_width_in_mbs_minus1 = r.read_ue()?;
        let pic_height_in_map_units_minus1 = r.read_ue()?;
        Ok(Self {
            seq_parameter_set_id,
            pic_width_in_mbs_minus1,
            pic_height_in_map_units_minus1,
            log2_max_frame_num_minus4,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pps {
    pub pic_parameter_set_id: u32,
    pub seq_parameter_set_id: u32,
    pub pic_init_qp_minus26: i32,
    pub chroma_qp_index_offset: i32,
    pub deblocking_filter_control_present_flag: bool,
}

impl Pps {
    pub fn new(pic_parameter_set_id: u32, seq_parameter_set_id: u32) -> Self {
        Self {
            pic_parameter_set_id,
            seq_parameter_set_id,
            pic_init_qp_minus26: 0,
            chroma_qp_index_offset: 0,
            deblocking_filter_control_present_flag: true,
        }
    }

    pub fn to_rbsp(&self) -> RbspData {
        let mut bv: BitVec<u8, Msb0> = BitVec::with_capacity(20 * 8);

        bv.extend_exp_golomb(self.pic_parameter_set_id);
        bv.extend_exp_golomb(self.seq_parameter_set_id);

        // entropy_coding_mode_flag = 0 (CAVLC)
        bv.push(false);
        // bottom_field_pic_order_in_frame_present_flag = 0
        bv.push(false);
        // num_slice_groups_minus1 = 0
        bv.extend_exp_golomb(0u32);
        // num_ref_idx_l0_default_active_minus1 = 0
        bv.extend_exp_golomb(0u32);
        // num_ref_idx_l1_default_active_minus1 = 0
        bv.extend_exp_golomb(0u32);
        // weighted_pred_flag = 0
        bv.push(false);
        // weighted_bipred_idc = 0
        bv.push(false);
        bv.push(false);

        bv.extend_signed_exp_golomb(self.pic_init_qp_minus26);
        // pic_init_qs_minus26 = 0
        bv.extend_signed_exp_golomb(0);
        bv.extend_signed_exp_golomb(self.chroma_qp_index_offset);

        bv.push(self.deblocking_filter_control_present_flag);
        // constrained_intra_pred_flag = 0
        bv.push(false);
        // redundant_pic_cnt_present_flag = 0
        bv.push(false);

        bv.push(true);

        RbspData::new(bv.into_vec())
    }

    pub fn from_rbsp(data: &[u8]) -> Result<Self> {
        let mut r = BitReader::new(data);
        let pic_parameter_set_id = r.read_ue()?;
        let seq_parameter_set_id = r.read_ue()?;
        let entropy_coding_mode_flag = r.read_bit()?;
        if entropy_coding_mode_flag {
            return Err(Error::UnsupportedParameter {
                msg: "CABAC is not supported",
                #[cfg(feature = "backtrace")]
                backtrace: std::backtrace::Backtrace::capture(),
            });
        }
        let _bottom_field = r.read_bit()?;
        let _num_slice_groups_minus1 = r.read_ue()?;
        let _num_ref_idx_l0 = r.read_ue()?;
        let _num_ref_idx_l1 = r.read_ue()?;
        let _weighted_pred_flag = r.read_bit()?;
        let _weighted_bipred_idc = r.read_bits(2)?;
        let pic_init_qp_minus26 = r.read_se()?;
        let _pic_init_qs_minus26 = r.read_se()?;
        let chroma_qp_index_offset = r.read_se()?;
        let deblocking_filter_control_present_flag = r.read_bit()?;
        Ok(Self {
            pic_parameter_set_id,
            seq_parameter_set_id,
            pic_init_qp_minus26,
            chroma_qp_index_offset,
            deblocking_filter_control_present_flag,
        })
    }
}

fn underflow() -> Error {
    Error::BitstreamUnderflow {
        #[cfg(feature = "backtrace")]
        backtrace: std::backtrace::Backtrace::capture(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sps_roundtrips() {
        let sps = Sps::new(0, 4, 2, 0);
        let rbsp = sps.to_rbsp();
        let decoded = Sps::from_rbsp(&rbsp.data).unwrap();
        assert_eq!(decoded, sps);
        assert_eq!(decoded.width(), 80);
        assert_eq!(decoded.height(), 48);
    }

    #[test]
    fn pps_roundtrips() {
        let pps = Pps {
            chroma_qp_index_offset: -3,
            pic_init_qp_minus26: 5,
            ..Pps::new(1, 0)
        };
        let rbsp = pps.to_rbsp();
        let decoded = Pps::from_rbsp(&rbsp.data).unwrap();
        assert_eq!(decoded, pps);
    }

    #[test]
    fn unsupported_profile_is_rejected() {
        let mut data = Sps::new(0, 4, 2, 0).to_rbsp().data;
        data[0] = 100; // High profile
        assert!(Sps::from_rbsp(&data).is_err());
    }
}
