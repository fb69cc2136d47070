// Copyright 2022-2023 Andrew D. Straw.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Slice header encode/decode. This crate only ever emits one slice per
//! picture (`first_mb_in_slice == 0`), covering the whole picture.

use alloc::vec::Vec;
use bitvec::prelude::{BitVec, Msb0};

use crate::bitreader::BitReader;
use crate::golomb::BitVecGolomb;
use crate::sps_pps::Sps;
use crate::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SliceType {
    /// `slice_type == 7`: all macroblocks in the slice are intra-coded.
    IAll,
    /// `slice_type == 5`: macroblocks may be inter- or intra-coded.
    PAll,
}

impl SliceType {
    fn code_num(self) -> u32 {
        match self {
            SliceType::IAll => 7,
            SliceType::PAll => 5,
        }
    }

    fn from_code_num(v: u32) -> Option<Self> {
        match v % 5 {
            2 => Some(SliceType::IAll),
            0 => Some(SliceType::PAll),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SliceHeader {
    pub slice_type: SliceType,
    pub pic_parameter_set_id: u32,
    pub frame_num: u32,
    /// Present only when `slice_type == IAll` and the picture is an IDR.
    pub idr_pic_id: Option<u32>,
    pub slice_qp_delta: i32,
    /// `disable_deblocking_filter_idc`: 0 enables filtering across slice and
    /// MB edges, 1 disables it entirely, 2 disables only across slice
    /// boundaries (moot here, since each picture is one slice).
    pub disable_deblocking_filter_idc: u8,
}

impl SliceHeader {
    pub fn to_rbsp_prefix(&self, sps: &Sps) -> Vec<u8> {
        let mut bv: BitVec<u8, Msb0> = BitVec::with_capacity(20 * 8);

        // first_mb_in_slice = 0
        bv.extend_exp_golomb(0u32);
        bv.extend_exp_golomb(self.slice_type.code_num());
        bv.extend_exp_golomb(self.pic_parameter_set_id);

        let n_bits = sps.log2_max_frame_num();
        for i in (0..n_bits).rev() {
            bv.push((self.frame_num >> i) & 1 != 0);
        }

        if let Some(idr_pic_id) = self.idr_pic_id {
            bv.extend_exp_golomb(idr_pic_id);
        }

        // pic_order_cnt_type == 2: no pic_order_cnt_lsb field.

        if matches!(self.slice_type, SliceType::IAll) && self.idr_pic_id.is_some() {
            // dec_ref_pic_marking for an IDR picture.
            // no_output_of_prior_pics_flag
            bv.push(false);
            // long_term_reference_flag
            bv.push(false);
        } else if matches!(self.slice_type, SliceType::PAll) {
            // adaptive_ref_pic_marking_mode_flag = 0 (the single reference
            // picture is always just the previous one).
            bv.push(false);
        }

        bv.extend_signed_exp_golomb(self.slice_qp_delta);

        bv.extend_exp_golomb(self.disable_deblocking_filter_idc as u32);
        if self.disable_deblocking_filter_idc != 1 {
            // slice_alpha_c0_offset_div2 = 0, slice_beta_offset_div2 = 0
            bv.extend_signed_exp_golomb(0);
            bv.extend_signed_exp_golomb(0);
        }

        bv.into_vec()
    }

    /// Parse the slice header, returning it plus the bit offset (from the
    /// start of `data`) at which slice data begins.
    pub fn from_rbsp(data: &[u8], sps: &Sps, is_idr: bool) -> Result<(Self, usize)> {
        let mut r = BitReader::new(data);
        let _first_mb_in_slice = r.read_ue()?;
        let slice_type =
            SliceType::from_code_num(r.read_ue()?).unwrap_or(if is_idr {
                SliceType::IAll
            } else {
                SliceType::PAll
            });
        let pic_parameter_set_id = r.read_ue()?;

        let n_bits = sps.log2_max_frame_num();
        let frame_num = r.read_bits(n_bits)?;

        let idr_pic_id = if is_idr { Some(r.read_ue()?) } else { None };

        if matches!(slice_type, SliceType::IAll) && is_idr {
            let _no_output_of_prior_pics_flag = r.read_bit()?;
            let _long_term_reference_flag = r.read_bit()?;
        } else if matches!(slice_type, SliceType::PAll) {
            let _adaptive_ref_pic_marking_mode_flag = r.read_bit()?;
        }

        let slice_qp_delta = r.read_se()?;
        let disable_deblocking_filter_idc = r.read_ue()? as u8;
        if disable_deblocking_filter_idc != 1 {
            let _slice_alpha_c0_offset_div2 = r.read_se()?;
            let _slice_beta_offset_div2 = r.read_se()?;
        }

        Ok((
            Self {
                slice_type,
                pic_parameter_set_id,
                frame_num,
                idr_pic_id,
                slice_qp_delta,
                disable_deblocking_filter_idc,
            },
            r.bit_pos(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idr_i_slice_header_roundtrips() {
        let sps = Sps::new(0, 4, 4, 0);
        let header = SliceHeader {
            slice_type: SliceType::IAll,
            pic_parameter_set_id: 0,
            frame_num: 0,
            idr_pic_id: Some(0),
            slice_qp_delta: -2,
            disable_deblocking_filter_idc: 0,
        };
        let bytes = header.to_rbsp_prefix(&sps);
        let (decoded, _bit_pos) = SliceHeader::from_rbsp(&bytes, &sps, true).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn p_slice_header_roundtrips() {
        let sps = Sps::new(0, 4, 4, 0);
        let header = SliceHeader {
            slice_type: SliceType::PAll,
            pic_parameter_set_id: 0,
            frame_num: 3,
            idr_pic_id: None,
            slice_qp_delta: 4,
            disable_deblocking_filter_idc: 0,
        };
        let bytes = header.to_rbsp_prefix(&sps);
        let (decoded, _bit_pos) = SliceHeader::from_rbsp(&bytes, &sps, false).unwrap();
        assert_eq!(decoded, header);
    }
}
