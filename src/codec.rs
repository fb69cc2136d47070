// Copyright 2022-2023 Andrew D. Straw.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The `Codec` lifecycle: `open` generates the initial parameter sets,
//! `code` turns one [`Picture`] into NAL units, `decode` turns NAL units
//! back into pictures. Per-picture dataflow: estimate motion and decide
//! each macroblock's coding mode, run the rate controller against that
//! fixed mode map, commit the chosen QPs into the real bitstream and
//! reference picture, then deblock.

use alloc::vec;
use alloc::vec::Vec;

use bitvec::prelude::{BitVec, Msb0};

use crate::bitreader::BitReader;
use crate::deblock::deblock_picture;
use crate::golomb::BitVecGolomb;
use crate::image::Picture;
use crate::macroblock::MacroblockGrid;
use crate::mb_pipeline::{
    code_inter_mb, code_intra_mb, code_skip_mb, decode_inter_mb, decode_intra_mb, decode_skip_mb, ReferencePicture,
};
use crate::motion_est::{estimate_motion, search_range, SearchPyramid};
use crate::mv::{MotionVector, MotionVectorList};
use crate::nal_unit::{parse_nal_unit, split_annex_b, NalRefIdc, NalUnit, NalUnitType, RbspData};
use crate::params::{Params, PictureCodingType, RateControlMode};
use crate::rate_control::{MbCoster, RateController};
use crate::slice::{SliceHeader, SliceType};
use crate::sps_pps::{Pps, Sps};
use crate::{Error, Result};

/// Per-macroblock coding-mode decision, made once per picture from
/// motion-estimation SAD, before rate control ever runs. QP only affects
/// residual cost, never the mode, so this is decided up front and held
/// fixed through every QP probe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MbMode {
    Skip,
    Inter(MotionVector),
    Intra,
}

/// Average per-pixel SAD above which a macroblock is coded intra even in
/// a P slice: the motion search found nothing usable to copy.
const INTRA_REFRESH_SAD_PER_PIXEL: i32 = 40;
/// Average per-pixel SAD at or below which a macroblock whose motion
/// settled on the predicted vector is coded as skip instead of inter.
const SKIP_SAD_PER_PIXEL: i32 = 2;
const MB_PIXELS: i32 = 16 * 16;

/// Approximate per-skip-macroblock bitstream cost, amortising the shared
/// `mb_skip_run` Exp-Golomb code across a run of consecutive skips. Used
/// only to give the rate controller a non-zero, QP-invariant cost so its
/// bit budget isn't silently underestimated by treating skips as free.
const SKIP_MB_APPROX_BITS: u32 = 1;

/// Decoded output of one `Codec::decode` call.
pub struct DecodedPicture {
    pub picture: Picture,
    pub frame_num: u32,
    pub is_idr: bool,
}

/// Outcome of one `Codec::code` call.
pub struct EncodedPicture {
    pub nal_units: Vec<NalUnit>,
    pub is_idr: bool,
    pub qp: i32,
    pub bits: u32,
}

/// Baseline-profile CAVLC encode/decode core: single slice per picture,
/// single reference picture, `IPPPPP` GOP structure.
pub struct Codec {
    params: Params,
    sps: Sps,
    pps: Pps,
    grid: MacroblockGrid,
    rate_controller: RateController,
    mv_list: MotionVectorList,
    reference: Option<ReferencePicture>,
    last_recon: Option<Picture>,
    frame_num: u32,
    pictures_since_idr: u32,

    // Decoder-side parameter sets, learned from the bitstream. May differ
    // from `sps`/`pps` above if this `Codec` is only ever used to decode.
    decoded_sps: Option<Sps>,
    decoded_pps: Option<Pps>,
}

impl Codec {
    /// Open a codec instance for `params.width x params.height`, returning
    /// the initial SPS/PPS NAL units (empty if
    /// `params.generate_param_sets_on_open` is false).
    pub fn open(params: Params) -> Result<(Vec<NalUnit>, Self)> {
        let _ = Picture::new(params.width as usize, params.height as usize)?;
        let mb_width = params.width as usize / 16;
        let mb_height = params.height as usize / 16;

        let sps = Sps::new(
            params.seq_parameter_set_id,
            (mb_width - 1) as u32,
            (mb_height - 1) as u32,
            params.log2_max_frame_num_minus4,
        );
        let pps = Pps::new(params.pic_parameter_set_id, params.seq_parameter_set_id);

        let initial = if params.generate_param_sets_on_open {
            vec![param_set_nal_unit(&sps, true), param_set_nal_unit_pps(&pps)]
        } else {
            Vec::new()
        };

        let codec = Self {
            grid: MacroblockGrid::new(mb_width, mb_height),
            rate_controller: RateController::new(params.fixed_qp),
            mv_list: MotionVectorList::new(mb_width, mb_height),
            reference: None,
            last_recon: None,
            frame_num: 0,
            pictures_since_idr: 0,
            decoded_sps: None,
            decoded_pps: None,
            sps,
            pps,
            params,
        };
        Ok((initial, codec))
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    // -----------------------------------------------------------------
    // Encode
    // -----------------------------------------------------------------

    /// Code one picture, choosing I or P per [`Params::picture_coding_type`]
    /// and the auto-I heuristics, running motion estimation and rate
    /// control, and returning the coded NAL units.
    pub fn code(&mut self, source: &Picture) -> Result<EncodedPicture> {
        if source.width() != self.params.width as usize || source.height() != self.params.height as usize {
            return Err(Error::UnsupportedImageSize {
                #[cfg(feature = "backtrace")]
                backtrace: std::backtrace::Backtrace::capture(),
            });
        }

        self.grid.reset_for_new_picture();
        self.mv_list = MotionVectorList::new(self.grid.mb_width, self.grid.mb_height);

        let is_idr = self.decide_is_idr(source);
        let modes = if is_idr {
            vec![MbMode::Intra; self.grid.len()]
        } else {
            self.decide_modes(source)
        };

        let reference = self.reference.take();
        let mut recon = Picture::new(source.width(), source.height())?;
        let mut bv: BitVec<u8, Msb0> = BitVec::new();
        let scratch_grid = self.grid.clone();

        let result = {
            let mut coster = TrialCoster {
                source,
                reference: reference.as_ref(),
                modes: &modes,
                recon: &mut recon,
                mv_list: self.mv_list.clone(),
                scratch_grid,
                scratch_bv: BitVec::new(),
            };
            self.rate_controller.code_picture(&mut self.grid, &mut coster, &self.params, is_idr)
        };

        if matches!(self.params.rate_control, RateControlMode::MinMax) && result.bits > self.params.bits_per_picture {
            // `reference` was taken out of `self.reference` above; put it
            // back before bailing out, or the next call sees no reference
            // picture at all even though this picture never committed.
            self.reference = reference;
            return Err(Error::BitBudgetExceeded {
                bits: result.bits,
                bits_per_picture: self.params.bits_per_picture,
                #[cfg(feature = "backtrace")]
                backtrace: std::backtrace::Backtrace::capture(),
            });
        }

        // Commit pass: re-run every macroblock's real encode at its
        // settled QP into the real reconstruction, bitstream, and MV list.
        let mut nonzero_luma = vec![false; self.grid.len()];
        for i in 0..self.grid.len() {
            let mb_enc_qp = self.grid.mbs[i].mb_enc_qp;
            match modes[i] {
                MbMode::Skip => {
                    let reference = reference.as_ref().expect("skip mode requires a reference picture");
                    code_skip_mb(source, &mut recon, reference, &mut self.grid, &mut self.mv_list, i);
                }
                MbMode::Inter(mv) => {
                    let reference = reference.as_ref().expect("inter mode requires a reference picture");
                    code_inter_mb(source, &mut recon, reference, &mut self.grid, &mut self.mv_list, i, mv, mb_enc_qp, &mut bv);
                }
                MbMode::Intra => {
                    code_intra_mb(source, &mut recon, &mut self.grid, i, mb_enc_qp, &mut bv, is_idr);
                }
            }
            nonzero_luma[i] = self.grid.mbs[i].coded_block_pattern & 0x0f != 0;
        }

        let slice_type = if is_idr { SliceType::IAll } else { SliceType::PAll };
        let disable_deblocking_filter_idc = 0u8;
        deblock_in_place(&self.grid, &mut recon, &nonzero_luma, disable_deblocking_filter_idc != 0);

        let header = SliceHeader {
            slice_type,
            pic_parameter_set_id: self.pps.pic_parameter_set_id,
            frame_num: self.frame_num,
            idr_pic_id: is_idr.then_some(self.pictures_since_idr),
            slice_qp_delta: result.qp - (26 + self.pps.pic_init_qp_minus26),
            disable_deblocking_filter_idc,
        };
        // `to_rbsp_prefix` returns whole bytes via `BitVec::into_vec`, which
        // pads to the next byte boundary -- the header's true bit length is
        // almost never a multiple of 8. Re-parse it to recover the exact bit
        // count before appending macroblock data, or the padding bits land
        // mid-stream and corrupt everything after them.
        let header_bytes = header.to_rbsp_prefix(&self.sps);
        let (_, header_bit_len) = SliceHeader::from_rbsp(&header_bytes, &self.sps, is_idr)?;
        let mut slice_bits: BitVec<u8, Msb0> = BitVec::from_vec(header_bytes);
        slice_bits.truncate(header_bit_len);
        slice_bits.extend_from_bitslice(&bv);
        // rbsp_stop_one_bit plus zero padding to a byte boundary.
        slice_bits.push(true);
        while slice_bits.len() % 8 != 0 {
            slice_bits.push(false);
        }

        let ref_idc = if is_idr { NalRefIdc::Three } else { NalRefIdc::Two };
        let unit_type = if is_idr {
            NalUnitType::CodedSliceOfAnIDRPicture
        } else {
            NalUnitType::CodedSliceOfANonIDRPicture
        };
        let slice_nal = NalUnit::new(ref_idc, unit_type, RbspData::new(slice_bits.into_vec()));

        let mut nal_units = Vec::new();
        if is_idr && self.params.prepend_param_sets_to_i_pictures {
            nal_units.push(param_set_nal_unit(&self.sps, true));
            nal_units.push(param_set_nal_unit_pps(&self.pps));
        }
        nal_units.push(slice_nal);

        self.reference = Some(ReferencePicture::from_picture(&recon));
        self.last_recon = Some(recon);
        self.frame_num = (self.frame_num + 1) % (1u32 << self.sps.log2_max_frame_num());
        self.pictures_since_idr = if is_idr { 0 } else { self.pictures_since_idr + 1 };

        Ok(EncodedPicture {
            nal_units,
            is_idr,
            qp: result.qp,
            bits: result.bits,
        })
    }

    fn decide_is_idr(&self, source: &Picture) -> bool {
        match self.params.picture_coding_type {
            PictureCodingType::ForceI => true,
            PictureCodingType::ForceP => self.reference.is_none(),
            PictureCodingType::Auto => {
                if self.reference.is_none() {
                    return true;
                }
                if self.params.auto_i_picture && self.pictures_since_idr >= self.params.auto_i_period {
                    return true;
                }
                if self.params.auto_i_picture {
                    return self.scene_change_detected(source);
                }
                false
            }
        }
    }

    /// True when the fraction of macroblocks whose zero-motion SAD exceeds
    /// the intra-refresh threshold is at least `auto_i_sad_fraction`: a
    /// cheap scene-change heuristic that doesn't require running the full
    /// motion search first.
    fn scene_change_detected(&self, source: &Picture) -> bool {
        let Some(reference) = &self.reference else {
            return true;
        };
        let threshold = INTRA_REFRESH_SAD_PER_PIXEL * MB_PIXELS;
        let mut high_sad_count = 0u32;
        for mb in &self.grid.mbs {
            let lx0 = mb.col * 16;
            let ly0 = mb.row * 16;
            let mut sad = 0i32;
            for y in 0..16 {
                for x in 0..16 {
                    let s = source.luma().read((lx0 + x) as i32, (ly0 + y) as i32) as i32;
                    let r = reference.luma.read((lx0 + x) as i32, (ly0 + y) as i32) as i32;
                    sad += (s - r).abs();
                }
            }
            if sad > threshold {
                high_sad_count += 1;
            }
        }
        let fraction = high_sad_count as f32 / self.grid.len() as f32;
        fraction >= self.params.auto_i_sad_fraction
    }

    /// Decide Skip/Inter/Intra for every macroblock of a P picture, using
    /// motion-estimation SAD against the previous reconstructed picture.
    /// Builds the final motion-vector list as it goes, in raster order, so
    /// later macroblocks' predicted vectors see earlier decisions.
    fn decide_modes(&mut self, source: &Picture) -> Vec<MbMode> {
        let pyramid = SearchPyramid::new(self.last_recon.as_ref().expect("reference implies a last reconstruction").luma());
        let range = search_range(source.width(), source.height());

        let intra_threshold = INTRA_REFRESH_SAD_PER_PIXEL * MB_PIXELS;
        let skip_threshold = SKIP_SAD_PER_PIXEL * MB_PIXELS;

        let mut modes = Vec::with_capacity(self.grid.len());
        for i in 0..self.grid.len() {
            let (col, row) = (self.grid.mbs[i].col, self.grid.mbs[i].row);
            let predicted = self.mv_list.predict(col, row);
            let est = estimate_motion(&pyramid, source.luma(), col, row, predicted, range);

            let mode = if est.sad > intra_threshold {
                MbMode::Intra
            } else if est.mv == predicted && est.sad <= skip_threshold {
                MbMode::Skip
            } else {
                MbMode::Inter(est.mv)
            };

            match mode {
                MbMode::Intra => self.mv_list.clear(col, row),
                MbMode::Inter(mv) => self.mv_list.set(col, row, mv),
                MbMode::Skip => self.mv_list.set(col, row, predicted),
            }
            modes.push(mode);
        }
        modes
    }

    // -----------------------------------------------------------------
    // Decode
    // -----------------------------------------------------------------

    /// Feed Annex-B bitstream data into the decoder, returning every
    /// picture it completed. SPS/PPS NAL units update the stored parameter
    /// sets; slice NAL units are decoded against them.
    pub fn decode(&mut self, annex_b_data: &[u8]) -> Result<Vec<DecodedPicture>> {
        let mut out = Vec::new();
        for unit_buf in split_annex_b(annex_b_data) {
            let (_ref_idc, unit_type, rbsp) = parse_nal_unit(unit_buf);
            match unit_type {
                NalUnitType::SequenceParameterSet => {
                    self.decoded_sps = Some(Sps::from_rbsp(&rbsp.data)?);
                }
                NalUnitType::PictureParameterSet => {
                    self.decoded_pps = Some(Pps::from_rbsp(&rbsp.data)?);
                }
                NalUnitType::CodedSliceOfAnIDRPicture => {
                    out.push(self.decode_slice(&rbsp, true)?);
                }
                NalUnitType::CodedSliceOfANonIDRPicture => {
                    out.push(self.decode_slice(&rbsp, false)?);
                }
                _ => {}
            }
        }
        Ok(out)
    }

    fn decode_slice(&mut self, rbsp: &RbspData, is_idr: bool) -> Result<DecodedPicture> {
        let sps = self.decoded_sps.clone().ok_or_else(missing_param_set)?;
        let pps = self.decoded_pps.clone().ok_or_else(missing_param_set)?;

        let (header, bit_offset) = SliceHeader::from_rbsp(&rbsp.data, &sps, is_idr)?;
        if header.pic_parameter_set_id != pps.pic_parameter_set_id {
            return Err(Error::ParamSetIndexOutOfRange {
                id: header.pic_parameter_set_id,
                #[cfg(feature = "backtrace")]
                backtrace: std::backtrace::Backtrace::capture(),
            });
        }

        let width = sps.width() as usize;
        let height = sps.height() as usize;
        let mb_width = width / 16;
        let mb_height = height / 16;
        if self.grid.mb_width != mb_width || self.grid.mb_height != mb_height {
            self.grid = MacroblockGrid::new(mb_width, mb_height);
            self.mv_list = MotionVectorList::new(mb_width, mb_height);
        } else {
            self.grid.reset_for_new_picture();
            self.mv_list = MotionVectorList::new(mb_width, mb_height);
        }

        let slice_is_i = matches!(header.slice_type, SliceType::IAll);
        let reference = if slice_is_i { None } else { Some(self.reference.take().ok_or_else(missing_reference)?) };

        let mut recon = Picture::new(width, height)?;
        let byte_offset = bit_offset / 8;
        let bit_in_byte = bit_offset % 8;
        let mut r = BitReader::new(&rbsp.data[byte_offset..]);
        for _ in 0..bit_in_byte {
            r.read_bit()?;
        }

        let mut qp = 26 + pps.pic_init_qp_minus26 + header.slice_qp_delta;
        let mut mb_index = 0usize;
        let total_mbs = self.grid.len();

        while mb_index < total_mbs {
            if slice_is_i {
                let mb_type_code_num = r.read_ue()?;
                qp = decode_intra_mb(&mut recon, &mut self.grid, mb_index, &mut r, mb_type_code_num, qp, true)?;
                mb_index += 1;
                continue;
            }

            let skip_run = r.read_ue()?;
            for _ in 0..skip_run {
                if mb_index >= total_mbs {
                    break;
                }
                decode_skip_mb(
                    &mut recon,
                    reference.as_ref().ok_or_else(missing_reference)?,
                    &mut self.grid,
                    &mut self.mv_list,
                    mb_index,
                );
                mb_index += 1;
            }
            if mb_index >= total_mbs || !r.more_rbsp_data() {
                break;
            }

            let mb_type_code_num = r.read_ue()?;
            if mb_type_code_num == 0 {
                qp = decode_inter_mb(
                    &mut recon,
                    reference.as_ref().ok_or_else(missing_reference)?,
                    &mut self.grid,
                    &mut self.mv_list,
                    mb_index,
                    &mut r,
                    qp,
                )?;
            } else {
                qp = decode_intra_mb(&mut recon, &mut self.grid, mb_index, &mut r, mb_type_code_num - 1, qp, false)?;
            }
            mb_index += 1;
        }

        let mut nonzero_luma = vec![false; self.grid.len()];
        for (i, mb) in self.grid.mbs.iter().enumerate() {
            nonzero_luma[i] = mb.coded_block_pattern & 0x0f != 0;
        }
        deblock_in_place(&self.grid, &mut recon, &nonzero_luma, header.disable_deblocking_filter_idc == 1);

        self.reference = Some(ReferencePicture::from_picture(&recon));
        self.last_recon = Some(recon.clone());

        Ok(DecodedPicture {
            picture: recon,
            frame_num: header.frame_num,
            is_idr,
        })
    }
}

/// Apply the loop filter to a picture's three planes in place. A thin
/// wrapper over [`deblock_picture`], which takes separate `&mut Plane`
/// arguments, so callers holding one `&mut Picture` don't need to juggle
/// three disjoint borrows by hand.
fn deblock_in_place(grid: &MacroblockGrid, pic: &mut Picture, nonzero_luma: &[bool], disabled: bool) {
    let Picture { luma, cb, cr, .. } = pic;
    deblock_picture(grid, luma, cb, cr, nonzero_luma, disabled);
}

fn param_set_nal_unit(sps: &Sps, _is_sps: bool) -> NalUnit {
    NalUnit::new(NalRefIdc::Three, NalUnitType::SequenceParameterSet, sps.to_rbsp())
}

fn param_set_nal_unit_pps(pps: &Pps) -> NalUnit {
    NalUnit::new(NalRefIdc::Three, NalUnitType::PictureParameterSet, pps.to_rbsp())
}

fn missing_param_set() -> Error {
    Error::ParamSetIndexOutOfRange {
        id: 0,
        #[cfg(feature = "backtrace")]
        backtrace: std::backtrace::Backtrace::capture(),
    }
}

fn missing_reference() -> Error {
    Error::MissingReferencePicture {
        #[cfg(feature = "backtrace")]
        backtrace: std::backtrace::Backtrace::capture(),
    }
}

/// Implements [`MbCoster`] by actually running the per-MB coding pipeline
/// against a shared scratch reconstruction, so intra prediction sees
/// genuinely reconstructed neighbour pixels. Coding mode (skip/inter/intra)
/// and motion vectors are fixed ahead of time in `modes`; only QP varies
/// across probes. Each call mutates `recon`/`mv_list`, so repeated probes
/// of the same macroblock at different QPs leave the scratch state
/// reflecting whichever probe ran most recently -- an approximation real
/// single-pass rate control also makes, since re-deriving every
/// downstream neighbour's prediction for every candidate QP is not
/// tractable.
struct TrialCoster<'a> {
    source: &'a Picture,
    reference: Option<&'a ReferencePicture>,
    modes: &'a [MbMode],
    recon: &'a mut Picture,
    mv_list: MotionVectorList,
    /// Owned clone of the real grid. `RateController::code_picture` holds
    /// the real grid exclusively for its own QP/bits/distortion caching, so
    /// every probe here writes mode/residual/cbp state into this scratch
    /// copy instead.
    scratch_grid: MacroblockGrid,
    scratch_bv: BitVec<u8, Msb0>,
}

impl MbCoster for TrialCoster<'_> {
    fn cost(&mut self, mb_index: usize, qp: i32) -> (u32, i64) {
        match self.modes[mb_index] {
            MbMode::Skip => {
                let reference = self.reference.expect("skip mode requires a reference picture");
                let ssd = code_skip_mb(self.source, self.recon, reference, &mut self.scratch_grid, &mut self.mv_list, mb_index);
                (SKIP_MB_APPROX_BITS, ssd)
            }
            MbMode::Inter(mv) => {
                let reference = self.reference.expect("inter mode requires a reference picture");
                self.scratch_bv.clear();
                let (bits, ssd) = code_inter_mb(
                    self.source,
                    self.recon,
                    reference,
                    &mut self.scratch_grid,
                    &mut self.mv_list,
                    mb_index,
                    mv,
                    qp,
                    &mut self.scratch_bv,
                );
                (bits, ssd)
            }
            MbMode::Intra => {
                self.scratch_bv.clear();
                let (bits, ssd) =
                    code_intra_mb(self.source, self.recon, &mut self.scratch_grid, mb_index, qp, &mut self.scratch_bv, false);
                (bits, ssd)
            }
        }
    }
}
