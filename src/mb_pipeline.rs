// Copyright 2022-2023 Andrew D. Straw.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The per-macroblock coding pipeline: prediction, transform/quantise,
//! CAVLC, and reconstruction, wired together for Intra_16x16, Inter_16x16,
//! and P-skip macroblocks, both encode and decode directions.

use alloc::vec::Vec;
use bitvec::prelude::{BitVec, Msb0};

use crate::bitreader::BitReader;
use crate::cavlc::{decode_block, encode_block};
use crate::golomb::BitVecGolomb;
use crate::image::Picture;
use crate::intra::{select_intra16x16_mode, select_intra_chroma_mode, IntraNeighbors};
use crate::macroblock::{
    Intra16x16Mode, IntraChromaMode, Macroblock, MacroblockGrid, MbPartPredMode, ResidualBlock,
};
use crate::motion_comp::{compensate_chroma_8x8, compensate_luma_16x16, MOTION_COMP_BOUNDARY};
use crate::mv::{MotionVector, MotionVectorList};
use crate::plane::{ExtendedPlane, Plane};
use crate::tables::{cbp_to_code, qp_chroma_from_luma, CBP_INTER_CODE_TO_CBP, ZIGZAG_4X4, ZIGZAG_4X4_INV};
use crate::transform::*;
use crate::{Error, Result};

/// The previous picture's reconstructed planes, padded for sub-pel motion
/// compensation. Built once per picture and handed to every inter/skip MB.
pub struct ReferencePicture {
    pub luma: ExtendedPlane,
    pub cb: ExtendedPlane,
    pub cr: ExtendedPlane,
}

impl ReferencePicture {
    pub fn from_picture(pic: &Picture) -> Self {
        let mut luma = ExtendedPlane::new(pic.luma().width(), pic.luma().height(), MOTION_COMP_BOUNDARY);
        luma.fill_from(pic.luma());
        let mut cb = ExtendedPlane::new(pic.cb().width(), pic.cb().height(), MOTION_COMP_BOUNDARY);
        cb.fill_from(pic.cb());
        let mut cr = ExtendedPlane::new(pic.cr().width(), pic.cr().height(), MOTION_COMP_BOUNDARY);
        cr.fill_from(pic.cr());
        Self { luma, cb, cr }
    }
}

fn intra16x16_mode_index(m: Intra16x16Mode) -> u32 {
    match m {
        Intra16x16Mode::Vertical => 0,
        Intra16x16Mode::Horizontal => 1,
        Intra16x16Mode::Dc => 2,
        Intra16x16Mode::Plane => 3,
    }
}

fn intra16x16_mode_from_index(i: u32) -> Option<Intra16x16Mode> {
    match i {
        0 => Some(Intra16x16Mode::Vertical),
        1 => Some(Intra16x16Mode::Horizontal),
        2 => Some(Intra16x16Mode::Dc),
        3 => Some(Intra16x16Mode::Plane),
        _ => None,
    }
}

fn chroma_mode_index(m: IntraChromaMode) -> u32 {
    match m {
        IntraChromaMode::Dc => 0,
        IntraChromaMode::Horizontal => 1,
        IntraChromaMode::Vertical => 2,
        IntraChromaMode::Plane => 3,
    }
}

fn chroma_mode_from_index(i: u32) -> Option<IntraChromaMode> {
    match i {
        0 => Some(IntraChromaMode::Dc),
        1 => Some(IntraChromaMode::Horizontal),
        2 => Some(IntraChromaMode::Vertical),
        3 => Some(IntraChromaMode::Plane),
        _ => None,
    }
}

/// `mb_type` code_num for an Intra_16x16 macroblock, folding prediction mode
/// and the implicit coded-block-pattern flags into the value directly
/// (Intra_16x16 never transmits a separate `coded_block_pattern`). Adds 5
/// when used inside a P slice, where `I_NxN` occupies code_num 5.
fn intra16x16_mb_type_code(mode: Intra16x16Mode, cbp_luma_is_15: bool, cbp_chroma: u8, slice_is_i: bool) -> u32 {
    let base = 1 + intra16x16_mode_index(mode) + 4 * cbp_chroma as u32 + 12 * cbp_luma_is_15 as u32;
    if slice_is_i {
        base
    } else {
        base + 5
    }
}

fn decode_intra16x16_mb_type(code_num: u32, slice_is_i: bool) -> Result<(Intra16x16Mode, bool, u8)> {
    let base = if slice_is_i {
        code_num
    } else {
        code_num.checked_sub(5).ok_or_else(unsupported_mb_type)?
    };
    if !(1..=24).contains(&base) {
        return Err(unsupported_mb_type());
    }
    let v = base - 1;
    let mode_idx = v % 4;
    let rem = v / 4;
    let cbp_chroma = (rem % 3) as u8;
    let cbp_luma_is_15 = rem / 3 != 0;
    let mode = intra16x16_mode_from_index(mode_idx).ok_or_else(unsupported_mb_type)?;
    Ok((mode, cbp_luma_is_15, cbp_chroma))
}

fn unsupported_mb_type() -> Error {
    Error::UnsupportedParameter {
        msg: "only I_16x16 and Inter_16x16/P-skip macroblock types are supported",
        #[cfg(feature = "backtrace")]
        backtrace: std::backtrace::Backtrace::capture(),
    }
}

fn nc_from(left: Option<i32>, above: Option<i32>) -> i32 {
    match (left, above) {
        (Some(l), Some(a)) => (l + a + 1) >> 1,
        (Some(l), None) => l,
        (None, Some(a)) => a,
        (None, None) => 0,
    }
}

fn luma_block_nc(grid: &MacroblockGrid, mb: &Macroblock, bx: usize, by: usize) -> i32 {
    let left = if bx > 0 {
        Some(mb.luma_blocks[Macroblock::luma_block_index(bx - 4, by)].num_coeffs)
    } else {
        mb.left
            .map(|li| grid.mbs[li].luma_blocks[Macroblock::luma_block_index(12, by)].num_coeffs)
    };
    let above = if by > 0 {
        Some(mb.luma_blocks[Macroblock::luma_block_index(bx, by - 4)].num_coeffs)
    } else {
        mb.above
            .map(|ai| grid.mbs[ai].luma_blocks[Macroblock::luma_block_index(bx, 12)].num_coeffs)
    };
    nc_from(left, above)
}

fn chroma_block_index(bx: usize, by: usize) -> usize {
    (by / 4) * 2 + (bx / 4)
}

fn chroma_block_nc(grid: &MacroblockGrid, mb: &Macroblock, is_cb: bool, bx: usize, by: usize) -> i32 {
    fn blocks_of(m: &Macroblock, is_cb: bool) -> &[ResidualBlock; 4] {
        if is_cb {
            &m.cb_blocks
        } else {
            &m.cr_blocks
        }
    }
    let left = if bx > 0 {
        Some(blocks_of(mb, is_cb)[chroma_block_index(bx - 4, by)].num_coeffs)
    } else {
        mb.left.map(|li| blocks_of(&grid.mbs[li], is_cb)[chroma_block_index(4, by)].num_coeffs)
    };
    let above = if by > 0 {
        Some(blocks_of(mb, is_cb)[chroma_block_index(bx, by - 4)].num_coeffs)
    } else {
        mb.above.map(|ai| blocks_of(&grid.mbs[ai], is_cb)[chroma_block_index(bx, 4)].num_coeffs)
    };
    nc_from(left, above)
}

fn luma_cbp_any(blocks: &[ResidualBlock; 16]) -> bool {
    blocks.iter().any(|b| b.num_coeffs > 0)
}

fn luma_cbp_bits(blocks: &[ResidualBlock; 16]) -> u8 {
    let mut bits = 0u8;
    for (i, &(ox, oy)) in Macroblock::luma_8x8_offsets().iter().enumerate() {
        let any = [(0, 0), (4, 0), (0, 4), (4, 4)]
            .iter()
            .any(|&(dx, dy)| blocks[Macroblock::luma_block_index(ox + dx, oy + dy)].num_coeffs > 0);
        if any {
            bits |= 1 << i;
        }
    }
    bits
}

fn chroma_cbp_code(
    cb_blocks: &[ResidualBlock; 4],
    cr_blocks: &[ResidualBlock; 4],
    cb_dc: &ResidualBlock,
    cr_dc: &ResidualBlock,
) -> u8 {
    let any_ac = cb_blocks.iter().chain(cr_blocks.iter()).any(|b| b.num_coeffs > 0);
    if any_ac {
        return 2;
    }
    if cb_dc.num_coeffs > 0 || cr_dc.num_coeffs > 0 {
        1
    } else {
        0
    }
}

fn gather_neighbors(
    plane: &Plane,
    x0: usize,
    y0: usize,
    size: usize,
    has_above: bool,
    has_left: bool,
    has_above_left: bool,
) -> IntraNeighbors {
    let above = has_above.then(|| {
        (0..size)
            .map(|i| plane.read((x0 + i) as i32, y0 as i32 - 1) as i32)
            .collect::<Vec<_>>()
    });
    let left = has_left.then(|| {
        (0..size)
            .map(|i| plane.read(x0 as i32 - 1, (y0 + i) as i32) as i32)
            .collect::<Vec<_>>()
    });
    let above_left = has_above_left.then(|| plane.read(x0 as i32 - 1, y0 as i32 - 1) as i32);
    IntraNeighbors { above, left, above_left }
}

fn read_block_i32(plane: &Plane, x0: usize, y0: usize, size: usize) -> Vec<i32> {
    let mut out = Vec::with_capacity(size * size);
    for y in 0..size {
        for x in 0..size {
            out.push(plane.read((x0 + x) as i32, (y0 + y) as i32) as i32);
        }
    }
    out
}

fn read_block_i16(plane: &Plane, x0: usize, y0: usize, size: usize) -> Vec<i16> {
    let mut out = Vec::with_capacity(size * size);
    for y in 0..size {
        for x in 0..size {
            out.push(plane.read((x0 + x) as i32, (y0 + y) as i32));
        }
    }
    out
}

fn to_scan_order(raster: &[i32; 16]) -> [i32; 16] {
    let mut out = [0i32; 16];
    for (k, &r) in ZIGZAG_4X4.iter().enumerate() {
        out[k] = raster[r];
    }
    out
}

fn from_scan_order(scan: &[i32]) -> [i32; 16] {
    let mut out = [0i32; 16];
    for (r, &v) in scan.iter().enumerate() {
        out[ZIGZAG_4X4_INV[r]] = v;
    }
    out
}

/// Resolve a rate controller's desired `mb_enc_qp` (which may run up to 86
/// under the extended-QP ladder) into a legal transmitted `(qp, qp_delta)`
/// pair: `qp` is always in `0..=51` and `qp_delta` is always in
/// `[-26, 25]` against `prev_qp`, chosen so that a decoder computing
/// `(prev_qp + qp_delta).clamp(0, 51)` reproduces `qp` exactly. The raw
/// `mb_enc_qp` is kept separately by the caller to drive
/// [`apply_extended_qp_zeroing_intra`] / [`apply_extended_qp_zeroing_inter`].
fn resolve_transmitted_qp(prev_qp: i32, mb_enc_qp: i32) -> (i32, i32) {
    let desired = mb_enc_qp.clamp(0, 51);
    let delta = (desired - prev_qp).clamp(-26, 25);
    let qp = (prev_qp + delta).clamp(0, 51);
    (qp, qp - prev_qp)
}

/// Extended-QP coefficient zeroing counts for one macroblock, derived from
/// `mb_enc_qp` (spec §4.3 step 6). All counts are zero at `mb_enc_qp <= 51`.
struct ExtendedQpZeroing {
    ac_zero_count: usize,
    chroma_dc_ac_zero_count: usize,
    luma_dc_ac_zero_count: usize,
    zero_chroma_dc_term: bool,
    zero_luma_dc_term: bool,
}

fn extended_qp_zeroing(mb_enc_qp: i32) -> ExtendedQpZeroing {
    ExtendedQpZeroing {
        ac_zero_count: (mb_enc_qp - 51).clamp(0, 15) as usize,
        chroma_dc_ac_zero_count: (mb_enc_qp - 66).clamp(0, 3) as usize,
        luma_dc_ac_zero_count: (mb_enc_qp - 69).clamp(0, 15) as usize,
        zero_chroma_dc_term: mb_enc_qp >= 85,
        zero_luma_dc_term: mb_enc_qp >= 86,
    }
}

/// Zero the highest `count` scan positions (reverse zig-zag order) of a 4x4
/// residual block and recompute `num_coeffs`. `count_dc` controls whether
/// scan position 0 is included in the recount: intra AC-only blocks never
/// carry a DC term there (it's always already 0), while inter blocks and
/// the luma DC block count every position.
fn zero_highest_ac_scan_positions(block: &mut ResidualBlock, count: usize, count_dc: bool) {
    if count == 0 {
        return;
    }
    for k in (16 - count)..16 {
        block.coeffs[ZIGZAG_4X4[k]] = 0;
    }
    block.num_coeffs = if count_dc {
        block.coeffs.iter().filter(|&&v| v != 0).count() as i32
    } else {
        block.coeffs.iter().skip(1).filter(|&&v| v != 0).count() as i32
    };
}

/// Zero the highest `count` of the 3 chroma-DC AC terms (index 3 down to
/// 1); the 2x2 Hadamard has no formal zig-zag, so highest-index-first
/// stands in for "reverse scan order".
fn zero_trailing_chroma_dc(block: &mut ResidualBlock, count: usize) {
    if count == 0 {
        return;
    }
    for k in (4 - count)..4 {
        block.coeffs[k] = 0;
    }
    block.num_coeffs = block.coeffs[..4].iter().filter(|&&v| v != 0).count() as i32;
}

fn apply_extended_qp_zeroing_intra(plan: &mut IntraPlan, mb_enc_qp: i32) {
    if mb_enc_qp <= 51 {
        return;
    }
    let z = extended_qp_zeroing(mb_enc_qp);
    for block in plan.luma_blocks.iter_mut() {
        zero_highest_ac_scan_positions(block, z.ac_zero_count, false);
    }
    for block in plan.cb_blocks.iter_mut().chain(plan.cr_blocks.iter_mut()) {
        zero_highest_ac_scan_positions(block, z.ac_zero_count, false);
    }
    zero_trailing_chroma_dc(&mut plan.cb_dc, z.chroma_dc_ac_zero_count);
    zero_trailing_chroma_dc(&mut plan.cr_dc, z.chroma_dc_ac_zero_count);
    zero_highest_ac_scan_positions(&mut plan.luma_dc, z.luma_dc_ac_zero_count, true);
    if z.zero_chroma_dc_term {
        plan.cb_dc.coeffs[0] = 0;
        plan.cr_dc.coeffs[0] = 0;
        plan.cb_dc.num_coeffs = plan.cb_dc.coeffs[..4].iter().filter(|&&v| v != 0).count() as i32;
        plan.cr_dc.num_coeffs = plan.cr_dc.coeffs[..4].iter().filter(|&&v| v != 0).count() as i32;
    }
    if z.zero_luma_dc_term {
        plan.luma_dc.coeffs[0] = 0;
        plan.luma_dc.num_coeffs = plan.luma_dc.coeffs.iter().filter(|&&v| v != 0).count() as i32;
    }
    plan.cbp_luma_is_15 = luma_cbp_any(&plan.luma_blocks);
    plan.cbp_chroma = chroma_cbp_code(&plan.cb_blocks, &plan.cr_blocks, &plan.cb_dc, &plan.cr_dc);
}

/// Inter_16x16 has no separate DC Hadamard transform (luma or chroma), so
/// only the AC-zeroing stage (mb_enc_qp in 52..=66) has a counterpart here;
/// the DC-term stages of the ladder are meaningless for inter macroblocks.
fn apply_extended_qp_zeroing_inter(plan: &mut InterPlan, mb_enc_qp: i32) {
    if mb_enc_qp <= 51 {
        return;
    }
    let z = extended_qp_zeroing(mb_enc_qp);
    for block in plan.luma_blocks.iter_mut() {
        zero_highest_ac_scan_positions(block, z.ac_zero_count, true);
    }
    for block in plan.cb_blocks.iter_mut().chain(plan.cr_blocks.iter_mut()) {
        zero_highest_ac_scan_positions(block, z.ac_zero_count, true);
    }
    plan.cbp_luma = luma_cbp_bits(&plan.luma_blocks);
    plan.cbp_chroma = chroma_cbp_code(&plan.cb_blocks, &plan.cr_blocks, &ResidualBlock::default(), &ResidualBlock::default());
}

fn block_ssd(recon: &[i16], source: &[i32]) -> i64 {
    recon
        .iter()
        .zip(source.iter())
        .map(|(&r, &s)| {
            let d = r as i64 - s as i64;
            d * d
        })
        .sum()
}

fn clip_write(plane: &mut Plane, x0: usize, y0: usize, size: usize, samples: &[i32]) {
    for y in 0..size {
        for x in 0..size {
            plane.write(x0 + x, y0 + y, samples[y * size + x].clamp(0, 255) as i16);
        }
    }
}

// ---------------------------------------------------------------------
// Intra_16x16
// ---------------------------------------------------------------------

struct IntraPlan {
    luma_mode: Intra16x16Mode,
    chroma_mode: IntraChromaMode,
    pred_luma: [i32; 256],
    pred_cb: [i32; 64],
    pred_cr: [i32; 64],
    luma_dc: ResidualBlock,
    luma_blocks: [ResidualBlock; 16],
    cb_dc: ResidualBlock,
    cr_dc: ResidualBlock,
    cb_blocks: [ResidualBlock; 4],
    cr_blocks: [ResidualBlock; 4],
    cbp_luma_is_15: bool,
    cbp_chroma: u8,
}

fn plan_intra_mb(source: &Picture, recon: &Picture, mb: &Macroblock, qp: i32) -> IntraPlan {
    let col = mb.col;
    let row = mb.row;
    let has_left = mb.left.is_some();
    let has_above = mb.above.is_some();
    let has_above_left = mb.above_left.is_some();
    let lx0 = col * 16;
    let ly0 = row * 16;
    let cx0 = col * 8;
    let cy0 = row * 8;

    let luma_n = gather_neighbors(recon.luma(), lx0, ly0, 16, has_above, has_left, has_above_left);
    let orig_luma = read_block_i32(source.luma(), lx0, ly0, 16);
    let mut orig_luma_arr = [0i32; 256];
    orig_luma_arr.copy_from_slice(&orig_luma);
    let (luma_mode, pred_luma) = select_intra16x16_mode(&orig_luma_arr, &luma_n);

    let cb_n = gather_neighbors(recon.cb(), cx0, cy0, 8, has_above, has_left, has_above_left);
    let cr_n = gather_neighbors(recon.cr(), cx0, cy0, 8, has_above, has_left, has_above_left);
    let orig_cb = read_block_i32(source.cb(), cx0, cy0, 8);
    let orig_cr = read_block_i32(source.cr(), cx0, cy0, 8);
    let mut orig_cb_arr = [0i32; 64];
    orig_cb_arr.copy_from_slice(&orig_cb);
    let mut orig_cr_arr = [0i32; 64];
    orig_cr_arr.copy_from_slice(&orig_cr);
    let (chroma_mode, pred_cb) = select_intra_chroma_mode(&orig_cb_arr, &cb_n);
    let mut pred_cr = [0i32; 64];
    crate::intra::predict_intra_chroma(chroma_mode, &cr_n, &mut pred_cr);

    let mut luma_blocks: [ResidualBlock; 16] = Default::default();
    let mut dc_coeffs = [0i32; 16];
    let mut ac_raster: Vec<(usize, [i32; 16])> = Vec::with_capacity(16);
    for by in (0..16).step_by(4) {
        for bx in (0..16).step_by(4) {
            let mut residual = [0i32; 16];
            for y in 0..4 {
                for x in 0..4 {
                    let idx = (by + y) * 16 + (bx + x);
                    residual[y * 4 + x] = orig_luma_arr[idx] - pred_luma[idx];
                }
            }
            let t = forward_4x4(&residual);
            let block_idx = Macroblock::luma_block_index(bx, by);
            dc_coeffs[block_idx] = t[0];
            ac_raster.push((block_idx, t));
        }
    }
    let hadamard = hadamard_4x4_forward(&dc_coeffs);
    let dc_levels_raster = quantize_luma_dc(&hadamard, qp);
    let dc_levels_scan = to_scan_order(&dc_levels_raster);
    let luma_dc = ResidualBlock {
        coeffs: from_scan_order(&dc_levels_scan),
        num_coeffs: dc_levels_scan.iter().filter(|&&v| v != 0).count() as i32,
    };

    for (block_idx, t) in ac_raster {
        let mut q = quantize_4x4(&t, qp, true);
        q[0] = 0;
        let num_coeffs = q.iter().skip(1).filter(|&&v| v != 0).count() as i32;
        luma_blocks[block_idx] = ResidualBlock { coeffs: q, num_coeffs };
    }
    let cbp_luma_is_15 = luma_cbp_any(&luma_blocks);

    let mut cb_blocks: [ResidualBlock; 4] = Default::default();
    let mut cr_blocks: [ResidualBlock; 4] = Default::default();
    let mut cb_dc_raster = [0i32; 4];
    let mut cr_dc_raster = [0i32; 4];
    let mut cb_ac: Vec<(usize, [i32; 16])> = Vec::with_capacity(4);
    let mut cr_ac: Vec<(usize, [i32; 16])> = Vec::with_capacity(4);

    for by in (0..8).step_by(4) {
        for bx in (0..8).step_by(4) {
            let idx4 = chroma_block_index(bx, by);
            let mut res_cb = [0i32; 16];
            let mut res_cr = [0i32; 16];
            for y in 0..4 {
                for x in 0..4 {
                    let pix = (by + y) * 8 + (bx + x);
                    res_cb[y * 4 + x] = orig_cb_arr[pix] - pred_cb[pix];
                    res_cr[y * 4 + x] = orig_cr_arr[pix] - pred_cr[pix];
                }
            }
            let t_cb = forward_4x4(&res_cb);
            let t_cr = forward_4x4(&res_cr);
            cb_dc_raster[idx4] = t_cb[0];
            cr_dc_raster[idx4] = t_cr[0];
            cb_ac.push((idx4, t_cb));
            cr_ac.push((idx4, t_cr));
        }
    }

    let qpc = qp_chroma_from_luma(qp);
    let cb_hadamard = hadamard_2x2_forward(&cb_dc_raster);
    let cr_hadamard = hadamard_2x2_forward(&cr_dc_raster);
    let cb_dc_levels = quantize_chroma_dc(&cb_hadamard, qpc);
    let cr_dc_levels = quantize_chroma_dc(&cr_hadamard, qpc);
    let cb_dc = ResidualBlock {
        coeffs: {
            let mut c = [0i32; 16];
            c[..4].copy_from_slice(&cb_dc_levels);
            c
        },
        num_coeffs: cb_dc_levels.iter().filter(|&&v| v != 0).count() as i32,
    };
    let cr_dc = ResidualBlock {
        coeffs: {
            let mut c = [0i32; 16];
            c[..4].copy_from_slice(&cr_dc_levels);
            c
        },
        num_coeffs: cr_dc_levels.iter().filter(|&&v| v != 0).count() as i32,
    };

    for (idx4, t) in cb_ac {
        let mut q = quantize_4x4(&t, qpc, true);
        q[0] = 0;
        let num_coeffs = q.iter().skip(1).filter(|&&v| v != 0).count() as i32;
        cb_blocks[idx4] = ResidualBlock { coeffs: q, num_coeffs };
    }
    for (idx4, t) in cr_ac {
        let mut q = quantize_4x4(&t, qpc, true);
        q[0] = 0;
        let num_coeffs = q.iter().skip(1).filter(|&&v| v != 0).count() as i32;
        cr_blocks[idx4] = ResidualBlock { coeffs: q, num_coeffs };
    }

    let cbp_chroma = chroma_cbp_code(&cb_blocks, &cr_blocks, &cb_dc, &cr_dc);

    IntraPlan {
        luma_mode,
        chroma_mode,
        pred_luma,
        pred_cb,
        pred_cr,
        luma_dc,
        luma_blocks,
        cb_dc,
        cr_dc,
        cb_blocks,
        cr_blocks,
        cbp_luma_is_15,
        cbp_chroma,
    }
}

/// Write one already-planned Intra_16x16 macroblock's syntax elements and
/// residual into `bv`, in standard bitstream order.
fn write_intra_mb(
    bv: &mut BitVec<u8, Msb0>,
    grid: &MacroblockGrid,
    mb_index: usize,
    plan: &IntraPlan,
    qp_delta: i32,
    slice_is_i: bool,
) {
    let mb_type = intra16x16_mb_type_code(plan.luma_mode, plan.cbp_luma_is_15, plan.cbp_chroma, slice_is_i);
    bv.extend_exp_golomb(mb_type);
    bv.extend_exp_golomb(chroma_mode_index(plan.chroma_mode));
    bv.extend_signed_exp_golomb(qp_delta);

    let dc_scan = to_scan_order(&plan.luma_dc.coeffs);
    encode_block(bv, &dc_scan, Some(0));

    if plan.cbp_luma_is_15 {
        let mb = &grid.mbs[mb_index];
        for by in (0..16).step_by(4) {
            for bx in (0..16).step_by(4) {
                let idx = Macroblock::luma_block_index(bx, by);
                let nc = luma_block_nc(grid, mb, bx, by);
                let scan = to_scan_order(&plan.luma_blocks[idx].coeffs);
                encode_block(bv, &scan[1..], Some(nc));
            }
        }
    }

    if plan.cbp_chroma >= 1 {
        let cb_dc: Vec<i32> = plan.cb_dc.coeffs[..4].to_vec();
        let cr_dc: Vec<i32> = plan.cr_dc.coeffs[..4].to_vec();
        encode_block(bv, &cb_dc, None);
        encode_block(bv, &cr_dc, None);
    }
    if plan.cbp_chroma == 2 {
        let mb = &grid.mbs[mb_index];
        for is_cb in [true, false] {
            for by in (0..8).step_by(4) {
                for bx in (0..8).step_by(4) {
                    let idx = chroma_block_index(bx, by);
                    let nc = chroma_block_nc(grid, mb, is_cb, bx, by);
                    let coeffs = if is_cb {
                        &plan.cb_blocks[idx].coeffs
                    } else {
                        &plan.cr_blocks[idx].coeffs
                    };
                    let scan = to_scan_order(coeffs);
                    encode_block(bv, &scan[1..], Some(nc));
                }
            }
        }
    }
}

fn reconstruct_intra(recon: &mut Picture, mb: &Macroblock, plan: &IntraPlan, qp: i32) {
    let col = mb.col;
    let row = mb.row;
    let lx0 = col * 16;
    let ly0 = row * 16;
    let cx0 = col * 8;
    let cy0 = row * 8;
    let qpc = qp_chroma_from_luma(qp);

    let dc_dequant = dequantize_luma_dc(&plan.luma_dc.coeffs, qp);
    let dc_spatial = hadamard_4x4_inverse(&dc_dequant);

    let mut luma_out = [0i32; 256];
    for by in (0..16).step_by(4) {
        for bx in (0..16).step_by(4) {
            let idx = Macroblock::luma_block_index(bx, by);
            let mut dequant = dequantize_4x4(&plan.luma_blocks[idx].coeffs, qp);
            dequant[0] = dc_spatial[idx];
            let residual = inverse_4x4(&dequant);
            for y in 0..4 {
                for x in 0..4 {
                    let pix = (by + y) * 16 + (bx + x);
                    luma_out[pix] = plan.pred_luma[pix] + residual[y * 4 + x];
                }
            }
        }
    }
    clip_write(recon.luma_mut(), lx0, ly0, 16, &luma_out);

    let cb_dc4: [i32; 4] = plan.cb_dc.coeffs[..4].try_into().unwrap();
    let cr_dc4: [i32; 4] = plan.cr_dc.coeffs[..4].try_into().unwrap();
    let cb_dc_dequant = dequantize_chroma_dc(&cb_dc4, qpc);
    let cr_dc_dequant = dequantize_chroma_dc(&cr_dc4, qpc);
    let cb_dc_spatial = hadamard_2x2_inverse(&cb_dc_dequant);
    let cr_dc_spatial = hadamard_2x2_inverse(&cr_dc_dequant);

    let mut cb_out = [0i32; 64];
    let mut cr_out = [0i32; 64];
    for by in (0..8).step_by(4) {
        for bx in (0..8).step_by(4) {
            let idx = chroma_block_index(bx, by);
            let mut dq_cb = dequantize_4x4(&plan.cb_blocks[idx].coeffs, qpc);
            let mut dq_cr = dequantize_4x4(&plan.cr_blocks[idx].coeffs, qpc);
            dq_cb[0] = cb_dc_spatial[idx];
            dq_cr[0] = cr_dc_spatial[idx];
            let res_cb = inverse_4x4(&dq_cb);
            let res_cr = inverse_4x4(&dq_cr);
            for y in 0..4 {
                for x in 0..4 {
                    let pix = (by + y) * 8 + (bx + x);
                    cb_out[pix] = plan.pred_cb[pix] + res_cb[y * 4 + x];
                    cr_out[pix] = plan.pred_cr[pix] + res_cr[y * 4 + x];
                }
            }
        }
    }
    clip_write(recon.cb_mut(), cx0, cy0, 8, &cb_out);
    clip_write(recon.cr_mut(), cx0, cy0, 8, &cr_out);
}

/// Encode one Intra_16x16 macroblock against `qp`, appending its syntax and
/// residual to `bv` and writing reconstructed samples into `recon`. Updates
/// `grid.mbs[mb_index]`'s stored prediction/residual/cbp state. Returns
/// `(bits_written, ssd_against_source)` for rate-control accounting.
pub fn code_intra_mb(
    source: &Picture,
    recon: &mut Picture,
    grid: &mut MacroblockGrid,
    mb_index: usize,
    mb_enc_qp: i32,
    bv: &mut BitVec<u8, Msb0>,
    slice_is_i: bool,
) -> (u32, i64) {
    let bits_before = bv.len();
    let prev_qp = grid.mbs[mb_index].mb_qp;
    let (qp, qp_delta) = resolve_transmitted_qp(prev_qp, mb_enc_qp);
    let mut plan = plan_intra_mb(source, recon, &grid.mbs[mb_index], qp);
    apply_extended_qp_zeroing_intra(&mut plan, mb_enc_qp);

    write_intra_mb(bv, grid, mb_index, &plan, qp_delta, slice_is_i);
    reconstruct_intra(recon, &grid.mbs[mb_index], &plan, qp);

    let luma_bits_field = luma_cbp_bits(&plan.luma_blocks);
    let mb = &mut grid.mbs[mb_index];
    mb.intra_flag = true;
    mb.skip = false;
    mb.part_pred_mode = MbPartPredMode::Intra16x16(plan.luma_mode);
    mb.intra_chroma_mode = plan.chroma_mode;
    mb.mv = MotionVector::ZERO;
    mb.mvd = MotionVector::ZERO;
    mb.mb_qp_delta = qp_delta;
    mb.mb_qp = qp;
    mb.mb_enc_qp = mb_enc_qp;
    mb.luma_dc = plan.luma_dc.clone();
    mb.luma_blocks = plan.luma_blocks.clone();
    mb.cb_dc = plan.cb_dc.clone();
    mb.cr_dc = plan.cr_dc.clone();
    mb.cb_blocks = plan.cb_blocks.clone();
    mb.cr_blocks = plan.cr_blocks.clone();
    mb.coded_block_pattern = plan.cbp_chroma * 16 + if plan.cbp_luma_is_15 { 15 } else { luma_bits_field & 0 };

    let ssd = {
        let lx0 = mb.col * 16;
        let ly0 = mb.row * 16;
        let cx0 = mb.col * 8;
        let cy0 = mb.row * 8;
        let luma_recon = read_block_i16(recon.luma(), lx0, ly0, 16);
        let cb_recon = read_block_i16(recon.cb(), cx0, cy0, 8);
        let cr_recon = read_block_i16(recon.cr(), cx0, cy0, 8);
        let orig_luma = read_block_i32(source.luma(), lx0, ly0, 16);
        let orig_cb = read_block_i32(source.cb(), cx0, cy0, 8);
        let orig_cr = read_block_i32(source.cr(), cx0, cy0, 8);
        block_ssd(&luma_recon, &orig_luma) + block_ssd(&cb_recon, &orig_cb) + block_ssd(&cr_recon, &orig_cr)
    };

    ((bv.len() - bits_before) as u32, ssd)
}

/// Decode one Intra_16x16 macroblock, given `mb_type`'s code_num already
/// read by the caller. Returns the updated QP (after `mb_qp_delta`).
pub fn decode_intra_mb(
    recon: &mut Picture,
    grid: &mut MacroblockGrid,
    mb_index: usize,
    r: &mut BitReader,
    mb_type_code_num: u32,
    prev_qp: i32,
    slice_is_i: bool,
) -> Result<i32> {
    let (luma_mode, cbp_luma_is_15, cbp_chroma) = decode_intra16x16_mb_type(mb_type_code_num, slice_is_i)?;
    let chroma_mode_idx = r.read_ue()?;
    let chroma_mode = chroma_mode_from_index(chroma_mode_idx).ok_or_else(unsupported_mb_type)?;
    let qp_delta = r.read_se()?;
    let qp = (prev_qp + qp_delta).clamp(0, 51);

    let (has_left, has_above, has_above_left, col, row) = {
        let mb = &grid.mbs[mb_index];
        (mb.left.is_some(), mb.above.is_some(), mb.above_left.is_some(), mb.col, mb.row)
    };
    let lx0 = col * 16;
    let ly0 = row * 16;
    let cx0 = col * 8;
    let cy0 = row * 8;
    let luma_n = gather_neighbors(recon.luma(), lx0, ly0, 16, has_above, has_left, has_above_left);
    let cb_n = gather_neighbors(recon.cb(), cx0, cy0, 8, has_above, has_left, has_above_left);
    let cr_n = gather_neighbors(recon.cr(), cx0, cy0, 8, has_above, has_left, has_above_left);
    let mut pred_luma = [0i32; 256];
    crate::intra::predict_intra16x16(luma_mode, &luma_n, &mut pred_luma);
    let mut pred_cb = [0i32; 64];
    let mut pred_cr = [0i32; 64];
    crate::intra::predict_intra_chroma(chroma_mode, &cb_n, &mut pred_cb);
    crate::intra::predict_intra_chroma(chroma_mode, &cr_n, &mut pred_cr);

    let dc_decoded = decode_block(r, 16, Some(0))?;
    let luma_dc = ResidualBlock {
        coeffs: from_scan_order(&dc_decoded.coeffs),
        num_coeffs: dc_decoded.total_coeff as i32,
    };

    let mut luma_blocks: [ResidualBlock; 16] = Default::default();
    if cbp_luma_is_15 {
        for by in (0..16).step_by(4) {
            for bx in (0..16).step_by(4) {
                let idx = Macroblock::luma_block_index(bx, by);
                let nc = luma_block_nc(grid, &grid.mbs[mb_index], bx, by);
                let decoded = decode_block(r, 15, Some(nc))?;
                let mut coeffs_scan = [0i32; 16];
                coeffs_scan[1..].copy_from_slice(&decoded.coeffs);
                let block = ResidualBlock {
                    coeffs: from_scan_order(&coeffs_scan),
                    num_coeffs: decoded.total_coeff as i32,
                };
                luma_blocks[idx] = block.clone();
                grid.mbs[mb_index].luma_blocks[idx] = block;
            }
        }
    }

    let mut cb_dc = ResidualBlock::default();
    let mut cr_dc = ResidualBlock::default();
    if cbp_chroma >= 1 {
        let decoded_cb = decode_block(r, 4, None)?;
        let decoded_cr = decode_block(r, 4, None)?;
        cb_dc = ResidualBlock {
            coeffs: {
                let mut c = [0i32; 16];
                c[..4].copy_from_slice(&decoded_cb.coeffs);
                c
            },
            num_coeffs: decoded_cb.total_coeff as i32,
        };
        cr_dc = ResidualBlock {
            coeffs: {
                let mut c = [0i32; 16];
                c[..4].copy_from_slice(&decoded_cr.coeffs);
                c
            },
            num_coeffs: decoded_cr.total_coeff as i32,
        };
    }

    let mut cb_blocks: [ResidualBlock; 4] = Default::default();
    let mut cr_blocks: [ResidualBlock; 4] = Default::default();
    if cbp_chroma == 2 {
        for is_cb in [true, false] {
            for by in (0..8).step_by(4) {
                for bx in (0..8).step_by(4) {
                    let idx = chroma_block_index(bx, by);
                    let nc = chroma_block_nc(grid, &grid.mbs[mb_index], is_cb, bx, by);
                    let decoded = decode_block(r, 15, Some(nc))?;
                    let mut coeffs_scan = [0i32; 16];
                    coeffs_scan[1..].copy_from_slice(&decoded.coeffs);
                    let block = ResidualBlock {
                        coeffs: from_scan_order(&coeffs_scan),
                        num_coeffs: decoded.total_coeff as i32,
                    };
                    if is_cb {
                        cb_blocks[idx] = block.clone();
                        grid.mbs[mb_index].cb_blocks[idx] = block;
                    } else {
                        cr_blocks[idx] = block.clone();
                        grid.mbs[mb_index].cr_blocks[idx] = block;
                    }
                }
            }
        }
    }

    let plan = IntraPlan {
        luma_mode,
        chroma_mode,
        pred_luma,
        pred_cb,
        pred_cr,
        luma_dc,
        luma_blocks,
        cb_dc,
        cr_dc,
        cb_blocks,
        cr_blocks,
        cbp_luma_is_15,
        cbp_chroma,
    };
    reconstruct_intra(recon, &grid.mbs[mb_index], &plan, qp);

    let luma_bits_field = luma_cbp_bits(&grid.mbs[mb_index].luma_blocks);
    let mb = &mut grid.mbs[mb_index];
    mb.intra_flag = true;
    mb.skip = false;
    mb.part_pred_mode = MbPartPredMode::Intra16x16(luma_mode);
    mb.intra_chroma_mode = chroma_mode;
    mb.mv = MotionVector::ZERO;
    mb.mvd = MotionVector::ZERO;
    mb.mb_qp_delta = qp_delta;
    mb.mb_qp = qp;
    mb.mb_enc_qp = qp;
    mb.luma_dc = plan.luma_dc;
    mb.cb_dc = plan.cb_dc;
    mb.cr_dc = plan.cr_dc;
    mb.coded_block_pattern = cbp_chroma * 16 + if cbp_luma_is_15 { 15 } else { luma_bits_field & 0 };

    Ok(qp)
}

// ---------------------------------------------------------------------
// Inter_16x16 and P-skip
// ---------------------------------------------------------------------

struct InterPlan {
    pred_luma: [i16; 256],
    pred_cb: [i16; 64],
    pred_cr: [i16; 64],
    luma_blocks: [ResidualBlock; 16],
    cb_blocks: [ResidualBlock; 4],
    cr_blocks: [ResidualBlock; 4],
    cbp_luma: u8,
    cbp_chroma: u8,
}

fn plan_inter_mb(source: &Picture, reference: &ReferencePicture, mb: &Macroblock, mv: MotionVector, qp: i32) -> InterPlan {
    let lx0 = mb.col * 16;
    let ly0 = mb.row * 16;
    let cx0 = mb.col * 8;
    let cy0 = mb.row * 8;
    let pred_luma = compensate_luma_16x16(&reference.luma, lx0, ly0, mv);
    let pred_cb = compensate_chroma_8x8(&reference.cb, cx0, cy0, mv);
    let pred_cr = compensate_chroma_8x8(&reference.cr, cx0, cy0, mv);

    let orig_luma = read_block_i32(source.luma(), lx0, ly0, 16);
    let orig_cb = read_block_i32(source.cb(), cx0, cy0, 8);
    let orig_cr = read_block_i32(source.cr(), cx0, cy0, 8);

    let mut luma_blocks: [ResidualBlock; 16] = Default::default();
    for by in (0..16).step_by(4) {
        for bx in (0..16).step_by(4) {
            let idx = Macroblock::luma_block_index(bx, by);
            let mut residual = [0i32; 16];
            for y in 0..4 {
                for x in 0..4 {
                    let pix = (by + y) * 16 + (bx + x);
                    residual[y * 4 + x] = orig_luma[pix] - pred_luma[pix] as i32;
                }
            }
            let q = transform_and_quantize_4x4(&residual, qp, false);
            let num_coeffs = q.iter().filter(|&&v| v != 0).count() as i32;
            luma_blocks[idx] = ResidualBlock { coeffs: q, num_coeffs };
        }
    }
    let cbp_luma = luma_cbp_bits(&luma_blocks);

    let qpc = qp_chroma_from_luma(qp);
    let mut cb_blocks: [ResidualBlock; 4] = Default::default();
    let mut cr_blocks: [ResidualBlock; 4] = Default::default();
    for by in (0..8).step_by(4) {
        for bx in (0..8).step_by(4) {
            let idx = chroma_block_index(bx, by);
            let mut res_cb = [0i32; 16];
            let mut res_cr = [0i32; 16];
            for y in 0..4 {
                for x in 0..4 {
                    let pix = (by + y) * 8 + (bx + x);
                    res_cb[y * 4 + x] = orig_cb[pix] - pred_cb[pix] as i32;
                    res_cr[y * 4 + x] = orig_cr[pix] - pred_cr[pix] as i32;
                }
            }
            let q_cb = transform_and_quantize_4x4(&res_cb, qpc, false);
            let q_cr = transform_and_quantize_4x4(&res_cr, qpc, false);
            let nc_cb = q_cb.iter().filter(|&&v| v != 0).count() as i32;
            let nc_cr = q_cr.iter().filter(|&&v| v != 0).count() as i32;
            cb_blocks[idx] = ResidualBlock { coeffs: q_cb, num_coeffs: nc_cb };
            cr_blocks[idx] = ResidualBlock { coeffs: q_cr, num_coeffs: nc_cr };
        }
    }
    let cbp_chroma = chroma_cbp_code(&cb_blocks, &cr_blocks, &ResidualBlock::default(), &ResidualBlock::default());

    InterPlan {
        pred_luma,
        pred_cb,
        pred_cr,
        luma_blocks,
        cb_blocks,
        cr_blocks,
        cbp_luma,
        cbp_chroma,
    }
}

fn reconstruct_inter(recon: &mut Picture, mb: &Macroblock, plan: &InterPlan, qp: i32) {
    let lx0 = mb.col * 16;
    let ly0 = mb.row * 16;
    let cx0 = mb.col * 8;
    let cy0 = mb.row * 8;
    let qpc = qp_chroma_from_luma(qp);

    let mut luma_out = [0i32; 256];
    for by in (0..16).step_by(4) {
        for bx in (0..16).step_by(4) {
            let idx = Macroblock::luma_block_index(bx, by);
            let residual = dequantize_and_inverse_4x4(&plan.luma_blocks[idx].coeffs, qp);
            for y in 0..4 {
                for x in 0..4 {
                    let pix = (by + y) * 16 + (bx + x);
                    luma_out[pix] = plan.pred_luma[pix] as i32 + residual[y * 4 + x];
                }
            }
        }
    }
    clip_write(recon.luma_mut(), lx0, ly0, 16, &luma_out);

    let mut cb_out = [0i32; 64];
    let mut cr_out = [0i32; 64];
    for by in (0..8).step_by(4) {
        for bx in (0..8).step_by(4) {
            let idx = chroma_block_index(bx, by);
            let res_cb = dequantize_and_inverse_4x4(&plan.cb_blocks[idx].coeffs, qpc);
            let res_cr = dequantize_and_inverse_4x4(&plan.cr_blocks[idx].coeffs, qpc);
            for y in 0..4 {
                for x in 0..4 {
                    let pix = (by + y) * 8 + (bx + x);
                    cb_out[pix] = plan.pred_cb[pix] as i32 + res_cb[y * 4 + x];
                    cr_out[pix] = plan.pred_cr[pix] as i32 + res_cr[y * 4 + x];
                }
            }
        }
    }
    clip_write(recon.cb_mut(), cx0, cy0, 8, &cb_out);
    clip_write(recon.cr_mut(), cx0, cy0, 8, &cr_out);
}

fn write_inter_mb(bv: &mut BitVec<u8, Msb0>, grid: &MacroblockGrid, mb_index: usize, mvd: MotionVector, plan: &InterPlan, qp_delta: i32) {
    bv.extend_exp_golomb(0); // P_L0_16x16
    bv.extend_signed_exp_golomb(mvd.x);
    bv.extend_signed_exp_golomb(mvd.y);

    let cbp = plan.cbp_chroma * 16 + plan.cbp_luma;
    bv.extend_exp_golomb(cbp_to_code(&CBP_INTER_CODE_TO_CBP, cbp));
    if cbp != 0 {
        bv.extend_signed_exp_golomb(qp_delta);
    }

    if plan.cbp_luma != 0 {
        let mb = &grid.mbs[mb_index];
        for (region_i, &(ox, oy)) in Macroblock::luma_8x8_offsets().iter().enumerate() {
            if plan.cbp_luma & (1 << region_i) == 0 {
                continue;
            }
            for &(dx, dy) in &[(0, 0), (4, 0), (0, 4), (4, 4)] {
                let bx = ox + dx;
                let by = oy + dy;
                let idx = Macroblock::luma_block_index(bx, by);
                let nc = luma_block_nc(grid, mb, bx, by);
                let scan = to_scan_order(&plan.luma_blocks[idx].coeffs);
                encode_block(bv, &scan, Some(nc));
            }
        }
    }
    if plan.cbp_chroma == 2 {
        let mb = &grid.mbs[mb_index];
        for is_cb in [true, false] {
            for by in (0..8).step_by(4) {
                for bx in (0..8).step_by(4) {
                    let idx = chroma_block_index(bx, by);
                    let nc = chroma_block_nc(grid, mb, is_cb, bx, by);
                    let coeffs = if is_cb {
                        &plan.cb_blocks[idx].coeffs
                    } else {
                        &plan.cr_blocks[idx].coeffs
                    };
                    let scan = to_scan_order(coeffs);
                    encode_block(bv, &scan, Some(nc));
                }
            }
        }
    }
}

pub fn code_inter_mb(
    source: &Picture,
    recon: &mut Picture,
    reference: &ReferencePicture,
    grid: &mut MacroblockGrid,
    mv_list: &mut MotionVectorList,
    mb_index: usize,
    mv: MotionVector,
    mb_enc_qp: i32,
    bv: &mut BitVec<u8, Msb0>,
) -> (u32, i64) {
    let bits_before = bv.len();
    let (col, row, prev_qp, prev_enc_qp) = {
        let mb = &grid.mbs[mb_index];
        (mb.col, mb.row, mb.mb_qp, mb.mb_enc_qp)
    };
    let predicted = mv_list.predict(col, row);
    let mvd = mv.sub(predicted);
    let (qp, qp_delta) = resolve_transmitted_qp(prev_qp, mb_enc_qp);
    let mut plan = plan_inter_mb(source, reference, &grid.mbs[mb_index], mv, qp);
    apply_extended_qp_zeroing_inter(&mut plan, mb_enc_qp);
    let cbp = plan.cbp_chroma * 16 + plan.cbp_luma;

    write_inter_mb(bv, grid, mb_index, mvd, &plan, qp_delta);
    reconstruct_inter(recon, &grid.mbs[mb_index], &plan, qp);

    mv_list.set(col, row, mv);
    let mb = &mut grid.mbs[mb_index];
    mb.intra_flag = false;
    mb.skip = false;
    mb.part_pred_mode = MbPartPredMode::Inter16x16;
    mb.mv = mv;
    mb.mvd = mvd;
    mb.mb_qp_delta = if cbp != 0 { qp_delta } else { 0 };
    mb.mb_qp = if cbp != 0 { qp } else { prev_qp };
    mb.mb_enc_qp = if cbp != 0 { mb_enc_qp } else { prev_enc_qp };
    mb.luma_blocks = plan.luma_blocks.clone();
    mb.cb_blocks = plan.cb_blocks.clone();
    mb.cr_blocks = plan.cr_blocks.clone();
    mb.luma_dc.clear();
    mb.cb_dc.clear();
    mb.cr_dc.clear();
    mb.coded_block_pattern = cbp;

    let ssd = {
        let lx0 = col * 16;
        let ly0 = row * 16;
        let cx0 = col * 8;
        let cy0 = row * 8;
        let luma_recon = read_block_i16(recon.luma(), lx0, ly0, 16);
        let cb_recon = read_block_i16(recon.cb(), cx0, cy0, 8);
        let cr_recon = read_block_i16(recon.cr(), cx0, cy0, 8);
        let orig_luma = read_block_i32(source.luma(), lx0, ly0, 16);
        let orig_cb = read_block_i32(source.cb(), cx0, cy0, 8);
        let orig_cr = read_block_i32(source.cr(), cx0, cy0, 8);
        block_ssd(&luma_recon, &orig_luma) + block_ssd(&cb_recon, &orig_cb) + block_ssd(&cr_recon, &orig_cr)
    };

    ((bv.len() - bits_before) as u32, ssd)
}

pub fn decode_inter_mb(
    recon: &mut Picture,
    reference: &ReferencePicture,
    grid: &mut MacroblockGrid,
    mv_list: &mut MotionVectorList,
    mb_index: usize,
    r: &mut BitReader,
    prev_qp: i32,
) -> Result<i32> {
    let mvd = MotionVector { x: r.read_se()?, y: r.read_se()? };
    let (col, row) = {
        let mb = &grid.mbs[mb_index];
        (mb.col, mb.row)
    };
    let predicted = mv_list.predict(col, row);
    let mv = predicted.add(mvd);

    let cbp_code = r.read_ue()?;
    let cbp = CBP_INTER_CODE_TO_CBP
        .get(cbp_code as usize)
        .copied()
        .ok_or_else(unsupported_mb_type)?;
    let cbp_luma = cbp & 0x0f;
    let cbp_chroma = cbp >> 4;
    let qp_delta = if cbp != 0 { r.read_se()? } else { 0 };
    let qp = if cbp != 0 { (prev_qp + qp_delta).clamp(0, 51) } else { prev_qp };

    let lx0 = col * 16;
    let ly0 = row * 16;
    let cx0 = col * 8;
    let cy0 = row * 8;
    let pred_luma = compensate_luma_16x16(&reference.luma, lx0, ly0, mv);
    let pred_cb = compensate_chroma_8x8(&reference.cb, cx0, cy0, mv);
    let pred_cr = compensate_chroma_8x8(&reference.cr, cx0, cy0, mv);

    let mut luma_blocks: [ResidualBlock; 16] = Default::default();
    if cbp_luma != 0 {
        for (region_i, &(ox, oy)) in Macroblock::luma_8x8_offsets().iter().enumerate() {
            if cbp_luma & (1 << region_i) == 0 {
                continue;
            }
            for &(dx, dy) in &[(0, 0), (4, 0), (0, 4), (4, 4)] {
                let bx = ox + dx;
                let by = oy + dy;
                let idx = Macroblock::luma_block_index(bx, by);
                let nc = luma_block_nc(grid, &grid.mbs[mb_index], bx, by);
                let decoded = decode_block(r, 16, Some(nc))?;
                let block = ResidualBlock {
                    coeffs: from_scan_order(&decoded.coeffs),
                    num_coeffs: decoded.total_coeff as i32,
                };
                luma_blocks[idx] = block.clone();
                grid.mbs[mb_index].luma_blocks[idx] = block;
            }
        }
    }

    let mut cb_blocks: [ResidualBlock; 4] = Default::default();
    let mut cr_blocks: [ResidualBlock; 4] = Default::default();
    if cbp_chroma == 2 {
        for is_cb in [true, false] {
            for by in (0..8).step_by(4) {
                for bx in (0..8).step_by(4) {
                    let idx = chroma_block_index(bx, by);
                    let nc = chroma_block_nc(grid, &grid.mbs[mb_index], is_cb, bx, by);
                    let decoded = decode_block(r, 16, Some(nc))?;
                    let block = ResidualBlock {
                        coeffs: from_scan_order(&decoded.coeffs),
                        num_coeffs: decoded.total_coeff as i32,
                    };
                    if is_cb {
                        cb_blocks[idx] = block.clone();
                        grid.mbs[mb_index].cb_blocks[idx] = block;
                    } else {
                        cr_blocks[idx] = block.clone();
                        grid.mbs[mb_index].cr_blocks[idx] = block;
                    }
                }
            }
        }
    }

    let plan = InterPlan {
        pred_luma,
        pred_cb,
        pred_cr,
        luma_blocks,
        cb_blocks,
        cr_blocks,
        cbp_luma,
        cbp_chroma,
    };
    reconstruct_inter(recon, &grid.mbs[mb_index], &plan, qp);

    mv_list.set(col, row, mv);
    let mb = &mut grid.mbs[mb_index];
    mb.intra_flag = false;
    mb.skip = false;
    mb.part_pred_mode = MbPartPredMode::Inter16x16;
    mb.mv = mv;
    mb.mvd = mvd;
    mb.mb_qp_delta = if cbp != 0 { qp_delta } else { 0 };
    mb.mb_qp = qp;
    mb.mb_enc_qp = qp;
    mb.coded_block_pattern = cbp;
    mb.luma_dc.clear();
    mb.cb_dc.clear();
    mb.cr_dc.clear();

    Ok(qp)
}

pub fn code_skip_mb(
    source: &Picture,
    recon: &mut Picture,
    reference: &ReferencePicture,
    grid: &mut MacroblockGrid,
    mv_list: &mut MotionVectorList,
    mb_index: usize,
) -> i64 {
    let (col, row) = {
        let mb = &grid.mbs[mb_index];
        (mb.col, mb.row)
    };
    let mv = mv_list.predict(col, row);
    apply_skip(recon, reference, grid, mb_index, mv);
    mv_list.set(col, row, mv);

    let lx0 = col * 16;
    let ly0 = row * 16;
    let cx0 = col * 8;
    let cy0 = row * 8;
    let luma_recon = read_block_i16(recon.luma(), lx0, ly0, 16);
    let cb_recon = read_block_i16(recon.cb(), cx0, cy0, 8);
    let cr_recon = read_block_i16(recon.cr(), cx0, cy0, 8);
    let orig_luma = read_block_i32(source.luma(), lx0, ly0, 16);
    let orig_cb = read_block_i32(source.cb(), cx0, cy0, 8);
    let orig_cr = read_block_i32(source.cr(), cx0, cy0, 8);
    block_ssd(&luma_recon, &orig_luma) + block_ssd(&cb_recon, &orig_cb) + block_ssd(&cr_recon, &orig_cr)
}

pub fn decode_skip_mb(
    recon: &mut Picture,
    reference: &ReferencePicture,
    grid: &mut MacroblockGrid,
    mv_list: &mut MotionVectorList,
    mb_index: usize,
) {
    let (col, row) = {
        let mb = &grid.mbs[mb_index];
        (mb.col, mb.row)
    };
    let mv = mv_list.predict(col, row);
    apply_skip(recon, reference, grid, mb_index, mv);
    mv_list.set(col, row, mv);
}

fn apply_skip(recon: &mut Picture, reference: &ReferencePicture, grid: &mut MacroblockGrid, mb_index: usize, mv: MotionVector) {
    let (col, row) = {
        let mb = &grid.mbs[mb_index];
        (mb.col, mb.row)
    };
    let lx0 = col * 16;
    let ly0 = row * 16;
    let cx0 = col * 8;
    let cy0 = row * 8;
    let pred_luma = compensate_luma_16x16(&reference.luma, lx0, ly0, mv);
    let pred_cb = compensate_chroma_8x8(&reference.cb, cx0, cy0, mv);
    let pred_cr = compensate_chroma_8x8(&reference.cr, cx0, cy0, mv);
    for y in 0..16 {
        for x in 0..16 {
            recon.luma_mut().write(lx0 + x, ly0 + y, pred_luma[y * 16 + x]);
        }
    }
    for y in 0..8 {
        for x in 0..8 {
            recon.cb_mut().write(cx0 + x, cy0 + y, pred_cb[y * 8 + x]);
            recon.cr_mut().write(cx0 + x, cy0 + y, pred_cr[y * 8 + x]);
        }
    }

    let mb = &mut grid.mbs[mb_index];
    mb.intra_flag = false;
    mb.skip = true;
    mb.part_pred_mode = MbPartPredMode::Inter16x16;
    mb.mv = mv;
    mb.mvd = MotionVector::ZERO;
    mb.mb_qp_delta = 0;
    mb.mb_enc_qp = mb.mb_qp;
    mb.coded_block_pattern = 0;
    mb.clear_residuals();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::Picture;
    use crate::macroblock::MacroblockGrid;

    fn flat_picture(w: usize, h: usize, v: i16) -> Picture {
        let mut pic = Picture::new(w, h).unwrap();
        for y in 0..h {
            for x in 0..w {
                pic.luma_mut().write(x, y, v);
            }
        }
        for y in 0..h / 2 {
            for x in 0..w / 2 {
                pic.cb_mut().write(x, y, 128);
                pic.cr_mut().write(x, y, 128);
            }
        }
        pic
    }

    #[test]
    fn intra_dc_mb_on_flat_source_reconstructs_near_exactly() {
        let source = flat_picture(16, 16, 120);
        let mut recon = flat_picture(16, 16, 0);
        let mut grid = MacroblockGrid::new(1, 1);
        let mut bv: BitVec<u8, Msb0> = BitVec::new();
        let (bits, ssd) = code_intra_mb(&source, &mut recon, &mut grid, 0, 20, &mut bv, true);
        assert!(bits > 0);
        assert!(ssd < 50);
        assert!(grid.mbs[0].intra_flag);
    }

    #[test]
    fn intra_mb_type_code_roundtrips() {
        for mode in [
            Intra16x16Mode::Vertical,
            Intra16x16Mode::Horizontal,
            Intra16x16Mode::Dc,
            Intra16x16Mode::Plane,
        ] {
            for cbp_luma in [false, true] {
                for cbp_chroma in 0..3u8 {
                    for slice_is_i in [true, false] {
                        let code = intra16x16_mb_type_code(mode, cbp_luma, cbp_chroma, slice_is_i);
                        let (m2, l2, c2) = decode_intra16x16_mb_type(code, slice_is_i).unwrap();
                        assert_eq!(m2, mode);
                        assert_eq!(l2, cbp_luma);
                        assert_eq!(c2, cbp_chroma);
                    }
                }
            }
        }
    }

    #[test]
    fn skip_mb_copies_reference_with_predicted_mv() {
        let source = flat_picture(16, 16, 77);
        let reference_pic = flat_picture(16, 16, 77);
        let reference = ReferencePicture::from_picture(&reference_pic);
        let mut recon = flat_picture(16, 16, 0);
        let mut grid = MacroblockGrid::new(1, 1);
        let mut mv_list = MotionVectorList::new(1, 1);
        let ssd = code_skip_mb(&source, &mut recon, &reference, &mut grid, &mut mv_list, 0);
        assert_eq!(ssd, 0);
        assert!(grid.mbs[0].skip);
    }

    #[test]
    fn extended_qp_zeroing_ladder_matches_spec_breakpoints() {
        assert_eq!(extended_qp_zeroing(51).ac_zero_count, 0);
        let at_52 = extended_qp_zeroing(52);
        assert_eq!(at_52.ac_zero_count, 1);
        assert_eq!(at_52.chroma_dc_ac_zero_count, 0);
        let at_66 = extended_qp_zeroing(66);
        assert_eq!(at_66.ac_zero_count, 15);
        assert_eq!(at_66.chroma_dc_ac_zero_count, 0);
        let at_67 = extended_qp_zeroing(67);
        assert_eq!(at_67.chroma_dc_ac_zero_count, 1);
        let at_69 = extended_qp_zeroing(69);
        assert_eq!(at_69.chroma_dc_ac_zero_count, 3);
        assert_eq!(at_69.luma_dc_ac_zero_count, 0);
        let at_70 = extended_qp_zeroing(70);
        assert_eq!(at_70.luma_dc_ac_zero_count, 1);
        let at_84 = extended_qp_zeroing(84);
        assert_eq!(at_84.luma_dc_ac_zero_count, 15);
        assert!(!at_84.zero_chroma_dc_term);
        let at_85 = extended_qp_zeroing(85);
        assert!(at_85.zero_chroma_dc_term);
        assert!(!at_85.zero_luma_dc_term);
        let at_86 = extended_qp_zeroing(86);
        assert!(at_86.zero_luma_dc_term);
    }

    #[test]
    fn resolve_transmitted_qp_keeps_delta_legal_and_qp_in_range() {
        for prev_qp in [0, 10, 26, 51] {
            for mb_enc_qp in [0, 30, 51, 60, 75, 86] {
                let (qp, delta) = resolve_transmitted_qp(prev_qp, mb_enc_qp);
                assert!((0..=51).contains(&qp));
                assert!((-26..=25).contains(&delta));
                assert_eq!((prev_qp + delta).clamp(0, 51), qp);
            }
        }
    }

    #[test]
    fn zero_highest_ac_scan_positions_zeroes_reverse_zigzag_and_recomputes_count() {
        let mut block = ResidualBlock { coeffs: [0; 16], num_coeffs: 0 };
        for k in 0..16 {
            block.coeffs[ZIGZAG_4X4[k]] = (k + 1) as i32;
        }
        block.num_coeffs = 16;
        zero_highest_ac_scan_positions(&mut block, 3, true);
        for k in 13..16 {
            assert_eq!(block.coeffs[ZIGZAG_4X4[k]], 0);
        }
        for k in 0..13 {
            assert_eq!(block.coeffs[ZIGZAG_4X4[k]], (k + 1) as i32);
        }
        assert_eq!(block.num_coeffs, 13);
    }

    #[test]
    fn zero_trailing_chroma_dc_zeroes_highest_indices_first() {
        let mut block = ResidualBlock {
            coeffs: [1, 2, 3, 4, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
            num_coeffs: 4,
        };
        zero_trailing_chroma_dc(&mut block, 2);
        assert_eq!(&block.coeffs[..4], &[1, 2, 0, 0]);
        assert_eq!(block.num_coeffs, 2);
    }

    #[test]
    fn apply_extended_qp_zeroing_intra_recomputes_cbp() {
        let mut ac_block = ResidualBlock { coeffs: [0; 16], num_coeffs: 1 };
        ac_block.coeffs[1] = 5;
        let mut plan = IntraPlan {
            luma_mode: Intra16x16Mode::Dc,
            chroma_mode: IntraChromaMode::Dc,
            pred_luma: [0; 256],
            pred_cb: [0; 64],
            pred_cr: [0; 64],
            luma_dc: ResidualBlock { coeffs: [1; 16], num_coeffs: 16 },
            luma_blocks: std::array::from_fn(|_| ac_block.clone()),
            cb_dc: ResidualBlock::default(),
            cr_dc: ResidualBlock::default(),
            cb_blocks: Default::default(),
            cr_blocks: Default::default(),
            cbp_luma_is_15: true,
            cbp_chroma: 0,
        };
        // ac_zero_count at qp 66 is 15: every AC scan position gets zeroed.
        apply_extended_qp_zeroing_intra(&mut plan, 66);
        assert!(plan.luma_blocks.iter().all(|b| b.num_coeffs == 0));
        assert!(!plan.cbp_luma_is_15);
    }

    #[test]
    fn extended_qp_mb_transmits_legal_qp_delta() {
        let source = flat_picture(16, 16, 90);
        let mut recon = flat_picture(16, 16, 40);
        let mut grid = MacroblockGrid::new(1, 1);
        let mut bv: BitVec<u8, Msb0> = BitVec::new();
        let (bits, _ssd) = code_intra_mb(&source, &mut recon, &mut grid, 0, 86, &mut bv, true);
        assert!(bits > 0);
        let mb = &grid.mbs[0];
        assert_eq!(mb.mb_enc_qp, 86);
        assert!((0..=51).contains(&mb.mb_qp));
        assert!((-26..=25).contains(&mb.mb_qp_delta));
    }

    #[test]
    fn inter_mb_with_zero_mv_on_identical_reference_has_small_residual() {
        let source = flat_picture(16, 16, 90);
        let reference_pic = flat_picture(16, 16, 90);
        let reference = ReferencePicture::from_picture(&reference_pic);
        let mut recon = flat_picture(16, 16, 0);
        let mut grid = MacroblockGrid::new(1, 1);
        let mut mv_list = MotionVectorList::new(1, 1);
        let mut bv: BitVec<u8, Msb0> = BitVec::new();
        let (_bits, ssd) = code_inter_mb(&source, &mut recon, &reference, &mut grid, &mut mv_list, 0, MotionVector::ZERO, 26, &mut bv);
        assert!(ssd < 50);
        assert!(!grid.mbs[0].intra_flag);
    }
}
