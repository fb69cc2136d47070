// Copyright 2022-2023 Andrew D. Straw.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The in-loop deblocking filter: boundary strength derivation and the
//! normal (non-bS-4) luma/chroma edge filters, applied vertical edges
//! first then horizontal, per macroblock in raster order.

use crate::macroblock::{Macroblock, MacroblockGrid};
use crate::plane::Plane;
use crate::tables::{ALPHA_TABLE, BETA_TABLE, TC0_TABLE};

/// Boundary strength for one 4-pixel edge segment between two macroblocks
/// or between two 4x4 blocks within the same macroblock.
fn boundary_strength(
    p_mb: &Macroblock,
    q_mb: &Macroblock,
    is_mb_edge: bool,
    p_has_nonzero_coeffs: bool,
    q_has_nonzero_coeffs: bool,
) -> u8 {
    if p_mb.intra_flag || q_mb.intra_flag {
        return if is_mb_edge { 4 } else { 3 };
    }
    if p_has_nonzero_coeffs || q_has_nonzero_coeffs {
        return 2;
    }
    let mv_diff = p_mb.mv.sub(q_mb.mv);
    if mv_diff.x.abs() >= 4 || mv_diff.y.abs() >= 4 {
        return 1;
    }
    0
}

fn filter_luma_edge(plane: &mut Plane, is_vertical: bool, edge_pos: i32, line_start: i32, qp_av: i32, bs: u8) {
    if bs == 0 {
        return;
    }
    let idx = qp_av.clamp(0, 51) as usize;
    let alpha = ALPHA_TABLE[idx];
    let beta = BETA_TABLE[idx];
    if alpha == 0 {
        return;
    }

    for k in 0..4i32 {
        let line = line_start + k;
        macro_rules! sample {
            ($off:expr) => {
                if is_vertical {
                    plane.read(edge_pos + $off, line) as i32
                } else {
                    plane.read(line, edge_pos + $off) as i32
                }
            };
        }
        let p0 = sample!(-1);
        let p1 = sample!(-2);
        let p2 = sample!(-3);
        let q0 = sample!(0);
        let q1 = sample!(1);
        let q2 = sample!(2);

        if (p0 - q0).abs() >= alpha || (p1 - p0).abs() >= beta || (q1 - q0).abs() >= beta {
            continue;
        }

        macro_rules! write {
            ($off:expr, $v:expr) => {{
                let v = ($v).clamp(0, 255) as i16;
                if is_vertical {
                    plane.write((edge_pos + $off) as usize, line as usize, v);
                } else {
                    plane.write(line as usize, (edge_pos + $off) as usize, v);
                }
            }};
        }

        if bs < 4 {
            let tc0 = TC0_TABLE[(bs - 1) as usize][idx];
            let ap = (p2 - p0).abs() < beta;
            let aq = (q2 - q0).abs() < beta;
            let tc = tc0 + ap as i32 + aq as i32;
            let delta = ((4 * (q0 - p0) + (p1 - q1) + 4) >> 3).clamp(-tc, tc);
            write!(-1, p0 + delta);
            write!(0, q0 - delta);
            if ap {
                let delta_p1 = ((p2 + ((p0 + q0 + 1) >> 1) - 2 * p1) >> 1).clamp(-tc0, tc0);
                write!(-2, p1 + delta_p1);
            }
            if aq {
                let delta_q1 = ((q2 + ((p0 + q0 + 1) >> 1) - 2 * q1) >> 1).clamp(-tc0, tc0);
                write!(1, q1 + delta_q1);
            }
        } else {
            let strong_p = (p2 - p0).abs() < beta && (p0 - q0).abs() < (alpha >> 2) + 2;
            let strong_q = (q2 - q0).abs() < beta && (p0 - q0).abs() < (alpha >> 2) + 2;
            if strong_p {
                write!(-1, (p2 + 2 * p1 + 2 * p0 + 2 * q0 + q1 + 4) >> 3);
                write!(-2, (p2 + p1 + p0 + q0 + 2) >> 2);
                write!(-3, (2 * sample!(-4) + 3 * p2 + p1 + p0 + q0 + 4) >> 3);
            } else {
                write!(-1, (2 * p1 + p0 + q1 + 2) >> 2);
            }
            if strong_q {
                write!(0, (q2 + 2 * q1 + 2 * q0 + 2 * p0 + p1 + 4) >> 3);
                write!(1, (q2 + q1 + q0 + p0 + 2) >> 2);
                write!(2, (2 * sample!(3) + 3 * q2 + q1 + q0 + p0 + 4) >> 3);
            } else {
                write!(0, (2 * q1 + q0 + p1 + 2) >> 2);
            }
        }
    }
}

fn filter_chroma_edge(plane: &mut Plane, is_vertical: bool, edge_pos: i32, line_start: i32, len: i32, qp_av: i32, bs: u8) {
    if bs == 0 || bs == 4 {
        // bS == 4 chroma handling uses the simple two-tap rule below; 0 means no filtering.
        if bs == 0 {
            return;
        }
    }
    let idx = qp_av.clamp(0, 51) as usize;
    let alpha = ALPHA_TABLE[idx];
    let beta = BETA_TABLE[idx];
    if alpha == 0 {
        return;
    }
    for k in 0..len {
        let line = line_start + k;
        let sample = |off: i32| -> i32 {
            if is_vertical {
                plane.read(edge_pos + off, line) as i32
            } else {
                plane.read(line, edge_pos + off) as i32
            }
        };
        let p0 = sample(-1);
        let p1 = sample(-2);
        let q0 = sample(0);
        let q1 = sample(1);
        if (p0 - q0).abs() >= alpha || (p1 - p0).abs() >= beta || (q1 - q0).abs() >= beta {
            continue;
        }
        let mut write = |off: i32, v: i32| {
            let v = v.clamp(0, 255) as i16;
            if is_vertical {
                plane.write((edge_pos + off) as usize, line as usize, v);
            } else {
                plane.write(line as usize, (edge_pos + off) as usize, v);
            }
        };
        if bs == 4 {
            write(-1, (2 * p1 + p0 + q1 + 2) >> 2);
            write(0, (2 * q1 + q0 + p1 + 2) >> 2);
        } else {
            let tc0 = TC0_TABLE[(bs - 1) as usize][idx];
            let tc = tc0 + 1;
            let delta = ((4 * (q0 - p0) + (p1 - q1) + 4) >> 3).clamp(-tc, tc);
            write(-1, p0 + delta);
            write(0, q0 - delta);
        }
    }
}

/// Apply the deblocking filter to a whole picture's reconstructed planes,
/// vertical edges before horizontal edges, macroblock by macroblock in
/// raster order, per the standard's ordering rule.
pub fn deblock_picture(
    grid: &MacroblockGrid,
    luma: &mut Plane,
    cb: &mut Plane,
    cr: &mut Plane,
    nonzero_luma: &[bool],
    disabled: bool,
) {
    if disabled {
        return;
    }
    for mb in &grid.mbs {
        let x0 = (mb.col * 16) as i32;
        let y0 = (mb.row * 16) as i32;
        let qp = mb.mb_qp;

        // Vertical edges (filtering columns), left-to-right within the MB:
        // the MB's left edge (against the left neighbour) plus the three
        // internal 4-pixel boundaries.
        for edge in 0..4 {
            let edge_x = x0 + edge * 4;
            if edge == 0 {
                if let Some(left_idx) = mb.left {
                    let left = &grid.mbs[left_idx];
                    let bs = boundary_strength(
                        left,
                        mb,
                        true,
                        nonzero_luma[left.index],
                        nonzero_luma[mb.index],
                    );
                    let qp_av = (left.mb_qp + qp + 1) >> 1;
                    filter_luma_edge(luma, true, edge_x, y0, qp_av, bs);
                }
            } else {
                let bs = boundary_strength(mb, mb, false, nonzero_luma[mb.index], nonzero_luma[mb.index]);
                filter_luma_edge(luma, true, edge_x, y0, qp, bs);
            }
        }

        // Horizontal edges (filtering rows), top-to-bottom.
        for edge in 0..4 {
            let edge_y = y0 + edge * 4;
            if edge == 0 {
                if let Some(above_idx) = mb.above {
                    let above = &grid.mbs[above_idx];
                    let bs = boundary_strength(
                        above,
                        mb,
                        true,
                        nonzero_luma[above.index],
                        nonzero_luma[mb.index],
                    );
                    let qp_av = (above.mb_qp + qp + 1) >> 1;
                    filter_luma_edge(luma, false, edge_y, x0, qp_av, bs);
                }
            } else {
                let bs = boundary_strength(mb, mb, false, nonzero_luma[mb.index], nonzero_luma[mb.index]);
                filter_luma_edge(luma, false, edge_y, x0, qp, bs);
            }
        }

        // Chroma: one internal edge per component at the 4-pixel midline,
        // plus the MB-edge boundary, using the chroma QP average.
        let cx0 = (mb.col * 8) as i32;
        let cy0 = (mb.row * 8) as i32;
        let qpc = crate::tables::qp_chroma_from_luma(qp);
        for plane in [&mut *cb, &mut *cr] {
            if let Some(left_idx) = mb.left {
                let left = &grid.mbs[left_idx];
                let bs = boundary_strength(left, mb, true, nonzero_luma[left.index], nonzero_luma[mb.index]);
                filter_chroma_edge(plane, true, cx0, cy0, 8, qpc, bs);
            }
            let bs_internal = boundary_strength(mb, mb, false, nonzero_luma[mb.index], nonzero_luma[mb.index]);
            filter_chroma_edge(plane, true, cx0 + 4, cy0, 8, qpc, bs_internal);
            if let Some(above_idx) = mb.above {
                let above = &grid.mbs[above_idx];
                let bs = boundary_strength(above, mb, true, nonzero_luma[above.index], nonzero_luma[mb.index]);
                filter_chroma_edge(plane, false, cy0, cx0, 8, qpc, bs);
            }
            filter_chroma_edge(plane, false, cy0 + 4, cx0, 8, qpc, bs_internal);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macroblock::MacroblockGrid;

    #[test]
    fn disabled_filter_leaves_plane_untouched() {
        let grid = MacroblockGrid::new(2, 2);
        let mut luma = Plane::new(32, 32);
        for i in 0..32 * 32 {
            luma.write(i % 32, i / 32, (i % 251) as i16);
        }
        let before = luma.data().to_vec();
        let mut cb = Plane::new(16, 16);
        let mut cr = Plane::new(16, 16);
        let nz = vec![false; grid.len()];
        deblock_picture(&grid, &mut luma, &mut cb, &mut cr, &nz, true);
        assert_eq!(luma.data(), before.as_slice());
    }

    #[test]
    fn flat_block_is_not_modified_by_filter() {
        let grid = MacroblockGrid::new(2, 2);
        let mut luma = Plane::new(32, 32);
        for i in 0..32 * 32 {
            luma.write(i % 32, i / 32, 100);
        }
        let mut cb = Plane::new(16, 16);
        let mut cr = Plane::new(16, 16);
        let nz = vec![false; grid.len()];
        deblock_picture(&grid, &mut luma, &mut cb, &mut cr, &nz, false);
        assert!(luma.data().iter().all(|&v| v == 100));
    }
}
