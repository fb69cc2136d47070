// Copyright 2022-2023 Andrew D. Straw.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Intra_16x16 luma and Intra_Chroma prediction, plus the zooming-grid mode
//! selection that chooses among the available modes by partial-sum SSD.

use alloc::vec;
use alloc::vec::Vec;

use crate::macroblock::{Intra16x16Mode, IntraChromaMode};
use crate::tables::{CHROMA_ZOOM_GRID, CHROMA_ZOOM_THRESHOLD, LUMA_ZOOM_GRID, LUMA_ZOOM_THRESHOLD};

/// Reference samples available for predicting one NxN intra block: the row
/// directly above (length `2*n`, covering above-right too, with the tail
/// replicated when above-right is unavailable), the column directly to the
/// left (length `n`), and the above-left corner sample.
#[derive(Clone, Debug)]
pub struct IntraNeighbors {
    pub above: Option<Vec<i32>>,
    pub left: Option<Vec<i32>>,
    pub above_left: Option<i32>,
}

impl IntraNeighbors {
    pub fn none() -> Self {
        Self {
            above: None,
            left: None,
            above_left: None,
        }
    }

    fn has_above(&self) -> bool {
        self.above.is_some()
    }
    fn has_left(&self) -> bool {
        self.left.is_some()
    }
}

/// Which luma/chroma modes are legal given the available neighbours.
pub fn available_intra16x16_modes(n: &IntraNeighbors) -> Vec<Intra16x16Mode> {
    match (n.has_above(), n.has_left(), n.above_left.is_some()) {
        (true, true, true) => vec![
            Intra16x16Mode::Vertical,
            Intra16x16Mode::Horizontal,
            Intra16x16Mode::Dc,
            Intra16x16Mode::Plane,
        ],
        (true, true, false) => vec![
            Intra16x16Mode::Vertical,
            Intra16x16Mode::Horizontal,
            Intra16x16Mode::Dc,
        ],
        (false, true, _) => vec![Intra16x16Mode::Horizontal, Intra16x16Mode::Dc],
        (true, false, _) => vec![Intra16x16Mode::Vertical, Intra16x16Mode::Dc],
        (false, false, _) => vec![Intra16x16Mode::Dc],
    }
}

/// Which chroma modes are legal given the available neighbours.
pub fn available_chroma_modes(n: &IntraNeighbors) -> Vec<IntraChromaMode> {
    match (n.has_above(), n.has_left(), n.above_left.is_some()) {
        (true, true, true) => vec![
            IntraChromaMode::Dc,
            IntraChromaMode::Horizontal,
            IntraChromaMode::Vertical,
            IntraChromaMode::Plane,
        ],
        (true, true, false) => vec![
            IntraChromaMode::Dc,
            IntraChromaMode::Horizontal,
            IntraChromaMode::Vertical,
        ],
        (false, true, _) => vec![IntraChromaMode::Dc, IntraChromaMode::Horizontal],
        (true, false, _) => vec![IntraChromaMode::Dc, IntraChromaMode::Vertical],
        (false, false, _) => vec![IntraChromaMode::Dc],
    }
}

fn plane_coeffs(n: &IntraNeighbors, size: usize) -> (i32, i32, i32) {
    let above = n.above.as_ref().unwrap();
    let left = n.left.as_ref().unwrap();
    let al = n.above_left.unwrap_or(128);
    let half = size / 2;
    let mut h = 0i32;
    let mut v = 0i32;
    for xp in 0..half {
        let right = above[half + xp];
        let mirrored = if half as i32 - 2 - xp as i32 >= 0 {
            above[half - 2 - xp]
        } else {
            al
        };
        h += (xp as i32 + 1) * (right - mirrored);
    }
    for yp in 0..half {
        let below = left[half + yp];
        let mirrored = if half as i32 - 2 - yp as i32 >= 0 {
            left[half - 2 - yp]
        } else {
            al
        };
        v += (yp as i32 + 1) * (below - mirrored);
    }
    let a = 16 * (left[size - 1] + above[size - 1]);
    (a, h, v)
}

/// Predict one NxN (16 or 8) block given a mode and its neighbours, writing
/// `size*size` samples row-major into `out`.
pub fn predict_block(
    mode_is_plane: bool,
    mode_is_vertical: bool,
    mode_is_horizontal: bool,
    n: &IntraNeighbors,
    size: usize,
    out: &mut [i32],
) {
    if mode_is_plane {
        let (a, h, v) = plane_coeffs(n, size);
        let (b, c, shift) = if size == 16 {
            ((5 * h + 32) >> 6, (5 * v + 32) >> 6, 5)
        } else {
            ((17 * h + 16) >> 5, (17 * v + 16) >> 5, 5)
        };
        let half = (size / 2) as i32 - 1;
        for y in 0..size {
            for x in 0..size {
                let val = (a + b * (x as i32 - half) + c * (y as i32 - half) + 16) >> shift;
                out[y * size + x] = val.clamp(0, 255);
            }
        }
    } else if mode_is_vertical {
        let above = n.above.as_ref().unwrap();
        for y in 0..size {
            for x in 0..size {
                out[y * size + x] = above[x];
            }
        }
    } else if mode_is_horizontal {
        let left = n.left.as_ref().unwrap();
        for y in 0..size {
            for x in 0..size {
                out[y * size + x] = left[y];
            }
        }
    } else {
        // DC
        let dc = match (n.has_above(), n.has_left()) {
            (true, true) => {
                let above = n.above.as_ref().unwrap();
                let left = n.left.as_ref().unwrap();
                let sum: i32 = above[..size].iter().sum::<i32>() + left.iter().sum::<i32>();
                (sum + size as i32) / (2 * size as i32)
            }
            (true, false) => {
                let above = n.above.as_ref().unwrap();
                let sum: i32 = above[..size].iter().sum();
                (sum + size as i32 / 2) / size as i32
            }
            (false, true) => {
                let left = n.left.as_ref().unwrap();
                let sum: i32 = left.iter().sum();
                (sum + size as i32 / 2) / size as i32
            }
            (false, false) => 128,
        };
        out[..size * size].fill(dc);
    }
}

pub fn predict_intra16x16(mode: Intra16x16Mode, n: &IntraNeighbors, out: &mut [i32; 256]) {
    predict_block(
        mode == Intra16x16Mode::Plane,
        mode == Intra16x16Mode::Vertical,
        mode == Intra16x16Mode::Horizontal,
        n,
        16,
        out,
    );
}

pub fn predict_intra_chroma(mode: IntraChromaMode, n: &IntraNeighbors, out: &mut [i32; 64]) {
    predict_block(
        mode == IntraChromaMode::Plane,
        mode == IntraChromaMode::Vertical,
        mode == IntraChromaMode::Horizontal,
        n,
        8,
        out,
    );
}

/// Select the best Intra_16x16 mode by accumulating SSD over a zoom grid of
/// sample points, terminating early once the DC candidate already falls
/// under the early-exit threshold.
pub fn select_intra16x16_mode(
    input: &[i32; 256],
    n: &IntraNeighbors,
) -> (Intra16x16Mode, [i32; 256]) {
    select_mode_zoom(
        input,
        n,
        16,
        available_intra16x16_modes(n),
        LUMA_ZOOM_GRID,
        LUMA_ZOOM_THRESHOLD,
        predict_intra16x16_into,
        |m| *m == Intra16x16Mode::Dc,
    )
}

pub fn select_intra_chroma_mode(
    input: &[i32; 64],
    n: &IntraNeighbors,
) -> (IntraChromaMode, [i32; 64]) {
    select_mode_zoom(
        input,
        n,
        8,
        available_chroma_modes(n),
        CHROMA_ZOOM_GRID,
        CHROMA_ZOOM_THRESHOLD,
        predict_chroma_into,
        |m| *m == IntraChromaMode::Dc,
    )
}

fn predict_intra16x16_into(mode: Intra16x16Mode, n: &IntraNeighbors, out: &mut [i32]) {
    let mut buf = [0i32; 256];
    predict_intra16x16(mode, n, &mut buf);
    out.copy_from_slice(&buf);
}

fn predict_chroma_into(mode: IntraChromaMode, n: &IntraNeighbors, out: &mut [i32]) {
    let mut buf = [0i32; 64];
    predict_intra_chroma(mode, n, &mut buf);
    out.copy_from_slice(&buf);
}

#[allow(clippy::too_many_arguments)]
fn select_mode_zoom<M: Copy, const SZ: usize>(
    input: &[i32; SZ],
    n: &IntraNeighbors,
    size: usize,
    modes: Vec<M>,
    grid: &[(u8, u8)],
    dc_threshold: i32,
    predict_into: fn(M, &IntraNeighbors, &mut [i32]),
    is_dc: fn(&M) -> bool,
) -> (M, [i32; SZ])
where
    M: PartialEq,
{
    let dc_pos = modes.iter().position(is_dc).expect("DC always available");

    let mut predictions: Vec<[i32; SZ]> = vec![[0i32; SZ]; modes.len()];
    for (mi, &mode) in modes.iter().enumerate() {
        predict_into(mode, n, &mut predictions[mi]);
    }

    let mut running: Vec<i32> = vec![0; modes.len()];
    let mut points_considered = 0usize;
    let mut best_index = dc_pos;
    for &(px, py) in grid {
        let (px, py) = (px as usize, py as usize);
        if px >= size || py >= size {
            continue;
        }
        points_considered += 1;
        let idx = py * size + px;
        for (mi, pred) in predictions.iter().enumerate() {
            let d = input[idx] - pred[idx];
            running[mi] += d * d;
        }
        if points_considered >= 4 {
            if running[dc_pos] < dc_threshold {
                best_index = dc_pos;
                break;
            }
            best_index = running
                .iter()
                .enumerate()
                .min_by_key(|&(_, &v)| v)
                .map(|(mi, _)| mi)
                .unwrap();
        }
    }
    let best_mode = modes[best_index];
    let mut out = [0i32; SZ];
    out.copy_from_slice(&predictions[best_index]);
    (best_mode, out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dc_with_no_neighbours_is_128() {
        let n = IntraNeighbors::none();
        let mut out = [0i32; 256];
        predict_intra16x16(Intra16x16Mode::Dc, &n, &mut out);
        assert!(out.iter().all(|&v| v == 128));
    }

    #[test]
    fn vertical_copies_above_row() {
        let mut above = vec![0i32; 16];
        for (i, v) in above.iter_mut().enumerate() {
            *v = i as i32 * 3;
        }
        let n = IntraNeighbors {
            above: Some(above.clone()),
            left: Some(vec![0; 16]),
            above_left: Some(0),
        };
        let mut out = [0i32; 256];
        predict_intra16x16(Intra16x16Mode::Vertical, &n, &mut out);
        for y in 0..16 {
            for x in 0..16 {
                assert_eq!(out[y * 16 + x], above[x]);
            }
        }
    }

    #[test]
    fn select_mode_picks_dc_for_uniform_input_with_no_neighbours() {
        let input = [128i32; 256];
        let n = IntraNeighbors::none();
        let (mode, pred) = select_intra16x16_mode(&input, &n);
        assert_eq!(mode, Intra16x16Mode::Dc);
        assert_eq!(pred, input);
    }

    #[test]
    fn chroma_dc_no_neighbours_is_128() {
        let input = [5i32; 64];
        let n = IntraNeighbors::none();
        let (mode, _) = select_intra_chroma_mode(&input, &n);
        assert_eq!(mode, IntraChromaMode::Dc);
    }
}
