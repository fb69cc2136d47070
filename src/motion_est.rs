// Copyright 2022-2023 Andrew D. Straw.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Multi-resolution full-pel motion search followed by half/quarter-pel
//! refinement, biased toward the predicted motion vector.

use crate::motion_comp::{compensate_luma_16x16, MOTION_COMP_BOUNDARY};
use crate::mv::MotionVector;
use crate::plane::{ExtendedPlane, Plane};

/// Full-pel search range, in pixels, scaled by picture size: pictures at or
/// below CIF resolution use the smaller range.
pub fn search_range(width: usize, height: usize) -> i32 {
    if width * height <= 352 * 288 {
        32
    } else {
        64
    }
}

/// Result of estimating motion for one macroblock.
#[derive(Clone, Copy, Debug)]
pub struct MotionEstimate {
    pub mv: MotionVector,
    pub sad: i32,
}

/// Downsample a plane by 2x in each dimension by 2x2 averaging, used to
/// build the coarser search levels.
fn downsample(src: &Plane) -> Plane {
    let w = src.width() / 2;
    let h = src.height() / 2;
    let mut out = Plane::new(w.max(1), h.max(1));
    for y in 0..h {
        for x in 0..w {
            let a = src.read((2 * x) as i32, (2 * y) as i32) as i32;
            let b = src.read((2 * x + 1) as i32, (2 * y) as i32) as i32;
            let c = src.read((2 * x) as i32, (2 * y + 1) as i32) as i32;
            let d = src.read((2 * x + 1) as i32, (2 * y + 1) as i32) as i32;
            out.write(x, y, (((a + b + c + d + 2) / 4) as i16).clamp(0, 255));
        }
    }
    out
}

/// A three-level resolution pyramid (L0 full res, L1 half res, L2 quarter
/// res) of a reference picture's luma plane, built once per picture and
/// reused across every macroblock's search.
pub struct SearchPyramid {
    l0: ExtendedPlane,
    l1: ExtendedPlane,
    l2: ExtendedPlane,
}

impl SearchPyramid {
    pub fn new(luma: &Plane) -> Self {
        let l1_plane = downsample(luma);
        let l2_plane = downsample(&l1_plane);

        let mut l0 = ExtendedPlane::new(luma.width(), luma.height(), MOTION_COMP_BOUNDARY);
        l0.fill_from(luma);
        let mut l1 = ExtendedPlane::new(l1_plane.width(), l1_plane.height(), MOTION_COMP_BOUNDARY);
        l1.fill_from(&l1_plane);
        let mut l2 = ExtendedPlane::new(l2_plane.width(), l2_plane.height(), MOTION_COMP_BOUNDARY);
        l2.fill_from(&l2_plane);

        Self { l0, l1, l2 }
    }

    pub fn full_res(&self) -> &ExtendedPlane {
        &self.l0
    }
}

fn cross_search(
    reference: &ExtendedPlane,
    current: &[i16],
    block_x: usize,
    block_y: usize,
    block_size: usize,
    center: (i32, i32),
    range: i32,
) -> (i32, i32, i32) {
    let sad_at = |dx: i32, dy: i32| -> i32 {
        let mut acc = 0i32;
        for y in 0..block_size {
            for x in 0..block_size {
                let v = reference.read(
                    block_x as i32 + center.0 + dx + x as i32,
                    block_y as i32 + center.1 + dy + y as i32,
                ) as i32;
                acc += (v - current[y * block_size + x] as i32).abs();
            }
        }
        acc
    };

    let mut best = (0i32, 0i32, sad_at(0, 0));
    let mut step = ((range.max(1)) as u32).next_power_of_two() as i32 / 2;
    step = step.max(1);
    let mut origin = (0i32, 0i32);
    while step >= 1 {
        let mut improved = true;
        while improved {
            improved = false;
            for &(dx, dy) in &[
                (origin.0 + step, origin.1),
                (origin.0 - step, origin.1),
                (origin.0, origin.1 + step),
                (origin.0, origin.1 - step),
            ] {
                if dx.abs() > range || dy.abs() > range {
                    continue;
                }
                let sad = sad_at(dx, dy);
                if sad < best.2 {
                    best = (dx, dy, sad);
                    origin = (dx, dy);
                    improved = true;
                }
            }
        }
        step /= 2;
    }
    best
}

/// Estimate the best 16x16 motion vector for the macroblock at
/// `(mb_col * 16, mb_row * 16)`, biased toward `predicted_mv`, starting
/// coarse at L2 and refining down to full-pel at L0, then to quarter-pel.
pub fn estimate_motion(
    pyramid: &SearchPyramid,
    current_luma: &Plane,
    mb_col: usize,
    mb_row: usize,
    predicted_mv: MotionVector,
    range: i32,
) -> MotionEstimate {
    let block_x = mb_col * 16;
    let block_y = mb_row * 16;
    let mut current = [0i16; 256];
    for y in 0..16 {
        for x in 0..16 {
            current[y * 16 + x] = current_luma.read((block_x + x) as i32, (block_y + y) as i32);
        }
    }

    // L2 (quarter res): coarse cross search around the zero vector and the
    // predicted vector divided into L2 units, whichever starts closer.
    let l2_pred = (predicted_mv.x >> 2 >> 2, predicted_mv.y >> 2 >> 2);
    let mut l2_block = [0i16; 256];
    for y in 0..16 {
        for x in 0..16 {
            l2_block[y * 16 + x] = pyramid
                .l2
                .read((block_x / 4 + x) as i32, (block_y / 4 + y) as i32);
        }
    }
    let (l2dx, l2dy, _) = cross_search(
        &pyramid.l2,
        &l2_block,
        block_x / 4,
        block_y / 4,
        16,
        l2_pred,
        (range / 4).max(4),
    );

    // L1 (half res): refine around the L2 result scaled up.
    let mut l1_block = [0i16; 256];
    for y in 0..16 {
        for x in 0..16 {
            l1_block[y * 16 + x] = pyramid
                .l1
                .read((block_x / 2 + x) as i32, (block_y / 2 + y) as i32);
        }
    }
    let (l1dx, l1dy, _) = cross_search(
        &pyramid.l1,
        &l1_block,
        block_x / 2,
        block_y / 2,
        16,
        (l2dx * 2, l2dy * 2),
        4,
    );

    // L0 (full res): final full-pel refinement around the L1 result scaled up.
    let (l0dx, l0dy, full_pel_sad) = cross_search(
        &pyramid.l0,
        &current,
        block_x,
        block_y,
        16,
        (l1dx * 2, l1dy * 2),
        4,
    );

    let full_pel_mv = MotionVector {
        x: l0dx * 4,
        y: l0dy * 4,
    };

    // Quarter-pel refinement: sample the 8 quarter-pel neighbours around
    // the full-pel winner and keep the best.
    let mut best = MotionEstimate {
        mv: full_pel_mv,
        sad: full_pel_sad,
    };
    for ddx in -1..=1i32 {
        for ddy in -1..=1i32 {
            if ddx == 0 && ddy == 0 {
                continue;
            }
            let mv = MotionVector {
                x: full_pel_mv.x + ddx,
                y: full_pel_mv.y + ddy,
            };
            let pred = compensate_luma_16x16(&pyramid.l0, block_x, block_y, mv);
            let sad: i32 = pred
                .iter()
                .zip(current.iter())
                .map(|(&p, &c)| (p as i32 - c as i32).abs())
                .sum();
            if sad < best.sad {
                best = MotionEstimate { mv, sad };
            }
        }
    }

    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shifted_planes(shift_x: i32) -> (Plane, Plane) {
        let w = 64;
        let h = 64;
        let mut reference = Plane::new(w, h);
        for y in 0..h {
            for x in 0..w {
                reference.write(x, y, (((x * 3 + y * 7) % 251) as i16).clamp(0, 255));
            }
        }
        let mut current = Plane::new(w, h);
        for y in 0..h {
            for x in 0..w {
                let sx = (x as i32 - shift_x).clamp(0, w as i32 - 1) as usize;
                current.write(x, y, reference.read(sx as i32, y as i32));
            }
        }
        (reference, current)
    }

    #[test]
    fn finds_pure_translation() {
        let (reference, current) = shifted_planes(3);
        let pyramid = SearchPyramid::new(&reference);
        let est = estimate_motion(
            &pyramid,
            &current,
            1,
            1,
            MotionVector::ZERO,
            search_range(64, 64),
        );
        // The block moved 3 pixels right in `current` relative to
        // `reference`, so the best match is found by searching +3 in x.
        assert_eq!(est.mv.x / 4, 3);
    }

    #[test]
    fn zero_motion_gives_zero_sad_on_identical_pictures() {
        let (reference, _) = shifted_planes(0);
        let pyramid = SearchPyramid::new(&reference);
        let est = estimate_motion(
            &pyramid,
            &reference,
            0,
            0,
            MotionVector::ZERO,
            search_range(64, 64),
        );
        assert_eq!(est.sad, 0);
        assert_eq!(est.mv, MotionVector::ZERO);
    }

    #[test]
    fn search_range_scales_with_resolution() {
        assert_eq!(search_range(352, 288), 32);
        assert_eq!(search_range(1920, 1080), 64);
    }
}
