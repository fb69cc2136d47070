// Copyright 2022-2023 Andrew D. Straw.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The MinMax rate controller: a per-macroblock Dmax-equalising search over
//! the normal QP range, falling back to a per-macroblock steepest-ascent
//! walk up the extended-QP damage control ladder when even `qp == 51`
//! overshoots the bit budget.

use alloc::vec;
use alloc::vec::Vec;

use crate::macroblock::{MacroblockGrid, EXTENDED_QP_MAX};
use crate::params::{Params, RateControlMode};
use crate::tables::{DAMAGE_CONTROL_QP_LADDER, MB_QP_STEP};

#[cfg(feature = "std")]
use std::time::{Duration, Instant};

/// Floor a macroblock's QP is never stepped below while chasing a target
/// distortion; matches the floor used elsewhere for the normal QP range.
const MB_QP_FLOOR: i32 = 4;

/// Evaluates one macroblock at a candidate QP, returning `(bits, ssd)`.
/// Implemented by the per-MB coding pipeline; the rate controller memoises
/// every call it makes in [`crate::macroblock::Macroblock::rate`] and
/// [`crate::macroblock::Macroblock::distortion`] so repeated probes at the
/// same QP never re-run the pipeline.
pub trait MbCoster {
    fn cost(&mut self, mb_index: usize, qp: i32) -> (u32, i64);
}

/// Outcome of [`RateController::code_picture`].
#[derive(Clone, Copy, Debug)]
pub struct PictureRateResult {
    /// Under damage control this is still 51, since per-MB QP is recorded
    /// on each macroblock's `mb_enc_qp` instead. Otherwise it's the first
    /// macroblock's settled QP, the baseline the bitstream's
    /// `mb_qp_delta` chain starts from.
    pub qp: i32,
    pub bits: u32,
    pub distortion: i64,
    pub damage_control: bool,
}

/// Per-codec-instance rate controller state, carried across pictures so
/// each picture's search starts from the previous picture's QP rather than
/// from scratch.
pub struct RateController {
    last_picture_qp: i32,
}

impl RateController {
    pub fn new(initial_qp: i32) -> Self {
        Self {
            last_picture_qp: initial_qp.clamp(0, 51),
        }
    }

    pub fn last_picture_qp(&self) -> i32 {
        self.last_picture_qp
    }

    /// Choose QP for one picture (fixed, or MinMax search plus damage
    /// control) and leave every macroblock's `mb_enc_qp` set accordingly.
    ///
    /// `is_idr` selects which of [`Params::intra_iteration_limit`] /
    /// [`Params::inter_iteration_limit`] bounds the MinMax search.
    pub fn code_picture(
        &mut self,
        grid: &mut MacroblockGrid,
        coster: &mut dyn MbCoster,
        params: &Params,
        is_idr: bool,
    ) -> PictureRateResult {
        match params.rate_control {
            RateControlMode::FixedQp => {
                let qp = params.fixed_qp.clamp(0, 51);
                let mut bits = 0u32;
                let mut distortion = 0i64;
                for i in 0..grid.mbs.len() {
                    let (b, d) = cost_at(grid, coster, i, qp);
                    grid.mbs[i].mb_enc_qp = qp;
                    bits += b;
                    distortion += d;
                }
                self.last_picture_qp = qp;
                PictureRateResult {
                    qp,
                    bits,
                    distortion,
                    damage_control: false,
                }
            }
            RateControlMode::MinMax => {
                let iteration_limit = if is_idr {
                    params.intra_iteration_limit
                } else {
                    params.inter_iteration_limit
                };
                let outcome = run_minmax(grid, coster, params, iteration_limit);
                for (i, &qp) in outcome.qp_vector.iter().enumerate() {
                    grid.mbs[i].mb_enc_qp = qp;
                }
                let qp = if outcome.damage_control {
                    51
                } else {
                    outcome.qp_vector.first().copied().unwrap_or(51).clamp(0, 51)
                };
                self.last_picture_qp = qp;
                PictureRateResult {
                    qp,
                    bits: outcome.bits,
                    distortion: outcome.distortion,
                    damage_control: outcome.damage_control,
                }
            }
        }
    }
}

fn cost_at(grid: &mut MacroblockGrid, coster: &mut dyn MbCoster, idx: usize, qp: i32) -> (u32, i64) {
    let qp_idx = qp as usize;
    if let (Some(bits), Some(distortion)) = (grid.mbs[idx].rate[qp_idx], grid.mbs[idx].distortion[qp_idx]) {
        return (bits, distortion);
    }
    let (bits, distortion) = coster.cost(idx, qp);
    grid.mbs[idx].rate[qp_idx] = Some(bits);
    grid.mbs[idx].distortion[qp_idx] = Some(distortion);
    (bits, distortion)
}

fn picture_bits(grid: &mut MacroblockGrid, coster: &mut dyn MbCoster, qp: i32) -> u32 {
    let mut total = 0u32;
    for i in 0..grid.mbs.len() {
        total += cost_at(grid, coster, i, qp).0;
    }
    total
}

fn picture_dmax(grid: &mut MacroblockGrid, coster: &mut dyn MbCoster, qp: i32) -> i64 {
    let mut dmax = 0i64;
    for i in 0..grid.mbs.len() {
        dmax = dmax.max(cost_at(grid, coster, i, qp).1);
    }
    dmax
}

struct MinMaxOutcome {
    qp_vector: Vec<i32>,
    bits: u32,
    distortion: i64,
    damage_control: bool,
}

/// Per-macroblock Dmax-equalising MinMax search: rather than a single
/// uniform QP, each macroblock gets its own QP, stepped down from the
/// all-51 baseline until its own distortion meets a shared target Dmax
/// that the outer loop narrows toward the bit budget.
fn run_minmax(grid: &mut MacroblockGrid, coster: &mut dyn MbCoster, params: &Params, iteration_limit: u32) -> MinMaxOutcome {
    let n = grid.mbs.len();
    let allowed_bits = params.bits_per_picture;

    let bits_at_51 = picture_bits(grid, coster, 51);
    if bits_at_51 > allowed_bits {
        let bits = apply_damage_control(grid, coster, allowed_bits);
        let distortion = grid
            .mbs
            .iter()
            .map(|mb| mb.distortion[mb.mb_enc_qp as usize].unwrap_or(0))
            .max()
            .unwrap_or(0);
        return MinMaxOutcome {
            qp_vector: grid.mbs.iter().map(|mb| mb.mb_enc_qp).collect(),
            bits,
            distortion,
            damage_control: true,
        };
    }

    let dmax_at_51 = picture_dmax(grid, coster, 51);

    let mut qp_vector = vec![51i32; n];
    let mut best_vector = qp_vector.clone();
    let mut best_bits = bits_at_51;
    let mut best_distortion = dmax_at_51;

    let mut rl = bits_at_51 as i64;
    let mut dl = dmax_at_51;
    let mut ru = allowed_bits as i64 * 256;
    let mut du = 1i64;

    let eps = ((allowed_bits / 250) as i64).max(16);
    let target = allowed_bits as i64 - eps;
    let mut prev_dmax = dl;

    #[cfg(feature = "std")]
    let setup_start = Instant::now();
    #[cfg(feature = "std")]
    let deadline = deadline_from(params);
    #[cfg(feature = "std")]
    let setup_cost = setup_start.elapsed();
    #[cfg(feature = "std")]
    let mut iter_total = Duration::ZERO;
    #[cfg(feature = "std")]
    let mut iter_count: u32 = 0;

    for _ in 0..iteration_limit.max(1) {
        if (ru - rl).unsigned_abs() < (4 * eps) as u64 {
            break;
        }

        #[cfg(feature = "std")]
        let iter_start = Instant::now();

        let mut dmax = predict_dmax(rl, dl, ru, du, target);
        dmax += (dl - dmax) / 4;
        dmax = dmax.clamp(dl.min(du), dl.max(du));

        let (bits, actual_dmax) = step_qp_vector_toward(grid, coster, &mut qp_vector, dmax);
        let r = bits as i64;

        if r <= allowed_bits as i64 {
            rl = r;
            dl = actual_dmax;
            best_vector = qp_vector.clone();
            best_bits = bits;
            best_distortion = actual_dmax;
        } else {
            ru = r;
            du = actual_dmax;
            qp_vector = best_vector.clone();
        }

        #[cfg(feature = "std")]
        {
            iter_count += 1;
            iter_total += iter_start.elapsed();
        }

        let dmax_delta = (actual_dmax - prev_dmax).unsigned_abs();
        prev_dmax = actual_dmax;
        if (target - r).unsigned_abs() < eps as u64 || dmax_delta < 8 {
            break;
        }

        #[cfg(feature = "std")]
        if let Some(deadline) = deadline {
            let avg_iter = if iter_count == 0 { Duration::ZERO } else { iter_total / iter_count };
            if Instant::now() + 2 * setup_cost + avg_iter >= deadline {
                break;
            }
        }
    }

    MinMaxOutcome {
        qp_vector: best_vector,
        bits: best_bits,
        distortion: best_distortion,
        damage_control: false,
    }
}

/// Predict the next target Dmax via a power-law fit `R = alpha * D^(-beta)`
/// through `(rl, dl)` and `(ru, du)`, falling back to linear interpolation
/// and then bisection when the fit is unusable (out of range, degenerate,
/// or unavailable in `no_std` builds without transcendental `f64` methods).
fn predict_dmax(rl: i64, dl: i64, ru: i64, du: i64, target: i64) -> i64 {
    let (rlf, dlf, ruf, duf, targetf) = (rl as f64, dl as f64, ru as f64, du as f64, target as f64);

    if let Some(d) = power_law_dmax(rlf, dlf, ruf, duf, targetf) {
        let lo = dlf.min(duf);
        let hi = dlf.max(duf);
        if d.is_finite() && d >= lo && d <= hi && (d - dlf).abs() > 0.5 {
            return d.round() as i64;
        }
    }

    if (ruf - rlf).abs() > 0.5 {
        let d = dlf + (targetf - rlf) * (duf - dlf) / (ruf - rlf);
        if d.is_finite() {
            return d.round() as i64;
        }
    }

    ((dlf + duf) / 2.0).round() as i64
}

#[cfg(feature = "std")]
fn power_law_dmax(rl: f64, dl: f64, ru: f64, du: f64, target: f64) -> Option<f64> {
    if rl <= 0.0 || ru <= 0.0 || dl <= 0.0 || du <= 0.0 || dl == du {
        return None;
    }
    let beta = (ru.ln() - rl.ln()) / (dl.ln() - du.ln());
    if !beta.is_finite() || beta.abs() < 1e-9 {
        return None;
    }
    let ln_alpha = rl.ln() + beta * dl.ln();
    let ln_target = target.max(1.0).ln();
    let d = ((ln_alpha - ln_target) / beta).exp();
    d.is_finite().then_some(d)
}

#[cfg(not(feature = "std"))]
fn power_law_dmax(_rl: f64, _dl: f64, _ru: f64, _du: f64, _target: f64) -> Option<f64> {
    None
}

/// Step every macroblock's QP, in order, from its current cached value down
/// toward `dmax`: decrease QP by [`MB_QP_STEP`] until the MB's own
/// distortion at that QP is at or below `dmax`, or the floor is reached.
/// Each settled QP is clamped against the previous macroblock's settled QP
/// so the `mb_qp_delta` chain stays within the legal `[-26, +25]` range;
/// [`crate::mb_pipeline::resolve_transmitted_qp`] re-enforces this exactly
/// at commit time regardless of what this approximation settles on.
fn step_qp_vector_toward(grid: &mut MacroblockGrid, coster: &mut dyn MbCoster, qp_vector: &mut [i32], dmax: i64) -> (u32, i64) {
    let mut total_bits = 0u32;
    let mut actual_dmax = 0i64;
    let mut prev_qp: Option<i32> = None;

    for i in 0..qp_vector.len() {
        let mut qp = qp_vector[i];
        loop {
            let (_, dist) = cost_at(grid, coster, i, qp);
            if dist <= dmax || qp <= MB_QP_FLOOR {
                break;
            }
            let step = MB_QP_STEP[qp as usize].max(1) as i32;
            let next = (qp - step).max(MB_QP_FLOOR);
            if next == qp {
                break;
            }
            qp = next;
        }
        if let Some(prev) = prev_qp {
            qp = qp.clamp(prev - 26, prev + 25);
        }
        qp = qp.clamp(0, EXTENDED_QP_MAX as i32);

        let (bits, dist) = cost_at(grid, coster, i, qp);
        qp_vector[i] = qp;
        total_bits += bits;
        actual_dmax = actual_dmax.max(dist);
        prev_qp = Some(qp);
    }

    (total_bits, actual_dmax)
}

/// Walk each macroblock independently up [`DAMAGE_CONTROL_QP_LADDER`],
/// greedily stepping whichever macroblock currently offers the steepest
/// bits-saved-per-distortion-added trade, until the picture fits the
/// budget or every macroblock has exhausted the ladder. Leaves each
/// macroblock's `mb_enc_qp` set to the extended QP it settled on.
fn apply_damage_control(grid: &mut MacroblockGrid, coster: &mut dyn MbCoster, budget_bits: u32) -> u32 {
    let n = grid.mbs.len();
    let mut step: Vec<usize> = vec![0; n];
    let mut bits: Vec<u32> = (0..n)
        .map(|i| cost_at(grid, coster, i, DAMAGE_CONTROL_QP_LADDER[0] as i32).0)
        .collect();
    let mut total: u32 = bits.iter().sum();

    while total > budget_bits {
        let mut best_idx: Option<usize> = None;
        let mut best_score = -1.0f64;
        let mut best_bits = 0u32;

        for i in 0..n {
            let cur_step = step[i];
            if cur_step + 1 >= DAMAGE_CONTROL_QP_LADDER.len() {
                continue;
            }
            let cur_qp = DAMAGE_CONTROL_QP_LADDER[cur_step] as i32;
            let next_qp = DAMAGE_CONTROL_QP_LADDER[cur_step + 1] as i32;
            let (cur_bits, cur_dist) = cost_at(grid, coster, i, cur_qp);
            let (next_bits, next_dist) = cost_at(grid, coster, i, next_qp);
            if next_bits >= cur_bits {
                continue;
            }
            let bits_saved = (cur_bits - next_bits) as f64;
            let distortion_added = (next_dist - cur_dist).max(1) as f64;
            let score = bits_saved / distortion_added;
            if score > best_score {
                best_score = score;
                best_idx = Some(i);
                best_bits = next_bits;
            }
        }

        let Some(idx) = best_idx else {
            break;
        };
        total = total - bits[idx] + best_bits;
        bits[idx] = best_bits;
        step[idx] += 1;
    }

    for (i, mb) in grid.mbs.iter_mut().enumerate() {
        mb.mb_enc_qp = DAMAGE_CONTROL_QP_LADDER[step[i]] as i32;
    }

    total
}

/// Wall-clock deadline for one call to `Codec::code`, derived from
/// [`Params::time_limit_msec`]. `None` when the limit is disabled (zero) or
/// the `std` feature is unavailable.
#[cfg(feature = "std")]
pub fn deadline_from(params: &Params) -> Option<Instant> {
    if params.time_limit_msec == 0 {
        None
    } else {
        Some(Instant::now() + Duration::from_millis(params.time_limit_msec as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A synthetic cost model: bits fall off linearly as QP rises, and
    /// distortion rises with the square of QP, giving the search and
    /// damage-control logic a predictable curve.
    struct LinearCoster {
        bits_per_qp_step: u32,
    }

    impl MbCoster for LinearCoster {
        fn cost(&mut self, _mb_index: usize, qp: i32) -> (u32, i64) {
            let bits = (self.bits_per_qp_step * (52 - qp.clamp(0, 51)) as u32).max(1);
            let distortion = (qp as i64) * (qp as i64);
            (bits, distortion)
        }
    }

    #[test]
    fn fixed_qp_assigns_same_qp_to_every_mb() {
        let mut grid = MacroblockGrid::new(2, 2);
        let mut coster = LinearCoster { bits_per_qp_step: 10 };
        let params = Params::new(32, 32).with_fixed_qp(30);
        let mut rc = RateController::new(26);
        let result = rc.code_picture(&mut grid, &mut coster, &params, false);
        assert_eq!(result.qp, 30);
        assert!(grid.mbs.iter().all(|mb| mb.mb_enc_qp == 30));
    }

    #[test]
    fn minmax_fits_budget_and_refines_quality_from_qp51_baseline() {
        let mut grid = MacroblockGrid::new(2, 2);
        let mut coster = LinearCoster { bits_per_qp_step: 10 };
        // 4 MBs; qp==51 alone costs 4*10*1=40 bits, comfortably under a
        // budget loose enough to let the search pull QP down for quality.
        let budget = 4 * 10 * (52 - 30);
        let params = Params::new(32, 32).with_bits_per_picture(budget);
        let mut rc = RateController::new(26);
        let result = rc.code_picture(&mut grid, &mut coster, &params, false);
        assert!(!result.damage_control);
        assert!(result.bits <= budget);
        assert!(grid.mbs.iter().any(|mb| mb.mb_enc_qp < 51));
        assert!(grid.mbs.iter().all(|mb| (0..=51).contains(&mb.mb_enc_qp)));
    }

    #[test]
    fn minmax_respects_mb_qp_delta_legal_range() {
        // A coster whose cost depends on mb_index lets different MBs settle
        // on very different QPs; the per-MB search must still keep each
        // macroblock's QP within 25/26 of its predecessor's.
        struct SkewedCoster;
        impl MbCoster for SkewedCoster {
            fn cost(&mut self, mb_index: usize, qp: i32) -> (u32, i64) {
                let bias = (mb_index as i64) * 40;
                let bits = (10 * (52 - qp.clamp(0, 51)) as i64 + bias).max(1) as u32;
                let distortion = (qp as i64) * (qp as i64);
                (bits, distortion)
            }
        }
        let mut grid = MacroblockGrid::new(4, 4);
        let mut coster = SkewedCoster;
        // Loose enough that qp==51 alone already fits (bits_at_51 sums to
        // 160 + 40*(0+1+...+15) = 4960), so the search refines rather than
        // falling into damage control.
        let budget = 6000;
        let params = Params::new(64, 64).with_bits_per_picture(budget);
        let mut rc = RateController::new(26);
        let result = rc.code_picture(&mut grid, &mut coster, &params, true);
        assert!(!result.damage_control);
        for w in grid.mbs.windows(2) {
            let delta = w[1].mb_enc_qp - w[0].mb_enc_qp;
            assert!((-26..=25).contains(&delta), "delta {delta} out of range");
        }
    }

    #[test]
    fn damage_control_engages_when_qp51_overshoots() {
        let mut grid = MacroblockGrid::new(2, 2);
        // At qp == 51 there's still 1 bit/MB minimum; force a budget even
        // the floor can't satisfy within the normal QP range, so damage
        // control's extended ladder must be tried.
        struct FloorCoster;
        impl MbCoster for FloorCoster {
            fn cost(&mut self, _mb_index: usize, qp: i32) -> (u32, i64) {
                if qp <= 51 {
                    (1000, (qp as i64) * (qp as i64))
                } else {
                    // Extended QPs on the damage-control ladder actually
                    // shrink the coded size.
                    let extra = (qp - 51) as u32;
                    (1000u32.saturating_sub(extra * 150), (qp as i64) * (qp as i64))
                }
            }
        }
        let mut coster = FloorCoster;
        let params = Params::new(32, 32).with_bits_per_picture(1500);
        let mut rc = RateController::new(26);
        let result = rc.code_picture(&mut grid, &mut coster, &params, false);
        assert!(result.damage_control);
        assert!(grid.mbs.iter().any(|mb| mb.mb_enc_qp > 51));
    }
}
