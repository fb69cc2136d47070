// Copyright 2022-2023 Andrew D. Straw.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Encoder/decoder configuration, set once at [`crate::Codec::open`] time.

/// How the codec should choose QP for each picture.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateControlMode {
    /// Walk QP toward a caller-supplied bit budget via the MinMax
    /// rate controller.
    MinMax,
    /// Always use the fixed QP given in [`Params::fixed_qp`].
    FixedQp,
}

/// Picture coding type requested for the next call to
/// [`crate::Codec::code`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PictureCodingType {
    Auto,
    ForceI,
    ForceP,
}

/// Open-time configuration for a [`crate::Codec`].
///
/// Mirrors the handful of knobs a Baseline CAVLC encoder actually needs;
/// fields unrelated to this crate's scope (container muxing, colour
/// conversion) are intentionally absent.
#[derive(Clone, Debug)]
pub struct Params {
    pub width: u32,
    pub height: u32,

    pub rate_control: RateControlMode,
    /// Target size, in bits, for each coded picture when
    /// `rate_control == MinMax`.
    pub bits_per_picture: u32,
    /// QP used directly when `rate_control == FixedQp`. MinMax ignores this
    /// and always starts its search from QP 51.
    pub fixed_qp: i32,

    pub picture_coding_type: PictureCodingType,
    /// When true, a `ForceP` request is promoted to an I-picture once every
    /// `auto_i_period` pictures, or sooner if scene-change SAD exceeds
    /// `auto_i_sad_fraction` of the picture's sample count.
    pub auto_i_picture: bool,
    pub auto_i_period: u32,
    pub auto_i_sad_fraction: f32,

    /// Cap on MinMax's outer Dmax-search iterations when coding an I
    /// picture. Ignored by `FixedQp`.
    pub intra_iteration_limit: u32,
    /// Cap on MinMax's outer Dmax-search iterations when coding a P
    /// picture. Ignored by `FixedQp`.
    pub inter_iteration_limit: u32,
    /// Soft wall-clock budget for one call to `code()`, in milliseconds.
    /// Only consulted when the `std` feature is enabled. Zero disables it.
    pub time_limit_msec: u32,

    pub seq_parameter_set_id: u32,
    pub pic_parameter_set_id: u32,
    /// Emit a fresh SPS/PPS pair on `open()`, before the first picture.
    pub generate_param_sets_on_open: bool,
    /// Re-send SPS/PPS ahead of every IDR picture, not only the first.
    pub prepend_param_sets_to_i_pictures: bool,
    /// Insert emulation-prevention bytes. Disabling this produces a
    /// non-conformant bitstream and exists only to aid debugging.
    pub start_code_emulation_prevention: bool,

    pub log2_max_frame_num_minus4: u32,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            rate_control: RateControlMode::MinMax,
            bits_per_picture: 0,
            fixed_qp: 26,
            picture_coding_type: PictureCodingType::Auto,
            auto_i_picture: true,
            auto_i_period: 300,
            auto_i_sad_fraction: 0.5,
            intra_iteration_limit: 16,
            inter_iteration_limit: 64,
            time_limit_msec: 0,
            seq_parameter_set_id: 0,
            pic_parameter_set_id: 0,
            generate_param_sets_on_open: true,
            prepend_param_sets_to_i_pictures: true,
            start_code_emulation_prevention: true,
            log2_max_frame_num_minus4: 4,
        }
    }
}

impl Params {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            ..Default::default()
        }
    }

    pub fn with_fixed_qp(mut self, qp: i32) -> Self {
        self.rate_control = RateControlMode::FixedQp;
        self.fixed_qp = qp;
        self
    }

    pub fn with_bits_per_picture(mut self, bits: u32) -> Self {
        self.rate_control = RateControlMode::MinMax;
        self.bits_per_picture = bits;
        self
    }

    pub fn log2_max_frame_num(&self) -> u32 {
        self.log2_max_frame_num_minus4 + 4
    }
}
