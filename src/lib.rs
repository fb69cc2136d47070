// Copyright 2022-2023 Andrew D. Straw.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! less Advanced Video Coding (H.264) encoding and decoding library
//!
//! This crate implements a pure Rust Baseline-profile H.264 codec core:
//! CAVLC entropy coding, a single slice per picture, a single reference
//! picture, `IPPPPP` GOP structure. Intra prediction, motion estimation and
//! compensation, the integer transform, a MinMax rate controller, and an
//! in-loop deblocking filter are all implemented; anything beyond Baseline
//! (CABAC, B-slices, multiple reference pictures, interlaced fields) is out
//! of scope.
//!
//! [`Codec`] is the entry point: [`Codec::open`] starts a session,
//! [`Codec::code`] turns one [`Picture`] into coded NAL units, and
//! [`Codec::decode`] turns Annex-B bitstream data back into pictures.
#![cfg_attr(not(feature = "std"), no_std)]
#![cfg_attr(feature = "backtrace", feature(error_generic_member_access))]
#![deny(unsafe_code)]

#[cfg(not(feature = "std"))]
extern crate core as std;

extern crate alloc;

#[cfg(feature = "backtrace")]
use std::backtrace::Backtrace;

mod golomb;

mod bitreader;
pub mod nal_unit;

pub mod plane;
pub mod image;
mod macroblock;
mod mv;

mod intra;
mod transform;
mod tables;
mod cavlc;
mod motion_comp;
mod motion_est;

mod deblock;
mod rate_control;
mod mb_pipeline;

pub mod params;
mod slice;
pub mod sps_pps;

pub mod codec;

pub mod sei;

#[cfg(feature = "std")]
mod writer;
#[cfg(feature = "std")]
pub use writer::H264Writer;

pub use codec::{Codec, DecodedPicture, EncodedPicture};
pub use image::Picture;
pub use nal_unit::{NalRefIdc, NalUnit, NalUnitType, RbspData};
pub use params::{Params, PictureCodingType, RateControlMode};

// Error type ----------------------

/// An H.264 encoding or decoding error.
#[derive(Debug)]
pub enum Error {
    /// An image's width or height is zero or not a multiple of 16.
    UnsupportedImageSize {
        #[cfg(feature = "backtrace")]
        backtrace: Backtrace,
    },
    /// A `profile_idc` other than Baseline (66) was found while parsing an
    /// SPS.
    UnsupportedProfile {
        profile_idc: u8,
        #[cfg(feature = "backtrace")]
        backtrace: Backtrace,
    },
    /// A syntax element outside what this Baseline-only core supports was
    /// found while parsing an SPS or PPS (CABAC, `pic_order_cnt_type != 2`).
    UnsupportedParameter {
        msg: &'static str,
        #[cfg(feature = "backtrace")]
        backtrace: Backtrace,
    },
    /// A bit reader ran out of data before finishing a syntax element.
    BitstreamUnderflow {
        #[cfg(feature = "backtrace")]
        backtrace: Backtrace,
    },
    /// A slice referenced a `pic_parameter_set_id` that does not match any
    /// parameter set the decoder has seen.
    ParamSetIndexOutOfRange {
        id: u32,
        #[cfg(feature = "backtrace")]
        backtrace: Backtrace,
    },
    /// A P slice was decoded (or a P picture was coded) before any
    /// reference picture was available.
    MissingReferencePicture {
        #[cfg(feature = "backtrace")]
        backtrace: Backtrace,
    },
    InconsistentState {
        #[cfg(feature = "backtrace")]
        backtrace: Backtrace,
    },
    /// Damage control could not bring a coded picture under its allotted
    /// `bits_per_picture` budget even at the extended QP ceiling.
    BitBudgetExceeded {
        bits: u32,
        bits_per_picture: u32,
        #[cfg(feature = "backtrace")]
        backtrace: Backtrace,
    },
    /// A motion vector list lookup found the predictor state inconsistent
    /// with the macroblock grid (e.g. a neighbour marked available with no
    /// recorded motion vector).
    MotionVectorListMismatch {
        #[cfg(feature = "backtrace")]
        backtrace: Backtrace,
    },
    #[cfg(feature = "std")]
    IoError {
        source: std::io::Error,
        #[cfg(feature = "backtrace")]
        backtrace: Backtrace,
    },
}
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(feature = "std")]
impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Error::IoError {
            source,
            #[cfg(feature = "backtrace")]
            backtrace: Backtrace::capture(),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError {
                source,
                #[cfg(feature = "backtrace")]
                    backtrace: _,
            } => Some(source),
            _ => None,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::result::Result<(), std::fmt::Error> {
        match self {
            Error::UnsupportedImageSize {
                #[cfg(feature = "backtrace")]
                    backtrace: _,
            } => {
                write!(f, "unsupported image size: width and height must be non-zero multiples of 16")
            }
            Error::UnsupportedProfile {
                profile_idc,
                #[cfg(feature = "backtrace")]
                    backtrace: _,
            } => {
                write!(f, "unsupported profile_idc {profile_idc}: only Baseline (66) is supported")
            }
            Error::UnsupportedParameter {
                msg,
                #[cfg(feature = "backtrace")]
                    backtrace: _,
            } => {
                write!(f, "unsupported parameter: {msg}")
            }
            Error::BitstreamUnderflow {
                #[cfg(feature = "backtrace")]
                    backtrace: _,
            } => {
                write!(f, "bitstream ended before a syntax element finished")
            }
            Error::ParamSetIndexOutOfRange {
                id,
                #[cfg(feature = "backtrace")]
                    backtrace: _,
            } => {
                write!(f, "slice referenced unknown parameter set id {id}")
            }
            Error::MissingReferencePicture {
                #[cfg(feature = "backtrace")]
                    backtrace: _,
            } => {
                write!(f, "no reference picture is available for a P slice")
            }
            Error::InconsistentState {
                #[cfg(feature = "backtrace")]
                    backtrace: _,
            } => {
                write!(f, "internal error: inconsistent state")
            }
            Error::BitBudgetExceeded {
                bits,
                bits_per_picture,
                #[cfg(feature = "backtrace")]
                    backtrace: _,
            } => {
                write!(f, "coded picture used {bits} bits, over its {bits_per_picture}-bit budget")
            }
            Error::MotionVectorListMismatch {
                #[cfg(feature = "backtrace")]
                    backtrace: _,
            } => {
                write!(f, "internal error: motion vector list state is inconsistent")
            }
            #[cfg(feature = "std")]
            Error::IoError {
                source,
                #[cfg(feature = "backtrace")]
                    backtrace: _,
            } => {
                write!(f, "IO error: {source}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::Picture;
    use crate::params::Params;

    #[test]
    fn open_emits_initial_param_sets_by_default() {
        let params = Params::new(32, 16);
        let (initial, _codec) = Codec::open(params).unwrap();
        assert_eq!(initial.len(), 2);
        assert_eq!(initial[0].unit_type(), &NalUnitType::SequenceParameterSet);
        assert_eq!(initial[1].unit_type(), &NalUnitType::PictureParameterSet);
    }

    #[test]
    fn first_picture_is_coded_as_idr() {
        let params = Params::new(32, 16).with_fixed_qp(30);
        let (_initial, mut codec) = Codec::open(params).unwrap();
        let pic = Picture::new(32, 16).unwrap();
        let encoded = codec.code(&pic).unwrap();
        assert!(encoded.is_idr);
        assert!(!encoded.nal_units.is_empty());
    }

    #[test]
    fn encode_then_decode_roundtrips_an_idr_picture() {
        let params = Params::new(32, 16).with_fixed_qp(28);
        let (_initial, mut encoder) = Codec::open(params.clone()).unwrap();
        let pic = Picture::new(32, 16).unwrap();
        let encoded = encoder.code(&pic).unwrap();

        let mut annex_b = Vec::new();
        for nal in &encoded.nal_units {
            annex_b.extend(nal.to_annex_b_data());
        }

        let (_initial, mut decoder) = Codec::open(params).unwrap();
        let decoded = decoder.decode(&annex_b).unwrap();
        assert_eq!(decoded.len(), 1);
        assert!(decoded[0].is_idr);
        assert_eq!(decoded[0].picture.width(), 32);
        assert_eq!(decoded[0].picture.height(), 16);
    }
}
