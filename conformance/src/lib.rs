// Copyright 2022-2023 Andrew D. Straw.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Fixture generation shared by the integration tests, examples, and
//! benchmarks in this workspace member.

use h264_baseline_codec::Picture;

/// A synthetic YUV 4:2:0 test picture: a horizontal luma gradient over
/// neutral (mid-grey) chroma, shifted by `phase` pixels each call so a
/// sequence of pictures has genuine inter-frame motion for the encoder to
/// find.
pub fn generate_picture(width: u32, height: u32, phase: i64) -> Picture {
    let width = width as usize;
    let height = height as usize;
    let mut y = vec![0u8; width * height];
    for row in 0..height {
        for col in 0..width {
            let shifted = (col as i64 + phase).rem_euclid(width as i64) as usize;
            y[row * width + col] = ((shifted * 255) / width.max(1)) as u8;
        }
    }
    let c = vec![128u8; (width / 2) * (height / 2)];
    Picture::from_planes_u8(width, height, &y, width, &c, &c, width / 2).unwrap()
}

/// Sum of absolute sample differences across the luma plane, a cheap
/// round-trip fidelity check that doesn't need a reference decoder.
pub fn luma_sad(a: &Picture, b: &Picture) -> i64 {
    let (ay, _, _) = a.to_planes_u8();
    let (by, _, _) = b.to_planes_u8();
    ay.iter().zip(by.iter()).map(|(&x, &y)| (x as i64 - y as i64).abs()).sum()
}
