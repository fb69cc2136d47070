// Copyright 2022-2023 Andrew D. Straw.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The integer 4x4 transform, the 4x4/2x2 Hadamard DC transforms, and their
//! quantisers. Each transform exposes transform-only, quantise-only, and
//! combined modes as separate free functions rather than a single "mode"
//! parameter, since the three call shapes take different arguments.

/// Forward-quantisation multiplier table, indexed `[qp % 6][group]`.
const MF: [[i32; 3]; 6] = [
    [13107, 5243, 8066],
    [11916, 4660, 7490],
    [10082, 4194, 6554],
    [9362, 3647, 5825],
    [8192, 3355, 5243],
    [7282, 2893, 4559],
];

/// Dequantisation (rescale) table, indexed `[qp % 6][group]`.
const V: [[i32; 3]; 6] = [
    [10, 16, 13],
    [11, 18, 14],
    [13, 20, 16],
    [14, 23, 18],
    [16, 25, 20],
    [18, 29, 23],
];

#[inline]
fn group(idx: usize) -> usize {
    let (i, j) = (idx / 4, idx % 4);
    match (i % 2, j % 2) {
        (0, 0) => 0,
        (1, 1) => 1,
        _ => 2,
    }
}

/// Forward 4x4 integer transform (core, unscaled) on a row-major block.
pub fn forward_4x4(x: &[i32; 16]) -> [i32; 16] {
    let mut tmp = [0i32; 16];
    // Horizontal pass.
    for r in 0..4 {
        let row = &x[r * 4..r * 4 + 4];
        let s0 = row[0] + row[3];
        let s1 = row[1] + row[2];
        let s2 = row[1] - row[2];
        let s3 = row[0] - row[3];
        tmp[r * 4] = s0 + s1;
        tmp[r * 4 + 1] = 2 * s3 + s2;
        tmp[r * 4 + 2] = s0 - s1;
        tmp[r * 4 + 3] = s3 - 2 * s2;
    }
    let mut out = [0i32; 16];
    // Vertical pass.
    for c in 0..4 {
        let col = [tmp[c], tmp[4 + c], tmp[8 + c], tmp[12 + c]];
        let s0 = col[0] + col[3];
        let s1 = col[1] + col[2];
        let s2 = col[1] - col[2];
        let s3 = col[0] - col[3];
        out[c] = s0 + s1;
        out[4 + c] = 2 * s3 + s2;
        out[8 + c] = s0 - s1;
        out[12 + c] = s3 - 2 * s2;
    }
    out
}

/// Inverse 4x4 integer transform, including the final normalising
/// `(+32) >> 6` shift, producing a spatial-domain residual block.
pub fn inverse_4x4(x: &[i32; 16]) -> [i32; 16] {
    let mut tmp = [0i32; 16];
    for c in 0..4 {
        let col = [x[c], x[4 + c], x[8 + c], x[12 + c]];
        let f0 = col[0] + col[2];
        let f1 = col[0] - col[2];
        let f2 = (col[1] >> 1) - col[3];
        let f3 = col[1] + (col[3] >> 1);
        tmp[c] = f0 + f3;
        tmp[4 + c] = f1 + f2;
        tmp[8 + c] = f1 - f2;
        tmp[12 + c] = f0 - f3;
    }
    let mut out = [0i32; 16];
    for r in 0..4 {
        let row = &tmp[r * 4..r * 4 + 4];
        let f0 = row[0] + row[2];
        let f1 = row[0] - row[2];
        let f2 = (row[1] >> 1) - row[3];
        let f3 = row[1] + (row[3] >> 1);
        out[r * 4] = (f0 + f3 + 32) >> 6;
        out[r * 4 + 1] = (f1 + f2 + 32) >> 6;
        out[r * 4 + 2] = (f1 - f2 + 32) >> 6;
        out[r * 4 + 3] = (f0 - f3 + 32) >> 6;
    }
    out
}

/// Quantise a 4x4 AC coefficient block already in the transform domain.
pub fn quantize_4x4(coeffs: &[i32; 16], qp: i32, intra: bool) -> [i32; 16] {
    let qbits = 15 + qp / 6;
    let f = if intra {
        (1i64 << qbits) / 3
    } else {
        (1i64 << qbits) / 6
    };
    let mut out = [0i32; 16];
    for (idx, &c) in coeffs.iter().enumerate() {
        let mf = MF[(qp % 6) as usize][group(idx)] as i64;
        let sign = if c < 0 { -1 } else { 1 };
        let z = ((c.unsigned_abs() as i64) * mf + f) >> qbits;
        out[idx] = sign * (z as i32);
    }
    out
}

/// Dequantise (rescale) a 4x4 AC coefficient block, producing values ready
/// for [`inverse_4x4`].
pub fn dequantize_4x4(levels: &[i32; 16], qp: i32) -> [i32; 16] {
    let shift = qp / 6;
    let mut out = [0i32; 16];
    for (idx, &c) in levels.iter().enumerate() {
        let v = V[(qp % 6) as usize][group(idx)];
        out[idx] = if shift >= 4 {
            (c * v) << (shift - 4)
        } else {
            (c * v + (1 << (3 - shift))) >> (4 - shift)
        };
    }
    out
}

/// Combined forward-transform-and-quantise.
pub fn transform_and_quantize_4x4(residual: &[i32; 16], qp: i32, intra: bool) -> [i32; 16] {
    quantize_4x4(&forward_4x4(residual), qp, intra)
}

/// Combined dequantise-and-inverse-transform.
pub fn dequantize_and_inverse_4x4(levels: &[i32; 16], qp: i32) -> [i32; 16] {
    inverse_4x4(&dequantize_4x4(levels, qp))
}

/// Forward 4x4 Hadamard transform on the 16 DC coefficients gathered from an
/// Intra_16x16 macroblock's luma blocks (unscaled, no quantisation).
pub fn hadamard_4x4_forward(x: &[i32; 16]) -> [i32; 16] {
    let mut tmp = [0i32; 16];
    for r in 0..4 {
        let row = &x[r * 4..r * 4 + 4];
        tmp[r * 4] = row[0] + row[1] + row[2] + row[3];
        tmp[r * 4 + 1] = row[0] + row[1] - row[2] - row[3];
        tmp[r * 4 + 2] = row[0] - row[1] - row[2] + row[3];
        tmp[r * 4 + 3] = row[0] - row[1] + row[2] - row[3];
    }
    let mut out = [0i32; 16];
    for c in 0..4 {
        let col = [tmp[c], tmp[4 + c], tmp[8 + c], tmp[12 + c]];
        out[c] = col[0] + col[1] + col[2] + col[3];
        out[4 + c] = col[0] + col[1] - col[2] - col[3];
        out[8 + c] = col[0] - col[1] - col[2] + col[3];
        out[12 + c] = col[0] - col[1] + col[2] - col[3];
    }
    out
}

/// Inverse 4x4 Hadamard transform (self-inverse up to scale; the combining
/// normalisation happens during quantise/dequantise since the Hadamard gain
/// differs from the core transform's).
pub fn hadamard_4x4_inverse(x: &[i32; 16]) -> [i32; 16] {
    hadamard_4x4_forward(x)
}

/// Quantise the 16 luma-DC Hadamard coefficients of an Intra_16x16 MB.
pub fn quantize_luma_dc(coeffs: &[i32; 16], qp: i32) -> [i32; 16] {
    let qbits = 15 + qp / 6 + 1;
    let f = (1i64 << qbits) / 3;
    let mf = MF[(qp % 6) as usize][0] as i64;
    let mut out = [0i32; 16];
    for (idx, &c) in coeffs.iter().enumerate() {
        let sign = if c < 0 { -1 } else { 1 };
        let z = ((c.unsigned_abs() as i64) * mf + f) >> qbits;
        out[idx] = sign * (z as i32);
    }
    out
}

/// Dequantise the 16 luma-DC coefficients, producing values ready for
/// [`hadamard_4x4_inverse`] before being distributed back into the AC blocks.
pub fn dequantize_luma_dc(levels: &[i32; 16], qp: i32) -> [i32; 16] {
    let shift = qp / 6;
    let v = V[(qp % 6) as usize][0];
    let mut out = [0i32; 16];
    for (idx, &c) in levels.iter().enumerate() {
        out[idx] = if shift >= 6 {
            (c * v) << (shift - 6)
        } else {
            (c * v + (1 << (5 - shift))) >> (6 - shift)
        };
    }
    out
}

/// Forward 2x2 Hadamard transform on a chroma block's 4 DC coefficients.
pub fn hadamard_2x2_forward(x: &[i32; 4]) -> [i32; 4] {
    let (a, b, c, d) = (x[0], x[1], x[2], x[3]);
    [a + b + c + d, a - b + c - d, a + b - c - d, a - b - c + d]
}

/// Inverse 2x2 Hadamard transform (self-inverse up to scale).
pub fn hadamard_2x2_inverse(x: &[i32; 4]) -> [i32; 4] {
    hadamard_2x2_forward(x)
}

/// Quantise the 4 chroma-DC Hadamard coefficients, using `qp_chroma`.
pub fn quantize_chroma_dc(coeffs: &[i32; 4], qp_chroma: i32) -> [i32; 4] {
    let qbits = 15 + qp_chroma / 6 + 1;
    let f = (1i64 << qbits) / 3;
    let mf = MF[(qp_chroma % 6) as usize][0] as i64;
    let mut out = [0i32; 4];
    for (idx, &c) in coeffs.iter().enumerate() {
        let sign = if c < 0 { -1 } else { 1 };
        let z = ((c.unsigned_abs() as i64) * mf + f) >> qbits;
        out[idx] = sign * (z as i32);
    }
    out
}

/// Dequantise the 4 chroma-DC coefficients, ready for
/// [`hadamard_2x2_inverse`].
pub fn dequantize_chroma_dc(levels: &[i32; 4], qp_chroma: i32) -> [i32; 4] {
    let shift = qp_chroma / 6;
    let v = V[(qp_chroma % 6) as usize][0];
    let mut out = [0i32; 4];
    for (idx, &c) in levels.iter().enumerate() {
        out[idx] = if shift >= 5 {
            (c * v) << (shift - 5)
        } else {
            (c * v + (1 << (4 - shift))) >> (5 - shift)
        };
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transform_roundtrips_without_quant() {
        let x: [i32; 16] = [
            10, -3, 7, 0, 2, 5, -8, 1, 0, 0, 4, -2, 6, -6, 3, 9,
        ];
        let t = forward_4x4(&x);
        let r = inverse_4x4(&t);
        // Unquantised round trip should be exact (the forward/inverse pair
        // is orthogonal up to the final >>6 normalisation, which exactly
        // cancels the transform's fixed gain of 64 for this kernel).
        assert_eq!(r, x);
    }

    #[test]
    fn quantize_dequantize_shrinks_toward_zero() {
        let x = [100i32; 16];
        let q = quantize_4x4(&x, 26, true);
        let dq = dequantize_4x4(&q, 26);
        // Dequantised magnitude should track the original coefficient's
        // sign and rough order of magnitude.
        assert_eq!(dq[0].signum(), x[0].signum());
    }

    #[test]
    fn hadamard_4x4_is_involutive_up_to_scale() {
        let x = [1i32, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16];
        let f = hadamard_4x4_forward(&x);
        let r = hadamard_4x4_inverse(&f);
        // Hadamard^2 = 16 * Identity for this unnormalized kernel.
        for i in 0..16 {
            assert_eq!(r[i], 16 * x[i]);
        }
    }

    #[test]
    fn hadamard_2x2_is_involutive_up_to_scale() {
        let x = [3i32, -1, 2, 7];
        let f = hadamard_2x2_forward(&x);
        let r = hadamard_2x2_inverse(&f);
        for i in 0..4 {
            assert_eq!(r[i], 4 * x[i]);
        }
    }

    #[test]
    fn all_zero_residual_quantizes_to_all_zero() {
        let x = [0i32; 16];
        let q = transform_and_quantize_4x4(&x, 30, false);
        assert_eq!(q, [0i32; 16]);
    }
}
