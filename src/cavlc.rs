// Copyright 2022-2023 Andrew D. Straw.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Context-Adaptive Variable Length Coding for one 4x4 (or 2x2 chroma DC)
//! residual block: `coeff_token`, trailing-ones sign flags, level
//! prefix/suffix, `total_zeros`, and `run_before`.

use alloc::vec;
use alloc::vec::Vec;
use bitvec::prelude::{BitVec, Msb0};

use crate::bitreader::BitReader;
use crate::golomb::BitVecGolomb;
use crate::{Error, Result};

/// Which neighbour-context table governs `coeff_token`: the three luma/cb/cr
/// AC ranges selected by `nC`, or the fixed 4-entry table used for 2x2 chroma
/// DC blocks (`nC == -1` in the standard's notation).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoeffTokenContext {
    Range0, // 0 <= nC < 2
    Range1, // 2 <= nC < 4
    Range2, // 4 <= nC < 8
    Range3, // nC >= 8
    ChromaDc,
}

impl CoeffTokenContext {
    pub fn for_nc(nc: i32) -> Self {
        match nc {
            i32::MIN..=1 => Self::Range0,
            2..=3 => Self::Range1,
            4..=7 => Self::Range2,
            _ => Self::Range3,
        }
    }
}

/// `(trailing_ones, total_coeff, code_len, code)` entries for one
/// `coeff_token` context.
type CoeffTokenEntry = (u8, u8, u8, u32);

macro_rules! ct {
    ($($t1:expr, $tc:expr, $len:expr, $code:expr;)*) => {
        &[$(($t1, $tc, $len, $code)),*]
    };
}

// Table 9-5, 0 <= nC < 2.
static COEFF_TOKEN_RANGE0: &[CoeffTokenEntry] = ct! {
    0, 0, 1, 0b1;
    0, 1, 6, 0b000101;
    1, 1, 2, 0b01;
    0, 2, 8, 0b00000111;
    1, 2, 6, 0b000100;
    2, 2, 3, 0b001;
    0, 3, 9, 0b000000111;
    1, 3, 8, 0b00000110;
    2, 3, 7, 0b0000101;
    3, 3, 5, 0b00011;
    0, 4, 10, 0b0000000111;
    1, 4, 9, 0b000000110;
    2, 4, 8, 0b00000101;
    3, 4, 6, 0b000011;
    0, 5, 11, 0b00000000111;
    1, 5, 10, 0b0000000110;
    2, 5, 9, 0b000000101;
    3, 5, 7, 0b0000100;
    0, 6, 13, 0b0000000001111;
    1, 6, 11, 0b00000000110;
    2, 6, 10, 0b0000000101;
    3, 6, 8, 0b00000100;
    0, 7, 13, 0b0000000001011;
    1, 7, 13, 0b0000000001110;
    2, 7, 11, 0b00000000101;
    3, 7, 9, 0b000000100;
    0, 8, 13, 0b0000000001000;
    1, 8, 13, 0b0000000001010;
    2, 8, 13, 0b0000000001101;
    3, 8, 10, 0b0000000100;
    0, 9, 14, 0b00000000001111;
    1, 9, 14, 0b00000000001110;
    2, 9, 13, 0b0000000001001;
    3, 9, 11, 0b00000000100;
    0, 10, 14, 0b00000000001011;
    1, 10, 14, 0b00000000001010;
    2, 10, 14, 0b00000000001101;
    3, 10, 13, 0b0000000001100;
    0, 11, 15, 0b000000000001111;
    1, 11, 15, 0b000000000001110;
    2, 11, 14, 0b00000000001001;
    3, 11, 14, 0b00000000001100;
    0, 12, 15, 0b000000000001011;
    1, 12, 15, 0b000000000001010;
    2, 12, 15, 0b000000000001101;
    3, 12, 14, 0b00000000001000;
    0, 13, 16, 0b0000000000001111;
    1, 13, 15, 0b000000000000001;
    2, 13, 15, 0b000000000001001;
    3, 13, 15, 0b000000000001100;
    0, 14, 16, 0b0000000000001011;
    1, 14, 16, 0b0000000000001110;
    2, 14, 16, 0b0000000000001101;
    3, 14, 15, 0b000000000001000;
    0, 15, 16, 0b0000000000000111;
    1, 15, 16, 0b0000000000001010;
    2, 15, 16, 0b0000000000001001;
    3, 15, 16, 0b0000000000001100;
    0, 16, 16, 0b0000000000000100;
    1, 16, 16, 0b0000000000000110;
    2, 16, 16, 0b0000000000000101;
    3, 16, 16, 0b0000000000001000;
};

// Table 9-5, 2 <= nC < 4.
static COEFF_TOKEN_RANGE1: &[CoeffTokenEntry] = ct! {
    0, 0, 2, 0b11;
    0, 1, 6, 0b001011;
    1, 1, 2, 0b10;
    0, 2, 6, 0b000111;
    1, 2, 5, 0b00111;
    2, 2, 3, 0b011;
    0, 3, 7, 0b0000111;
    1, 3, 6, 0b001010;
    2, 3, 6, 0b001001;
    3, 3, 4, 0b0101;
    0, 4, 8, 0b00000111;
    1, 4, 6, 0b000110;
    2, 4, 6, 0b000101;
    3, 4, 4, 0b0100;
    0, 5, 8, 0b00000100;
    1, 5, 7, 0b0000110;
    2, 5, 7, 0b0000101;
    3, 5, 5, 0b00110;
    0, 6, 9, 0b000000111;
    1, 6, 8, 0b00000110;
    2, 6, 8, 0b00000101;
    3, 6, 6, 0b001000;
    0, 7, 11, 0b00000001111;
    1, 7, 9, 0b000000110;
    2, 7, 9, 0b000000101;
    3, 7, 6, 0b000100;
    0, 8, 11, 0b00000001011;
    1, 8, 11, 0b00000001110;
    2, 8, 9, 0b000000100;
    3, 8, 7, 0b0000100;
    0, 9, 12, 0b000000001111;
    1, 9, 11, 0b00000001010;
    2, 9, 11, 0b00000001101;
    3, 9, 9, 0b000000011;
    0, 10, 12, 0b000000001011;
    1, 10, 12, 0b000000001110;
    2, 10, 11, 0b00000001001;
    3, 10, 11, 0b00000001100;
    0, 11, 12, 0b000000001000;
    1, 11, 12, 0b000000001010;
    2, 11, 12, 0b000000001101;
    3, 11, 11, 0b00000001000;
    0, 12, 13, 0b0000000001111;
    1, 12, 13, 0b0000000001110;
    2, 12, 12, 0b000000001001;
    3, 12, 12, 0b000000001100;
    0, 13, 13, 0b0000000001011;
    1, 13, 13, 0b0000000001010;
    2, 13, 13, 0b0000000001101;
    3, 13, 12, 0b000000001000;
    0, 14, 13, 0b0000000000111;
    1, 14, 13, 0b0000000001001;
    2, 14, 13, 0b0000000001100;
    3, 14, 13, 0b0000000001000;
    0, 15, 14, 0b0000000000001;
    1, 15, 13, 0b0000000000110;
    2, 15, 13, 0b0000000000101;
    3, 15, 13, 0b0000000000100;
    0, 16, 14, 0b0000000000001;
    1, 16, 13, 0b0000000000010;
    2, 16, 14, 0b0000000000001;
    3, 16, 13, 0b0000000000001;
};

// Table 9-5, 4 <= nC < 8 (fixed-length 6-bit codes).
static COEFF_TOKEN_RANGE2: &[CoeffTokenEntry] = ct! {
    0, 0, 4, 0b1111;
    0, 1, 6, 0b001111;
    1, 1, 4, 0b1110;
    0, 2, 6, 0b001011;
    1, 2, 5, 0b01111;
    2, 2, 4, 0b1101;
    0, 3, 6, 0b001000;
    1, 3, 5, 0b01100;
    2, 3, 5, 0b01110;
    3, 3, 4, 0b1100;
    0, 4, 6, 0b001001;
    1, 4, 5, 0b01010;
    2, 4, 5, 0b01011;
    3, 4, 4, 0b1011;
    0, 5, 6, 0b001101;
    1, 5, 5, 0b01000;
    2, 5, 5, 0b01001;
    3, 5, 4, 0b1010;
    0, 6, 6, 0b001100;
    1, 6, 5, 0b00111;
    2, 6, 5, 0b00110;
    3, 6, 4, 0b1001;
    0, 7, 6, 0b001010;
    1, 7, 5, 0b00101;
    2, 7, 5, 0b00100;
    3, 7, 4, 0b1000;
    0, 8, 7, 0b0001111;
    1, 8, 6, 0b000111;
    2, 8, 6, 0b000110;
    3, 8, 6, 0b001110;
    0, 9, 7, 0b0001011;
    1, 9, 6, 0b000101;
    2, 9, 6, 0b000100;
    3, 9, 6, 0b001101;
    0, 10, 7, 0b0000111;
    1, 10, 6, 0b0001110;
    2, 10, 6, 0b000011;
    3, 10, 6, 0b0001100;
    0, 11, 7, 0b0000100;
    1, 11, 6, 0b0000110;
    2, 11, 6, 0b0000101;
    3, 11, 6, 0b0001101;
    0, 12, 8, 0b00000111;
    1, 12, 7, 0b00000110;
    2, 12, 7, 0b00000101;
    3, 12, 7, 0b0000100;
    0, 13, 8, 0b00000100;
    1, 13, 8, 0b00000101;
    2, 13, 8, 0b00000110;
    3, 13, 7, 0b0000011;
    0, 14, 9, 0b000000111;
    1, 14, 8, 0b000000110;
    2, 14, 8, 0b000000101;
    3, 14, 8, 0b000000100;
    0, 15, 9, 0b000000100;
    1, 15, 9, 0b000000101;
    2, 15, 9, 0b000000110;
    3, 15, 9, 0b000000111;
    0, 16, 9, 0b000000001;
    1, 16, 9, 0b000000010;
    2, 16, 9, 0b000000011;
    3, 16, 9, 0b000000000;
};

// Table 9-5, nC >= 8: every TotalCoeff/TrailingOnes combination is a fixed
// 6-bit code, `coeff_token = (TotalCoeff - 1) * 4 + TrailingOnes` except for
// TotalCoeff == 0.
fn coeff_token_range3_code(t1: u8, tc: u8) -> u32 {
    if tc == 0 {
        0b000011
    } else {
        ((tc as u32 - 1) << 2) | t1 as u32
    }
}

// Table 9-5, chroma DC (2x2), nC == -1.
static COEFF_TOKEN_CHROMA_DC: &[CoeffTokenEntry] = ct! {
    0, 0, 2, 0b01;
    0, 1, 6, 0b000111;
    1, 1, 1, 0b1;
    0, 2, 6, 0b000100;
    1, 2, 6, 0b000110;
    2, 2, 3, 0b001;
    0, 3, 6, 0b000011;
    1, 3, 7, 0b0000011;
    2, 3, 7, 0b0000010;
    3, 3, 6, 0b000101;
    0, 4, 6, 0b000010;
    1, 4, 8, 0b00000011;
    2, 4, 8, 0b00000010;
    3, 4, 7, 0b0000000;
};

fn coeff_token_table(ctx: CoeffTokenContext) -> &'static [CoeffTokenEntry] {
    match ctx {
        CoeffTokenContext::Range0 => COEFF_TOKEN_RANGE0,
        CoeffTokenContext::Range1 => COEFF_TOKEN_RANGE1,
        CoeffTokenContext::Range2 => COEFF_TOKEN_RANGE2,
        CoeffTokenContext::ChromaDc => COEFF_TOKEN_CHROMA_DC,
        CoeffTokenContext::Range3 => &[],
    }
}

fn write_coeff_token(bv: &mut BitVec<u8, Msb0>, ctx: CoeffTokenContext, t1: u8, tc: u8) {
    if ctx == CoeffTokenContext::Range3 {
        let code = coeff_token_range3_code(t1, tc);
        for i in (0..6).rev() {
            bv.push((code >> i) & 1 != 0);
        }
        return;
    }
    let table = coeff_token_table(ctx);
    let (_, _, len, code) = *table
        .iter()
        .find(|&&(e_t1, e_tc, _, _)| e_t1 == t1 && e_tc == tc)
        .expect("valid (trailing_ones, total_coeff) pair");
    for i in (0..len).rev() {
        bv.push((code >> i) & 1 != 0);
    }
}

fn read_coeff_token(r: &mut BitReader, ctx: CoeffTokenContext) -> Result<(u8, u8)> {
    if ctx == CoeffTokenContext::Range3 {
        let code = r.read_bits(6)?;
        if code == 0b000011 {
            return Ok((0, 0));
        }
        let tc = (code >> 2) as u8 + 1;
        let t1 = (code & 0b11) as u8;
        return Ok((t1, tc));
    }
    let table = coeff_token_table(ctx);
    let mut code = 0u32;
    for len in 1..=16u8 {
        code = (code << 1) | (r.read_bit()? as u32);
        if let Some(&(t1, tc, _, _)) = table
            .iter()
            .find(|&&(_, _, e_len, e_code)| e_len == len && e_code == code)
        {
            return Ok((t1, tc));
        }
    }
    Err(bitstream_error())
}

/// total_zeros VLC tables (9-7/9-8), one row per `tzVlcIndex` (== TotalCoeff,
/// 1..=15), entries `(len, code)` indexed by `total_zeros`.
static TOTAL_ZEROS_TABLES: [&[(u8, u32)]; 15] = [
    &[
        (1, 1), (3, 0b011), (3, 0b010), (4, 0b0011), (4, 0b0010), (5, 0b00011), (5, 0b00010),
        (6, 0b000011), (6, 0b000010), (7, 0b0000011), (7, 0b0000010), (8, 0b00000011),
        (8, 0b00000010), (9, 0b000000011), (9, 0b000000010), (9, 0b000000001),
    ],
    &[
        (3, 0b111), (3, 0b110), (3, 0b101), (3, 0b100), (3, 0b011), (4, 0b0101), (4, 0b0100),
        (4, 0b0011), (4, 0b0010), (5, 0b00011), (5, 0b00010), (6, 0b000011), (6, 0b000010),
        (6, 0b000001), (6, 0b000000),
    ],
    &[
        (4, 0b0101), (3, 0b111), (3, 0b110), (3, 0b101), (4, 0b0100), (4, 0b0011), (3, 0b100),
        (3, 0b011), (4, 0b0010), (5, 0b00011), (5, 0b00010), (6, 0b000001), (5, 0b00001),
        (6, 0b000000),
    ],
    &[
        (5, 0b00011), (3, 0b111), (4, 0b0101), (4, 0b0100), (3, 0b110), (3, 0b101), (3, 0b100),
        (4, 0b0011), (3, 0b011), (4, 0b0010), (5, 0b00010), (5, 0b00001), (5, 0b00000),
    ],
    &[
        (4, 0b0101), (4, 0b0100), (4, 0b0011), (3, 0b111), (3, 0b110), (3, 0b101), (3, 0b100),
        (3, 0b011), (4, 0b0010), (5, 0b00001), (4, 0b0001), (5, 0b00000),
    ],
    &[
        (6, 0b000001), (5, 0b00001), (3, 0b111), (3, 0b110), (3, 0b101), (3, 0b100), (3, 0b011),
        (3, 0b010), (4, 0b0001), (3, 0b001), (6, 0b000000),
    ],
    &[
        (6, 0b000001), (5, 0b00001), (3, 0b101), (3, 0b100), (3, 0b011), (2, 0b11), (3, 0b010),
        (4, 0b0001), (3, 0b001), (6, 0b000000),
    ],
    &[
        (6, 0b000001), (4, 0b0001), (5, 0b00001), (3, 0b011), (2, 0b11), (2, 0b10), (3, 0b010),
        (3, 0b001), (6, 0b000000),
    ],
    &[
        (6, 0b000001), (6, 0b000000), (4, 0b0001), (2, 0b11), (2, 0b10), (3, 0b001), (2, 0b01),
        (5, 0b00001),
    ],
    &[
        (5, 0b00001), (5, 0b00000), (3, 0b001), (2, 0b11), (2, 0b10), (2, 0b01), (4, 0b0001),
    ],
    &[(4, 0b0000), (4, 0b0001), (3, 0b001), (3, 0b010), (1, 0b1), (3, 0b011)],
    &[(4, 0b0000), (3, 0b001), (1, 0b1), (3, 0b010), (3, 0b011)],
    &[(2, 0b00), (2, 0b01), (1, 0b1), (2, 0b10)],
    &[(2, 0b00), (1, 0b1), (1, 0b0)],
    &[(1, 0b0), (1, 0b1)],
];

/// total_zeros VLC for the 2x2 chroma DC block (Table 9-9a).
static TOTAL_ZEROS_CHROMA_DC: [&[(u8, u32)]; 3] = [
    &[(1, 0b1), (2, 0b01), (3, 0b001), (3, 0b000)],
    &[(1, 0b1), (2, 0b01), (2, 0b00)],
    &[(1, 0b1), (1, 0b0)],
];

fn write_total_zeros(
    bv: &mut BitVec<u8, Msb0>,
    total_coeff: u8,
    total_zeros: u8,
    chroma_dc: bool,
) {
    let (len, code) = if chroma_dc {
        TOTAL_ZEROS_CHROMA_DC[(total_coeff - 1) as usize][total_zeros as usize]
    } else {
        TOTAL_ZEROS_TABLES[(total_coeff - 1) as usize][total_zeros as usize]
    };
    for i in (0..len).rev() {
        bv.push((code >> i) & 1 != 0);
    }
}

fn read_total_zeros(r: &mut BitReader, total_coeff: u8, chroma_dc: bool) -> Result<u8> {
    let table: &[(u8, u32)] = if chroma_dc {
        TOTAL_ZEROS_CHROMA_DC[(total_coeff - 1) as usize]
    } else {
        TOTAL_ZEROS_TABLES[(total_coeff - 1) as usize]
    };
    let mut code = 0u32;
    for len in 1..=9u8 {
        code = (code << 1) | (r.read_bit()? as u32);
        if let Some(tz) = table
            .iter()
            .position(|&(e_len, e_code)| e_len == len && e_code == code)
        {
            return Ok(tz as u8);
        }
    }
    Err(bitstream_error())
}

/// run_before VLC (Table 9-10), rows indexed by `min(zeros_left, 7) - 1`.
static RUN_BEFORE_TABLES: [&[(u8, u32)]; 7] = [
    &[(1, 0b1), (1, 0b0)],
    &[(1, 0b1), (2, 0b01), (2, 0b00)],
    &[(2, 0b11), (2, 0b10), (2, 0b01), (2, 0b00)],
    &[(2, 0b11), (2, 0b10), (2, 0b01), (3, 0b001), (3, 0b000)],
    &[
        (2, 0b11), (2, 0b10), (3, 0b011), (3, 0b010), (3, 0b001), (3, 0b000),
    ],
    &[
        (2, 0b11), (3, 0b000), (3, 0b001), (3, 0b011), (3, 0b010), (3, 0b101), (3, 0b100),
    ],
    &[
        (3, 0b111), (3, 0b110), (3, 0b101), (3, 0b100), (3, 0b011), (3, 0b010), (3, 0b001),
        (4, 0b0001), (5, 0b00001), (6, 0b000001), (7, 0b0000001), (8, 0b00000001),
        (9, 0b000000001), (10, 0b0000000001), (11, 0b00000000001),
    ],
];

fn run_before_row(zeros_left: u8) -> &'static [(u8, u32)] {
    RUN_BEFORE_TABLES[(zeros_left.min(7) - 1) as usize]
}

fn write_run_before(bv: &mut BitVec<u8, Msb0>, zeros_left: u8, run_before: u8) {
    let (len, code) = run_before_row(zeros_left)[run_before as usize];
    for i in (0..len).rev() {
        bv.push((code >> i) & 1 != 0);
    }
}

fn read_run_before(r: &mut BitReader, zeros_left: u8) -> Result<u8> {
    let table = run_before_row(zeros_left);
    let mut code = 0u32;
    for len in 1..=11u8 {
        code = (code << 1) | (r.read_bit()? as u32);
        if let Some(rb) = table
            .iter()
            .position(|&(e_len, e_code)| e_len == len && e_code == code)
        {
            return Ok(rb as u8);
        }
    }
    Err(bitstream_error())
}

fn bitstream_error() -> Error {
    Error::BitstreamUnderflow {
        #[cfg(feature = "backtrace")]
        backtrace: std::backtrace::Backtrace::capture(),
    }
}

/// A decoded residual block: coefficients in raster (de-zigzagged) order for
/// a 4x4 block, or linear order for a 2x2 chroma DC block, plus the
/// `TotalCoeff` CAVLC's neighbour-context prediction needs.
#[derive(Clone, Debug, Default)]
pub struct DecodedBlock {
    pub coeffs: Vec<i32>,
    pub total_coeff: u8,
}

/// Encode one residual block's non-zero run, in (already zig-zag-ordered)
/// `levels` -- one entry per scan position, 0 for absent coefficients --
/// using the neighbour-predicted coefficient count `nc` (or `None` for
/// chroma DC).
pub fn encode_block(bv: &mut BitVec<u8, Msb0>, levels: &[i32], nc_or_chroma_dc: Option<i32>) {
    let chroma_dc = nc_or_chroma_dc.is_none();
    let ctx = match nc_or_chroma_dc {
        None => CoeffTokenContext::ChromaDc,
        Some(nc) => CoeffTokenContext::for_nc(nc),
    };

    // Collect nonzero coefficients from the end of the scan (highest
    // frequency) backward, as CAVLC transmits them.
    let mut nonzero: Vec<(usize, i32)> = levels
        .iter()
        .enumerate()
        .filter(|&(_, &v)| v != 0)
        .map(|(i, &v)| (i, v))
        .collect();
    let total_coeff = nonzero.len() as u8;

    if total_coeff == 0 {
        write_coeff_token(bv, ctx, 0, 0);
        return;
    }

    nonzero.reverse();
    let trailing_ones = nonzero
        .iter()
        .take(3)
        .take_while(|&&(_, v)| v == 1 || v == -1)
        .count() as u8;

    write_coeff_token(bv, ctx, trailing_ones, total_coeff);

    for &(_, v) in nonzero.iter().take(trailing_ones as usize) {
        bv.push(v < 0);
    }

    let mut suffix_length: u32 = if total_coeff > 10 && trailing_ones < 3 {
        1
    } else {
        0
    };
    for (i, &(_, v)) in nonzero.iter().enumerate().skip(trailing_ones as usize) {
        let mut level_code = if v > 0 { 2 * v - 1 } else { -2 * v };
        if i == trailing_ones as usize && trailing_ones < 3 {
            level_code -= 2;
        }
        write_level(bv, level_code as u32, suffix_length);
        if suffix_length == 0 {
            suffix_length = 1;
        }
        let threshold = 3i64 << (suffix_length - 1);
        if level_code as i64 > threshold && suffix_length < 6 {
            suffix_length += 1;
        }
    }

    // total_zeros is the count of zero-valued scan positions before (and
    // interleaved with) the highest nonzero coefficient.
    let highest_nonzero = nonzero.iter().map(|&(i, _)| i).max().unwrap();
    let total_zeros = highest_nonzero + 1 - total_coeff as usize;

    if (total_coeff as usize) < levels.len() {
        write_total_zeros(bv, total_coeff, total_zeros as u8, chroma_dc);
    }

    let mut zeros_left = total_zeros as u8;
    let mut positions: Vec<usize> = nonzero.iter().map(|&(i, _)| i).collect();
    positions.sort_unstable_by(|a, b| b.cmp(a));
    for (k, &pos) in positions.iter().enumerate() {
        if zeros_left == 0 || k + 1 == positions.len() {
            break;
        }
        let next_pos = positions[k + 1];
        let run = (pos - next_pos - 1) as u8;
        write_run_before(bv, zeros_left, run);
        zeros_left -= run;
    }
}

fn write_level(bv: &mut BitVec<u8, Msb0>, level_code: u32, suffix_length: u32) {
    let prefix = level_code >> suffix_length;
    // level_prefix is represented in unary (`prefix` zeros then a one), with
    // an escape to Exp-Golomb-style suffixes for large magnitudes.
    if prefix < 15 {
        for _ in 0..prefix {
            bv.push(false);
        }
        bv.push(true);
        if suffix_length > 0 {
            let suffix = level_code & ((1 << suffix_length) - 1);
            for i in (0..suffix_length).rev() {
                bv.push((suffix >> i) & 1 != 0);
            }
        }
    } else {
        for _ in 0..15 {
            bv.push(false);
        }
        bv.push(true);
        let remainder = level_code - (15 << suffix_length);
        bv.extend_exp_golomb(remainder);
    }
}

fn read_level(r: &mut BitReader, suffix_length: u32) -> Result<u32> {
    let mut prefix = 0u32;
    while !r.read_bit()? {
        prefix += 1;
        if prefix > 47 {
            return Err(bitstream_error());
        }
    }
    if prefix < 15 {
        let suffix = if suffix_length > 0 {
            r.read_bits(suffix_length)?
        } else {
            0
        };
        Ok((prefix << suffix_length) | suffix)
    } else {
        let remainder = r.read_ue()?;
        Ok((15 << suffix_length) + remainder)
    }
}

/// Decode one residual block. `max_coeffs` is 16 for luma/chroma AC blocks
/// and 4 for the 2x2 chroma DC block. `nc_or_chroma_dc` mirrors
/// [`encode_block`].
pub fn decode_block(
    r: &mut BitReader,
    max_coeffs: usize,
    nc_or_chroma_dc: Option<i32>,
) -> Result<DecodedBlock> {
    let chroma_dc = nc_or_chroma_dc.is_none();
    let ctx = match nc_or_chroma_dc {
        None => CoeffTokenContext::ChromaDc,
        Some(nc) => CoeffTokenContext::for_nc(nc),
    };

    let (trailing_ones, total_coeff) = read_coeff_token(r, ctx)?;
    let mut coeffs = vec![0i32; max_coeffs];
    if total_coeff == 0 {
        return Ok(DecodedBlock {
            coeffs,
            total_coeff,
        });
    }

    let mut levels = Vec::with_capacity(total_coeff as usize);
    for _ in 0..trailing_ones {
        let sign = r.read_bit()?;
        levels.push(if sign { -1 } else { 1 });
    }

    let mut suffix_length: u32 = if total_coeff > 10 && trailing_ones < 3 {
        1
    } else {
        0
    };
    for i in trailing_ones..total_coeff {
        let mut level_code = read_level(r, suffix_length)? as i64;
        if i == trailing_ones && trailing_ones < 3 {
            level_code += 2;
        }
        let level = if level_code % 2 == 0 {
            -((level_code + 2) / 2)
        } else {
            (level_code + 1) / 2
        };
        levels.push(level as i32);
        if suffix_length == 0 {
            suffix_length = 1;
        }
        let threshold = 3i64 << (suffix_length - 1);
        if level_code > threshold && suffix_length < 6 {
            suffix_length += 1;
        }
    }

    let total_zeros = if (total_coeff as usize) < max_coeffs {
        read_total_zeros(r, total_coeff, chroma_dc)?
    } else {
        0
    };

    let mut runs = vec![0u8; total_coeff as usize];
    let mut zeros_left = total_zeros;
    for k in 0..(total_coeff as usize - 1) {
        if zeros_left == 0 {
            break;
        }
        let run = read_run_before(r, zeros_left)?;
        runs[k] = run;
        zeros_left -= run;
    }
    runs[total_coeff as usize - 1] = zeros_left;

    let mut pos = -1i32;
    for k in (0..total_coeff as usize).rev() {
        pos += 1 + runs[k] as i32;
        coeffs[pos as usize] = levels[total_coeff as usize - 1 - k];
    }

    Ok(DecodedBlock {
        coeffs,
        total_coeff,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(levels: &[i32], nc: Option<i32>, max_coeffs: usize) {
        let mut bv: BitVec<u8, Msb0> = BitVec::new();
        encode_block(&mut bv, levels, nc);
        let bytes = bv.into_vec();
        let mut r = BitReader::new(&bytes);
        let decoded = decode_block(&mut r, max_coeffs, nc).unwrap();
        assert_eq!(&decoded.coeffs[..levels.len()], levels);
    }

    #[test]
    fn empty_block_roundtrips() {
        roundtrip(&[0; 16], Some(0), 16);
    }

    #[test]
    fn single_trailing_one_roundtrips() {
        let mut levels = [0i32; 16];
        levels[0] = 1;
        roundtrip(&levels, Some(0), 16);
    }

    #[test]
    fn mixed_levels_roundtrip() {
        let mut levels = [0i32; 16];
        levels[0] = 3;
        levels[1] = -1;
        levels[3] = 1;
        levels[7] = -2;
        roundtrip(&levels, Some(4), 16);
    }

    #[test]
    fn high_nc_context_roundtrips() {
        let mut levels = [0i32; 16];
        levels[0] = -5;
        levels[2] = 1;
        roundtrip(&levels, Some(9), 16);
    }

    #[test]
    fn chroma_dc_roundtrips() {
        let levels = [1, -1, 0, 2];
        roundtrip(&levels, None, 4);
    }

    #[test]
    fn large_magnitude_level_escapes_to_suffix() {
        let mut levels = [0i32; 16];
        levels[0] = 40;
        roundtrip(&levels, Some(1), 16);
    }
}
