// Copyright 2022-2023 Andrew D. Straw.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Static tables shared by the transform, CAVLC, and deblocking filter
//! modules: zig-zag scan order, the chroma QP derivation, the deblocking
//! alpha/beta/tC0 tables, and the intra zoom-grid sample points.

/// Zig-zag scan order for a 4x4 block, expressed as the raster index at each
/// scan position.
pub const ZIGZAG_4X4: [usize; 16] = [
    0, 1, 4, 8, 5, 2, 3, 6, 9, 12, 13, 10, 7, 11, 14, 15,
];

/// Raster-order inverse of [`ZIGZAG_4X4`]: scan position for each raster index.
pub const ZIGZAG_4X4_INV: [usize; 16] = {
    let mut inv = [0usize; 16];
    let mut i = 0;
    while i < 16 {
        inv[ZIGZAG_4X4[i]] = i;
        i += 1;
    }
    inv
};

/// `QPc(QP_Y)` chroma QP derivation, defined for `qp_y` in `30..=51`; below 30
/// chroma QP equals luma QP.
const QPC_TABLE: [u8; 22] = [
    29, 30, 31, 32, 32, 33, 34, 34, 35, 35, 36, 36, 37, 37, 37, 38, 38, 38, 39, 39, 39, 39,
];

/// Derive the chroma QP from a luma QP, saturating per the H.264 table above
/// `qp_y == 51`.
pub fn qp_chroma_from_luma(qp_y: i32) -> i32 {
    let qp_y = qp_y.clamp(0, 51);
    if qp_y < 30 {
        qp_y
    } else {
        QPC_TABLE[(qp_y - 30) as usize] as i32
    }
}

/// Deblocking filter `alpha` table indexed by `qPav` (clamped to 0..=51).
pub const ALPHA_TABLE: [i32; 52] = [
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 4, 4, 5, 6, 7, 8, 9, 10, 12, 13, 15, 17, 20,
    22, 25, 28, 32, 36, 40, 45, 50, 56, 63, 71, 80, 90, 101, 113, 127, 144, 162, 182, 203, 226,
    255, 255,
];

/// Deblocking filter `beta` table indexed by `qPav` (clamped to 0..=51).
pub const BETA_TABLE: [i32; 52] = [
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 2, 2, 2, 3, 3, 3, 3, 4, 4, 4, 6, 6, 7, 7, 8, 8,
    9, 9, 10, 10, 11, 11, 12, 12, 13, 13, 14, 14, 15, 15, 16, 16, 17, 17, 18, 18,
];

/// `tC0` table rows for `bS` in `{1, 2, 3}`, indexed by `qPav`.
pub const TC0_TABLE: [[i32; 52]; 3] = [
    [
        0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 1, 1, 1, 1, 1,
        1, 1, 1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 4, 4, 4, 5, 6, 6, 7, 8, 9,
    ],
    [
        0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 1, 1, 1, 1, 1,
        1, 1, 2, 2, 2, 2, 3, 3, 3, 4, 4, 5, 6, 6, 7, 8, 9, 10, 11, 13, 14, 16,
    ],
    [
        0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 2, 2, 2,
        2, 3, 3, 3, 4, 4, 4, 5, 6, 6, 7, 8, 8, 10, 11, 12, 13, 15, 17, 19, 21, 23,
    ],
];

/// Zoom-grid sample points used by intra-16x16 mode selection, expressed as
/// (x, y) offsets within the 16x16 luma block. Points are grouped from
/// coarsest (4 points) to finest; mode selection accumulates SSD over an
/// increasing prefix until the DC-mode early-exit threshold fires or the
/// list is exhausted.
pub const LUMA_ZOOM_GRID: &[(u8, u8)] = &[
    // 4 points: coarse corners.
    (2, 2),
    (2, 13),
    (13, 2),
    (13, 13),
    // 4 more: edge midpoints.
    (7, 2),
    (2, 7),
    (13, 7),
    (7, 13),
    // 8 more: fills in a finer grid.
    (5, 5),
    (10, 5),
    (5, 10),
    (10, 10),
    (0, 0),
    (15, 0),
    (0, 15),
    (15, 15),
];

/// Zoom-grid sample points for 8x8 chroma blocks, same discipline at half
/// scale.
pub const CHROMA_ZOOM_GRID: &[(u8, u8)] = &[
    (1, 1),
    (1, 6),
    (6, 1),
    (6, 6),
    (3, 3),
    (4, 4),
    (0, 0),
    (7, 7),
];

/// Luma intra-mode SSD early-exit threshold (spec constant
/// `20480/(256/4) = 320`).
pub const LUMA_ZOOM_THRESHOLD: i32 = 320;
/// Chroma intra-mode SSD early-exit threshold.
pub const CHROMA_ZOOM_THRESHOLD: i32 = 160;

/// Per-QP macroblock QP decrement step used while the rate controller walks
/// an MB's QP down toward a target distortion. Larger QPs take larger
/// strides since the rate/distortion curve is flatter there.
pub const MB_QP_STEP: [u8; 87] = {
    let mut t = [1u8; 87];
    let mut qp = 0;
    while qp < 87 {
        t[qp] = if qp > 70 {
            4
        } else if qp > 50 {
            3
        } else if qp > 30 {
            2
        } else {
            1
        };
        qp += 1;
    }
    t
};

/// Extended-QP ladder used by damage control when even `qp == 51` overshoots
/// the bit budget (spec §4.8).
pub const DAMAGE_CONTROL_QP_LADDER: [u8; 12] = [51, 59, 63, 66, 67, 68, 69, 77, 81, 84, 85, 86];

/// Coded-block-pattern <-> code_num mapping (Table 9-4) for inter macroblock
/// prediction modes, `chroma_format_idc == 1`. I_16x16 macroblocks carry
/// `coded_block_pattern` implicitly in their `mb_type` code (Table 7-11)
/// rather than as a separately transmitted value, so no intra variant of
/// this table is needed.
pub const CBP_INTER_CODE_TO_CBP: [u8; 48] = [
    0, 16, 1, 2, 4, 8, 32, 3, 5, 10, 12, 15, 47, 7, 11, 13, 14, 6, 9, 31, 35, 37, 42, 44, 33, 34,
    36, 40, 39, 43, 45, 46, 17, 18, 20, 24, 19, 21, 26, 28, 23, 27, 29, 30, 22, 25, 38, 41,
];

/// Reverse lookup: cbp value (0..=47) -> code_num, for the given table.
pub fn cbp_to_code(table: &[u8; 48], cbp: u8) -> u32 {
    table.iter().position(|&v| v == cbp).unwrap_or(0) as u32
}
