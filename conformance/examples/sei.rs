use std::io::Write;

use conformance::generate_picture;
use h264_baseline_codec::nal_unit::{NalRefIdc, NalUnit, NalUnitType};
use h264_baseline_codec::sei::*;
use h264_baseline_codec::{Codec, Params};

/// Create a precision time stamp as described in MISB Standard 0604, given a
/// timestamp in microseconds since the Unix epoch.
fn precision_time_stamp(timestamp_micros: i64) -> UserDataUnregistered {
    let precision_time_stamp_bytes: [u8; 8] = timestamp_micros.to_be_bytes();

    let mut payload: Vec<u8> = vec![0u8; 12];
    payload[0] = 0x0F;
    payload[1..3].copy_from_slice(&precision_time_stamp_bytes[0..2]);
    payload[3] = 0xff;
    payload[4..6].copy_from_slice(&precision_time_stamp_bytes[2..4]);
    payload[6] = 0xff;
    payload[7..9].copy_from_slice(&precision_time_stamp_bytes[4..6]);
    payload[9] = 0xff;
    payload[9..11].copy_from_slice(&precision_time_stamp_bytes[6..8]);

    UserDataUnregistered::new(*b"MISPmicrosectime", payload)
}

fn timestamp_to_nal_unit(timestamp_micros: i64) -> Vec<u8> {
    to_annex_b(precision_time_stamp(timestamp_micros))
}

fn sei_comment(msg: Vec<u8>) -> Vec<u8> {
    // x264 says "random ID number generated according to ISO-11578", so we made up ours here.
    let uuid = b"\x05\xdeG\x06\x03u_T\xe9\x8e4P\x1d\x0erq";
    let udu = UserDataUnregistered::new(*uuid, msg);
    to_annex_b(udu)
}

fn to_annex_b(udu: UserDataUnregistered) -> Vec<u8> {
    let rbsp_data = SupplementalEnhancementInformation::UserDataUnregistered(udu).to_rbsp();
    NalUnit::new(
        NalRefIdc::Zero,
        NalUnitType::SupplementalEnhancementInformation,
        rbsp_data,
    )
    .to_annex_b_data()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut fd = std::fs::File::create("sei.h264")?;

    let params = Params::new(1920, 1080);
    let (initial_nal_units, mut codec) = Codec::open(params)?;

    // 2022-11-19T12:34:56Z, expressed directly in microseconds since the
    // Unix epoch to avoid depending on a calendar crate here.
    let mut timestamp_micros: i64 = 1_668_860_096_000_000;

    fd.write_all(&sei_comment(b"hello from rust".to_vec()))?;
    for nal in &initial_nal_units {
        fd.write_all(&nal.to_annex_b_data())?;
    }

    for phase in 0..10 {
        let frame = generate_picture(1920, 1080, phase * 4);
        fd.write_all(&timestamp_to_nal_unit(timestamp_micros))?;
        let encoded = codec.code(&frame)?;
        for nal in &encoded.nal_units {
            fd.write_all(&nal.to_annex_b_data())?;
        }
        timestamp_micros += 50_000;
    }
    Ok(())
}
