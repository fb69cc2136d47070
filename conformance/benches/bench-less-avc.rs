#![feature(test)]
extern crate test;

#[cfg(test)]
mod bench {
    use test::Bencher;

    use conformance::generate_picture;
    use h264_baseline_codec::nal_unit::{NalRefIdc, NalUnit, NalUnitType};
    use h264_baseline_codec::{Codec, Params, RbspData};

    fn bench_code(b: &mut Bencher, width: u32, height: u32) {
        let params = Params::new(width, height).with_fixed_qp(28);
        let (_initial, mut codec) = Codec::open(params).unwrap();
        let frame = generate_picture(width, height, 0);
        // Warm up past the initial IDR so steady-state P-picture cost is measured.
        codec.code(&frame).unwrap();
        b.iter(|| {
            codec.code(&frame).unwrap();
        });
    }

    #[bench]
    fn encapsulate_raw(b: &mut Bencher) {
        let one_megabyte = NalUnit::new(
            NalRefIdc::Zero,
            NalUnitType::CodedSliceOfAnIDRPicture,
            RbspData {
                data: vec![0u8; 1024 * 1024],
            },
        );
        b.iter(|| {
            one_megabyte.to_annex_b_data();
        });
    }

    #[bench]
    fn code_1920x1080(b: &mut Bencher) {
        bench_code(b, 1920, 1080)
    }

    #[bench]
    fn code_640x480(b: &mut Bencher) {
        bench_code(b, 640, 480)
    }

    #[bench]
    fn write_1920x1080(b: &mut Bencher) {
        let out_buf = std::io::Cursor::new(Vec::new());
        let mut writer = h264_baseline_codec::H264Writer::new(out_buf).unwrap();
        let frame = generate_picture(1920, 1080, 0);
        writer.write(&frame).unwrap();
        b.iter(|| {
            writer.write(&frame).unwrap();
        });
    }
}
