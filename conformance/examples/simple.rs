use conformance::generate_picture;

fn main() {
    let fd = std::fs::File::create("simple.h264").unwrap();
    let mut writer = h264_baseline_codec::H264Writer::new(fd).unwrap();
    for phase in 0..10 {
        let frame = generate_picture(1920, 1080, phase * 4);
        writer.write(&frame).unwrap();
    }
}
