use chrono::Utc;
use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use rand::Rng;

use magstream::config::{Device, SensorConfig};
use magstream::decoder::{parse_hex_signed, FieldDecoder, ObsDaqDecoder};
use magstream::framing::{FixedLengthAssembler, FrameAssembler, RawFrame};

const LINE: &str = ":R,00,200131.143739.617,*0259FEFFF1BFFFFCEDL:04AC11CC000B000B000B";

fn bench_fixed_length_burst(c: &mut Criterion) {
    let mut frame = b"48456123 +- 00012 [00] 01-31-20 14:37:39.61".to_vec();
    frame.resize(Device::POS1_FRAME_LEN, 0);
    let burst = frame.repeat(16);

    let mut group = c.benchmark_group("framing");
    group.throughput(Throughput::Bytes(burst.len() as u64));
    group.bench_function("fixed_length_burst", |b| {
        let mut asm = FixedLengthAssembler::new(Device::POS1_FRAME_LEN);
        b.iter(|| {
            let frames = asm.feed(&burst);
            assert_eq!(frames.len(), 16);
        });
    });
    group.finish();
}

fn bench_obsdaq_decode(c: &mut Criterion) {
    let sensor = SensorConfig::builder()
        .sensor_id("OBSDAQ_01")
        .device(Device::ObsDaq)
        .supplement(true)
        .build();
    let decoder = ObsDaqDecoder::new(true);
    let frame = RawFrame {
        offset: 0,
        data: LINE.as_bytes().to_vec(),
    };
    let received = Utc::now();

    c.bench_function("obsdaq_decode", |b| {
        b.iter(|| {
            let rec = decoder.decode(&frame, &sensor, received);
            assert!(rec.is_valid());
        });
    });
}

// Sign extend random 24-bit samples.
fn bench_hex_signed(c: &mut Criterion) {
    let mut rng = rand::thread_rng();
    let samples: Vec<String> = (0..1024)
        .map(|_| format!("{:06X}", rng.gen::<u32>() & 0x00FF_FFFF))
        .collect();

    c.bench_function("parse_hex_signed_24", |b| {
        b.iter(|| {
            for s in &samples {
                assert!(parse_hex_signed(s).is_some());
            }
        });
    });
}

criterion_group!(
    benches,
    bench_fixed_length_burst,
    bench_obsdaq_decode,
    bench_hex_signed
);
criterion_main!(benches);
