//! Benchmarks for the frame receive path
//!
//! Measures what the subscriber does per datagram:
//! - header parsing and frame decoding into a reused buffer
//! - decoding when the frame shape changes every datagram
//! - deep copies for owned snapshots

use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use cortex_stream::Frame;
use cortex_stream::protocol::{Packet, codec};
use cortex_stream::test_utils::{frame_datagram, sample_frame};
use std::hint::black_box;

fn bench_decode_steady_shape(c: &mut Criterion) {
    let datagram = frame_datagram(&sample_frame(1), 0);

    let mut group = c.benchmark_group("frame_decode");
    group.throughput(Throughput::Bytes(datagram.len() as u64));

    group.bench_function("reused_buffer", |b| {
        let mut frame = Frame::default();
        b.iter(|| {
            let packet = Packet::parse(black_box(&datagram)).expect("valid datagram");
            codec::decode_frame_into(packet.payload, &mut frame).expect("valid frame");
            black_box(frame.frame_number)
        })
    });

    group.bench_function("fresh_buffer", |b| {
        b.iter(|| {
            let packet = Packet::parse(black_box(&datagram)).expect("valid datagram");
            let mut frame = Frame::default();
            codec::decode_frame_into(packet.payload, &mut frame).expect("valid frame");
            black_box(frame)
        })
    });

    group.finish();
}

fn bench_decode_changing_shape(c: &mut Criterion) {
    let full = frame_datagram(&sample_frame(1), 0);
    let mut reduced_frame = sample_frame(2);
    reduced_frame.bodies.truncate(1);
    reduced_frame.unidentified_markers.clear();
    let reduced = frame_datagram(&reduced_frame, 0);

    c.bench_function("frame_decode_alternating_shape", |b| {
        let mut frame = Frame::default();
        let mut toggle = false;
        b.iter(|| {
            toggle = !toggle;
            let datagram = if toggle { &full } else { &reduced };
            let packet = Packet::parse(black_box(datagram)).expect("valid datagram");
            codec::decode_frame_into(packet.payload, &mut frame).expect("valid frame");
            black_box(frame.bodies.len())
        })
    });
}

fn bench_snapshot_copy(c: &mut Criterion) {
    let source = sample_frame(1);

    let mut group = c.benchmark_group("frame_snapshot");

    group.bench_function("copy_into_reused", |b| {
        let mut dst = Frame::default();
        b.iter(|| {
            source.copy_into(black_box(&mut dst)).expect("copy fits");
            black_box(dst.frame_number)
        })
    });

    group.bench_function("clone", |b| b.iter(|| black_box(source.clone())));

    group.finish();
}

criterion_group!(benches, bench_decode_steady_shape, bench_decode_changing_shape, bench_snapshot_copy);
criterion_main!(benches);
