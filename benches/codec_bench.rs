//! Criterion benchmark untuk TcpBuffer dan TinyPB codec
//!
//! Run dengan: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use tinyrpc_net::protocol::{checksum32, Codec, TinyPbCodec, TinyPbFrame};
use tinyrpc_net::TcpBuffer;

fn frame(payload_len: usize) -> TinyPbFrame {
    TinyPbFrame::new("123456", "EchoService.echo", vec![0xab; payload_len])
}

fn bench_buffer(c: &mut Criterion) {
    let mut group = c.benchmark_group("tcp_buffer");
    group.throughput(Throughput::Bytes(64));

    // Append lalu consume: cursor reset ke 0 setiap kali kosong
    group.bench_function("append_consume_64", |b| {
        let mut buf = TcpBuffer::new(4096);
        let chunk = [7u8; 64];
        b.iter(|| {
            buf.append(black_box(&chunk));
            black_box(buf.consume(64));
        });
    });

    // Partial consume memicu compaction berkala
    group.bench_function("append_partial_consume", |b| {
        let mut buf = TcpBuffer::new(4096);
        let chunk = [7u8; 64];
        b.iter(|| {
            buf.append(black_box(&chunk));
            buf.advance_read(48);
            if buf.readable_bytes() > 2048 {
                buf.clear();
            }
        });
    });

    group.finish();
}

fn bench_codec(c: &mut Criterion) {
    let codec = TinyPbCodec::default();
    let mut group = c.benchmark_group("tinypb_codec");

    for payload_len in [16usize, 256, 4096].iter() {
        let f = frame(*payload_len);
        group.throughput(Throughput::Bytes(f.encoded_len() as u64));

        group.bench_function(format!("encode_{}", payload_len), |b| {
            let mut buf = TcpBuffer::new(8192);
            b.iter(|| {
                codec.encode_frame(black_box(&f), &mut buf).unwrap();
                buf.clear();
            });
        });

        group.bench_function(format!("decode_{}", payload_len), |b| {
            let mut encoded = TcpBuffer::new(8192);
            codec.encode_frame(&f, &mut encoded).unwrap();
            let bytes = encoded.readable_slice().to_vec();
            let mut buf = TcpBuffer::new(8192);
            b.iter(|| {
                buf.append(&bytes);
                black_box(codec.decode(&mut buf));
            });
        });
    }

    group.finish();
}

fn bench_throughput(c: &mut Criterion) {
    let codec = TinyPbCodec::default();
    let mut group = c.benchmark_group("throughput");

    // Batch decode dari satu read burst
    for batch_size in [10usize, 100, 1000].iter() {
        let frames: Vec<TinyPbFrame> = (0..*batch_size).map(|_| frame(128)).collect();
        let mut encoded = TcpBuffer::new(64 * 1024);
        codec.encode(&frames, &mut encoded).unwrap();
        let bytes = encoded.readable_slice().to_vec();

        group.throughput(Throughput::Elements(*batch_size as u64));
        group.bench_function(format!("decode_batch_{}", batch_size), |b| {
            let mut buf = TcpBuffer::new(bytes.len());
            b.iter(|| {
                buf.append(&bytes);
                let decoded = codec.decode(&mut buf);
                assert_eq!(decoded.len(), *batch_size);
            });
        });
    }

    group.bench_function("checksum_4k", |b| {
        let data = vec![0x5au8; 4096];
        b.iter(|| black_box(checksum32(black_box(&data))));
    });

    group.finish();
}

criterion_group!(benches, bench_buffer, bench_codec, bench_throughput);
criterion_main!(benches);
