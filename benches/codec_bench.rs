use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use snapback::streaming::{decode_stream, encode_stream, SnapshotRelay, StreamEncoder};
use tokio::runtime::Runtime;

fn make_payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i.wrapping_mul(31) % 251) as u8).collect()
}

fn encoded(rt: &Runtime, data: &[u8]) -> Vec<u8> {
    rt.block_on(async {
        let mut out = Vec::with_capacity(data.len() + 1024);
        let mut src = data;
        encode_stream(&mut src, &mut out).await.unwrap();
        out
    })
}

fn bench_encode(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("encode_stream");
    group.sample_size(20);

    for size_mb in [1usize, 16, 64] {
        let data = make_payload(size_mb * 1024 * 1024);
        group.throughput(Throughput::Bytes(data.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(format!("{}MB", size_mb)), &data, |b, data| {
            b.iter(|| {
                rt.block_on(async {
                    let mut src = black_box(&data[..]);
                    let mut out = Vec::with_capacity(data.len() + 1024);
                    encode_stream(&mut src, &mut out).await.unwrap()
                })
            });
        });
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("decode_stream");
    group.sample_size(20);

    for size_mb in [1usize, 16, 64] {
        let data = make_payload(size_mb * 1024 * 1024);
        let stream = encoded(&rt, &data);
        group.throughput(Throughput::Bytes(data.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(format!("{}MB", size_mb)), &stream, |b, stream| {
            b.iter(|| {
                rt.block_on(async {
                    let mut sink = tokio::io::sink();
                    decode_stream(black_box(&stream[..]), &mut sink).await.unwrap()
                })
            });
        });
    }
    group.finish();
}

fn bench_relay(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("snapshot_relay");
    group.sample_size(20);

    let data = make_payload(64 * 1024 * 1024);
    group.throughput(Throughput::Bytes(data.len() as u64));
    group.bench_function("64MB", |b| {
        b.iter(|| {
            rt.block_on(async {
                let relay = SnapshotRelay::new();
                let mut src = black_box(&data[..]);
                let mut encoder = StreamEncoder::new(tokio::io::sink());
                encoder.write_start().await.unwrap();
                let stats = relay.run(&mut src, &mut encoder).await.unwrap();
                encoder.finish().await.unwrap();
                stats
            })
        });
    });
    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode, bench_relay);
criterion_main!(benches);
