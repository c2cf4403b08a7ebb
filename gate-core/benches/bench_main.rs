use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use tokio::runtime::Runtime;

use gate_core::diff::diff_stream_index;
use gate_core::hash::{hash128, hash256};
use gate_core::index::memory::MemoryIndex;
use gate_core::index::{Index, KeyValue, KvStream};

fn bench_hash(c: &mut Criterion) {
    let mut group = c.benchmark_group("hash");
    for size in [16usize, 256, 4096] {
        let data = vec![0x5au8; size];
        group.bench_with_input(format!("hash128/{size}"), &data, |b, data| {
            b.iter(|| hash128(black_box(data)))
        });
        group.bench_with_input(format!("hash256/{size}"), &data, |b, data| {
            b.iter(|| hash256(black_box(data)))
        });
    }
    group.finish();
}

fn kv_stream(n: usize) -> KvStream {
    let items: Vec<KeyValue> = (0..n)
        .map(|i| KeyValue { key: format!("key-{i}").into_bytes(), value: Some(format!("value-{i}").into_bytes()) })
        .collect();
    Box::pin(tokio_stream::iter(items))
}

fn bench_diff_stream_index(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    c.bench_function("diff_stream_index/10k_unchanged", |b| {
        b.iter_batched(
            || {
                let index = MemoryIndex::new(true, false);
                rt.block_on(index.index(kv_stream(10_000), None)).unwrap();
                index
            },
            |index| {
                rt.block_on(async {
                    let (tx, mut rx) = tokio::sync::mpsc::channel(1024);
                    let cancel = tokio_util::sync::CancellationToken::new();
                    let reference = kv_stream(10_000);
                    let drain = tokio::spawn(async move { while rx.recv().await.is_some() {} });
                    diff_stream_index(reference, &index, tx, cancel).await.unwrap();
                    drain.await.unwrap();
                });
            },
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, bench_hash, bench_diff_stream_index);
criterion_main!(benches);
