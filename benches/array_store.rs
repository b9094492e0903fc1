// Apache License, Version 2.0

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};

use array_store::ArrayStore;

const DATA_LEN: usize = 64 * 1024;
const STRIDE: usize = 4;
const CHUNK_COUNT: usize = 64;
const VERSIONS: usize = 16;

/// A chain of versions, each differing from the previous by one small
/// overwritten region.
fn version_chain(rng: &mut StdRng) -> Vec<Vec<u8>> {
    let mut data = vec![0u8; DATA_LEN];
    rng.fill_bytes(&mut data);

    let mut versions = Vec::with_capacity(VERSIONS);
    versions.push(data.clone());
    for _ in 1..VERSIONS {
        let offset = rng.gen_range(0..(DATA_LEN - 256));
        for b in &mut data[offset..(offset + 256)] {
            *b = rng.gen();
        }
        versions.push(data.clone());
    }
    versions
}

fn bench_state_add(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(42);
    let versions = version_chain(&mut rng);

    let mut group = c.benchmark_group("state_add");
    group.throughput(Throughput::Bytes((DATA_LEN * VERSIONS) as u64));
    group.bench_function("edit_chain", |b| {
        b.iter(|| {
            let mut bs = ArrayStore::new(STRIDE, CHUNK_COUNT);
            let mut state_prev = None;
            for data in &versions {
                let state = bs.state_add(black_box(data), state_prev.as_deref());
                state_prev = Some(state);
            }
            black_box(bs.calc_size_compacted_get())
        })
    });
    group.finish();
}

fn bench_data_get(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(42);
    let versions = version_chain(&mut rng);

    let mut bs = ArrayStore::new(STRIDE, CHUNK_COUNT);
    let mut states = Vec::with_capacity(versions.len());
    let mut state_prev = None;
    for data in &versions {
        let state = bs.state_add(data, state_prev.as_deref());
        states.push(std::rc::Rc::clone(&state));
        state_prev = Some(state);
    }

    let mut group = c.benchmark_group("data_get");
    group.throughput(Throughput::Bytes((DATA_LEN * VERSIONS) as u64));
    group.bench_function("expand_all", |b| {
        let mut data = vec![0u8; DATA_LEN];
        b.iter(|| {
            for state in &states {
                state.data_get(&mut data);
                black_box(&data);
            }
        })
    });
    group.finish();
}

criterion_group!(benches, bench_state_add, bench_data_get);
criterion_main!(benches);
