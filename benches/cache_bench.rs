use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use indexcache::{BytesSerializer, Durability, IndexedCache, Options};
use rand::Rng;
use tempdir::TempDir;

type Cache = IndexedCache<String, Vec<u8>, BytesSerializer>;

fn open_cache(dir: &TempDir) -> Cache {
    let options = Options::new()
        .with_dir(dir.path())
        .with_durability(Durability::Eventual);
    IndexedCache::open_with_options(options, BytesSerializer).unwrap()
}

// Keys are deterministic so runs are comparable, values are random
fn generate_test_data(size: usize, value_size: usize) -> Vec<(String, Vec<u8>)> {
    let mut rng = rand::rng();
    (0..size)
        .map(|i| {
            let key = format!("task-{:08}", i);
            let value: Vec<u8> = (0..value_size).map(|_| rng.random()).collect();
            (key, value)
        })
        .collect()
}

fn benchmark_put(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_put");

    for size in [100, 1000, 10000].iter() {
        group.throughput(Throughput::Elements(*size as u64));

        group.bench_with_input(BenchmarkId::new("put", size), size, |b, &size| {
            b.iter(|| {
                let temp_dir = TempDir::new("bench").unwrap();
                let mut cache = open_cache(&temp_dir);

                for (key, value) in generate_test_data(size, 64) {
                    cache.put(black_box(&key), black_box(&value)).unwrap();
                }
            });
        });
    }

    group.finish();
}

fn benchmark_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_get");

    for size in [1000, 10000].iter() {
        group.throughput(Throughput::Elements(*size as u64));

        let temp_dir = TempDir::new("bench").unwrap();
        let mut cache = open_cache(&temp_dir);
        let data = generate_test_data(*size, 64);
        for (key, value) in &data {
            cache.put(key, value).unwrap();
        }

        group.bench_with_input(BenchmarkId::new("get", size), size, |b, _| {
            b.iter(|| {
                for (key, _) in &data {
                    black_box(cache.get(key).unwrap());
                }
            });
        });
    }

    group.finish();
}

fn benchmark_remove(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_remove");

    for size in [100, 1000].iter() {
        group.throughput(Throughput::Elements(*size as u64));

        group.bench_with_input(BenchmarkId::new("remove", size), size, |b, &size| {
            b.iter(|| {
                let temp_dir = TempDir::new("bench").unwrap();
                let mut cache = open_cache(&temp_dir);

                let data = generate_test_data(size, 64);
                for (key, value) in &data {
                    cache.put(key, value).unwrap();
                }

                for (key, _) in data {
                    cache.remove(black_box(&key)).unwrap();
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_put, benchmark_get, benchmark_remove);
criterion_main!(benches);
