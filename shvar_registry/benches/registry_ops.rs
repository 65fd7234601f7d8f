//! Registry operation benchmarks

use criterion::{Criterion, criterion_group, criterion_main};
use rand::Rng;
use shvar::config::RegistryConfig;
use shvar_registry::{Registry, SharedVar, tags};
use std::hint::black_box;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tempfile::TempDir;

fn open(dir: &TempDir, name: &str) -> Arc<Registry> {
    let config = RegistryConfig {
        shm_dir: dir.path().to_path_buf(),
        capacity: 4 * 1024 * 1024,
        ..RegistryConfig::named(name)
    };
    Registry::open(&config).unwrap()
}

/// Attach to an existing variable and drop the handle again
fn bench_attach_release(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let registry = open(&dir, "bench_attach");
    let _anchor = SharedVar::<AtomicU64>::open(&registry, "anchor").unwrap();

    c.bench_function("attach_release_existing", |b| {
        b.iter(|| {
            let var = SharedVar::<AtomicU64>::open(&registry, black_box("anchor")).unwrap();
            black_box(var.load(Ordering::Relaxed));
        });
    });
}

/// Create a transient variable and let the drop reclaim it
fn bench_create_reclaim(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let registry = open(&dir, "bench_create");

    c.bench_function("create_reclaim_transient", |b| {
        b.iter(|| {
            let var = SharedVar::<u64>::builder(black_box("scratch"))
                .initial(7u64)
                .open(&registry)
                .unwrap();
            black_box(var.get());
        });
    });
}

/// Random lookups among 500 variables
fn bench_lookup(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let registry = open(&dir, "bench_lookup");
    let names: Vec<String> = (0..500).map(|i| format!("sensor_{i:04}")).collect();
    for name in &names {
        registry
            .create_or_attach(name, tags::F64, 8, "", true)
            .unwrap();
    }
    let mut rng = rand::thread_rng();

    c.bench_function("exists_random_of_500", |b| {
        b.iter(|| {
            let name = &names[rng.gen_range(0..names.len())];
            black_box(registry.exists(name).unwrap());
        });
    });

    c.bench_function("list_all_500", |b| {
        b.iter(|| black_box(registry.list_all().unwrap().len()));
    });
}

/// Hot-path access through an open handle
fn bench_handle_access(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let registry = open(&dir, "bench_access");
    let counter = SharedVar::<AtomicU64>::open(&registry, "counter").unwrap();
    let value = SharedVar::<f64>::open(&registry, "value").unwrap();

    c.bench_function("atomic_fetch_add", |b| {
        b.iter(|| counter.fetch_add(black_box(1), Ordering::Relaxed));
    });

    c.bench_function("volatile_set_get", |b| {
        b.iter(|| {
            value.set(black_box(1.5));
            black_box(value.get())
        });
    });
}

criterion_group!(
    benches,
    bench_attach_release,
    bench_create_reclaim,
    bench_lookup,
    bench_handle_access
);
criterion_main!(benches);
