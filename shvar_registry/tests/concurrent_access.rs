//! Concurrency tests: every thread maps the segment on its own, so the
//! cross-process locks are the only thing keeping them apart.

use shvar::config::RegistryConfig;
use shvar_registry::{Registry, SharedVar, ShmResult, tags};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use tempfile::TempDir;

const THREADS: usize = 8;

fn config(dir: &TempDir) -> RegistryConfig {
    RegistryConfig {
        shm_dir: dir.path().to_path_buf(),
        capacity: 1024 * 1024,
        ..RegistryConfig::named("concurrent")
    }
}

#[test]
fn test_racing_creators_agree_on_one_value() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let barrier = Arc::new(Barrier::new(THREADS));

    let results: Vec<(bool, u64)> = thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS as u64)
            .map(|id| {
                let config = config.clone();
                let barrier = Arc::clone(&barrier);
                s.spawn(move || {
                    let registry = Registry::open(&config).unwrap();
                    barrier.wait();

                    let var = SharedVar::<u64>::builder("race")
                        .persistent(true)
                        .initial(id + 100)
                        .open(&registry)
                        .unwrap();
                    barrier.wait();
                    let seen = (var.is_owner(), var.get());
                    barrier.wait();
                    seen
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let creators = results.iter().filter(|(created, _)| *created).count();
    assert_eq!(creators, 1);

    let value = results[0].1;
    assert!((100..100 + THREADS as u64).contains(&value));
    assert!(results.iter().all(|(_, v)| *v == value));

    let registry = Registry::open(&config).unwrap();
    let info = registry.exists("race").unwrap().unwrap();
    assert_eq!(info.ref_count, 0);
}

#[test]
fn test_counter_updates_from_every_mapping() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let registry = Registry::open(&config).unwrap();
    let total = SharedVar::<AtomicU64>::open(&registry, "ticks").unwrap();

    thread::scope(|s| {
        for _ in 0..THREADS {
            let config = config.clone();
            s.spawn(move || {
                let registry = Registry::open(&config).unwrap();
                let ticks = SharedVar::<AtomicU64>::open(&registry, "ticks").unwrap();
                for _ in 0..1000 {
                    ticks.fetch_add(1, Ordering::Relaxed);
                }
            });
        }
    });

    assert_eq!(total.load(Ordering::Relaxed), THREADS as u64 * 1000);
    assert_eq!(total.ref_count(), 1);
}

#[test]
fn test_attach_release_churn_keeps_counts_exact() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let registry = Registry::open(&config).unwrap();
    let anchor = SharedVar::<u32>::open(&registry, "anchor").unwrap();

    thread::scope(|s| {
        for _ in 0..THREADS {
            let config = config.clone();
            s.spawn(move || {
                let registry = Registry::open(&config).unwrap();
                for _ in 0..200 {
                    let var = SharedVar::<u32>::open(&registry, "anchor").unwrap();
                    assert!(var.ref_count() >= 2);
                }
            });
        }
    });

    assert_eq!(anchor.ref_count(), 1);
}

#[test]
fn test_transient_create_destroy_race_never_corrupts() -> ShmResult<()> {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let registry = Registry::open(&config)?;
    let baseline = registry.stats()?.heap;

    thread::scope(|s| {
        for t in 0..THREADS {
            let config = config.clone();
            s.spawn(move || {
                let registry = Registry::open(&config).unwrap();
                for i in 0..100 {
                    // Half the names are shared, so creation and reclamation
                    // of the same record interleave across threads.
                    let name = if i % 2 == 0 {
                        format!("shared_{}", i % 10)
                    } else {
                        format!("private_{t}_{i}")
                    };
                    let var = SharedVar::<[u8; 32]>::builder(&name)
                        .type_tag(tags::FIRST_USER)
                        .initial([t as u8; 32])
                        .open(&registry)
                        .unwrap();
                    let bytes = var.get();
                    assert!(bytes.iter().all(|&b| b == bytes[0]));
                }
            });
        }
    });

    let stats = registry.stats()?;
    assert_eq!(stats.records, 0);
    assert_eq!(stats.heap.allocations, baseline.allocations);
    assert_eq!(stats.heap.used_bytes + stats.heap.free_bytes, stats.heap.total_bytes);
    Ok(())
}

#[test]
fn test_listing_during_churn_never_sees_partial_records() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let registry = Registry::open(&config).unwrap();
    let capacity = registry.capacity() as u64;
    let done = AtomicBool::new(false);

    thread::scope(|s| {
        let writers: Vec<_> = (0..4)
            .map(|t| {
                let config = config.clone();
                s.spawn(move || {
                    let registry = Registry::open(&config).unwrap();
                    for i in 0..300u64 {
                        let var = SharedVar::<u64>::builder(&format!("churn_{t}_{}", i % 7))
                            .initial(i)
                            .open(&registry)
                            .unwrap();
                        drop(var);
                    }
                })
            })
            .collect();

        let done = &done;
        let registry = &registry;
        let reader = s.spawn(move || {
            let mut snapshots = 0usize;
            while !done.load(Ordering::Acquire) {
                let entries = registry.list_all().unwrap();
                for pair in entries.windows(2) {
                    assert!(pair[0].info.name.as_str() < pair[1].info.name.as_str());
                }
                for entry in &entries {
                    let info = &entry.info;
                    assert!(!info.name.is_empty());
                    assert_eq!(info.type_tag, tags::U64);
                    assert_eq!(info.size, 8);
                    assert!(info.offset > 0);
                    assert!(info.offset + info.size as u64 <= capacity);
                    assert_eq!(registry.offset_of(entry.address.as_ptr()).unwrap(), info.offset);
                }
                snapshots += 1;
            }
            snapshots
        });

        for writer in writers {
            writer.join().unwrap();
        }
        done.store(true, Ordering::Release);
        assert!(reader.join().unwrap() > 0);
    });

    assert!(registry.list_all().unwrap().is_empty());
}
