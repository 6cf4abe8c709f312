//! Benchmarks for the sharded registry store and config publishing

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use registry_config_server::config::{
    ConfigChangeNotifier, ConfigEntries, ConfigKey, ConfigSnapshotStore, MemoryBackend,
    NotifierConfig, SnapshotStoreConfig,
};
use registry_config_server::domain::system_clock;
use registry_config_server::registry::{InstanceRegistration, InstanceStatus, RegistryStore};
use std::sync::Arc;

fn populated_store(count: usize) -> Arc<RegistryStore> {
    let store = RegistryStore::new();
    for i in 0..count {
        let registration = InstanceRegistration::new(
            format!("inst-{:04}", i),
            format!("app-{}", i % 10),
            format!("10.0.{}.{}", i / 256, i % 256),
            8080,
        );
        let _ = store.register(registration);
        let _ = store.set_status(format!("inst-{:04}", i), InstanceStatus::Up);
    }
    store
}

fn bench_register(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry_store");
    group.throughput(Throughput::Elements(1));

    group.bench_function("register_single_instance", |b| {
        let store = RegistryStore::new();
        let mut counter = 0u64;

        b.iter(|| {
            counter += 1;
            let registration = InstanceRegistration::new(
                format!("inst-{}", counter),
                "orders",
                format!("host-{}.local", counter),
                8080,
            );
            let _ = store.register(black_box(registration));
        });
    });

    group.finish();
}

fn bench_renew(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry_store");
    group.throughput(Throughput::Elements(1));

    let store = populated_store(1000);

    group.bench_function("renew", |b| {
        let mut counter = 0u64;
        b.iter(|| {
            counter += 1;
            let _ = store.renew(black_box(format!("inst-{:04}", counter % 1000)));
        });
    });

    group.finish();
}

fn bench_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry_store");
    group.throughput(Throughput::Elements(1));

    let store = populated_store(1000);

    group.bench_function("lookup_100_of_1000", |b| {
        b.iter(|| store.lookup(black_box("app-3")));
    });

    group.finish();
}

fn bench_concurrent_renewals(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry_store");
    group.throughput(Throughput::Elements(100));

    let store = populated_store(1000);
    let rt = tokio::runtime::Runtime::new().unwrap();

    group.bench_function("concurrent_100_renewals", |b| {
        b.iter(|| {
            rt.block_on(async {
                let mut handles = Vec::new();
                for i in 0..100 {
                    let store = store.clone();
                    handles.push(tokio::spawn(async move {
                        let _ = store.renew(format!("inst-{:04}", (i * 7) % 1000));
                    }));
                }
                for handle in handles {
                    let _ = handle.await;
                }
            });
        });
    });

    group.finish();
}

fn bench_config_publish(c: &mut Criterion) {
    let mut group = c.benchmark_group("config_store");
    group.throughput(Throughput::Elements(1));

    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = rt.block_on(async {
        let notifier = ConfigChangeNotifier::new(NotifierConfig::default(), system_clock());
        ConfigSnapshotStore::open(
            SnapshotStoreConfig::default(),
            Arc::new(MemoryBackend::new()),
            notifier,
            system_clock(),
        )
        .await
        .unwrap()
    });
    let key = ConfigKey::new("orders", "prod", "main");
    let mut entries = ConfigEntries::new();
    for i in 0..50 {
        entries.insert(format!("property.{}", i), format!("value-{}", i));
    }

    group.bench_function("publish_50_entries", |b| {
        b.iter(|| {
            rt.block_on(async {
                let _ = store.publish(&key, black_box(entries.clone())).await;
            });
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_register,
    bench_renew,
    bench_lookup,
    bench_concurrent_renewals,
    bench_config_publish,
);
criterion_main!(benches);
