use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use nireg_alloc::{AllocationStrategy, Allocator};
use nireg_id::PoolId;
use nireg_reconcile::{PaceLevel, PacePolicy};
use nireg_registry::{
    config::Config,
    coordinator::{AllocationCoordinator, CoordinatorError},
    reconciler::{ReconcileWorker, WorkerConfig},
    state::AppState,
    store::{InMemoryStore, RegisterKey, RegistrySpec, RegistryStore},
};
use tokio::sync::watch;

const MANIFEST: &str = r#"
[[registry]]
namespace = "default"
name = "ni-registry"
size = 1000

[[register]]
namespace = "default"
name = "reg-prov"
registry = "ni-registry"
selector = { name = "prov" }
source-tag = { vpc = "test" }

[[register]]
namespace = "default"
name = "reg-infra"
registry = "ni-registry"
selector = { name = "infra" }
"#;

fn pool(name: &str) -> PoolId {
    PoolId::new("default", name).unwrap()
}

fn coordinator_with(pools: &[(&str, u32)]) -> (Arc<InMemoryStore>, Arc<AllocationCoordinator>) {
    let store = Arc::new(InMemoryStore::new());
    let coordinator = Arc::new(AllocationCoordinator::new(store.clone()));
    for (name, size) in pools {
        store.upsert_registry(pool(name), RegistrySpec::with_size(*size));
        coordinator.init_from_store(&pool(name)).unwrap();
    }
    (store, coordinator)
}

#[test]
fn small_pool_fills_and_reuses_freed_index() {
    let (_, coordinator) = coordinator_with(&[("small", 4)]);
    let p = pool("small");

    let keys = ["a", "b", "c", "d"];
    let indices: Vec<u32> = keys
        .iter()
        .map(|key| coordinator.allocate(&p, "reg", key, None).unwrap())
        .collect();
    // Placement is a function of the keys and insertion order alone.
    let mut reference = Allocator::new(4).unwrap();
    let expected: Vec<u32> = keys
        .iter()
        .map(|key| reference.insert(key, "reg", None).unwrap().index)
        .collect();
    assert_eq!(indices, expected);

    assert!(matches!(
        coordinator.allocate(&p, "reg", "e", None),
        Err(CoordinatorError::PoolExhausted { capacity: 4, .. })
    ));

    // Existing keys keep their index even when the pool is full.
    assert_eq!(coordinator.allocate(&p, "reg", "c", None).unwrap(), indices[2]);

    // Only one slot is free, so the next key must land there.
    coordinator.release(&p, "reg", "b", None).unwrap();
    assert_eq!(coordinator.allocate(&p, "reg", "e", None).unwrap(), indices[1]);

    // Keys placed after the freed slot are still reachable.
    for (key, index) in keys.iter().zip(&indices) {
        if *key != "b" {
            assert_eq!(coordinator.allocate(&p, "reg", key, None).unwrap(), *index);
        }
    }

    let status = coordinator.status(&p);
    assert_eq!(status.allocated, 4);
    assert_eq!(status.available, 0);
}

#[test]
fn first_available_pool_fills_from_zero() {
    let (store, coordinator) = coordinator_with(&[]);
    let p = pool("ordered");
    store.upsert_registry(p.clone(), RegistrySpec::with_size(4));
    coordinator
        .init_with_strategy(&p, 4, AllocationStrategy::FirstAvailable)
        .unwrap();

    let indices: Vec<u32> = ["d", "c", "b", "a"]
        .iter()
        .map(|key| coordinator.allocate(&p, "reg", key, None).unwrap())
        .collect();
    assert_eq!(indices, vec![0, 1, 2, 3]);

    coordinator.release(&p, "reg", "c", None).unwrap();
    assert_eq!(coordinator.allocate(&p, "reg", "e", None).unwrap(), 1);
    assert_eq!(
        coordinator.get_allocated(&p).used,
        vec!["d", "e", "b", "a"]
    );
}

#[test]
fn concurrent_registrations_get_distinct_indices() {
    let (_, coordinator) = coordinator_with(&[("ni-registry", 1000)]);
    let p = pool("ni-registry");

    let indices: Vec<u32> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let coordinator = &coordinator;
                let p = &p;
                scope.spawn(move || {
                    (0..25)
                        .map(|i| {
                            let key = format!("key-{worker}-{i}");
                            coordinator.allocate(p, "reg", &key, None).unwrap()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect()
    });

    let distinct: HashSet<_> = indices.iter().copied().collect();
    assert_eq!(distinct.len(), 100);
    assert!(indices.iter().all(|index| *index < 1000));

    let snapshot = coordinator.get_allocated(&p);
    assert_eq!(snapshot.allocated, 100);
    assert_eq!(snapshot.used.len(), 100);
}

#[test]
fn pools_do_not_share_indices_or_pace() {
    let (_, coordinator) = coordinator_with(&[("a", 8), ("b", 8)]);
    let policy = PacePolicy::default();

    coordinator.allocate(&pool("a"), "reg", "prov", None).unwrap();
    coordinator.next_delay(&pool("a"), &policy);

    assert_eq!(coordinator.get_allocated(&pool("a")).allocated, 1);
    assert!(coordinator.get_allocated(&pool("b")).is_empty());
    assert_eq!(coordinator.pace_level(&pool("a")), PaceLevel::new(1));
    assert_eq!(coordinator.pace_level(&pool("b")), PaceLevel::RESET);
}

#[test]
fn pacing_follows_mutations() {
    let (_, coordinator) = coordinator_with(&[("ni-registry", 8)]);
    let p = pool("ni-registry");
    let policy = PacePolicy::default();

    let delays: Vec<_> = (0..5).map(|_| coordinator.next_delay(&p, &policy)).collect();
    assert_eq!(
        delays,
        vec![
            Duration::from_secs(1),
            Duration::from_secs(5),
            Duration::from_secs(5),
            Duration::from_secs(60),
            Duration::from_secs(60),
        ]
    );

    coordinator.allocate(&p, "reg", "prov", None).unwrap();
    assert_eq!(coordinator.next_delay(&p, &policy), Duration::from_secs(1));

    coordinator.delete(&p);
    assert_eq!(coordinator.pace_level(&p), PaceLevel::INACTIVE);
}

#[test]
fn status_serializes_for_mirroring() {
    let (_, coordinator) = coordinator_with(&[("ni-registry", 4)]);
    let p = pool("ni-registry");
    coordinator.allocate(&p, "reg", "prov", None).unwrap();

    let value = serde_json::to_value(coordinator.status(&p)).unwrap();
    assert_eq!(value["total"], 4);
    assert_eq!(value["allocated"], 1);
    assert_eq!(value["available"], 3);
    assert_eq!(value["used"], serde_json::json!(["prov"]));
}

#[tokio::test]
async fn worker_converges_manifest() {
    let store = Arc::new(InMemoryStore::from_manifest_str(MANIFEST).unwrap());
    let config = Config::from_vars(|key| (key == "NIREG_TICK_INTERVAL_MS").then(|| "10".into()))
        .unwrap();
    let state = AppState::new(store.clone(), &config);
    let worker = ReconcileWorker::new(
        state.coordinator().clone(),
        store.clone(),
        WorkerConfig {
            tick_interval: config.tick_interval,
            pace_policy: config.pace_policy.clone(),
        },
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { worker.run(shutdown_rx).await });

    let p = pool("ni-registry");
    let converged = async {
        loop {
            let indexed = store.registers().iter().all(|r| r.index.is_some());
            let status = store.registry(&p).unwrap().status;
            if indexed && status.as_ref().is_some_and(|s| s.allocated == 2) {
                return status.unwrap();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    let status = tokio::time::timeout(Duration::from_secs(10), converged)
        .await
        .expect("worker did not converge");

    assert_eq!(status.total, 1000);
    assert_eq!(status.available, 998);
    let mut used = status.used.clone();
    used.sort();
    assert_eq!(used, vec!["infra".to_string(), "prov".to_string()]);

    // Deleting a register releases its index on a later pass.
    store
        .mark_register_deleting(&RegisterKey::new("default", "reg-prov"))
        .unwrap();
    let released = async {
        while state.coordinator().get_allocated(&p).allocated != 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(10), released)
        .await
        .expect("register was not released");
    assert!(store
        .register(&RegisterKey::new("default", "reg-prov"))
        .is_none());

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
}
