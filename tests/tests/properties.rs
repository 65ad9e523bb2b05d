//! Property checks over seeded random acquire/release/eviction sequences.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use modelshare_foundation::{
    CacheConfig, CachePolicy, Device, InstanceInfo, ModelSharingService, ShareError, ShareMode,
};
use modelshare_kernel::Clock;
use modelshare_testing::{ManualClock, MockBackend, assert_consistent};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

const MODELS: [&str; 4] = ["m-small", "m-medium", "m-large", "m-broken"];
const CALLERS: [&str; 5] = ["u1", "u2", "u3", "u4", "u5"];
const MODES: [ShareMode; 4] = [
    ShareMode::Exclusive,
    ShareMode::Shared,
    ShareMode::Pooled,
    ShareMode::Dynamic,
];
const POLICIES: [CachePolicy; 5] = [
    CachePolicy::Lru,
    CachePolicy::Lfu,
    CachePolicy::Fifo,
    CachePolicy::Ttl,
    CachePolicy::Adaptive,
];

struct Harness {
    service: ModelSharingService,
    backend: Arc<MockBackend>,
    clock: Arc<ManualClock>,
}

fn harness(policy: CachePolicy) -> Harness {
    let backend = MockBackend::new(300.0)
        .with_footprint("m-small", 256.0)
        .with_footprint("m-medium", 700.0)
        .with_footprint("m-large", 1200.0);
    backend.fail_model("m-broken");
    let backend = Arc::new(backend);
    let clock = Arc::new(ManualClock::default());

    let config = CacheConfig::default()
        .with_max_instances(3)
        .with_max_memory_gb(2.0)
        .with_max_holders(2)
        .with_policy(policy)
        .with_ttl_minutes(5)
        .with_device(Device::Cpu);
    let service = ModelSharingService::builder(config, backend.clone())
        .clock(clock.clone())
        .build()
        .unwrap();
    Harness {
        service,
        backend,
        clock,
    }
}

fn held_instances(infos: &[InstanceInfo]) -> HashSet<String> {
    infos
        .iter()
        .filter(|info| !info.holders.is_empty())
        .map(|info| info.instance_id.clone())
        .collect()
}

/// Holder sets and caller sessions mirror each other, checked through the
/// public views only.
fn assert_sessions_mirror_holders(service: &ModelSharingService, infos: &[InstanceInfo]) {
    for info in infos {
        for caller in &info.holders {
            assert!(
                service.caller_instances(caller).contains(&info.instance_id),
                "{caller} holds {} but its session does not list it",
                info.instance_id
            );
        }
    }
    for caller in CALLERS {
        for instance_id in service.caller_instances(caller) {
            let holders = service.holders(&instance_id).unwrap_or_default();
            assert!(
                holders.iter().any(|h| h == caller),
                "{caller} lists {instance_id} without being a holder"
            );
        }
    }
}

fn assert_memory_matches_committed(service: &ModelSharingService, infos: &[InstanceInfo]) {
    let committed: f64 = infos
        .iter()
        .filter(|info| !info.loading)
        .map(|info| info.memory_mb)
        .sum();
    assert!((service.total_memory_mb() - committed).abs() < 1e-6);
}

/// Evict until a pass removes nothing, then check the limits.
///
/// Capacity-driven policies leave only held instances behind. TTL only
/// expires idle instances, so it may settle with fresh unheld ones.
async fn settle_and_check_capacity(service: &ModelSharingService, clock: &ManualClock) {
    while service.run_eviction().await > 0 {}
    let config = service.config();
    let infos = service.list_instances();
    let unheld: Vec<&InstanceInfo> = infos.iter().filter(|i| i.holders.is_empty()).collect();

    assert!(service.instance_count() <= config.max_instances);
    if config.cache_policy == CachePolicy::Ttl {
        let ttl_ms = config.ttl().as_millis() as i64;
        let now = clock.now_millis() as i64;
        for info in unheld {
            assert!(now - info.last_accessed.timestamp_millis() < ttl_ms);
        }
    } else if !unheld.is_empty() {
        assert!(service.total_memory_mb() <= config.max_memory_mb());
    }
}

async fn run_sequence(seed: u64, policy: CachePolicy, steps: usize) {
    let Harness {
        service,
        backend,
        clock,
    } = harness(policy);
    let mut rng = StdRng::seed_from_u64(seed);

    for _ in 0..steps {
        let before = service.list_instances();
        let held_before = held_instances(&before);

        match rng.gen_range(0..10) {
            0..=4 => {
                let model = MODELS[rng.gen_range(0..MODELS.len())];
                let caller = CALLERS[rng.gen_range(0..CALLERS.len())];
                let mode = MODES[rng.gen_range(0..MODES.len())];
                let force_new = rng.gen_bool(0.1);
                match service.acquire_ready(model, caller, mode, force_new).await {
                    Ok(_) => {}
                    Err(ShareError::LoadFailed { model_name, .. }) => {
                        assert_eq!(model_name, "m-broken");
                    }
                    Err(e) => panic!("unexpected error: {e}"),
                }
            }
            5..=7 => {
                let caller = CALLERS[rng.gen_range(0..CALLERS.len())];
                let held = service.caller_instances(caller);
                if let Some(id) = held.choose(&mut rng) {
                    assert!(service.release(id, caller));
                } else {
                    assert!(!service.release("missing", caller));
                }
            }
            8 => settle_and_check_capacity(&service, &clock).await,
            _ => clock.advance(Duration::from_secs(rng.gen_range(1..600))),
        }

        // No held instance disappears, whatever the operation was
        let after = service.list_instances();
        let present: HashSet<String> = after.iter().map(|i| i.instance_id.clone()).collect();
        for id in &held_before {
            assert!(present.contains(id), "held instance {id} was removed");
        }

        assert_consistent!(service);
        assert_memory_matches_committed(&service, &after);
        assert_sessions_mirror_holders(&service, &after);
        assert!(after.iter().all(|info| !info.loading));
    }

    settle_and_check_capacity(&service, &clock).await;
    service.stop().await;
    assert_eq!(backend.live_handles(), 0, "stop must unload every handle");
}

#[tokio::test]
async fn random_sequences_preserve_invariants_for_every_policy() {
    for (i, policy) in POLICIES.into_iter().enumerate() {
        for seed in 0..8u64 {
            run_sequence(seed * 31 + i as u64, policy, 300).await;
        }
    }
}

#[tokio::test]
async fn double_release_equals_single_release() {
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..20 {
        let Harness { service, .. } = harness(CachePolicy::Lru);
        for _ in 0..rng.gen_range(2..12) {
            let model = MODELS[rng.gen_range(0..3)];
            let caller = CALLERS[rng.gen_range(0..CALLERS.len())];
            service
                .acquire_ready(model, caller, ShareMode::Shared, false)
                .await
                .unwrap();
        }

        let caller = CALLERS
            .iter()
            .copied()
            .find(|c| !service.caller_instances(c).is_empty())
            .unwrap();
        let id = service.caller_instances(caller)[0].clone();

        service.release(&id, caller);
        let once = (
            service.list_instances(),
            service.caller_instances(caller),
            service.total_memory_mb(),
        );
        service.release(&id, caller);
        let twice = (
            service.list_instances(),
            service.caller_instances(caller),
            service.total_memory_mb(),
        );
        assert_eq!(once, twice);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_keep_registry_consistent() {
    let backend = MockBackend::new(200.0);
    backend.fail_model("m-broken");
    backend.set_load_delay(Duration::from_millis(1));
    let backend = Arc::new(backend);
    let config = CacheConfig::default()
        .with_max_instances(4)
        .with_max_holders(3)
        .with_device(Device::Cpu);
    let service = ModelSharingService::new(config, backend.clone()).unwrap();
    service.start();

    let tasks: Vec<_> = (0..16)
        .map(|worker| {
            let service = service.clone();
            tokio::spawn(async move {
                let mut rng = StdRng::seed_from_u64(worker);
                let caller = format!("worker-{worker}");
                for _ in 0..40 {
                    let model = MODELS[rng.gen_range(0..MODELS.len())];
                    let mode = MODES[rng.gen_range(0..MODES.len())];
                    match service.acquire_ready(model, &caller, mode, false).await {
                        Ok(Some(id)) => {
                            service
                                .infer(&id, &caller, serde_json::json!(worker))
                                .await
                                .unwrap();
                            if rng.gen_bool(0.8) {
                                service.release(&id, &caller);
                            }
                        }
                        Ok(None) | Err(ShareError::LoadFailed { .. }) => {}
                        Err(e) => panic!("unexpected error: {e}"),
                    }
                    if rng.gen_bool(0.1) {
                        service.run_eviction().await;
                    }
                }
            })
        })
        .collect();

    for result in futures::future::join_all(tasks).await {
        result.unwrap();
    }

    assert_consistent!(service);
    let infos = service.list_instances();
    assert!(infos.iter().all(|info| !info.loading));
    assert_memory_matches_committed(&service, &infos);

    service.stop().await;
    assert_eq!(service.instance_count(), 0);
    assert_eq!(backend.live_handles(), 0);
}
