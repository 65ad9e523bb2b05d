//! End-to-end scenarios against the sharing service with a mock backend and
//! a manual clock.

use std::sync::Arc;
use std::time::Duration;

use modelshare_foundation::{
    CacheConfig, CachePolicy, Device, EvictionTuning, ModelSharingService, ShareError, ShareMode,
};
use modelshare_kernel::ModelHandle;
use modelshare_testing::{ManualClock, MockBackend, assert_consistent};
use serde_json::json;

const MINUTE: Duration = Duration::from_secs(60);

fn setup(
    config: CacheConfig,
    backend: MockBackend,
) -> (ModelSharingService, Arc<MockBackend>, Arc<ManualClock>) {
    let backend = Arc::new(backend);
    let clock = Arc::new(ManualClock::default());
    let service = ModelSharingService::builder(config.with_device(Device::Cpu), backend.clone())
        .clock(clock.clone())
        .build()
        .unwrap();
    (service, backend, clock)
}

#[tokio::test]
async fn scenario_a_reuse_then_soft_reject() {
    let (svc, backend, _) = setup(
        CacheConfig::default().with_max_instances(1),
        MockBackend::default(),
    );

    let id = svc
        .acquire("m1", "userA", ShareMode::Shared, false)
        .await
        .unwrap()
        .expect("first acquire creates an instance");
    svc.commit_instance(&id, ModelHandle::new("weights"), 500.0)
        .await
        .unwrap();
    assert_eq!(svc.total_memory_mb(), 500.0);

    let reused = svc
        .acquire("m1", "userB", ShareMode::Shared, false)
        .await
        .unwrap();
    assert_eq!(reused.as_deref(), Some(id.as_str()));
    assert_eq!(svc.instance_count(), 1);
    assert_eq!(svc.holders(&id).unwrap(), vec!["userA", "userB"]);

    let rejected = svc
        .acquire("m2", "userC", ShareMode::Shared, false)
        .await
        .unwrap();
    assert!(rejected.is_none());
    assert_eq!(svc.instance_count(), 1);
    assert!(svc.caller_instances("userC").is_empty());

    let stats = svc.stats();
    assert_eq!(stats.counters.rejections, 1);
    assert_eq!(stats.counters.hits, 1);
    assert_eq!(backend.load_count(), 0);
    assert_consistent!(svc);
}

#[tokio::test]
async fn scenario_b_ttl_zero_evicts_on_next_pass() {
    let (svc, _, _clock) = setup(
        CacheConfig::default()
            .with_policy(CachePolicy::Ttl)
            .with_ttl_minutes(0),
        MockBackend::default(),
    );

    let popular = svc
        .acquire_ready("m1", "alice", ShareMode::Shared, false)
        .await
        .unwrap()
        .unwrap();
    for caller in ["bob", "carol", "dave"] {
        svc.acquire_ready("m1", caller, ShareMode::Shared, false)
            .await
            .unwrap();
        svc.release(&popular, caller);
    }
    svc.release(&popular, "alice");
    assert!(svc.instance_info(&popular).unwrap().access_count >= 4);

    // No time passes at all
    assert_eq!(svc.run_eviction().await, 1);
    assert!(svc.instance_info(&popular).is_none());
    assert_eq!(svc.total_memory_mb(), 0.0);
}

#[tokio::test]
async fn scenario_c_lru_evicts_older_first() {
    let tuning = EvictionTuning {
        batch_size: 1,
        ..EvictionTuning::default()
    };
    let (svc, _, clock) = setup(
        CacheConfig::default().with_eviction_tuning(tuning),
        MockBackend::default(),
    );

    let older = svc
        .acquire_ready("m-old", "alice", ShareMode::Shared, false)
        .await
        .unwrap()
        .unwrap();
    svc.release(&older, "alice");

    clock.advance(MINUTE * 10);
    let newer = svc
        .acquire_ready("m-new", "bob", ShareMode::Shared, false)
        .await
        .unwrap()
        .unwrap();
    svc.release(&newer, "bob");

    clock.advance(MINUTE * 10);
    // Idle for 20 and 10 minutes respectively
    assert_eq!(svc.run_eviction().await, 1);
    assert!(svc.instance_info(&older).is_none());
    assert!(svc.instance_info(&newer).is_some());
}

#[tokio::test]
async fn scenario_d_release_without_holdings_is_noop() {
    let (svc, _, _) = setup(CacheConfig::default(), MockBackend::default());
    let id = svc
        .acquire_ready("m1", "alice", ShareMode::Shared, false)
        .await
        .unwrap()
        .unwrap();
    let before = svc.stats();

    assert!(!svc.release(&id, "ghost"));
    assert!(!svc.release("no-such-instance", "ghost"));

    let after = svc.stats();
    assert_eq!(after.total_instances, before.total_instances);
    assert_eq!(after.total_active_holders, before.total_active_holders);
    assert_eq!(after.caller_sessions, before.caller_sessions);
    assert_eq!(svc.holders(&id).unwrap(), vec!["alice"]);
    assert_consistent!(svc);
}

#[tokio::test]
async fn scenario_e_load_failure_leaves_no_placeholder() {
    let backend = MockBackend::default();
    backend.fail_model("broken");
    let (svc, backend, _) = setup(CacheConfig::default(), backend);

    svc.acquire_ready("healthy", "alice", ShareMode::Shared, false)
        .await
        .unwrap()
        .unwrap();
    let memory_before = svc.total_memory_mb();

    let placeholder = svc
        .acquire("broken", "bob", ShareMode::Shared, false)
        .await
        .unwrap()
        .unwrap();
    assert!(svc.instance_info(&placeholder).unwrap().loading);

    let err = svc.load_instance(&placeholder, None).await.unwrap_err();
    assert!(matches!(err, ShareError::LoadFailed { .. }));
    assert!(svc.instance_info(&placeholder).is_none());
    assert_eq!(svc.total_memory_mb(), memory_before);
    assert!(svc.caller_instances("bob").is_empty());
    assert_eq!(svc.stats().counters.load_failures, 1);
    assert_eq!(backend.live_handles(), 1);
    assert_consistent!(svc);
}

#[tokio::test]
async fn abandoned_placeholder_is_reclaimed_after_timeout() {
    let (svc, _, clock) = setup(
        CacheConfig::default().with_loading_timeout_secs(60),
        MockBackend::default(),
    );
    let stuck = svc
        .acquire("m1", "alice", ShareMode::Shared, false)
        .await
        .unwrap()
        .unwrap();

    clock.advance(Duration::from_secs(30));
    svc.run_eviction().await;
    assert!(svc.instance_info(&stuck).is_some());

    clock.advance(Duration::from_secs(31));
    svc.run_eviction().await;
    assert!(svc.instance_info(&stuck).is_none());
    assert_eq!(svc.stats().counters.abandoned_placeholders, 1);

    // A late commit finds nothing and its handle is released
    let err = svc
        .commit_instance(&stuck, ModelHandle::new(()), 100.0)
        .await
        .unwrap_err();
    assert!(matches!(err, ShareError::InstanceNotFound(_)));
    assert_eq!(svc.total_memory_mb(), 0.0);
}

#[tokio::test(start_paused = true)]
async fn dropped_acquire_ready_frees_its_slot_on_next_pass() {
    let backend = MockBackend::default();
    backend.set_load_delay(Duration::from_secs(5));
    let (svc, backend, _) = setup(CacheConfig::default().with_max_instances(1), backend);

    let gave_up = tokio::time::timeout(
        Duration::from_millis(10),
        svc.acquire_ready("m1", "gone", ShareMode::Shared, false),
    )
    .await;
    assert!(gave_up.is_err());
    assert_eq!(svc.instance_count(), 1);

    // No clock movement: the loading timeout plays no part
    assert_eq!(svc.run_eviction().await, 1);
    assert_eq!(svc.instance_count(), 0);
    assert_eq!(svc.stats().counters.abandoned_placeholders, 1);
    assert_eq!(backend.live_handles(), 0);

    let next = svc.acquire("m2", "bob", ShareMode::Shared, false).await.unwrap();
    assert!(next.is_some());
    assert_consistent!(svc);
}

#[tokio::test]
async fn reacquiring_a_full_exclusive_instance_gets_a_new_one() {
    let (svc, _, _) = setup(CacheConfig::default(), MockBackend::default());
    let first = svc
        .acquire_ready("m1", "alice", ShareMode::Exclusive, false)
        .await
        .unwrap()
        .unwrap();
    let second = svc
        .acquire_ready("m1", "alice", ShareMode::Exclusive, false)
        .await
        .unwrap()
        .unwrap();

    assert_ne!(first, second);
    assert_eq!(svc.instance_count(), 2);
    assert_eq!(svc.caller_instances("alice").len(), 2);
    assert_eq!(svc.holders(&first).unwrap(), vec!["alice".to_string()]);
    assert_consistent!(svc);
}

#[tokio::test]
async fn usage_of_departed_callers_is_pruned() {
    let (svc, _, clock) = setup(
        CacheConfig::default()
            .with_policy(CachePolicy::Ttl)
            .with_ttl_minutes(10),
        MockBackend::default(),
    );
    let anchor = svc
        .acquire_ready("m1", "steady", ShareMode::Shared, false)
        .await
        .unwrap()
        .unwrap();
    for i in 0..500 {
        let caller = format!("request-{i}");
        let id = svc
            .acquire_ready("m1", &caller, ShareMode::Shared, false)
            .await
            .unwrap()
            .unwrap();
        svc.release(&id, &caller);
    }
    assert_eq!(svc.stats().top_callers.len(), 10);

    clock.advance(10 * MINUTE);
    svc.run_eviction().await;

    let stats = svc.stats();
    assert_eq!(stats.caller_sessions, 1);
    assert_eq!(stats.top_callers.len(), 1);
    assert_eq!(stats.top_callers[0].caller_id, "steady");
    assert!(svc.instance_info(&anchor).is_some());
}

#[tokio::test]
async fn force_new_still_prefers_shared_instances() {
    let (svc, _, _) = setup(CacheConfig::default(), MockBackend::default());
    let first = svc
        .acquire_ready("m1", "alice", ShareMode::Shared, false)
        .await
        .unwrap()
        .unwrap();
    let again = svc
        .acquire_ready("m1", "alice", ShareMode::Shared, true)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first, again);
    assert_eq!(svc.instance_count(), 1);

    let exclusive = svc
        .acquire_ready("m1", "bob", ShareMode::Exclusive, true)
        .await
        .unwrap()
        .unwrap();
    // Shared instance has room, so bob joins it regardless of requested mode
    assert_eq!(exclusive, first);
}

#[tokio::test]
async fn exclusive_instances_are_not_shared() {
    let (svc, _, _) = setup(CacheConfig::default(), MockBackend::default());
    let a = svc
        .acquire_ready("m1", "alice", ShareMode::Exclusive, false)
        .await
        .unwrap()
        .unwrap();
    let b = svc
        .acquire_ready("m1", "bob", ShareMode::Exclusive, false)
        .await
        .unwrap()
        .unwrap();
    assert_ne!(a, b);
    assert_eq!(svc.instance_info(&a).unwrap().max_holders, 1);
}

#[tokio::test]
async fn holder_limit_spills_to_new_instance() {
    let (svc, _, _) = setup(
        CacheConfig::default().with_max_holders(2),
        MockBackend::default(),
    );
    let mut ids = Vec::new();
    for caller in ["a", "b", "c"] {
        ids.push(
            svc.acquire_ready("m1", caller, ShareMode::Pooled, false)
                .await
                .unwrap()
                .unwrap(),
        );
    }
    assert_eq!(ids[0], ids[1]);
    assert_ne!(ids[1], ids[2]);
    assert_eq!(svc.stats().instances_by_share_mode.get("pooled"), Some(&2));
}

#[tokio::test]
async fn eviction_under_admission_unloads_handles() {
    let (svc, backend, clock) = setup(
        CacheConfig::default().with_max_instances(2),
        MockBackend::default(),
    );
    for (model, caller) in [("m1", "a"), ("m2", "b")] {
        let id = svc
            .acquire_ready(model, caller, ShareMode::Shared, false)
            .await
            .unwrap()
            .unwrap();
        svc.release(&id, caller);
        clock.advance(MINUTE);
    }

    let id = svc
        .acquire_ready("m3", "c", ShareMode::Shared, false)
        .await
        .unwrap();
    assert!(id.is_some());
    assert_eq!(svc.instance_count(), 1);
    assert_eq!(backend.unload_count(), 2);
    assert_eq!(backend.live_handles(), 1);
    assert_eq!(svc.stats().counters.evictions, 2);
}

#[tokio::test]
async fn infer_through_lease() {
    let (svc, backend, _) = setup(CacheConfig::default(), MockBackend::default());
    {
        let lease = svc
            .lease("m1", "alice", ShareMode::Shared)
            .await
            .unwrap()
            .unwrap();
        let out = lease.infer(json!({ "prompt": "hi" })).await.unwrap();
        assert_eq!(out["model"], "m1");
        assert_eq!(out["inputs"]["prompt"], "hi");
        assert_eq!(svc.stats().total_active_holders, 1);
    }
    assert_eq!(svc.stats().total_active_holders, 0);
    assert_eq!(backend.infer_count(), 1);

    let lease = svc
        .lease("m1", "bob", ShareMode::Shared)
        .await
        .unwrap()
        .unwrap();
    let id = lease.instance_id().to_string();
    lease.release();
    assert!(svc.holders(&id).unwrap().is_empty());
}

#[tokio::test]
async fn stop_drains_everything_and_refuses_work() {
    let (svc, backend, _) = setup(CacheConfig::default(), MockBackend::default());
    svc.start();
    for caller in ["a", "b", "c"] {
        svc.acquire_ready("m1", caller, ShareMode::Exclusive, false)
            .await
            .unwrap();
    }
    let pending = svc
        .acquire("m2", "d", ShareMode::Shared, false)
        .await
        .unwrap()
        .unwrap();

    svc.stop().await;
    assert_eq!(svc.instance_count(), 0);
    assert_eq!(backend.live_handles(), 0);
    assert!(backend.reclaim_count() >= 1);
    assert_eq!(svc.stats().caller_sessions, 0);

    assert!(matches!(
        svc.acquire("m1", "a", ShareMode::Shared, false).await,
        Err(ShareError::ShuttingDown)
    ));
    assert!(matches!(
        svc.load_instance(&pending, None).await,
        Err(ShareError::InstanceNotFound(_))
    ));

    svc.stop().await;
    assert_eq!(backend.unload_count(), 3);
}

#[tokio::test]
async fn stats_report_usage_and_hit_rate() {
    let (svc, _, _) = setup(CacheConfig::default(), MockBackend::default());
    let id = svc
        .acquire_ready("m1", "alice", ShareMode::Shared, false)
        .await
        .unwrap()
        .unwrap();
    for _ in 0..3 {
        svc.acquire_ready("m1", "bob", ShareMode::Shared, false)
            .await
            .unwrap();
    }
    svc.release(&id, "alice");

    let stats = svc.stats();
    assert_eq!(stats.counters.misses, 1);
    assert_eq!(stats.counters.hits, 3);
    assert_eq!(stats.hit_rate, 0.75);
    assert_eq!(stats.top_callers[0].caller_id, "bob");
    assert_eq!(stats.top_callers[0].access_count, 3);
    assert_eq!(stats.top_callers[1].active_instances, 0);
    assert_eq!(stats.peak_memory_mb, 500.0);

    let json = serde_json::to_value(&stats).unwrap();
    assert_eq!(json["cache_policy"], "lru");
    assert!(json["top_callers"][0]["last_access"].is_string());
}
