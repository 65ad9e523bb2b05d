//! Background cleanup and memory pressure loops.
//!
//! Each loop holds only a weak reference to the service state, so dropping
//! every service handle ends the loops even without `stop()`.

use std::sync::Weak;
use std::time::Duration;

use sysinfo::{MemoryRefreshKind, RefreshKind, System};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::service::{ModelSharingService, ServiceInner};
use crate::stats::HostMemory;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

pub(crate) fn spawn_loops(
    service: &ModelSharingService,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let config = service.config();
    let mut handles = vec![tokio::spawn(cleanup_loop(
        service.downgrade(),
        config.cleanup_interval(),
        cancel.clone(),
    ))];
    if config.enable_memory_monitoring {
        handles.push(tokio::spawn(pressure_loop(
            service.downgrade(),
            config.pressure_check_interval(),
            cancel,
        )));
    }
    handles
}

/// Wait for the next tick or cancellation, then upgrade the service handle.
async fn next_pass(
    ticker: &mut tokio::time::Interval,
    cancel: &CancellationToken,
    weak: &Weak<ServiceInner>,
) -> Option<ModelSharingService> {
    tokio::select! {
        _ = cancel.cancelled() => None,
        _ = ticker.tick() => weak.upgrade().map(ModelSharingService::from_inner),
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

async fn cleanup_loop(weak: Weak<ServiceInner>, period: Duration, cancel: CancellationToken) {
    let mut ticker = ticker(period);
    while let Some(service) = next_pass(&mut ticker, &cancel, &weak).await {
        let evicted = service.run_eviction().await;
        // Unloading evicted instances already reclaimed
        if evicted == 0 {
            if let Err(e) = service.reclaim_memory().await {
                warn!(error = %e, "memory reclamation failed in cleanup loop");
            }
        }
        debug!(evicted, "cleanup pass complete");
    }
    debug!("cleanup loop stopped");
}

async fn pressure_loop(weak: Weak<ServiceInner>, period: Duration, cancel: CancellationToken) {
    let mut ticker = ticker(period);
    while let Some(service) = next_pass(&mut ticker, &cancel, &weak).await {
        match sample_host_memory().await {
            Some(sample) => service.record_host_memory(sample),
            None => warn!("host memory sample unavailable"),
        }
        let evicted = service.check_memory_pressure().await;
        if evicted > 0 {
            debug!(evicted, "pressure pass evicted instances");
        }
    }
    debug!("memory pressure loop stopped");
}

/// Host memory via sysinfo, on a blocking thread.
pub(crate) async fn sample_host_memory() -> Option<HostMemory> {
    tokio::task::spawn_blocking(|| {
        let mut sys = System::new_with_specifics(
            RefreshKind::new().with_memory(MemoryRefreshKind::everything()),
        );
        sys.refresh_memory();
        // sysinfo reports bytes
        HostMemory {
            total_mb: sys.total_memory() as f64 / BYTES_PER_MB,
            available_mb: sys.available_memory() as f64 / BYTES_PER_MB,
        }
    })
    .await
    .ok()
}
