//! `modelshare simulate` command implementation
//!
//! Drives a [`ModelSharingService`] with a seeded multi-caller workload
//! against the simulated backend and reports what the cache did.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use colored::Colorize;
use futures::future::join_all;
use modelshare_foundation::{ModelSharingService, ShareError, SharingStats};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::backend::SimulatedBackend;
use crate::cli::SimulateArgs;
use crate::commands::config::load_cache_config;
use crate::output::{OutputFormat, render};

/// What one simulated request ended with
enum Outcome {
    Served { kept: Option<String> },
    Rejected,
    LoadFailed,
    Failed,
}

#[derive(Debug, Default, Serialize)]
pub struct WorkloadSummary {
    pub requests: u64,
    pub served: u64,
    pub rejected: u64,
    pub load_failures: u64,
    pub errors: u64,
    pub evicted_between_rounds: u64,
}

#[derive(Debug, Serialize)]
pub struct SimulationReport {
    pub rounds: usize,
    pub callers: usize,
    pub models: Vec<String>,
    pub seed: u64,
    pub summary: WorkloadSummary,
    /// Snapshot taken before shutdown
    pub stats: SharingStats,
    pub backend_unloads: u64,
}

fn validate(args: &SimulateArgs) -> anyhow::Result<()> {
    if args.callers == 0 {
        bail!("--callers must be at least 1");
    }
    if args.models.iter().all(|m| m.trim().is_empty()) {
        bail!("--models must name at least one model");
    }
    for (name, value) in [("--fail-rate", args.fail_rate), ("--hold-rate", args.hold_rate)] {
        if !(0.0..=1.0).contains(&value) {
            bail!("{name} must be between 0 and 1, got {value}");
        }
    }
    Ok(())
}

pub async fn simulate(config_path: Option<&Path>, args: &SimulateArgs) -> anyhow::Result<SimulationReport> {
    validate(args)?;
    let mut config = load_cache_config(config_path)?;
    if let Some(policy) = args.policy {
        config.cache_policy = policy;
    }
    let models: Vec<String> = args
        .models
        .iter()
        .map(|m| m.trim().to_string())
        .filter(|m| !m.is_empty())
        .collect();

    let backend = Arc::new(SimulatedBackend::new(
        Duration::from_millis(args.load_delay_ms),
        args.fail_rate,
        args.seed,
    ));
    let service = ModelSharingService::new(config, backend.clone())?;
    service.start();

    let mut rng = StdRng::seed_from_u64(args.seed);
    let mut kept: Vec<Option<String>> = vec![None; args.callers];
    let mut summary = WorkloadSummary::default();

    for round in 0..args.rounds {
        let plan: Vec<(String, String, bool, Option<String>)> = (0..args.callers)
            .map(|i| {
                let model = models[rng.gen_range(0..models.len())].clone();
                let keep = rng.gen_bool(args.hold_rate);
                (format!("caller-{i}"), model, keep, kept[i].take())
            })
            .collect();

        let requests = plan.into_iter().map(|(caller, model, keep, previous)| {
            let service = service.clone();
            let share_mode = args.share_mode;
            async move {
                if let Some(previous) = previous {
                    service.release(&previous, &caller);
                }
                match service.acquire_ready(&model, &caller, share_mode, false).await {
                    Ok(Some(id)) => {
                        if let Err(e) = service.infer(&id, &caller, json!({ "round": round })).await {
                            warn!(caller = %caller, error = %e, "inference failed");
                        }
                        if keep {
                            Outcome::Served { kept: Some(id) }
                        } else {
                            service.release(&id, &caller);
                            Outcome::Served { kept: None }
                        }
                    }
                    Ok(None) => Outcome::Rejected,
                    Err(ShareError::LoadFailed { .. }) => Outcome::LoadFailed,
                    Err(e) => {
                        warn!(caller = %caller, error = %e, "request failed");
                        Outcome::Failed
                    }
                }
            }
        });

        for (i, outcome) in join_all(requests).await.into_iter().enumerate() {
            summary.requests += 1;
            match outcome {
                Outcome::Served { kept: held } => {
                    summary.served += 1;
                    kept[i] = held;
                }
                Outcome::Rejected => summary.rejected += 1,
                Outcome::LoadFailed => summary.load_failures += 1,
                Outcome::Failed => summary.errors += 1,
            }
        }

        summary.evicted_between_rounds += service.run_eviction().await as u64;
        info!(
            round,
            instances = service.instance_count(),
            memory_mb = service.total_memory_mb(),
            "round complete"
        );
    }

    for (i, held) in kept.into_iter().enumerate() {
        if let Some(id) = held {
            service.release(&id, &format!("caller-{i}"));
        }
    }

    let stats = service.stats();
    service.stop().await;

    Ok(SimulationReport {
        rounds: args.rounds,
        callers: args.callers,
        models,
        seed: args.seed,
        summary,
        stats,
        backend_unloads: backend.unload_count(),
    })
}

/// Execute the `modelshare simulate` command
pub async fn run(config_path: Option<&Path>, args: &SimulateArgs, format: OutputFormat) -> anyhow::Result<()> {
    let report = simulate(config_path, args).await?;
    if format == OutputFormat::Text {
        eprintln!(
            "{} {} requests, {} served, {} rejected, {} load failures",
            "->".green(),
            report.summary.requests,
            report.summary.served.to_string().green(),
            report.summary.rejected.to_string().yellow(),
            report.summary.load_failures.to_string().red(),
        );
    }
    println!("{}", render(&report, format)?);
    Ok(())
}
