//! CLI command definitions using clap

use crate::output::OutputFormat;
use clap::{Parser, Subcommand};
use modelshare_foundation::{CachePolicy, ShareMode};
use std::path::PathBuf;

/// modelshare - shared model instance cache tooling
#[derive(Parser)]
#[command(name = "modelshare")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (json, text)
    #[arg(short = 'o', long, global = true, default_value = "json")]
    pub output: OutputFormat,

    /// Cache configuration file (yaml, toml, json, ini, ron, json5)
    #[arg(short = 'c', long, global = true, env = "MODELSHARE_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Cache configuration
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },

    /// Run a simulated multi-caller workload and report cache statistics
    Simulate(SimulateArgs),
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the effective configuration after file and env overrides
    Show,
}

#[derive(clap::Args, Debug, Clone)]
pub struct SimulateArgs {
    /// Number of concurrent callers
    #[arg(long, default_value_t = 8)]
    pub callers: usize,

    /// Comma separated model names
    #[arg(
        long,
        value_delimiter = ',',
        default_value = "llama-3-8b,mistral-7b,phi-3-mini"
    )]
    pub models: Vec<String>,

    /// Number of rounds; every caller makes one request per round
    #[arg(long, default_value_t = 10)]
    pub rounds: usize,

    /// Probability that a backend load fails
    #[arg(long, default_value_t = 0.0)]
    pub fail_rate: f64,

    /// Probability that a caller keeps its instance into the next round
    #[arg(long, default_value_t = 0.3)]
    pub hold_rate: f64,

    /// Share mode requested by every caller
    #[arg(long, default_value = "shared")]
    pub share_mode: ShareMode,

    /// Override the configured eviction policy
    #[arg(long)]
    pub policy: Option<CachePolicy>,

    /// Simulated load latency in milliseconds
    #[arg(long, default_value_t = 5)]
    pub load_delay_ms: u64,

    /// Seed for the workload and failure generator
    #[arg(long, default_value_t = 42)]
    pub seed: u64,
}
