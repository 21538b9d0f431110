//! CLI argument definitions and shared statics.

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::OnceLock;

pub static FILE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

#[derive(Parser, Debug)]
#[command(name = "beltsort", version, about = "Beltsort sorter control plane")]
pub struct Cli {
    /// Path to config TOML (typed)
    #[arg(long, value_name = "FILE", default_value = "etc/beltsort.toml")]
    pub config: PathBuf,

    /// Log as JSON lines instead of pretty
    #[arg(long, action = ArgAction::SetTrue)]
    pub json: bool,

    /// Console log level (error|warn|info|debug|trace)
    #[arg(long = "log-level", value_name = "LEVEL", default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the sorter until stopped (or for a fixed duration)
    Run {
        /// Stop automatically after this many seconds
        #[arg(long, value_name = "S")]
        duration_s: Option<u64>,
        /// Enable real-time mode (SCHED_FIFO, affinity, mlockall)
        #[arg(long, action = ArgAction::SetTrue)]
        rt: bool,
        /// Simulation only: generate a synthetic camera trigger every N ms
        /// (0 disables)
        #[arg(long, value_name = "MS", default_value_t = 0)]
        sim_trigger_interval_ms: u64,
        /// Print a status line every N seconds (0 disables)
        #[arg(long, value_name = "S", default_value_t = 10)]
        status_every_s: u64,
    },
    /// Quick health check (hardware presence / sim ok)
    SelfCheck,
}
