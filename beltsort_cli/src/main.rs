mod cli;
mod error_fmt;
mod rt;
mod setup;

use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use beltsort_config::Config;
use beltsort_core::{SorterRuntime, SystemState, TriggerEvent};
use beltsort_traits::MonotonicClock;
use clap::Parser;
use eyre::WrapErr;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::{Cli, Commands, FILE_GUARD};
use crate::error_fmt::humanize;

/// Build a file sink writer with optional rotation, storing the non-blocking
/// guard in OnceLock.
fn file_layer(
    file: Option<&str>,
    rotation: Option<&str>,
) -> Option<tracing_appender::non_blocking::NonBlocking> {
    let path = file?;
    let p = std::path::Path::new(path);
    if let Some(parent) = p.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let file_appender = match rotation.unwrap_or("never").to_ascii_lowercase().as_str() {
        "daily" => tracing_appender::rolling::daily(".", path),
        "hourly" => tracing_appender::rolling::hourly(".", path),
        _ => tracing_appender::rolling::never(".", path),
    };
    let (nb_writer, guard) = tracing_appender::non_blocking(file_appender);
    let _ = FILE_GUARD.set(guard);
    Some(nb_writer)
}

/// Initialize tracing once for the whole app.
fn init_tracing(json: bool, level: &str, file: Option<&str>, rotation: Option<&str>) {
    // Prefer RUST_LOG if set; otherwise use the CLI level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let registry = tracing_subscriber::registry().with(filter);

    if json {
        let console = fmt::layer().json().with_target(false);
        if let Some(nb_writer) = file_layer(file, rotation) {
            let file_l = fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(nb_writer);
            registry.with(console).with(file_l).init();
        } else {
            registry.with(console).init();
        }
    } else {
        let console = fmt::layer().pretty().with_target(false);
        if let Some(nb_writer) = file_layer(file, rotation) {
            let file_l = fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(nb_writer);
            registry.with(console).with(file_l).init();
        } else {
            registry.with(console).init();
        }
    }
}

fn main() -> eyre::Result<()> {
    if let Err(e) = real_main() {
        eprintln!("{}", humanize(&e));
        std::process::exit(2);
    }
    Ok(())
}

fn real_main() -> eyre::Result<()> {
    let cli = Cli::parse();

    let cfg_text = fs::read_to_string(&cli.config)
        .wrap_err_with(|| format!("read config {:?}", cli.config))?;
    let cfg: Config =
        toml::from_str(&cfg_text).wrap_err_with(|| format!("parse config {:?}", cli.config))?;
    cfg.validate().wrap_err("invalid configuration")?;

    init_tracing(
        cli.json,
        &cli.log_level,
        cfg.logging.file.as_deref(),
        cfg.logging.rotation.as_deref(),
    );

    match cli.cmd {
        Commands::SelfCheck => self_check(&cfg),
        Commands::Run {
            duration_s,
            rt,
            sim_trigger_interval_ms,
            status_every_s,
        } => run(&cfg, duration_s, rt, sim_trigger_interval_ms, status_every_s),
    }
}

fn self_check(cfg: &Config) -> eyre::Result<()> {
    tracing::info!("self-check starting");
    setup::self_check(cfg)?;
    tracing::info!("self-check ok");
    println!("OK");
    Ok(())
}

fn run(
    cfg: &Config,
    duration_s: Option<u64>,
    rt: bool,
    sim_trigger_interval_ms: u64,
    status_every_s: u64,
) -> eyre::Result<()> {
    let machine = setup::build_machine(cfg).wrap_err("bringing up components")?;

    if rt {
        rt::apply_rt_mode();
    }

    let sim_tx = machine.sim_trigger_tx.clone();
    let runtime = SorterRuntime::spawn(machine.orchestrator, Arc::new(MonotonicClock::new()));
    let handle = runtime.handle();

    handle.start().wrap_err("starting sorter")?;
    tracing::info!(
        belt_mps = cfg.belt.belt_speed_mps,
        min_confidence = cfg.model.min_confidence,
        "sorter running"
    );

    // Simulation mode can synthesize camera triggers at a fixed cadence.
    let stop_flag = Arc::new(AtomicBool::new(false));
    let generator = match (sim_tx, sim_trigger_interval_ms) {
        (Some(tx), interval) if interval > 0 => {
            let stop = stop_flag.clone();
            Some(std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    let _ = tx.send(TriggerEvent { at: Instant::now() });
                    std::thread::sleep(Duration::from_millis(interval));
                }
            }))
        }
        _ => None,
    };

    let started = Instant::now();
    let mut last_status = Instant::now();
    loop {
        std::thread::sleep(Duration::from_millis(200));

        if let Some(limit) = duration_s
            && started.elapsed() >= Duration::from_secs(limit)
        {
            break;
        }

        if status_every_s > 0 && last_status.elapsed() >= Duration::from_secs(status_every_s) {
            last_status = Instant::now();
            match handle.status() {
                Ok(s) => tracing::info!(
                    state = %s.state,
                    processed = s.items_processed,
                    actuated = s.items_actuated,
                    dropped = s.items_dropped,
                    pending = s.pending_fires,
                    "status"
                ),
                Err(_) => break,
            }
        }

        match handle.status() {
            Ok(s) if s.state == SystemState::Shutdown => break,
            Ok(_) => {}
            Err(_) => break,
        }
    }

    let final_status = handle.status().ok();
    let _ = handle.stop();
    stop_flag.store(true, Ordering::Relaxed);
    if let Some(g) = generator {
        let _ = g.join();
    }
    if !runtime.join(Duration::from_secs(10)) {
        tracing::warn!("orchestrator did not shut down within 10 s");
    }

    if let Some(s) = final_status {
        tracing::info!(
            uptime_s = s.uptime.as_secs(),
            processed = s.items_processed,
            actuated = s.items_actuated,
            dropped = s.items_dropped,
            avg_confidence = s.avg_confidence,
            "run summary"
        );
        println!(
            "processed: {}  actuated: {}  dropped: {}",
            s.items_processed, s.items_actuated, s.items_dropped
        );
    }
    Ok(())
}
