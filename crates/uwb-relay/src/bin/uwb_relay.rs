//! # uwb-relay
//!
//! Reads distance frames from a UWB sensor on one serial port and, when an
//! outbound port is configured, forwards changed distances to a controller
//! on another.
//!
//! ## Usage
//!
//! ```bash
//! # Receive only, log each stabilized distance
//! uwb-relay --inbound /dev/ttyUSB0
//!
//! # Forward to a controller, at most every 50 ms
//! uwb-relay --inbound /dev/ttyUSB0 --outbound /dev/ttyUSB1 --min-interval-ms 50
//!
//! # From a config file, no hardware attached
//! uwb-relay --config relay.toml --simulate
//!
//! # Show serial ports
//! uwb-relay --list-ports
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use uwb_relay::link::system::list_ports;
use uwb_relay::link::DEFAULT_REOPEN_BACKOFF;
use uwb_relay::sim::{SimulatedControllerOpener, SimulatedSensorOpener};
use uwb_relay::{
    LineEncoder, PortOpener, Relay, RelayConfig, RelayError, RelayStats, SerialLink, Shutdown,
    StatsSnapshot, TransmitThrottler,
};

/// UWB distance relay.
#[derive(Parser, Debug)]
#[command(name = "uwb-relay", about = "Relay UWB sensor distances to a serial controller")]
struct Cli {
    /// TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Sensor serial port.
    #[arg(long)]
    inbound: Option<String>,

    /// Controller serial port. Omit to run receive-only.
    #[arg(long)]
    outbound: Option<String>,

    /// Baud rate for both ports.
    #[arg(long)]
    baud: Option<u32>,

    /// Consecutive valid frames before distances are published.
    #[arg(long)]
    required_frames: Option<u32>,

    /// Minimum time between forwards.
    #[arg(long)]
    min_interval_ms: Option<u64>,

    /// Wait after opening the sensor port before decoding.
    #[arg(long)]
    settle_ms: Option<u64>,

    /// Use a simulated sensor and controller instead of serial ports.
    #[arg(long, default_value_t = false)]
    simulate: bool,

    /// List serial ports and exit.
    #[arg(long, default_value_t = false)]
    list_ports: bool,

    /// Seconds between stats log lines.
    #[arg(long, default_value_t = 5)]
    stats_interval: u64,
}

fn main() -> anyhow::Result<()> {
    // ── Logging ─────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .compact()
        .init();

    let cli = Cli::parse();

    if cli.list_ports {
        let ports = list_ports().context("failed to enumerate serial ports")?;
        if ports.is_empty() {
            println!("no serial ports found");
        }
        for port in ports {
            println!("{}\t{}", port.name, port.description);
        }
        return Ok(());
    }

    // ── Config ──────────────────────────────────────────────────
    let mut config = match &cli.config {
        Some(path) => RelayConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => RelayConfig::default(),
    };
    apply_overrides(&mut config, &cli);
    config.validate().context("invalid configuration")?;

    tracing::info!(
        inbound = %config.inbound.port,
        outbound = ?config.outbound.as_ref().map(|o| o.port.as_str()),
        baud_rate = config.inbound.baud_rate,
        required_frames = config.required_frames,
        min_interval_ms = config.throttle.min_interval.as_millis() as u64,
        simulate = cli.simulate,
        "uwb-relay starting"
    );

    // ── Graceful shutdown ───────────────────────────────────────
    let shutdown = Shutdown::new();
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            tracing::info!("shutting down...");
            shutdown.trigger();
        })
        .context("failed to install signal handler")?;
    }

    // ── Relay ───────────────────────────────────────────────────
    let stats = Arc::new(RelayStats::new());
    let started = if cli.simulate {
        start(
            &config,
            SimulatedSensorOpener::new("sim-sensor"),
            Some(SimulatedControllerOpener::new("sim-controller")),
            &shutdown,
            stats.clone(),
        )
    } else {
        start(
            &config,
            config.inbound.opener(),
            config.outbound.as_ref().map(|o| o.opener()),
            &shutdown,
            stats.clone(),
        )
    };
    let relay = started.context("failed to start relay")?;

    let receive_only = config.outbound.is_none() && !cli.simulate;
    supervise(relay, &shutdown, receive_only, Duration::from_secs(cli.stats_interval.max(1)))
}

fn apply_overrides(config: &mut RelayConfig, cli: &Cli) {
    if let Some(port) = &cli.inbound {
        config.inbound.port = port.clone();
    }
    if let Some(port) = &cli.outbound {
        let link = config
            .outbound
            .get_or_insert_with(|| uwb_relay::config::LinkConfig::new(port.clone()));
        link.port = port.clone();
    }
    if let Some(baud) = cli.baud {
        config.inbound.baud_rate = baud;
        if let Some(out) = config.outbound.as_mut() {
            out.baud_rate = baud;
        }
    }
    if let Some(n) = cli.required_frames {
        config.required_frames = n;
    }
    if let Some(ms) = cli.min_interval_ms {
        config.throttle.min_interval = Duration::from_millis(ms);
    }
    if let Some(ms) = cli.settle_ms {
        config.settle_delay = Duration::from_millis(ms);
    }
}

fn start<I, O>(
    config: &RelayConfig,
    inbound: I,
    outbound: Option<O>,
    shutdown: &Shutdown,
    stats: Arc<RelayStats>,
) -> Result<Relay, RelayError>
where
    I: PortOpener + 'static,
    O: PortOpener + 'static,
{
    let inbound = SerialLink::new(inbound, config.inbound.reopen_backoff, shutdown.clone());
    let settings = config.receive_settings();

    match outbound {
        None => Relay::receive_only(inbound, settings, stats),
        Some(opener) => {
            let backoff = config
                .outbound
                .as_ref()
                .map_or(DEFAULT_REOPEN_BACKOFF, |o| o.reopen_backoff);
            let outbound = SerialLink::new(opener, backoff, shutdown.clone());
            let throttler = TransmitThrottler::new(config.throttle.clone(), LineEncoder);
            Relay::with_forwarding(inbound, settings, outbound, throttler, stats)
        }
    }
}

/// Runs until shutdown or until a relay thread stops on its own.
fn supervise(
    mut relay: Relay,
    shutdown: &Shutdown,
    receive_only: bool,
    stats_interval: Duration,
) -> anyhow::Result<()> {
    let slot = relay.slot();
    let stats = relay.stats();
    let mut last_stats_log = Instant::now();
    let mut stopped_early = false;

    while !shutdown.is_triggered() {
        if receive_only {
            if let Some(sample) = slot.consume(Duration::from_millis(100)) {
                tracing::info!(
                    distance_mm = sample.distance_mm(),
                    observed_at = %sample.observed_at(),
                    "distance"
                );
            }
        } else if shutdown.sleep(Duration::from_millis(100)) {
            break;
        }

        if !relay.is_running() && !shutdown.is_triggered() {
            tracing::error!("relay thread stopped unexpectedly");
            stopped_early = true;
            break;
        }

        if last_stats_log.elapsed() >= stats_interval {
            log_stats("relay stats", &stats.snapshot());
            last_stats_log = Instant::now();
        }
    }

    relay.shutdown();
    log_stats("uwb-relay stopped", &stats.snapshot());

    if stopped_early {
        anyhow::bail!("relay stopped before shutdown was requested");
    }
    Ok(())
}

fn log_stats(message: &str, s: &StatsSnapshot) {
    tracing::info!(
        decoded = s.frames_decoded,
        malformed = s.frames_malformed,
        skipped_bytes = s.bytes_skipped,
        published = s.samples_published,
        overwritten = s.samples_overwritten,
        forwarded = s.forwarded,
        unchanged = s.suppressed_unchanged,
        too_soon = s.suppressed_interval,
        forward_failures = s.forward_failures,
        inbound_faults = s.inbound_faults,
        inbound_reopens = s.inbound_reopens,
        outbound_faults = s.outbound_faults,
        outbound_reopens = s.outbound_reopens,
        "{message}"
    );
}
