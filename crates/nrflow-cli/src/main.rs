//! nrflow CLI
//!
//! Drives the shared-memory analysis pipeline with synthetic NR MAC PDU and
//! IP traffic, and talks to a running pipeline over its control socket.

mod config;
mod progress;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use nrflow_core::layout::{ArenaLayout, LAYOUT_VERSION, MAGIC};
use nrflow_core::{Analyzer, Command, RingSelection, SpawnMode};
use nrflow_runtime::control_server::{self, ControlEnvelope, ControlRequest, ControlServer};
use nrflow_runtime::{AnalyzerFactory, Producer, ShutdownReport, WorkerPool, cleanup};
use nrflow_traffic::{ProtocolAnalyzer, TrafficGenerator};
use tracing_subscriber::EnvFilter;

use config::Config;
use progress::{RunProgress, format_bytes, print_report};

/// Interval between reaping workers and serving control requests
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_millis(5);

/// nrflow - shared-memory transport for NR MAC PDU / IP packet analysis
#[derive(Parser)]
#[command(name = "nrflow")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline on generated traffic
    Run {
        /// Stop after this many seconds (runs until Ctrl+C when omitted)
        #[arg(short, long)]
        duration: Option<u64>,

        /// Messages per second, 0 for as fast as possible
        #[arg(short, long, default_value_t = 0)]
        rate: u64,

        /// Number of workers (overrides the config file)
        #[arg(short, long)]
        threads: Option<u32>,

        /// Worker creation mode (overrides the config file)
        #[arg(long, value_enum)]
        spawn: Option<SpawnArg>,

        /// Control socket path (overrides the config file)
        #[arg(long)]
        socket: Option<PathBuf>,
    },

    /// Send a control command to a running pipeline
    Ctl {
        /// Command to send
        #[arg(value_enum)]
        command: CtlCommand,

        /// Target worker (all workers when omitted)
        #[arg(short, long)]
        worker: Option<u32>,

        /// Control socket path (overrides the config file)
        #[arg(long)]
        socket: Option<PathBuf>,
    },

    /// Print the shared-memory layout the configuration produces
    Layout,

    /// Print the configuration as TOML
    Config {
        /// Print the loaded configuration instead of the defaults
        #[arg(long)]
        current: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum SpawnArg {
    Process,
    Thread,
}

impl From<SpawnArg> for SpawnMode {
    fn from(arg: SpawnArg) -> Self {
        match arg {
            SpawnArg::Process => SpawnMode::Process,
            SpawnArg::Thread => SpawnMode::Thread,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum CtlCommand {
    Start,
    Pause,
    Drain,
    Shutdown,
    Stats,
}

impl From<CtlCommand> for Command {
    fn from(command: CtlCommand) -> Self {
        match command {
            CtlCommand::Start => Command::Start,
            CtlCommand::Pause => Command::Pause,
            CtlCommand::Drain => Command::Drain,
            CtlCommand::Shutdown => Command::Shutdown,
            CtlCommand::Stats => Command::StatsRequest,
        }
    }
}

// Worker processes are forked from this thread, so main stays synchronous
// and the async runtime is only built once the workers exist.
fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };

    let level = if cli.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .init();

    config.validate()?;

    match cli.command {
        Commands::Run {
            duration,
            rate,
            threads,
            spawn,
            socket,
        } => {
            let mut config = config;
            if let Some(threads) = threads {
                config.pipeline.workers = threads;
            }
            if let Some(spawn) = spawn {
                config.pipeline.spawn_mode = spawn.into();
            }
            if let Some(socket) = socket {
                config.control.enabled = true;
                config.control.socket = socket;
            }
            config.validate()?;
            run_pipeline(&config, duration.map(Duration::from_secs), rate)?;
        }
        Commands::Ctl {
            command,
            worker,
            socket,
        } => {
            let socket = socket.unwrap_or_else(|| config.control.socket.clone());
            send_control(socket, command.into(), worker)?;
        }
        Commands::Layout => {
            show_layout(&config)?;
        }
        Commands::Config { current } => {
            let shown = if current { config } else { Config::default() };
            print!("{}", toml::to_string_pretty(&shown)?);
        }
    }

    Ok(())
}

/// Run the pipeline until Ctrl+C, the duration expires or no worker is left
fn run_pipeline(config: &Config, duration: Option<Duration>, rate: u64) -> anyhow::Result<()> {
    let factory: AnalyzerFactory =
        Arc::new(|_worker: u32| Box::new(ProtocolAnalyzer::new()) as Box<dyn Analyzer>);

    let mut pool = WorkerPool::start(
        config.pipeline.clone(),
        config.segment.clone(),
        factory,
    )?;
    cleanup::install_signal_handlers()?;

    println!("nrflow {}", env!("CARGO_PKG_VERSION"));
    println!(
        "Workers: {} ({:?}, {:?} dequeue)",
        pool.worker_count(),
        config.pipeline.spawn_mode,
        config.pipeline.dequeue_mode
    );
    println!(
        "Arena: {} blocks of {}, ring capacity {}",
        config.pipeline.block_count,
        format_bytes(u64::from(config.pipeline.block_size)),
        config.pipeline.ring_capacity
    );
    println!("Press Ctrl+C to stop");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("nrflow-control")
        .enable_all()
        .build()?;

    let (request_tx, request_rx) = crossbeam_channel::unbounded::<ControlEnvelope>();
    let server = if config.control.enabled {
        match ControlServer::spawn(runtime.handle(), config.control.socket.clone(), request_tx) {
            Ok(server) => Some(server),
            Err(e) => {
                tracing::warn!(
                    "Control socket {} unavailable: {}",
                    config.control.socket.display(),
                    e
                );
                None
            }
        }
    } else {
        None
    };

    let progress = RunProgress::new(duration);
    let mut run = Run {
        config,
        duration,
        rate,
        progress: &progress,
        requests: &request_rx,
        submitted: 0,
        producer_drops: Default::default(),
    };
    let outcome = run.drive(&mut pool);

    drop(server);
    let report = pool.shutdown();
    progress.finish_with_message(finish_message(&report));
    print_report(&report, run.submitted, run.producer_drops);

    outcome?;
    if !report.failures.is_empty() {
        tracing::warn!("{} worker failures during the run", report.failures.len());
    }
    Ok(())
}

fn finish_message(report: &ShutdownReport) -> String {
    if report.leaked_blocks == 0 && report.failures.is_empty() {
        "Pipeline stopped cleanly".to_string()
    } else {
        format!(
            "Pipeline stopped with {} failures, {} leaked blocks",
            report.failures.len(),
            report.leaked_blocks
        )
    }
}

struct Run<'a> {
    config: &'a Config,
    duration: Option<Duration>,
    rate: u64,
    progress: &'a RunProgress,
    requests: &'a crossbeam_channel::Receiver<ControlEnvelope>,
    submitted: u64,
    producer_drops: nrflow_runtime::ProducerDrops,
}

impl Run<'_> {
    /// Generator loop; the producer is dropped before the pool shuts down
    fn drive(&mut self, pool: &mut WorkerPool) -> anyhow::Result<()> {
        let mut producer: Producer = pool.producer()?;
        let mut generator = TrafficGenerator::new(self.config.traffic.clone())?;
        let keyed = self.config.pipeline.ring_selection == RingSelection::FlowHash;
        let stats_interval = self.config.pipeline.stats_interval();

        let started = Instant::now();
        let mut next_housekeeping = started + HOUSEKEEPING_INTERVAL;
        let mut next_stats = started + stats_interval;
        let mut message = Vec::with_capacity(self.config.traffic.max_message);

        loop {
            let now = Instant::now();
            let elapsed = now - started;

            if now >= next_housekeeping {
                next_housekeeping = now + HOUSEKEEPING_INTERVAL;
                for failure in pool.poll()? {
                    tracing::warn!(
                        "Continuing without worker {} ({})",
                        failure.worker,
                        failure.status
                    );
                }
                control_server::dispatch_pending(pool, self.requests);

                if cleanup::shutdown_requested() {
                    tracing::info!("Interrupt received, shutting down");
                    break;
                }
                if self.duration.is_some_and(|limit| elapsed >= limit) {
                    break;
                }
                if pool.live_workers() == 0 {
                    tracing::warn!("No live workers left, stopping");
                    break;
                }
            }

            if now >= next_stats {
                next_stats = now + stats_interval;
                let stats = pool.stats();
                self.progress
                    .update(elapsed, self.submitted, pool.live_workers(), &stats);
            }

            if self.rate > 0 {
                let due = Duration::from_secs_f64(self.submitted as f64 / self.rate as f64);
                if due > elapsed {
                    thread::sleep((due - elapsed).min(HOUSEKEEPING_INTERVAL));
                    continue;
                }
            }

            message.clear();
            let generated = generator.next_into(&mut message);
            match generated.flow_key {
                Some(key) if keyed => producer.submit_keyed(&message, key)?,
                _ => producer.submit(&message)?,
            };
            self.submitted += 1;
        }

        self.producer_drops = producer.drops();
        Ok(())
    }
}

/// Send one control command and print the reply
fn send_control(socket: PathBuf, command: Command, worker: Option<u32>) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let request = ControlRequest { command, worker };
    let response = runtime
        .block_on(control_server::request(&socket, &request))
        .map_err(|e| anyhow::anyhow!("Control socket {}: {}", socket.display(), e))?;

    println!("{}", serde_json::to_string_pretty(&response)?);

    if let Some(error) = response.error {
        anyhow::bail!("{} failed: {}", command, error);
    }
    if !response.ok {
        anyhow::bail!(
            "{} not acknowledged by workers {:?}",
            command,
            response.missing
        );
    }
    Ok(())
}

/// Print the arena layout for the configured geometry
fn show_layout(config: &Config) -> anyhow::Result<()> {
    let layout = ArenaLayout::compute(config.pipeline.geometry())?;
    let geometry = layout.geometry;

    println!("nrflow arena layout");
    println!(
        "Magic: {:?}  version {}",
        String::from_utf8_lossy(&MAGIC).trim_end_matches('\0'),
        LAYOUT_VERSION
    );
    println!();

    println!("Geometry:");
    println!("  Blocks: {} x {}", geometry.block_count, format_bytes(u64::from(geometry.block_size)));
    println!("  Rings: {} x {} slots", geometry.ring_count, geometry.ring_capacity);
    println!();

    println!("Offsets:");
    println!("  {:<12} {:>#14x}", "header", 0);
    println!("  {:<12} {:>#14x}", "free list", layout.free_list_offset);
    println!(
        "  {:<12} {:>#14x}  ({} each, slots at +{:#x})",
        "rings",
        layout.rings_offset,
        format_bytes(layout.ring_stride),
        layout.slots_offset
    );
    println!(
        "  {:<12} {:>#14x}  ({} each)",
        "blocks",
        layout.blocks_offset,
        format_bytes(layout.block_stride)
    );
    println!();
    println!("Total: {} ({} bytes)", format_bytes(layout.total_size), layout.total_size);

    Ok(())
}
