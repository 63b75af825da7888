//! Command-line driver: parses flags into [`ProbeConfig`], installs a
//! SIGINT handler that flips the termination flag, and joins the pipeline
//! threads.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::Parser;
use ffprobe_rs::aggregation::AggregationStage;
use ffprobe_rs::capture::CaptureStage;
use ffprobe_rs::capture::source::{PacketSource, PcapFileSource, VecPacketSource};
use ffprobe_rs::config::ProbeConfig;
use ffprobe_rs::error::ProbeError;
use ffprobe_rs::flow::Timeval;
use ffprobe_rs::pipeline::{Counters, ParallelPipeline, build_shards, open_export_stage, run_sequential};

/// Staged-pipeline NetFlow v5 flow probe.
#[derive(Parser, Debug)]
#[command(name = "ffprobe")]
#[command(version)]
#[command(about = "Captures, aggregates and exports NetFlow v5 flow records", long_about = None)]
struct Cli {
    /// Interfaces to capture from (repeatable; only used with --pcap as a label here, since live capture is out of scope)
    #[arg(long = "interface")]
    interfaces: Vec<String>,

    /// Replay a pcap file instead of a live interface
    #[arg(long)]
    pcap: Option<PathBuf>,

    #[arg(long, default_value_t = 30)]
    idle_timeout: u64,

    #[arg(long, default_value_t = 120)]
    lifetime_timeout: u64,

    #[arg(long, default_value_t = 30)]
    queue_timeout: u64,

    #[arg(long, default_value_t = 1)]
    readers: usize,

    #[arg(long, default_value_t = 1)]
    workers: usize,

    #[arg(long, default_value_t = true)]
    independent_exporter: bool,

    #[arg(long, value_delimiter = '_')]
    cores: Vec<usize>,

    #[arg(long, default_value_t = 0)]
    chip: usize,

    #[arg(long, default_value_t = 32762)]
    hash_size: u32,

    #[arg(long, default_value_t = 3_000_000)]
    max_active_flows: u32,

    #[arg(long, default_value_t = 10_000)]
    max_per_batch: i64,

    #[arg(long)]
    output_file: Option<PathBuf>,

    #[arg(long, default_value_t = 200)]
    flows_per_task_check: i64,

    #[arg(long, default_value = "127.0.0.1")]
    collector: Ipv4Addr,

    #[arg(long, default_value_t = 2055)]
    port: u16,

    #[arg(long, default_value_t = 0)]
    min_flow_size: u32,

    /// Disable promiscuous mode
    #[arg(long)]
    nopromisc: bool,

    /// Force the single-threaded sequential composition
    #[arg(long)]
    sequential: bool,
}

impl Cli {
    fn into_config(self) -> ProbeConfig {
        ProbeConfig {
            interfaces: self.interfaces,
            promisc: !self.nopromisc,
            idle_timeout: Duration::from_secs(self.idle_timeout),
            lifetime_timeout: Duration::from_secs(self.lifetime_timeout),
            queue_timeout: Duration::from_secs(self.queue_timeout),
            readers: self.readers,
            workers: self.workers,
            independent_exporter: self.independent_exporter,
            cores: self.cores,
            chip: self.chip,
            hash_size: self.hash_size,
            max_active_flows: self.max_active_flows,
            max_per_batch: self.max_per_batch,
            output_file: self.output_file,
            flows_per_task_check: self.flows_per_task_check,
            collector: SocketAddrV4::new(self.collector, self.port),
            min_flow_size: self.min_flow_size,
            sequential: self.sequential,
        }
    }
}

fn wallclock_now() -> Timeval {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    Timeval::new(now.as_secs() as u32, now.subsec_micros())
}

fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let pcap_path = cli.pcap.clone();
    let config = cli.into_config();

    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "configuration error");
        return std::process::ExitCode::from(1);
    }

    let terminate = Arc::new(AtomicBool::new(false));
    {
        let terminate = Arc::clone(&terminate);
        if let Err(e) = ctrlc::set_handler(move || {
            terminate.store(true, Ordering::SeqCst);
        }) {
            tracing::warn!(error = %e, "failed to install SIGINT handler");
        }
    }

    let system_start_ms = wallclock_now().millis_since(0);
    let counters = Arc::new(Counters::default());

    let export = match open_export_stage(&config, system_start_ms, Arc::clone(&counters)) {
        Ok(e) => e,
        Err(e) => {
            tracing::error!(error = %e, "failed to start export stage");
            return std::process::ExitCode::from(1);
        }
    };

    if config.sequential {
        // Sequential composition forces workerCount to 1: one shard spanning
        // the whole hash space, not `hashSize / workers`.
        let shard = ffprobe_rs::shard::Shard::new(
            config.hash_size,
            config.max_active_flows,
            config.idle_timeout.as_secs() as u32,
            config.lifetime_timeout.as_secs() as u32,
        );
        let aggregation = AggregationStage::new(0, shard, config.flows_per_task_check_effective(), Arc::clone(&counters));
        let source = match open_source(pcap_path.as_deref()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "failed to open capture source");
                return std::process::ExitCode::from(1);
            }
        };
        let capture = CaptureStage::new(source, 1, config.max_per_batch_effective(), config.hash_size, Arc::clone(&terminate), counters);
        let snapshot = run_sequential(capture, aggregation, export, wallclock_now);
        tracing::info!(?snapshot, "pipeline terminated");
        return std::process::ExitCode::SUCCESS;
    }

    // Each reader opens its own capture source, mirroring ffProbe's per-reader
    // pfring ring; replaying the same pcap path `readers` times over stands in
    // for hardware fan-out clustering, which is out of scope here.
    let mut captures = Vec::with_capacity(config.readers);
    for _ in 0..config.readers {
        let source = match open_source(pcap_path.as_deref()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "failed to open capture source");
                return std::process::ExitCode::from(1);
            }
        };
        captures.push(CaptureStage::new(source, config.workers, config.max_per_batch_effective(), config.hash_size, Arc::clone(&terminate), Arc::clone(&counters)));
    }
    let aggregations: Vec<_> = build_shards(&config)
        .into_iter()
        .enumerate()
        .map(|(id, shard)| AggregationStage::new(id, shard, config.flows_per_task_check_effective(), Arc::clone(&counters)))
        .collect();

    let pipeline = ParallelPipeline::spawn(captures, aggregations, export, config.independent_exporter, terminate, wallclock_now);
    let snapshot = pipeline.join();
    tracing::info!(?snapshot, "pipeline terminated");
    std::process::ExitCode::SUCCESS
}

fn open_source(pcap_path: Option<&std::path::Path>) -> Result<Box<dyn PacketSource + Send>, ProbeError> {
    match pcap_path {
        Some(path) => PcapFileSource::open(path, wallclock_now())
            .map(|s| Box::new(s) as Box<dyn PacketSource + Send>)
            .map_err(ProbeError::CaptureOpen),
        None => Ok(Box::new(VecPacketSource::new(Vec::new()))),
    }
}
