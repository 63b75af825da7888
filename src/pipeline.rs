//! The pipeline driver: wires capture, aggregation, and export into one of
//! three compositions (sequential, single-reader staged, multi-reader with a
//! gather thread), connected by small bounded `crossbeam-channel` queues.

use std::net::UdpSocket;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, bounded};
use tracing::{info, warn};

use crate::aggregation::AggregationStage;
use crate::capture::CaptureStage;
use crate::capture::source::PacketSource;
use crate::config::ProbeConfig;
use crate::error::ProbeError;
use crate::export::ExportStage;
use crate::flow::Timeval;
use crate::shard::Shard;
use crate::task::Task;

/// Inter-stage queue depth: deliberately bounded and small so a reader
/// blocked on a full queue loses packets at the source rather than hiding
/// backpressure in an unbounded buffer.
pub const QUEUE_DEPTH: usize = 32;

/// Telemetry counters: the events worth counting exposed as atomics rather
/// than wrapped in a periodic printer — statistics *printing* is out of
/// scope. One `Arc<Counters>` is shared (cloned) across every stage of a
/// composed pipeline so each stage updates it inline.
#[derive(Debug, Default)]
pub struct Counters {
    pub packets_parsed: AtomicU64,
    pub packets_dropped_source: AtomicU64,
    pub queue_backpressure_spins: AtomicU64,
    pub pdus_sent: AtomicU64,
    pub pdus_send_failed: AtomicU64,
    pub flows_expired: AtomicU64,
    pub flows_dropped_min_size: AtomicU64,
}

impl Counters {
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            packets_parsed: self.packets_parsed.load(Ordering::Relaxed),
            packets_dropped_source: self.packets_dropped_source.load(Ordering::Relaxed),
            queue_backpressure_spins: self.queue_backpressure_spins.load(Ordering::Relaxed),
            pdus_sent: self.pdus_sent.load(Ordering::Relaxed),
            pdus_send_failed: self.pdus_send_failed.load(Ordering::Relaxed),
            flows_expired: self.flows_expired.load(Ordering::Relaxed),
            flows_dropped_min_size: self.flows_dropped_min_size.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CountersSnapshot {
    pub packets_parsed: u64,
    pub packets_dropped_source: u64,
    pub queue_backpressure_spins: u64,
    pub pdus_sent: u64,
    pub pdus_send_failed: u64,
    pub flows_expired: u64,
    pub flows_dropped_min_size: u64,
}

fn send_with_backpressure_counting<T>(tx: &Sender<T>, value: T, counters: &Counters) {
    let mut value = value;
    loop {
        match tx.try_send(value) {
            Ok(()) => return,
            Err(crossbeam_channel::TrySendError::Full(v)) => {
                counters.queue_backpressure_spins.fetch_add(1, Ordering::Relaxed);
                value = v;
                thread::sleep(Duration::from_micros(50));
            }
            Err(crossbeam_channel::TrySendError::Disconnected(_)) => return,
        }
    }
}

/// Runs the whole pipeline to completion in a single thread: capture,
/// worker 0, and export in a loop, with `workerCount` forced to 1. Intended
/// for tests and the `--sequential` CLI flag.
pub fn run_sequential<S: PacketSource>(
    mut capture: CaptureStage<S>,
    mut aggregation: AggregationStage,
    mut export: ExportStage,
    wallclock: impl Fn() -> Timeval,
) -> CountersSnapshot {
    let counters = Arc::clone(capture.counters());
    loop {
        let now = wallclock();
        let Some(task) = capture.activate(now) else { break };
        let eof = task.eof;
        let mut task = aggregation.activate(task, now);
        let export_queue = task.take_export_queue();
        export.activate(export_queue, eof, now);
        if eof {
            break;
        }
    }
    counters.snapshot()
}

/// Parallel composition: one or more readers feed worker 0's queue, worker
/// `i` feeds worker `i+1`'s queue, and the last worker either hands off to
/// an independent export thread or is fused with export in the same
/// thread — one OS thread per stage (plus a gather thread when there is
/// more than one reader), bounded queues of depth [`QUEUE_DEPTH`] between
/// them.
pub struct ParallelPipeline {
    handles: Vec<thread::JoinHandle<()>>,
    counters: Arc<Counters>,
    terminate: Arc<AtomicBool>,
}

impl ParallelPipeline {
    /// `independent_exporter = false` fuses the last worker and the exporter
    /// into a single thread (`export(worker(t))`) instead of connecting them
    /// with their own queue and thread.
    pub fn spawn<S>(
        mut captures: Vec<CaptureStage<S>>,
        mut aggregations: Vec<AggregationStage>,
        mut export: ExportStage,
        independent_exporter: bool,
        terminate: Arc<AtomicBool>,
        wallclock: impl Fn() -> Timeval + Send + Clone + 'static,
    ) -> Self
    where
        S: PacketSource + Send + 'static,
    {
        assert!(!captures.is_empty(), "at least one reader is required");
        assert!(!aggregations.is_empty(), "at least one aggregation worker is required");
        let counters = Arc::clone(captures[0].counters());
        let mut handles = Vec::new();
        let (first_tx, first_rx) = bounded::<Task>(QUEUE_DEPTH);

        if captures.len() == 1 {
            let mut capture = captures.remove(0);
            let counters = Arc::clone(&counters);
            let wallclock = wallclock.clone();
            handles.push(thread::spawn(move || {
                loop {
                    let now = wallclock();
                    let Some(task) = capture.activate(now) else { break };
                    let eof = task.eof;
                    send_with_backpressure_counting(&first_tx, task, &counters);
                    if eof {
                        break;
                    }
                }
            }));
        } else {
            // Each reader writes into its own queue; a gather thread
            // round-robins those queues into the shared worker pipeline.
            let mut reader_rxs = Vec::with_capacity(captures.len());
            for mut capture in captures.drain(..) {
                let (tx, rx) = bounded::<Task>(QUEUE_DEPTH);
                reader_rxs.push(rx);
                let counters = Arc::clone(&counters);
                let wallclock = wallclock.clone();
                handles.push(thread::spawn(move || {
                    loop {
                        let now = wallclock();
                        let Some(task) = capture.activate(now) else { break };
                        let eof = task.eof;
                        send_with_backpressure_counting(&tx, task, &counters);
                        if eof {
                            break;
                        }
                    }
                }));
            }
            let counters = Arc::clone(&counters);
            handles.push(thread::spawn(move || {
                gather_round_robin(&reader_rxs, &first_tx, &counters);
            }));
        }

        let last_aggregation = aggregations.pop().expect("at least one aggregation worker is required");
        let mut prev_rx: Option<Receiver<Task>> = Some(first_rx);

        for mut stage in aggregations.drain(..) {
            let rx = prev_rx.take().expect("a prior stage always feeds the next");
            let (tx, next_rx) = bounded::<Task>(QUEUE_DEPTH);
            let counters = Arc::clone(&counters);
            let wallclock = wallclock.clone();
            handles.push(thread::spawn(move || {
                for task in rx.iter() {
                    let eof = task.eof;
                    let now = wallclock();
                    let task = stage.activate(task, now);
                    send_with_backpressure_counting(&tx, task, &counters);
                    if eof {
                        break;
                    }
                }
            }));
            prev_rx = Some(next_rx);
        }

        let rx = prev_rx.expect("export stage always has an upstream queue");
        let mut last_aggregation = last_aggregation;
        if independent_exporter {
            let (tx, export_rx) = bounded::<Task>(QUEUE_DEPTH);
            let counters = Arc::clone(&counters);
            let wallclock_worker = wallclock.clone();
            handles.push(thread::spawn(move || {
                for task in rx.iter() {
                    let eof = task.eof;
                    let now = wallclock_worker();
                    let task = last_aggregation.activate(task, now);
                    send_with_backpressure_counting(&tx, task, &counters);
                    if eof {
                        break;
                    }
                }
            }));
            let wallclock_export = wallclock.clone();
            handles.push(thread::spawn(move || {
                for mut task in export_rx.iter() {
                    let eof = task.eof;
                    let now = wallclock_export();
                    let export_queue = task.take_export_queue();
                    export.activate(export_queue, eof, now);
                    if eof {
                        break;
                    }
                }
            }));
        } else {
            let wallclock = wallclock.clone();
            handles.push(thread::spawn(move || {
                for task in rx.iter() {
                    let eof = task.eof;
                    let now = wallclock();
                    let mut task = last_aggregation.activate(task, now);
                    let export_queue = task.take_export_queue();
                    export.activate(export_queue, eof, now);
                    if eof {
                        break;
                    }
                }
            }));
        }

        Self { handles, counters, terminate }
    }

    pub fn join(self) -> CountersSnapshot {
        for handle in self.handles {
            let _ = handle.join();
        }
        self.counters.snapshot()
    }

    pub fn signal_terminate(&self) {
        self.terminate.store(true, Ordering::SeqCst);
    }
}

/// Multiple-reader composition: each reader feeds its own bounded queue;
/// a single gather thread round-robin-polls those queues
/// with a [`crossbeam_channel::Select`] set and feeds the shared W-stage
/// pipeline, preserving single-writer-per-shard because the source already
/// clusters packets per-flow across readers.
pub fn gather_round_robin(receivers: &[Receiver<Task>], downstream: &Sender<Task>, counters: &Counters) {
    let mut sel = crossbeam_channel::Select::new();
    for rx in receivers {
        sel.recv(rx);
    }
    let mut live = receivers.len();
    let mut eof_forwarded = false;
    while live > 0 {
        let oper = sel.select();
        let index = oper.index();
        match oper.recv(&receivers[index]) {
            Ok(task) => {
                // Every reader shares the same terminate flag, so each emits
                // its own EOF task; only the first one is let through so the
                // downstream pipeline sees exactly one.
                let eof = task.eof;
                if !eof || !eof_forwarded {
                    send_with_backpressure_counting(downstream, task, counters);
                    eof_forwarded |= eof;
                }
            }
            Err(_) => {
                sel.remove(index);
                live -= 1;
            }
        }
    }
}

/// Opens the UDP export socket and, if configured, the text log file: a
/// bind failure is fatal, a text log open failure is logged and disables
/// text output without aborting.
pub fn open_export_stage(config: &ProbeConfig, system_start_ms: u32, counters: Arc<Counters>) -> Result<ExportStage, ProbeError> {
    let socket = UdpSocket::bind("0.0.0.0:0").map_err(ProbeError::SocketBind)?;
    let text_log = match &config.output_file {
        Some(path) => match std::fs::File::create(path) {
            Ok(f) => Some(f),
            Err(e) => {
                warn!(error = %e, path = %path.display(), "failed to open text log output, continuing without it");
                None
            }
        },
        None => None,
    };
    info!(collector = %config.collector, "export stage ready");
    ExportStage::new(socket, config.collector, config.min_flow_size, system_start_ms, config.queue_timeout.as_secs() as u32, text_log, counters).map_err(ProbeError::TextLogOpen)
}

pub fn build_shards(config: &ProbeConfig) -> Vec<Shard> {
    let bucket_count = config.shard_size();
    (0..config.workers)
        .map(|_| Shard::new(bucket_count, config.max_active_flows, config.idle_timeout.as_secs() as u32, config.lifetime_timeout.as_secs() as u32))
        .collect()
}
