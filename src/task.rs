//! The inter-stage message: one capture-batch timestamp, one enqueue
//! sub-queue per worker, one shared export queue, and an EOF marker.

use crate::flow::{FlowRecord, Timeval};

/// Carrier for a single capture activation's worth of work as it flows
/// through capture → aggregation(×W) → export.
#[derive(Debug, Clone)]
pub struct Task {
    /// Coarse wallclock timestamp stamped once at capture-batch start,
    /// deliberately not per-packet.
    pub timestamp: Timeval,
    /// One queue per aggregation worker; `flows_to_add[i]` holds the
    /// records this activation routed to worker `i`'s shard.
    flows_to_add: Vec<Vec<FlowRecord>>,
    /// Shared queue of already-expired records, appended to by every
    /// aggregation stage the task passes through.
    flows_to_export: Vec<FlowRecord>,
    pub eof: bool,
}

impl Task {
    pub fn new(worker_count: usize, timestamp: Timeval) -> Self {
        Self {
            timestamp,
            flows_to_add: vec![Vec::new(); worker_count],
            flows_to_export: Vec::new(),
            eof: false,
        }
    }

    pub fn eof_marker(worker_count: usize, timestamp: Timeval) -> Self {
        let mut task = Self::new(worker_count, timestamp);
        task.eof = true;
        task
    }

    /// Routes a parsed record into worker `worker_id`'s add-queue — the
    /// capture stage's per-packet dispatch step.
    pub fn route_to_worker(&mut self, worker_id: usize, record: FlowRecord) {
        self.flows_to_add[worker_id].push(record);
    }

    /// Drains worker `worker_id`'s add-queue. Used by the aggregation stage,
    /// which owns exactly one worker id and never touches another's queue.
    pub fn take_worker_queue(&mut self, worker_id: usize) -> Vec<FlowRecord> {
        std::mem::take(&mut self.flows_to_add[worker_id])
    }

    pub fn export_queue_mut(&mut self) -> &mut Vec<FlowRecord> {
        &mut self.flows_to_export
    }

    pub fn take_export_queue(&mut self) -> Vec<FlowRecord> {
        std::mem::take(&mut self.flows_to_export)
    }

    pub fn worker_count(&self) -> usize {
        self.flows_to_add.len()
    }
}
