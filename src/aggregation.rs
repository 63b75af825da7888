//! The aggregation stage, replicated one per worker: upsert this worker's
//! incoming sub-queue into its [`Shard`], run a bounded expiry sweep,
//! forward the task.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::flow::Timeval;
use crate::pipeline::Counters;
use crate::shard::Shard;
use crate::task::Task;

pub struct AggregationStage {
    worker_id: usize,
    shard: Shard,
    flows_per_task_check: i64,
    counters: Arc<Counters>,
}

impl AggregationStage {
    pub fn new(worker_id: usize, shard: Shard, flows_per_task_check: i64, counters: Arc<Counters>) -> Self {
        Self { worker_id, shard, flows_per_task_check, counters }
    }

    pub fn shard(&self) -> &Shard {
        &self.shard
    }

    /// One activation. `now` is the wallclock used for the
    /// bounded sweep; ignored on an EOF task, which instead triggers a full
    /// flush of this worker's shard.
    pub fn activate(&mut self, mut task: Task, now: Timeval) -> Task {
        let incoming = task.take_worker_queue(self.worker_id);
        let mut expired = Vec::new();
        self.shard.upsert_batch(incoming, &mut expired);

        if task.eof {
            self.shard.flush(&mut expired);
        } else {
            self.shard.expire_sweep(self.flows_per_task_check, &mut expired, Some(now));
        }

        self.counters.flows_expired.fetch_add(expired.len() as u64, Ordering::Relaxed);
        task.export_queue_mut().extend(expired);
        task
    }
}
