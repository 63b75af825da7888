//! The shard hash table: a per-worker chained hash of [`FlowRecord`]s
//! with an incremental, cursor-carrying expiry sweep.

use crate::flow::{FlowRecord, Timeval};

const INITIAL_BUCKET_CAPACITY: usize = 10;

/// One hash-bucket: a dynamically sized run of records with capacity that
/// doubles on overflow and halves once utilization drops below 50%.
/// `Vec<T>` already gives us "dynamically sized run with size/capacity" for
/// free; `swap_remove_and_shrink` below adds the explicit shrink-on-underuse
/// behavior, which `Vec` alone does not do (`Vec::shrink_to_fit` drops
/// straight to `len`, not to a halving policy).
#[derive(Debug, Default, Clone)]
struct Bucket {
    records: Vec<FlowRecord>,
}

impl Bucket {
    fn push(&mut self, record: FlowRecord) {
        if self.records.is_empty() {
            self.records.reserve_exact(INITIAL_BUCKET_CAPACITY);
        }
        self.records.push(record);
    }

    /// Swap-remove `index` and shrink the backing storage if utilization
    /// dropped below half. The halved capacity must never go below the
    /// element count that's about to remain; `Vec::shrink_to` guarantees
    /// this, unlike a naive `realloc` to `capacity/2` would if `size` ever
    /// exceeded it.
    fn swap_remove_and_shrink(&mut self, index: usize) -> FlowRecord {
        let removed = self.records.swap_remove(index);
        let capacity = self.records.capacity();
        let half = capacity / 2;
        if self.records.len() < half && half >= INITIAL_BUCKET_CAPACITY {
            self.records.shrink_to(half.max(self.records.len()));
        }
        removed
    }
}

/// Cursor position for the incremental expiry sweep, carried across calls so
/// work is amortized fairly over all buckets rather than always starting
/// from bucket 0.
#[derive(Debug, Clone, Copy, Default)]
struct SweepCursor {
    bucket: usize,
    slot: usize,
}

/// A single worker's partition of the global hash space:
/// `bucket_count` buckets (`hash_size / worker_count`).
#[derive(Debug)]
pub struct Shard {
    buckets: Vec<Bucket>,
    active_flows: u32,
    max_active_flows: u32,
    idle_timeout_secs: u32,
    lifetime_timeout_secs: u32,
    cursor: SweepCursor,
}

impl Shard {
    pub fn new(bucket_count: u32, max_active_flows: u32, idle_timeout_secs: u32, lifetime_timeout_secs: u32) -> Self {
        Self {
            buckets: (0..bucket_count).map(|_| Bucket::default()).collect(),
            active_flows: 0,
            max_active_flows,
            idle_timeout_secs,
            lifetime_timeout_secs,
            cursor: SweepCursor::default(),
        }
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Always equal to the sum of bucket sizes.
    pub fn active_flows(&self) -> u32 {
        self.active_flows
    }

    #[cfg(test)]
    fn recount_active_flows(&self) -> u32 {
        self.buckets.iter().map(|b| b.records.len() as u32).sum()
    }

    fn bucket_index_of(&self, hash_id: u32) -> usize {
        (hash_id as usize) % self.buckets.len()
    }

    /// Upserts every record in `incoming` into this shard, merging into an
    /// existing flow on a key hit or inserting a new one on a miss. Expired
    /// records produced by a saturation-triggered emergency sweep are
    /// appended to `expired_out`.
    pub fn upsert_batch(&mut self, incoming: impl IntoIterator<Item = FlowRecord>, expired_out: &mut Vec<FlowRecord>) {
        for record in incoming {
            self.upsert_one(record, expired_out);
        }
    }

    fn upsert_one(&mut self, incoming: FlowRecord, expired_out: &mut Vec<FlowRecord>) {
        let bucket_idx = self.bucket_index_of(incoming.hash_id);
        let bucket = &mut self.buckets[bucket_idx];

        if let Some(existing) = bucket.records.iter_mut().find(|r| r.key == incoming.key) {
            existing.merge_packet(incoming.octets, incoming.first, incoming.tcp_flags);
            return;
        }

        bucket.push(incoming);
        self.active_flows += 1;

        if self.active_flows == self.max_active_flows {
            // Saturation-triggered emergency flush, deliberately unbounded
            // rather than capped — capping would change which records are
            // live immediately after this call.
            self.expire_sweep(-1, expired_out, None);
        }
    }

    /// Checks up to `n` records for expiry, resuming from the cursor left
    /// by the previous call. `n < 0` means unbounded. `now = None` treats
    /// every record as expired (used by [`Shard::flush`] and the
    /// saturation path above).
    pub fn expire_sweep(&mut self, n: i64, expired_out: &mut Vec<FlowRecord>, now: Option<Timeval>) {
        if n == 0 || self.buckets.is_empty() {
            return;
        }
        let budget = if n < 0 { u64::MAX } else { n as u64 };
        let mut checked = 0u64;
        let mut lines_checked = 0usize;

        while checked < budget && lines_checked <= self.buckets.len() {
            let bucket_idx = self.cursor.bucket % self.buckets.len();
            let bucket = &mut self.buckets[bucket_idx];

            if self.cursor.slot >= bucket.records.len() {
                self.cursor.bucket = (bucket_idx + 1) % self.buckets.len();
                self.cursor.slot = 0;
                lines_checked += 1;
                continue;
            }

            let record = bucket.records[self.cursor.slot];
            checked += 1;
            if record.is_expired(self.idle_timeout_secs, self.lifetime_timeout_secs, now) {
                let removed = bucket.swap_remove_and_shrink(self.cursor.slot);
                expired_out.push(removed);
                self.active_flows -= 1;
                // cursor stays at `slot`: a new record (the one swapped in)
                // now occupies it.
            } else {
                self.cursor.slot += 1;
            }
        }
    }

    /// `flush` ≡ `expireSweep(unbounded, expired_out, None)`.
    pub fn flush(&mut self, expired_out: &mut Vec<FlowRecord>) {
        self.expire_sweep(-1, expired_out, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{FlowKey, TcpFlags};

    fn key(src_port: u16) -> FlowKey {
        FlowKey {
            src_addr: 1,
            dst_addr: 2,
            src_port,
            dst_port: 53,
            proto: 17,
            tos: 0,
        }
    }

    fn record(src_port: u16, hash_size: u32, t: Timeval) -> FlowRecord {
        FlowRecord::first_packet(key(src_port), 100, t, TcpFlags::empty(), hash_size)
    }

    #[test]
    fn upsert_of_empty_batch_is_a_no_op() {
        let mut shard = Shard::new(16, 1000, 30, 120);
        let mut expired = vec![];
        shard.upsert_batch(std::iter::empty(), &mut expired);
        assert_eq!(shard.active_flows(), 0);
        assert!(expired.is_empty());
    }

    #[test]
    fn expire_sweep_of_zero_is_a_no_op_and_does_not_move_cursor() {
        let mut shard = Shard::new(16, 1000, 30, 120);
        let mut expired = vec![];
        shard.upsert_batch([record(1000, 16 * 16, Timeval::new(0, 0))], &mut expired);
        let cursor_before = (shard.cursor.bucket, shard.cursor.slot);
        shard.expire_sweep(0, &mut expired, Some(Timeval::new(1000, 0)));
        assert_eq!((shard.cursor.bucket, shard.cursor.slot), cursor_before);
        assert!(expired.is_empty());
    }

    #[test]
    fn single_udp_flow_two_packets_then_idle_expiry() {
        // A UDP flow seen twice, then aged out by idle timeout.
        let hash_size = 16;
        let mut shard = Shard::new(hash_size, 1000, 30, 120);
        let mut expired = vec![];
        let k = FlowKey {
            src_addr: 0x0a000001,
            dst_addr: 0x0a000002,
            src_port: 1000,
            dst_port: 53,
            proto: 17,
            tos: 0,
        };
        let p1 = FlowRecord::first_packet(k, 100 - 14, Timeval::new(0, 0), TcpFlags::empty(), hash_size);
        let p2 = FlowRecord::first_packet(k, 100 - 14, Timeval::new(1, 0), TcpFlags::empty(), hash_size);
        shard.upsert_batch([p1], &mut expired);
        shard.upsert_batch([p2], &mut expired);
        assert_eq!(shard.active_flows(), 1);

        shard.expire_sweep(-1, &mut expired, Some(Timeval::new(1 + 31, 0)));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].packets, 2);
        assert_eq!(expired[0].octets, 172);
        assert_eq!(expired[0].first, Timeval::new(0, 0));
        assert_eq!(expired[0].last, Timeval::new(1, 0));
        assert_eq!(shard.active_flows(), 0);
    }

    #[test]
    fn tcp_fin_expires_on_next_sweep_even_if_fresh() {
        // A TCP flow with FIN set is flagged for eviction even while fresh.
        let hash_size = 16;
        let mut shard = Shard::new(hash_size, 1000, 30, 120);
        let mut expired = vec![];
        let k = FlowKey {
            src_addr: 1,
            dst_addr: 2,
            src_port: 1000,
            dst_port: 80,
            proto: 6,
            tos: 0,
        };
        let pkt = FlowRecord::first_packet(k, 60, Timeval::new(0, 0), TcpFlags::SYN | TcpFlags::FIN, hash_size);
        shard.upsert_batch([pkt], &mut expired);
        shard.expire_sweep(-1, &mut expired, Some(Timeval::new(0, 0)));
        assert_eq!(expired.len(), 1);
    }

    #[test]
    fn two_flows_same_bucket_coexist_and_export_independently() {
        // Two distinct keys hashed into the same bucket coexist and export independently.
        let hash_size = 1; // forces both keys into bucket 0 of a single-bucket shard
        let mut shard = Shard::new(1, 1000, 30, 120);
        let mut expired = vec![];
        let a = record(1000, hash_size, Timeval::new(0, 0));
        let b = record(2000, hash_size, Timeval::new(0, 0));
        shard.upsert_batch([a, b], &mut expired);
        assert_eq!(shard.active_flows(), 2);
        shard.flush(&mut expired);
        assert_eq!(expired.len(), 2);
        let ports: Vec<_> = expired.iter().map(|r| r.key.src_port).collect();
        assert!(ports.contains(&1000) && ports.contains(&2000));
    }

    #[test]
    fn shard_saturation_triggers_mid_batch_flush() {
        // Hitting max_active_flows mid-batch triggers an emergency flush.
        // The flush is unbounded with now=None, so it expires every record
        // live at that point (a and b), not just enough to get under the cap.
        let mut shard = Shard::new(4, 2, 30, 120);
        let mut expired = vec![];
        let a = record(1, 4, Timeval::new(0, 0));
        let b = record(2, 4, Timeval::new(0, 0));
        let c = record(3, 4, Timeval::new(0, 0));
        shard.upsert_batch([a, b, c], &mut expired);
        assert_eq!(expired.len(), 2);
        assert!(shard.active_flows() <= 2);
    }

    #[test]
    fn active_flows_matches_sum_of_bucket_sizes_after_mixed_ops() {
        let mut shard = Shard::new(8, 1000, 30, 120);
        let mut expired = vec![];
        for port in 0..20u16 {
            shard.upsert_batch([record(port, 8, Timeval::new(0, 0))], &mut expired);
        }
        shard.expire_sweep(5, &mut expired, Some(Timeval::new(1000, 0)));
        assert_eq!(shard.active_flows(), shard.recount_active_flows());
    }

    #[test]
    fn bucket_shrink_never_truncates_live_records() {
        let mut shard = Shard::new(1, 1000, 30, 120);
        let mut expired = vec![];
        for port in 0..40u16 {
            shard.upsert_batch([record(port, 1, Timeval::new(0, 0))], &mut expired);
        }
        // Drop back down to a handful of flows; shrink must never cut live data.
        for port in 0..35u16 {
            shard.upsert_batch([], &mut expired);
            let _ = port;
        }
        shard.expire_sweep(35, &mut expired, Some(Timeval::new(1000, 0)));
        assert_eq!(shard.buckets[0].records.len() + expired.len(), 40);
    }
}
