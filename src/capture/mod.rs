//! The capture stage: drains a packet source, parses each frame's L2/L3/L4
//! headers, and routes the resulting flow key to the worker that owns it.

pub mod headers;
pub mod source;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::flow::{FlowKey, FlowRecord, TcpFlags, Timeval};
use crate::pipeline::Counters;
use crate::task::Task;
use headers::{ParseError, parse_frame};
use source::{CapturedPacket, PacketSource};

/// Parameters the capture stage is configured with, minus the parts
/// ([`crate::config::ProbeConfig`] already owns interface names and
/// promisc) that belong to opening the source rather than running an
/// activation.
pub struct CaptureStage<S: PacketSource> {
    source: S,
    worker_count: usize,
    max_per_batch: usize,
    hash_size: u32,
    shard_size: u32,
    terminate: Arc<AtomicBool>,
    eof_emitted: bool,
    counters: Arc<Counters>,
}

impl<S: PacketSource> CaptureStage<S> {
    pub fn new(source: S, worker_count: usize, max_per_batch: usize, hash_size: u32, terminate: Arc<AtomicBool>, counters: Arc<Counters>) -> Self {
        Self {
            source,
            worker_count,
            max_per_batch,
            hash_size,
            shard_size: hash_size / worker_count as u32,
            terminate,
            eof_emitted: false,
            counters,
        }
    }

    pub fn counters(&self) -> &Arc<Counters> {
        &self.counters
    }

    /// One activation: returns `None` once the EOF task has already been
    /// produced and consumed by a prior call.
    pub fn activate(&mut self, wallclock: Timeval) -> Option<Task> {
        if self.eof_emitted {
            return None;
        }

        if self.terminate.load(Ordering::SeqCst) || self.source.is_exhausted() {
            self.eof_emitted = true;
            return Some(Task::eof_marker(self.worker_count, wallclock));
        }

        let mut task = Task::new(self.worker_count, wallclock);
        let packets = self.source.poll_batch(self.max_per_batch);
        for packet in packets {
            self.route_packet(&mut task, &packet, wallclock);
        }
        Some(task)
    }

    fn route_packet(&self, task: &mut Task, packet: &CapturedPacket, timestamp: Timeval) {
        let parsed = match parse_frame(&packet.bytes) {
            Ok(p) => p,
            Err(ParseError::Truncated) | Err(ParseError::NotIpv4) => {
                self.counters.packets_dropped_source.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        self.counters.packets_parsed.fetch_add(1, Ordering::Relaxed);

        let key = FlowKey {
            src_addr: parsed.src_addr,
            dst_addr: parsed.dst_addr,
            src_port: parsed.src_port,
            dst_port: parsed.dst_port,
            proto: parsed.proto,
            tos: parsed.tos,
        };
        let tcp_flags = if parsed.proto == 6 {
            headers::remap_tcp_flags(parsed.raw_tcp_flags)
        } else {
            TcpFlags::empty()
        };
        let octets = (packet.bytes.len().saturating_sub(headers::ETHERNET_HEADER_LEN)) as u32;
        let record = FlowRecord::first_packet(key, octets, timestamp, tcp_flags, self.hash_size);

        let worker_id = (record.hash_id / self.shard_size) as usize;
        task.route_to_worker(worker_id.min(self.worker_count - 1), record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use source::VecPacketSource;

    fn ipv4_udp_frame(src_port: u16) -> Vec<u8> {
        let mut eth = vec![0u8; 12];
        eth.extend_from_slice(&0x0800u16.to_be_bytes());
        let mut ip = vec![0x45u8, 0x00, 0, 0, 0, 0, 0, 0, 64, 17, 0, 0];
        ip.extend_from_slice(&0x0a000001u32.to_be_bytes());
        ip.extend_from_slice(&0x0a000002u32.to_be_bytes());
        let mut udp = src_port.to_be_bytes().to_vec();
        udp.extend_from_slice(&53u16.to_be_bytes());
        let mut frame = eth;
        frame.extend_from_slice(&ip);
        frame.extend_from_slice(&udp);
        frame
    }

    #[test]
    fn activation_routes_packet_to_the_worker_owning_its_hash() {
        let source = VecPacketSource::new(vec![CapturedPacket {
            timestamp: Timeval::new(0, 0),
            bytes: ipv4_udp_frame(1000),
        }]);
        let terminate = Arc::new(AtomicBool::new(false));
        let mut stage = CaptureStage::new(source, 2, 10_000, 16, terminate, Arc::new(Counters::default()));
        let mut task = stage.activate(Timeval::new(0, 0)).unwrap();
        let total: usize = (0..2).map(|w| task.take_worker_queue(w).len()).sum();
        assert_eq!(total, 1);
    }

    #[test]
    fn exhausted_source_yields_a_single_eof_task() {
        let source = VecPacketSource::new(vec![]);
        let terminate = Arc::new(AtomicBool::new(false));
        let mut stage = CaptureStage::new(source, 1, 10_000, 16, terminate, Arc::new(Counters::default()));
        let eof = stage.activate(Timeval::new(0, 0)).unwrap();
        assert!(eof.eof);
        assert!(stage.activate(Timeval::new(1, 0)).is_none());
    }

    #[test]
    fn empty_batch_still_produces_a_timestamped_task() {
        let source = VecPacketSource::new(vec![CapturedPacket {
            timestamp: Timeval::new(0, 0),
            bytes: ipv4_udp_frame(1000),
        }]);
        let terminate = Arc::new(AtomicBool::new(false));
        let mut stage = CaptureStage::new(source, 1, 0, 16, terminate, Arc::new(Counters::default()));
        let task = stage.activate(Timeval::new(5, 0)).unwrap();
        assert!(!task.eof);
        assert_eq!(task.timestamp, Timeval::new(5, 0));
    }

    #[test]
    fn terminate_flag_short_circuits_to_eof() {
        let source = VecPacketSource::new(vec![CapturedPacket {
            timestamp: Timeval::new(0, 0),
            bytes: ipv4_udp_frame(1000),
        }]);
        let terminate = Arc::new(AtomicBool::new(true));
        let mut stage = CaptureStage::new(source, 1, 10_000, 16, terminate, Arc::new(Counters::default()));
        let task = stage.activate(Timeval::new(0, 0)).unwrap();
        assert!(task.eof);
    }
}
