//! The export stage: batches expired flow records into NetFlow v5 PDUs and
//! ships them by UDP, with an optional pipe-delimited text log.
//!
//! The wire encoding builds each field's big-endian bytes and
//! `extend_from_slice`s them in order; the text log's header line and field
//! order mirror a typical NetFlow v5 collector feed.

use std::fs::File;
use std::io::Write;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::error::ProbeError;
use crate::flow::{FlowRecord, Timeval};
use crate::pipeline::Counters;

pub const MAX_FLOWS_PER_PDU: usize = 30;
const HEADER_LEN: usize = 24;
const RECORD_LEN: usize = 48;

const TEXT_LOG_HEADER: &str =
    "IPV4_SRC_ADDR|IPV4_DST_ADDR|OUT_PKTS|OUT_BYTES|FIRST_SWITCHED|LAST_SWITCHED|L4_SRC_PORT|L4_DST_PORT|TCP_FLAGS|PROTOCOL|SRC_TOS|\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PduHeader {
    pub version: u16,
    pub count: u16,
    pub sys_uptime_ms: u32,
    pub unix_secs: u32,
    pub unix_nsecs: u32,
    pub flow_sequence: u32,
    pub engine_type: u8,
    pub engine_id: u8,
    pub sampling_interval: u16,
}

impl PduHeader {
    fn to_be_bytes(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN);
        out.extend_from_slice(&self.version.to_be_bytes());
        out.extend_from_slice(&self.count.to_be_bytes());
        out.extend_from_slice(&self.sys_uptime_ms.to_be_bytes());
        out.extend_from_slice(&self.unix_secs.to_be_bytes());
        out.extend_from_slice(&self.unix_nsecs.to_be_bytes());
        out.extend_from_slice(&self.flow_sequence.to_be_bytes());
        out.push(self.engine_type);
        out.push(self.engine_id);
        out.extend_from_slice(&self.sampling_interval.to_be_bytes());
        out
    }
}

fn record_to_be_bytes(record: &FlowRecord, system_start_ms: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(RECORD_LEN);
    out.extend_from_slice(&record.key.src_addr.to_be_bytes());
    out.extend_from_slice(&record.key.dst_addr.to_be_bytes());
    out.extend_from_slice(&0u32.to_be_bytes()); // nexthop
    out.extend_from_slice(&0u16.to_be_bytes()); // input
    out.extend_from_slice(&0u16.to_be_bytes()); // output
    out.extend_from_slice(&record.packets.to_be_bytes());
    out.extend_from_slice(&record.octets.to_be_bytes());
    out.extend_from_slice(&record.first.millis_since(system_start_ms).to_be_bytes());
    out.extend_from_slice(&record.last.millis_since(system_start_ms).to_be_bytes());
    out.extend_from_slice(&record.key.src_port.to_be_bytes());
    out.extend_from_slice(&record.key.dst_port.to_be_bytes());
    out.push(0); // pad1
    out.push(record.tcp_flags.bits());
    out.push(record.key.proto);
    out.push(record.key.tos);
    out.extend_from_slice(&0u16.to_be_bytes()); // src_as
    out.extend_from_slice(&0u16.to_be_bytes()); // dst_as
    out.push(0); // src_mask
    out.push(0); // dst_mask
    out.extend_from_slice(&0u16.to_be_bytes()); // pad2
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PduError {
    TooManyRecords { count: usize },
}

/// Builds the raw bytes of one PDU. `n > 30` returns `Err` rather than
/// truncating silently — the caller ([`ExportStage`] below) is responsible
/// for never calling this with more than 30.
pub fn build_pdu(records: &[FlowRecord], flow_sequence: u32, wallclock: Timeval, system_start_ms: u32) -> Result<Vec<u8>, PduError> {
    if records.is_empty() || records.len() > MAX_FLOWS_PER_PDU {
        return Err(PduError::TooManyRecords { count: records.len() });
    }
    let header = PduHeader {
        version: 5,
        count: records.len() as u16,
        sys_uptime_ms: wallclock.millis_since(system_start_ms),
        unix_secs: wallclock.secs,
        unix_nsecs: wallclock.micros * 1000,
        flow_sequence,
        engine_type: 0,
        engine_id: 0,
        sampling_interval: 0,
    };
    let mut out = header.to_be_bytes();
    for record in records {
        out.extend_from_slice(&record_to_be_bytes(record, system_start_ms));
    }
    Ok(out)
}

fn write_text_log_line(out: &mut impl Write, record: &FlowRecord) -> std::io::Result<()> {
    writeln!(
        out,
        "{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|",
        Ipv4Addr::from(record.key.src_addr),
        Ipv4Addr::from(record.key.dst_addr),
        record.packets,
        record.octets,
        record.first.secs,
        record.last.secs,
        record.key.src_port,
        record.key.dst_port,
        record.tcp_flags.bits(),
        record.key.proto,
        record.key.tos,
    )
}

/// State owned exclusively by the export stage: pending queue, UDP socket,
/// sequence counter, optional text log.
pub struct ExportStage {
    pending: Vec<FlowRecord>,
    socket: UdpSocket,
    collector: SocketAddrV4,
    flow_sequence: u32,
    min_flow_size: u32,
    system_start_ms: u32,
    queue_timeout_secs: u32,
    last_emission: Timeval,
    text_log: Option<File>,
    pdus_sent: u64,
    pdus_dropped: u64,
    counters: Arc<Counters>,
}

impl ExportStage {
    pub fn new(
        socket: UdpSocket,
        collector: SocketAddrV4,
        min_flow_size: u32,
        system_start_ms: u32,
        queue_timeout_secs: u32,
        text_log: Option<File>,
        counters: Arc<Counters>,
    ) -> std::io::Result<Self> {
        let mut stage = Self {
            pending: Vec::with_capacity(MAX_FLOWS_PER_PDU),
            socket,
            collector,
            flow_sequence: 0,
            min_flow_size,
            system_start_ms,
            queue_timeout_secs,
            last_emission: Timeval::default(),
            text_log,
            pdus_sent: 0,
            pdus_dropped: 0,
            counters,
        };
        if let Some(log) = stage.text_log.as_mut() {
            log.write_all(TEXT_LOG_HEADER.as_bytes())?;
        }
        Ok(stage)
    }

    pub fn pdus_sent(&self) -> u64 {
        self.pdus_sent
    }

    pub fn pdus_dropped(&self) -> u64 {
        self.pdus_dropped
    }

    pub fn flow_sequence(&self) -> u32 {
        self.flow_sequence
    }

    /// One activation: admit each expired record (subject to the TCP-only
    /// min-size filter), flush full batches eagerly, and flush whatever
    /// remains on EOF or once `queue_timeout_secs` has elapsed.
    pub fn activate(&mut self, mut records: Vec<FlowRecord>, eof: bool, wallclock: Timeval) {
        for record in records.drain(..) {
            let is_small_tcp = record.key.proto == 6 && record.octets < self.min_flow_size;
            if is_small_tcp {
                self.counters.flows_dropped_min_size.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            self.pending.push(record);
            if let Some(log) = self.text_log.as_mut() {
                let _ = write_text_log_line(log, &self.pending[self.pending.len() - 1]);
            }
            if self.pending.len() == MAX_FLOWS_PER_PDU {
                self.emit(wallclock);
            }
        }

        if eof {
            if !self.pending.is_empty() {
                self.emit(wallclock);
            }
            if let Some(log) = self.text_log.as_mut() {
                let _ = log.flush();
            }
            self.text_log = None;
        } else if !self.pending.is_empty() && wallclock.secs.saturating_sub(self.last_emission.secs) as u64 >= self.queue_timeout_secs as u64 {
            self.emit(wallclock);
        }
    }

    fn emit(&mut self, wallclock: Timeval) {
        let batch = std::mem::take(&mut self.pending);
        match build_pdu(&batch, self.flow_sequence, wallclock, self.system_start_ms) {
            Ok(bytes) => {
                match self.socket.send_to(&bytes, self.collector) {
                    Ok(_) => {
                        self.pdus_sent += 1;
                        self.counters.pdus_sent.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        tracing::warn!(error = %ProbeError::Send(e), collector = %self.collector, "UDP send to collector failed");
                        self.pdus_dropped += 1;
                        self.counters.pdus_send_failed.fetch_add(1, Ordering::Relaxed);
                    }
                }
                self.flow_sequence = self.flow_sequence.wrapping_add(batch.len() as u32);
            }
            Err(PduError::TooManyRecords { .. }) => {
                self.pdus_dropped += 1;
                self.counters.pdus_send_failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.last_emission = wallclock;
    }
}
