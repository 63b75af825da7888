//! The flow key/record pair: the unit of mutable state the rest of the
//! pipeline shards, ages out and exports.

use serde::Serialize;

/// A `timeval`-shaped pair of capture-clock seconds/microseconds.
///
/// Kept as a distinct type (rather than `std::time::SystemTime`) because the
/// wire format and the aging arithmetic in [`crate::shard`] both operate on
/// raw seconds, and the capture stage stamps coarse wallclock seconds, never
/// sub-second precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Timeval {
    pub secs: u32,
    pub micros: u32,
}

impl Timeval {
    pub fn new(secs: u32, micros: u32) -> Self {
        Self { secs, micros }
    }

    /// Milliseconds since an arbitrary epoch, saturating rather than
    /// wrapping — used to build NetFlow's `First`/`Last` fields relative to
    /// `system_start_ms`.
    pub fn millis_since(&self, start_ms: u32) -> u32 {
        let ms = (self.secs as u64) * 1000 + (self.micros as u64) / 1000;
        ms.saturating_sub(start_ms as u64) as u32
    }
}

bitflags::bitflags! {
    /// Cumulative OR of remapped TCP control bits, MSB to LSB:
    /// CWR, ECE, URG, ACK, PSH, RST, SYN, FIN.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TcpFlags: u8 {
        const FIN = 0b0000_0001;
        const SYN = 0b0000_0010;
        const RST = 0b0000_0100;
        const PSH = 0b0000_1000;
        const ACK = 0b0001_0000;
        const URG = 0b0010_0000;
        const ECE = 0b0100_0000;
        const CWR = 0b1000_0000;
    }
}

impl Serialize for TcpFlags {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.bits())
    }
}

/// Immutable 6-tuple identity of a flow. Fields are kept in network byte
/// order exactly as lifted from packet bytes; equality is bitwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct FlowKey {
    pub src_addr: u32,
    pub dst_addr: u32,
    pub src_port: u16,
    pub dst_port: u16,
    pub proto: u8,
    pub tos: u8,
}

impl FlowKey {
    /// `hashId = (src+dst+proto+srcPort+dstPort+tos) mod hash_size`.
    ///
    /// All additions happen in `u32` the way the original `hashFun` adds
    /// `u_int32_t`/`u_int16_t`/`u_int8_t` fields together; `hash_size` must
    /// be non-zero (checked at config-validation time, not here, because
    /// this function is on the packet-parsing hot path).
    pub fn hash_id(&self, hash_size: u32) -> u32 {
        let sum = self
            .src_addr
            .wrapping_add(self.dst_addr)
            .wrapping_add(self.proto as u32)
            .wrapping_add(self.src_port as u32)
            .wrapping_add(self.dst_port as u32)
            .wrapping_add(self.tos as u32);
        sum % hash_size
    }
}

/// Mutable per-flow counters plus the cached `hash_id` used to re-derive the
/// owning shard without recomputing the key's hash.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FlowRecord {
    pub key: FlowKey,
    pub packets: u32,
    pub octets: u32,
    pub first: Timeval,
    pub last: Timeval,
    pub tcp_flags: TcpFlags,
    pub hash_id: u32,
}

impl FlowRecord {
    /// Builds the first-packet record for a flow: `packets = 1`,
    /// `last = first`.
    pub fn first_packet(key: FlowKey, octets: u32, timestamp: Timeval, tcp_flags: TcpFlags, hash_size: u32) -> Self {
        Self {
            key,
            packets: 1,
            octets,
            first: timestamp,
            last: timestamp,
            tcp_flags,
            hash_id: key.hash_id(hash_size),
        }
    }

    /// Folds another observation of the same flow into this record (the
    /// "hit" branch of `upsertBatch`).
    pub fn merge_packet(&mut self, octets: u32, timestamp: Timeval, tcp_flags: TcpFlags) {
        self.packets += 1;
        self.octets += octets;
        self.last = timestamp;
        self.tcp_flags |= tcp_flags;
    }

    /// `(tcpFlags & 0x05) != 0` — FIN or RST observed, the flag-triggered
    /// eviction condition.
    pub fn saw_fin_or_rst(&self) -> bool {
        self.tcp_flags.intersects(TcpFlags::FIN | TcpFlags::RST)
    }

    pub fn is_expired(&self, idle_timeout_secs: u32, lifetime_timeout_secs: u32, now: Option<Timeval>) -> bool {
        let Some(now) = now else {
            return true;
        };
        if now.secs.saturating_sub(self.last.secs) as u64 > idle_timeout_secs as u64 {
            return true;
        }
        if self.last.secs.saturating_sub(self.first.secs) as u64 > lifetime_timeout_secs as u64 {
            return true;
        }
        self.saw_fin_or_rst()
    }
}
