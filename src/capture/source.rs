//! Packet sources: the abstraction boundary standing in for the kernel
//! packet-ring API, treated as an abstract source yielding
//! `(timestamp, bytes)` pairs.
//!
//! [`PcapFileSource`] reads a legacy pcap file with
//! `pcap_parser::LegacyPcapReader`, giving the capture stage an offline
//! replay source, not just a test fixture. Frame slicing (L2/L3/L4) is
//! handled by [`crate::capture::headers::parse_frame`], not by a separate
//! slicing crate.

use std::fs::File;
use std::path::Path;

use pcap_parser::PcapError;
use pcap_parser::traits::PcapReaderIterator;

use crate::flow::Timeval;

/// One captured frame: coarse timestamp plus raw bytes starting at the
/// datalink header.
#[derive(Debug, Clone)]
pub struct CapturedPacket {
    pub timestamp: Timeval,
    pub bytes: Vec<u8>,
}

/// The capture stage's view of wherever packets come from. `poll_batch`
/// pulls up to `max` packets non-blocking, returning fewer (including zero)
/// when the source is momentarily empty,
/// and `true` from [`PacketSource::is_exhausted`] once there is nothing
/// left to ever read (end of a replay file; a live ring never reports
/// exhaustion on its own).
pub trait PacketSource {
    fn poll_batch(&mut self, max: usize) -> Vec<CapturedPacket>;
    fn is_exhausted(&self) -> bool;
}

impl<T: PacketSource + ?Sized> PacketSource for Box<T> {
    fn poll_batch(&mut self, max: usize) -> Vec<CapturedPacket> {
        (**self).poll_batch(max)
    }

    fn is_exhausted(&self) -> bool {
        (**self).is_exhausted()
    }
}

/// In-memory source used by unit and integration tests: a fixed queue of
/// packets, consumed in order, `is_exhausted` once drained.
#[derive(Debug, Default)]
pub struct VecPacketSource {
    packets: std::collections::VecDeque<CapturedPacket>,
}

impl VecPacketSource {
    pub fn new(packets: Vec<CapturedPacket>) -> Self {
        Self { packets: packets.into() }
    }
}

impl PacketSource for VecPacketSource {
    fn poll_batch(&mut self, max: usize) -> Vec<CapturedPacket> {
        let n = max.min(self.packets.len());
        self.packets.drain(..n).collect()
    }

    fn is_exhausted(&self) -> bool {
        self.packets.is_empty()
    }
}

/// Offline replay of a legacy (non-NG) pcap file, one activation at a time.
/// Every frame is stamped with the same [`Timeval`], taken once at open
/// time — a coarse wallclock-at-batch-start rather than the file's own
/// per-packet capture time, since a batch only ever carries one timestamp.
pub struct PcapFileSource {
    reader: pcap_parser::LegacyPcapReader<File>,
    timestamp: Timeval,
    exhausted: bool,
}

impl PcapFileSource {
    pub fn open(path: impl AsRef<Path>, timestamp: Timeval) -> Result<Self, String> {
        let file = File::open(path.as_ref()).map_err(|e| format!("{}: {e}", path.as_ref().display()))?;
        let reader = pcap_parser::LegacyPcapReader::new(65536, file).map_err(|e| e.to_string())?;
        Ok(Self { reader, timestamp, exhausted: false })
    }
}

impl PacketSource for PcapFileSource {
    fn poll_batch(&mut self, max: usize) -> Vec<CapturedPacket> {
        let mut out = Vec::new();
        while out.len() < max {
            match self.reader.next() {
                Ok((offset, block)) => {
                    if let pcap_parser::PcapBlockOwned::Legacy(pcap_block) = block {
                        out.push(CapturedPacket {
                            timestamp: self.timestamp,
                            bytes: pcap_block.data.to_vec(),
                        });
                    }
                    self.reader.consume(offset);
                }
                Err(PcapError::Eof) => {
                    self.exhausted = true;
                    break;
                }
                Err(PcapError::Incomplete(_)) => match self.reader.refill() {
                    Ok(()) => continue,
                    Err(_) => {
                        self.exhausted = true;
                        break;
                    }
                },
                Err(_) => {
                    self.exhausted = true;
                    break;
                }
            }
        }
        out
    }

    fn is_exhausted(&self) -> bool {
        self.exhausted
    }
}
