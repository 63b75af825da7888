//! Ambient configuration: the typed settings every stage is built from.
//!
//! This is a plain struct, not a builder — `ProbeConfig` has one flat set of
//! fields with no overlapping or conditionally-required knobs, so a builder
//! would only add ceremony.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;
use std::time::Duration;

/// `-1` sentinel used by `max_per_batch` and `flows_per_task_check` in the
/// original CLI surface, interpreted as "unbounded".
pub const UNBOUNDED: i64 = -1;

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub interfaces: Vec<String>,
    pub promisc: bool,
    pub idle_timeout: Duration,
    pub lifetime_timeout: Duration,
    pub queue_timeout: Duration,
    pub readers: usize,
    pub workers: usize,
    pub independent_exporter: bool,
    pub cores: Vec<usize>,
    pub chip: usize,
    pub hash_size: u32,
    pub max_active_flows: u32,
    pub max_per_batch: i64,
    pub output_file: Option<PathBuf>,
    pub flows_per_task_check: i64,
    pub collector: SocketAddrV4,
    pub min_flow_size: u32,
    pub sequential: bool,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interfaces: Vec::new(),
            promisc: true,
            idle_timeout: Duration::from_secs(30),
            lifetime_timeout: Duration::from_secs(120),
            queue_timeout: Duration::from_secs(30),
            readers: 1,
            workers: 1,
            independent_exporter: true,
            cores: Vec::new(),
            chip: 0,
            hash_size: 32762,
            max_active_flows: 3_000_000,
            max_per_batch: 10_000,
            output_file: None,
            flows_per_task_check: 200,
            collector: SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 2055),
            min_flow_size: 0,
            sequential: false,
        }
    }
}

impl ProbeConfig {
    /// `max_per_batch == -1` reads as "drain until empty" (`usize::MAX`).
    pub fn max_per_batch_effective(&self) -> usize {
        if self.max_per_batch < 0 { usize::MAX } else { self.max_per_batch as usize }
    }

    /// `flows_per_task_check == -1` means an unbounded sweep per task.
    pub fn flows_per_task_check_effective(&self) -> i64 {
        self.flows_per_task_check
    }

    /// `shard_size = hash_size / workers`; validated up front in
    /// [`Self::validate`] rather than asserted here — a library must never
    /// abort its caller.
    pub fn shard_size(&self) -> u32 {
        self.hash_size / self.workers as u32
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interfaces.is_empty() && !self.sequential {
            return Err(ConfigError::MissingInterface);
        }
        if self.workers == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        if self.hash_size % self.workers as u32 != 0 {
            return Err(ConfigError::HashSizeNotDivisible {
                hash_size: self.hash_size,
                workers: self.workers,
            });
        }
        if self.readers == 0 {
            return Err(ConfigError::ZeroReaders);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    MissingInterface,
    ZeroWorkers,
    ZeroReaders,
    HashSizeNotDivisible { hash_size: u32, workers: usize },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::MissingInterface => write!(f, "at least one interface is required unless --sequential replays a file source"),
            ConfigError::ZeroWorkers => write!(f, "workers must be >= 1"),
            ConfigError::ZeroReaders => write!(f, "readers must be >= 1"),
            ConfigError::HashSizeNotDivisible { hash_size, workers } => {
                write!(f, "hashSize ({hash_size}) must be divisible by workers ({workers})")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
