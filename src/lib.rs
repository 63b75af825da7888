//! `ffprobe-rs`: a staged-pipeline NetFlow v5 flow probe.
//!
//! Packets flow through three stages — capture ([`capture`]), per-worker
//! aggregation ([`aggregation`]) over a sharded flow table ([`shard`]), and
//! export ([`export`]) — connected by the [`task::Task`] message and
//! assembled by [`pipeline`]. [`flow`] defines the record the whole
//! pipeline exists to produce.

pub mod aggregation;
pub mod capture;
pub mod config;
pub mod error;
pub mod export;
pub mod flow;
pub mod pipeline;
pub mod shard;
pub mod task;

pub use config::ProbeConfig;
pub use error::ProbeError;
pub use flow::{FlowKey, FlowRecord, TcpFlags, Timeval};
