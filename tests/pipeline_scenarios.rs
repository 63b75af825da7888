//! End-to-end pipeline scenarios, driven through the sequential composition
//! with a [`VecPacketSource`] standing in for a live interface.

use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use ffprobe_rs::aggregation::AggregationStage;
use ffprobe_rs::capture::CaptureStage;
use ffprobe_rs::capture::source::{CapturedPacket, VecPacketSource};
use ffprobe_rs::export::ExportStage;
use ffprobe_rs::flow::Timeval;
use ffprobe_rs::pipeline::{Counters, run_sequential};
use ffprobe_rs::shard::Shard;

fn udp_frame(src_port: u16, dst_port: u16, payload_len: usize) -> Vec<u8> {
    let mut eth = vec![0u8; 12];
    eth.extend_from_slice(&0x0800u16.to_be_bytes());
    let mut ip = vec![0x45u8, 0x00, 0, 0, 0, 0, 0, 0, 64, 17, 0, 0];
    ip.extend_from_slice(&0x0a000001u32.to_be_bytes());
    ip.extend_from_slice(&0x0a000002u32.to_be_bytes());
    let mut udp = src_port.to_be_bytes().to_vec();
    udp.extend_from_slice(&dst_port.to_be_bytes());
    udp.extend(std::iter::repeat_n(0u8, payload_len));
    let mut frame = eth;
    frame.extend_from_slice(&ip);
    frame.extend_from_slice(&udp);
    frame
}

fn loopback_collector() -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 0)
}

/// A single UDP flow, two packets, expires after idle+1 seconds of
/// quiescence with the expected byte counts.
#[test]
fn single_udp_flow_two_packets_expires_with_expected_counters() {
    let p1 = udp_frame(1000, 53, 58); // eth(14)+ip(20)+udp(8)+58 = 100-byte frame, 86 octets after datalink offset
    let p2 = p1.clone();
    let source = VecPacketSource::new(vec![
        CapturedPacket { timestamp: Timeval::new(0, 0), bytes: p1 },
        CapturedPacket { timestamp: Timeval::new(1, 0), bytes: p2 },
    ]);

    let terminate = Arc::new(AtomicBool::new(false));
    let counters = Arc::new(Counters::default());
    // max_per_batch = 1 so each packet lands in its own activation and picks
    // up a distinct batch timestamp, matching the scenario's p1@T, p2@T+1.
    let capture = CaptureStage::new(source, 1, 1, 32762, terminate, Arc::clone(&counters));
    let shard = Shard::new(32762, 1000, 30, 120);
    let aggregation = AggregationStage::new(0, shard, 200, Arc::clone(&counters));
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let export = ExportStage::new(socket, loopback_collector(), 0, 0, 30, None, counters).unwrap();

    // One tick per packet, then enough idle ticks to trigger expiry and a
    // final tick to reach EOF.
    let ticks = [Timeval::new(0, 0), Timeval::new(1, 0), Timeval::new(1 + 31, 0)];
    let idx = std::cell::Cell::new(0usize);
    let snapshot = run_sequential(capture, aggregation, export, move || {
        let t = ticks[idx.get().min(ticks.len() - 1)];
        idx.set(idx.get() + 1);
        t
    });

    assert_eq!(snapshot.pdus_sent, 1);
    assert_eq!(snapshot.pdus_send_failed, 0);
}

/// A TCP FIN/RST causes eviction on the very next sweep, independent of
/// idle/lifetime windows.
#[test]
fn tcp_fin_triggers_prompt_eviction() {
    use ffprobe_rs::flow::{FlowKey, FlowRecord, TcpFlags};

    let mut shard = Shard::new(16, 1000, 30, 120);
    let mut expired = Vec::new();
    let key = FlowKey { src_addr: 1, dst_addr: 2, src_port: 1000, dst_port: 80, proto: 6, tos: 0 };
    let record = FlowRecord::first_packet(key, 60, Timeval::new(0, 0), TcpFlags::SYN | TcpFlags::FIN, 16);
    shard.upsert_batch([record], &mut expired);
    shard.expire_sweep(-1, &mut expired, Some(Timeval::new(0, 0)));
    assert_eq!(expired.len(), 1);
}

/// 31 simultaneously-expired flows split into a count=30 PDU followed by a
/// count=1 PDU with a contiguous flow_sequence.
#[test]
fn thirty_one_flows_split_across_two_pdus_with_contiguous_sequence() {
    use ffprobe_rs::export::build_pdu;
    use ffprobe_rs::flow::{FlowKey, FlowRecord, TcpFlags};

    let records: Vec<_> = (0..31u16)
        .map(|port| {
            let key = FlowKey { src_addr: 1, dst_addr: 2, src_port: port, dst_port: 53, proto: 17, tos: 0 };
            FlowRecord::first_packet(key, 100, Timeval::new(0, 0), TcpFlags::empty(), 32762)
        })
        .collect();

    let first_pdu = build_pdu(&records[..30], 0, Timeval::new(10, 0), 0).unwrap();
    let second_pdu = build_pdu(&records[30..], 30, Timeval::new(10, 0), 0).unwrap();

    assert_eq!(&first_pdu[2..4], &30u16.to_be_bytes());
    assert_eq!(&second_pdu[2..4], &1u16.to_be_bytes());
    assert_eq!(&second_pdu[12..16], &30u32.to_be_bytes());
}

/// The min-flow-size filter only drops small TCP records, never small UDP
/// ones.
#[test]
fn min_flow_size_filter_drops_only_small_tcp() {
    use ffprobe_rs::flow::{FlowKey, FlowRecord, TcpFlags};

    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let mut export = ExportStage::new(socket, loopback_collector(), 1000, 0, 30, None, Arc::new(Counters::default())).unwrap();

    let tcp_key = FlowKey { src_addr: 1, dst_addr: 2, src_port: 1, dst_port: 80, proto: 6, tos: 0 };
    let udp_key = FlowKey { src_addr: 1, dst_addr: 2, src_port: 2, dst_port: 53, proto: 17, tos: 0 };
    let tcp_record = FlowRecord::first_packet(tcp_key, 500, Timeval::new(0, 0), TcpFlags::empty(), 32762);
    let udp_record = FlowRecord::first_packet(udp_key, 500, Timeval::new(0, 0), TcpFlags::empty(), 32762);

    export.activate(vec![tcp_record, udp_record], true, Timeval::new(0, 0));
    assert_eq!(export.flow_sequence(), 1);
}

#[test]
fn capture_activation_respects_terminate_flag_with_eof() {
    let terminate = Arc::new(AtomicBool::new(false));
    let source = VecPacketSource::new(vec![CapturedPacket { timestamp: Timeval::new(0, 0), bytes: udp_frame(1, 2, 10) }]);
    let mut capture = CaptureStage::new(source, 1, 10_000, 16, Arc::clone(&terminate), Arc::new(Counters::default()));
    let task = capture.activate(Timeval::new(0, 0)).unwrap();
    assert!(!task.eof);

    terminate.store(true, Ordering::SeqCst);
    let eof_task = capture.activate(Timeval::new(1, 0)).unwrap();
    assert!(eof_task.eof);
}
