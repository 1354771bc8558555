//! End-to-end behaviour of the analyzer on small hand-built captures.

use std::net::Ipv4Addr;

use tcpscope::analysis::AnalysisFlags;
use tcpscope::flow::FlowDirection;
use tcpscope::reassembly::{ConsumeAll, ConsumeResult, Disposition, Pdu};
use tcpscope::segment::{Endpoint, FrameId, Segment, TcpFlags};
use tcpscope::{Analyzer, Config, SegmentReport};

fn a() -> Endpoint {
    Endpoint::new(Ipv4Addr::new(10, 0, 0, 1), 40000)
}

fn b() -> Endpoint {
    Endpoint::new(Ipv4Addr::new(10, 0, 0, 2), 443)
}

/// SYN(100) -> SYN/ACK(500, ack 101) -> ACK(101, ack 501), frames 1..=3.
fn handshake() -> Vec<Segment> {
    vec![
        Segment::new(1, 0.000, a(), b(), 100, 0, TcpFlags::SYN),
        Segment::new(2, 0.010, b(), a(), 500, 101, TcpFlags::SYN | TcpFlags::ACK),
        Segment::new(3, 0.020, a(), b(), 101, 501, TcpFlags::ACK),
    ]
}

fn data(frame: FrameId, ts: f64, seq: u32, payload: Vec<u8>) -> Segment {
    Segment::new(frame, ts, a(), b(), seq, 501, TcpFlags::ACK).with_payload(payload)
}

fn ack_from_b(frame: FrameId, ts: f64, ack: u32) -> Segment {
    Segment::new(frame, ts, b(), a(), 501, ack, TcpFlags::ACK)
}

fn run_first_pass(analyzer: &mut Analyzer, segments: &[Segment]) -> Vec<SegmentReport> {
    segments
        .iter()
        .map(|seg| analyzer.process(seg, true, &mut ConsumeAll).unwrap())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Seen {
    frame: FrameId,
    first_frame: FrameId,
    seq: u32,
    data: Vec<u8>,
    reassembled: bool,
}

impl Seen {
    fn from_pdu(pdu: &Pdu<'_>) -> Self {
        Seen {
            frame: pdu.frame,
            first_frame: pdu.first_frame,
            seq: pdu.seq,
            data: pdu.data.to_vec(),
            reassembled: pdu.reassembled,
        }
    }
}

/// One-byte length prefix followed by that many body bytes.
fn length_prefixed(pdu: &Pdu<'_>) -> ConsumeResult {
    let total = 1 + pdu.data[0] as usize;
    let len = pdu.data.len();
    if len < total {
        ConsumeResult::NeedMore(total - len)
    } else if len > total {
        ConsumeResult::ConsumedPrefix(total)
    } else {
        ConsumeResult::Consumed
    }
}

#[test]
fn scenario_a_clean_flow() {
    let mut analyzer = Analyzer::new(&Config::default());
    run_first_pass(&mut analyzer, &handshake());

    let sent = analyzer
        .process(&data(4, 0.030, 101, vec![b'x'; 50]), true, &mut ConsumeAll)
        .unwrap();
    assert!(sent.annotation.flags.is_empty(), "flags: {}", sent.annotation.flags);
    assert_eq!(sent.annotation.bytes_in_flight, Some(50));
    assert_eq!(analyzer.bytes_in_flight(0, FlowDirection::AtoB), Some(50));

    let acked = analyzer
        .process(&ack_from_b(5, 0.040, 151), true, &mut ConsumeAll)
        .unwrap();
    assert!(acked.annotation.flags.is_empty());
    assert_eq!(acked.annotation.frame_acked, Some(4));
    assert_eq!(analyzer.bytes_in_flight(0, FlowDirection::AtoB), Some(0));
}

#[test]
fn scenario_b_retransmission() {
    let mut analyzer = Analyzer::new(&Config::default());
    run_first_pass(&mut analyzer, &handshake());

    analyzer
        .process(&data(4, 0.030, 101, vec![b'x'; 50]), true, &mut ConsumeAll)
        .unwrap();
    let next_before = analyzer.flow(0).unwrap().direction(FlowDirection::AtoB).next_seq();
    assert_eq!(next_before, Some(151));

    let resent = analyzer
        .process(&data(5, 0.500, 101, vec![b'x'; 50]), true, &mut ConsumeAll)
        .unwrap();
    assert!(resent.annotation.has(AnalysisFlags::RETRANSMISSION));
    assert_eq!(resent.annotation.rto.map(|rto| rto.frame), Some(4));
    assert_eq!(resent.disposition, Disposition::Repeated);

    let next_after = analyzer.flow(0).unwrap().direction(FlowDirection::AtoB).next_seq();
    assert_eq!(next_after, next_before);
}

#[test]
fn scenario_c_gap_filled_out_of_order() {
    let mut analyzer = Analyzer::new(&Config::default());
    run_first_pass(&mut analyzer, &handshake());

    let s1 = vec![b'1'; 50];
    let s2 = vec![b'2'; 50];
    let s3 = vec![b'3'; 50];
    let mut seen = Vec::new();
    let mut consumer = |pdu: &Pdu<'_>| {
        seen.push(Seen::from_pdu(pdu));
        if pdu.data.len() < 150 {
            ConsumeResult::NeedMore(150 - pdu.data.len())
        } else {
            ConsumeResult::Consumed
        }
    };

    let r1 = analyzer
        .process(&data(4, 0.030, 101, s1.clone()), true, &mut consumer)
        .unwrap();
    let r2 = analyzer
        .process(&data(5, 0.031, 201, s2.clone()), true, &mut consumer)
        .unwrap();
    let r3 = analyzer
        .process(&data(6, 0.032, 151, s3.clone()), true, &mut consumer)
        .unwrap();

    assert!(r1.annotation.flags.is_empty());
    assert!(r2.annotation.has(AnalysisFlags::LOST_PACKET));
    assert_eq!(r2.disposition, Disposition::OutOfOrder);
    assert_eq!(r3.disposition, Disposition::Delivered);

    let expected: Vec<u8> = [s1, s3, s2].concat();
    let last = seen.last().unwrap();
    assert!(last.reassembled);
    assert_eq!(last.frame, 6);
    assert_eq!(last.first_frame, 4);
    // relative 1 is absolute 101
    assert_eq!(last.seq, 1);
    assert_eq!(last.data, expected);

    let follow: Vec<u8> = analyzer
        .follow_stream(0)
        .unwrap()
        .iter()
        .flat_map(|record| record.data.clone())
        .collect();
    assert_eq!(follow, expected);
}

#[test]
fn scenario_d_zero_window_probe() {
    let mut analyzer = Analyzer::new(&Config::default());
    run_first_pass(&mut analyzer, &handshake());

    analyzer
        .process(&data(4, 0.030, 101, vec![b'x'; 50]), true, &mut ConsumeAll)
        .unwrap();
    let closed = analyzer
        .process(&ack_from_b(5, 0.040, 151).with_window(0), true, &mut ConsumeAll)
        .unwrap();
    assert!(closed.annotation.has(AnalysisFlags::ZERO_WINDOW));

    let probe = analyzer
        .process(&data(6, 0.300, 151, vec![b'p']), true, &mut ConsumeAll)
        .unwrap();
    assert!(probe.annotation.has(AnalysisFlags::ZERO_WINDOW_PROBE));
    assert!(!probe.annotation.is_retransmission());
    let next = analyzer.flow(0).unwrap().direction(FlowDirection::AtoB).next_seq();
    assert_eq!(next, Some(151));
}

#[test]
fn reprocessing_is_idempotent() {
    let mut segments = handshake();
    segments.push(data(4, 0.030, 101, vec![1; 50]));
    segments.push(data(5, 0.031, 201, vec![2; 50]));
    segments.push(data(6, 0.032, 151, vec![3; 50]));
    segments.push(ack_from_b(7, 0.050, 251));

    let mut analyzer = Analyzer::new(&Config::default());
    let first = run_first_pass(&mut analyzer, &segments);
    let next = analyzer.flow(0).unwrap().direction(FlowDirection::AtoB).next_seq();

    let again = run_first_pass(&mut analyzer, &segments);
    assert_eq!(first, again);

    let later: Vec<SegmentReport> = segments
        .iter()
        .map(|seg| analyzer.process(seg, false, &mut ConsumeAll).unwrap())
        .collect();
    assert_eq!(first, later);
    assert_eq!(
        analyzer.flow(0).unwrap().direction(FlowDirection::AtoB).next_seq(),
        next
    );

    let mut fresh = Analyzer::new(&Config::default());
    assert_eq!(run_first_pass(&mut fresh, &segments), first);
}

#[test]
fn in_order_stream_raises_no_sequence_flags() {
    let mut segments = handshake();
    let mut frame = 4;
    for i in 0..20u32 {
        let ts = 0.030 + i as f64 * 0.01;
        segments.push(data(frame, ts, 101 + i * 100, vec![i as u8; 100]));
        segments.push(ack_from_b(frame + 1, ts + 0.005, 201 + i * 100));
        frame += 2;
    }

    let mut analyzer = Analyzer::new(&Config::default());
    let reports = run_first_pass(&mut analyzer, &segments);
    let troubled = AnalysisFlags::RETRANSMISSION_FAMILY
        | AnalysisFlags::LOST_PACKET
        | AnalysisFlags::DUPLICATE_ACK
        | AnalysisFlags::ACK_LOST_PACKET;

    let mut last_next = 0;
    for report in reports.iter().filter(|r| r.direction == FlowDirection::AtoB && r.seglen > 0) {
        assert!(
            !report.annotation.flags.intersects(troubled),
            "frame {} flagged {}",
            report.frame,
            report.annotation.flags
        );
        assert!(report.next_seq > last_next);
        last_next = report.next_seq;
    }
    assert_eq!(last_next, 2001);
}

fn permutations(n: usize) -> Vec<Vec<usize>> {
    fn heap(k: usize, items: &mut Vec<usize>, out: &mut Vec<Vec<usize>>) {
        if k <= 1 {
            out.push(items.clone());
            return;
        }
        for i in 0..k {
            heap(k - 1, items, out);
            if k % 2 == 0 {
                items.swap(i, k - 1);
            } else {
                items.swap(0, k - 1);
            }
        }
    }
    let mut items: Vec<usize> = (0..n).collect();
    let mut out = Vec::new();
    heap(n, &mut items, &mut out);
    out
}

#[test]
fn every_arrival_order_reassembles_the_same_bytes() {
    let chunks: Vec<Vec<u8>> = (0..4u8).map(|i| vec![b'a' + i; 10]).collect();
    let expected: Vec<u8> = chunks.concat();

    let orders = permutations(chunks.len());
    assert_eq!(orders.len(), 24);
    for order in orders {
        let mut analyzer = Analyzer::new(&Config::default());
        run_first_pass(&mut analyzer, &handshake());

        let mut delivered = Vec::new();
        let mut consumer = |pdu: &Pdu<'_>| {
            delivered.extend_from_slice(pdu.data);
            ConsumeResult::Consumed
        };
        for (arrival, &index) in order.iter().enumerate() {
            let seg = data(
                4 + arrival as FrameId,
                0.030 + arrival as f64 * 0.001,
                101 + 10 * index as u32,
                chunks[index].clone(),
            );
            analyzer.process(&seg, true, &mut consumer).unwrap();
        }
        assert_eq!(delivered, expected, "order {:?}", order);

        let follow: Vec<u8> = analyzer
            .follow_stream(0)
            .unwrap()
            .iter()
            .flat_map(|record| record.data.clone())
            .collect();
        assert_eq!(follow, expected, "follow, order {:?}", order);
    }
}

#[test]
fn identical_acks_count_as_duplicates_after_the_first() {
    let mut segments = handshake();
    segments.push(data(4, 0.030, 101, vec![0; 50]));
    for frame in 5..9 {
        segments.push(ack_from_b(frame, 0.040 + frame as f64 * 0.001, 151));
    }

    let mut analyzer = Analyzer::new(&Config::default());
    let reports = run_first_pass(&mut analyzer, &segments);

    let dupacks: Vec<(u32, FrameId)> = reports
        .iter()
        .filter(|r| r.annotation.has(AnalysisFlags::DUPLICATE_ACK))
        .filter_map(|r| r.annotation.dupack.map(|d| (d.num, d.frame)))
        .collect();
    assert_eq!(dupacks, vec![(1, 5), (2, 5), (3, 5)]);
    assert_eq!(analyzer.snapshot()[0].dup_acks, 3);
}

#[test]
fn reused_ports_open_a_new_stream() {
    let mut segments = handshake();
    segments.push(Segment::new(4, 0.1, a(), b(), 101, 501, TcpFlags::FIN | TcpFlags::ACK));
    segments.push(Segment::new(5, 0.2, b(), a(), 501, 102, TcpFlags::FIN | TcpFlags::ACK));
    segments.push(Segment::new(6, 0.3, a(), b(), 102, 502, TcpFlags::ACK));

    let mut analyzer = Analyzer::new(&Config::default());
    run_first_pass(&mut analyzer, &segments);
    let old_packets = analyzer.snapshot()[0].packets_total;

    let reopened = analyzer
        .process(
            &Segment::new(7, 10.0, a(), b(), 7000, 0, TcpFlags::SYN),
            true,
            &mut ConsumeAll,
        )
        .unwrap();
    assert_eq!(reopened.stream, 1);
    assert!(reopened.annotation.has(AnalysisFlags::REUSED_PORTS));

    let answer = analyzer
        .process(
            &Segment::new(8, 10.01, b(), a(), 3000, 7001, TcpFlags::SYN | TcpFlags::ACK),
            true,
            &mut ConsumeAll,
        )
        .unwrap();
    assert_eq!(answer.stream, 1);
    assert!(!answer.annotation.has(AnalysisFlags::REUSED_PORTS));

    let old = analyzer.flow(0).unwrap();
    assert!(old.is_superseded());
    assert_eq!(old.snapshot().packets_total, old_packets);
    let new = analyzer.flow(1).unwrap();
    assert_eq!(new.direction(FlowDirection::AtoB).base_seq(), Some(7000));
    assert_eq!(new.direction(FlowDirection::BtoA).base_seq(), Some(3000));
    assert_eq!(analyzer.snapshot().len(), 2);
}

#[test]
fn second_pass_replays_first_pass_deliveries() {
    let mut segments = handshake();
    segments.push(data(4, 0.030, 101, vec![1; 50]));
    segments.push(data(5, 0.031, 201, vec![2; 50]));
    segments.push(data(6, 0.032, 151, vec![3; 50]));

    let mut analyzer = Analyzer::new(&Config::default());
    let mut first = Vec::new();
    let mut consumer = |pdu: &Pdu<'_>| {
        first.push(Seen::from_pdu(pdu));
        if pdu.data.len() < 150 {
            ConsumeResult::NeedMore(150 - pdu.data.len())
        } else {
            ConsumeResult::Consumed
        }
    };
    for seg in &segments {
        analyzer.process(seg, true, &mut consumer).unwrap();
    }

    let mut replayed = Vec::new();
    let mut recorder = |pdu: &Pdu<'_>| {
        replayed.push(Seen::from_pdu(pdu));
        ConsumeResult::Consumed
    };
    for seg in &segments {
        analyzer.process(seg, false, &mut recorder).unwrap();
    }

    assert_eq!(first.len(), 2);
    assert_eq!(replayed, first);
}

#[test]
fn message_split_across_out_of_order_segments() {
    let mut analyzer = Analyzer::new(&Config::default());
    run_first_pass(&mut analyzer, &handshake());

    let mut seen = Vec::new();
    let mut consumer = |pdu: &Pdu<'_>| {
        seen.push(Seen::from_pdu(pdu));
        length_prefixed(pdu)
    };
    // [3 a b] [c 2 x y]: the second segment finishes one message and holds
    // a whole second one.
    let tail = data(5, 0.031, 104, vec![b'c', 2, b'x', b'y']);
    let head = data(4, 0.032, 101, vec![3, b'a', b'b']);
    let r_tail = analyzer.process(&tail, true, &mut consumer).unwrap();
    let r_head = analyzer.process(&head, true, &mut consumer).unwrap();
    assert_eq!(r_tail.disposition, Disposition::OutOfOrder);
    assert_eq!(r_head.disposition, Disposition::Delivered);

    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].data, vec![3, b'a', b'b', b'c', 2, b'x', b'y']);
    assert!(seen[0].reassembled);
    assert_eq!(seen[0].first_frame, 4);
    assert_eq!(seen[1].data, vec![2, b'x', b'y']);
    assert_eq!(seen[1].first_frame, 5);
    assert_eq!(seen[1].seq, 5);

    let state = analyzer
        .flow(0)
        .unwrap()
        .direction(FlowDirection::AtoB)
        .reassembly();
    assert_eq!(state.msp_at(6).map(|msp| msp.first_frame), Some(5));
    assert_eq!(state.msp_at(2).map(|msp| msp.nxtpdu), Some(5));
}

#[test]
fn until_close_message_is_delivered_at_fin() {
    let mut analyzer = Analyzer::new(&Config::default());
    run_first_pass(&mut analyzer, &handshake());

    let mut seen = Vec::new();
    let mut consumer = |pdu: &Pdu<'_>| {
        seen.push(Seen::from_pdu(pdu));
        if pdu.reassembled {
            ConsumeResult::Consumed
        } else {
            ConsumeResult::NeedUntilClose
        }
    };
    for (i, byte) in [b'a', b'b', b'c'].into_iter().enumerate() {
        let seg = data(4 + i as FrameId, 0.03 + i as f64 * 0.01, 101 + 10 * i as u32, vec![byte; 10]);
        analyzer.process(&seg, true, &mut consumer).unwrap();
    }
    let fin = Segment::new(7, 0.1, a(), b(), 131, 501, TcpFlags::FIN | TcpFlags::ACK);
    let closed = analyzer.process(&fin, true, &mut consumer).unwrap();

    assert_eq!(closed.disposition, Disposition::Delivered);
    assert_eq!(seen.len(), 2);
    let whole = &seen[1];
    assert!(whole.reassembled);
    assert_eq!(whole.frame, 7);
    assert_eq!(whole.first_frame, 4);
    assert_eq!(whole.data, [vec![b'a'; 10], vec![b'b'; 10], vec![b'c'; 10]].concat());
}

#[test]
fn flush_delivers_bytes_stranded_behind_a_gap() {
    let mut analyzer = Analyzer::new(&Config::default());
    run_first_pass(&mut analyzer, &handshake());

    let mut seen = Vec::new();
    let mut consumer = |pdu: &Pdu<'_>| {
        seen.push(Seen::from_pdu(pdu));
        ConsumeResult::Consumed
    };
    analyzer
        .process(&data(4, 0.03, 101, vec![1; 10]), true, &mut consumer)
        .unwrap();
    analyzer
        .process(&data(5, 0.04, 131, vec![3; 10]), true, &mut consumer)
        .unwrap();
    let flushed = analyzer.flush(&mut consumer);

    assert_eq!(flushed.len(), 1);
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[1].data, vec![3; 10]);
    assert_eq!(seen[1].first_frame, 5);
    assert!(analyzer.deliveries(5, 131, 501).is_empty());
    assert_eq!(analyzer.flushed_deliveries().count(), 1);
    let follow = analyzer.follow_stream(0).unwrap();
    assert_eq!(follow.len(), 2);
    assert_eq!((follow[1].start, follow[1].end), (31, 41));
}

#[test]
fn second_pass_replays_each_occurrence_in_a_frame_once() {
    // One frame carrying two segments of the same flow.
    let mut segments = handshake();
    segments.push(data(4, 0.030, 101, vec![b'x'; 10]));
    segments.push(data(4, 0.030, 111, vec![b'y'; 10]));

    let mut analyzer = Analyzer::new(&Config::default());
    let mut first = Vec::new();
    let mut consumer = |pdu: &Pdu<'_>| {
        first.push(Seen::from_pdu(pdu));
        ConsumeResult::Consumed
    };
    for seg in &segments {
        analyzer.process(seg, true, &mut consumer).unwrap();
    }

    let mut replayed = Vec::new();
    let mut recorder = |pdu: &Pdu<'_>| {
        replayed.push(Seen::from_pdu(pdu));
        ConsumeResult::Consumed
    };
    for seg in &segments {
        analyzer.process(seg, false, &mut recorder).unwrap();
    }

    assert_eq!(first.len(), 2);
    assert_eq!(replayed, first);
    assert_eq!(analyzer.deliveries(4, 111, 501).len(), 1);
    assert_eq!(analyzer.deliveries(4, 111, 501)[0].data, vec![b'y'; 10]);
}

#[test]
fn flushed_deliveries_replay_after_the_last_frame() {
    let mut segments = handshake();
    segments.push(data(4, 0.030, 101, vec![b'a'; 10]));
    segments.push(data(5, 0.031, 131, vec![b'c'; 10]));
    segments.push(data(6, 0.032, 111, vec![b'b'; 10]));

    let mut analyzer = Analyzer::new(&Config::default());
    let mut first = Vec::new();
    let mut consumer = |pdu: &Pdu<'_>| {
        first.push(Seen::from_pdu(pdu));
        ConsumeResult::Consumed
    };
    for seg in &segments {
        analyzer.process(seg, true, &mut consumer).unwrap();
    }
    analyzer.flush(&mut consumer);

    let mut replayed = Vec::new();
    let mut recorder = |pdu: &Pdu<'_>| {
        replayed.push(Seen::from_pdu(pdu));
        ConsumeResult::Consumed
    };
    for seg in &segments {
        analyzer.process(seg, false, &mut recorder).unwrap();
    }
    analyzer.replay_flush(&mut recorder);

    let order: Vec<u8> = first.iter().map(|seen| seen.data[0]).collect();
    assert_eq!(order, b"abc".to_vec());
    assert_eq!(replayed, first);
    let all: Vec<u8> = analyzer.all_deliveries().map(|pdu| pdu.data[0]).collect();
    assert_eq!(all, b"abc".to_vec());
}

#[test]
fn every_arrival_order_without_a_handshake_reassembles_the_same_bytes() {
    let chunks: Vec<Vec<u8>> = (0..3u8).map(|i| vec![b'a' + i; 10]).collect();
    let expected: Vec<u8> = chunks.concat();

    for order in permutations(chunks.len()) {
        let mut analyzer = Analyzer::new(&Config::default());
        let mut delivered = Vec::new();
        let mut consumer = |pdu: &Pdu<'_>| {
            delivered.extend_from_slice(pdu.data);
            ConsumeResult::Consumed
        };
        for (arrival, &index) in order.iter().enumerate() {
            let seg = data(
                4 + arrival as FrameId,
                0.030 + arrival as f64 * 0.001,
                101 + 10 * index as u32,
                chunks[index].clone(),
            );
            let report = analyzer.process(&seg, true, &mut consumer).unwrap();
            assert_eq!(report.disposition, Disposition::OutOfOrder, "order {:?}", order);
        }
        analyzer.flush(&mut consumer);
        assert_eq!(delivered, expected, "order {:?}", order);

        let follow: Vec<u8> = analyzer
            .follow_stream(0)
            .unwrap()
            .iter()
            .flat_map(|record| record.data.clone())
            .collect();
        assert_eq!(follow, expected, "follow, order {:?}", order);
    }
}

#[test]
fn peer_ack_fixes_where_a_stream_without_syn_starts() {
    let mut analyzer = Analyzer::new(&Config::default());
    let mut seen = Vec::new();
    let mut consumer = |pdu: &Pdu<'_>| {
        seen.push(Seen::from_pdu(pdu));
        ConsumeResult::Consumed
    };
    let late = data(4, 0.030, 121, vec![b'c'; 10]);
    let head = data(5, 0.031, 101, vec![b'a'; 10]);
    let ack = ack_from_b(6, 0.040, 131);
    let fill = data(7, 0.050, 111, vec![b'b'; 10]);

    analyzer.process(&late, true, &mut consumer).unwrap();
    analyzer.process(&head, true, &mut consumer).unwrap();
    let acked = analyzer.process(&ack, true, &mut consumer).unwrap();
    assert_eq!(acked.disposition, Disposition::Delivered);
    let filled = analyzer.process(&fill, true, &mut consumer).unwrap();
    assert_eq!(filled.disposition, Disposition::Delivered);

    assert_eq!(seen[0].data, vec![b'a'; 10]);
    assert_eq!((seen[0].frame, seen[0].first_frame), (6, 5));
    let bytes: Vec<u8> = seen.iter().flat_map(|s| s.data.clone()).collect();
    assert_eq!(bytes, [vec![b'a'; 10], vec![b'b'; 10], vec![b'c'; 10]].concat());
    assert_eq!(analyzer.deliveries(6, 501, 131).len(), 1);
}

#[test]
fn unacked_cap_degrades_rto_and_bytes_in_flight() {
    let mut segments = handshake();
    segments.push(data(4, 1.00, 101, vec![0; 10]));
    segments.push(data(5, 1.01, 111, vec![0; 10]));
    segments.push(data(6, 1.02, 121, vec![0; 10]));
    segments.push(data(7, 2.00, 101, vec![0; 10]));

    let mut config = Config::default();
    config.analysis.max_unacked_segments = 2;
    let mut capped = Analyzer::new(&config);
    let reports = run_first_pass(&mut capped, &segments);

    // The first data segment fell off the list.
    assert_eq!(reports[5].annotation.bytes_in_flight, Some(20));
    let resend = &reports[6].annotation;
    assert!(resend.has(AnalysisFlags::RETRANSMISSION));
    let rto = resend.rto.unwrap();
    assert_eq!(rto.frame, 6);
    assert!((rto.delta - 0.98).abs() < 1e-9);

    let mut full = Analyzer::new(&Config::default());
    let reports = run_first_pass(&mut full, &segments);
    assert_eq!(reports[5].annotation.bytes_in_flight, Some(30));
    let rto = reports[6].annotation.rto.unwrap();
    assert_eq!(rto.frame, 4);
    assert!((rto.delta - 1.0).abs() < 1e-9);
}
