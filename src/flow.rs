use ahash::AHashMap;
use bitflags::bitflags;
use serde::Serialize;
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::net::IpAddr;
use std::path::Path;

use crate::analysis::sequence::Handshake;
use crate::analysis::{AnalysisFlags, Annotation};
use crate::direction::Direction;
use crate::error::SegmentError;
use crate::follow::FollowRecord;
use crate::segment::{Endpoint, Segment, TcpFlags};

/// Index of a flow in the directory, assigned in order of first sight.
pub type StreamId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowDirection {
    AtoB,
    BtoA,
}

impl FlowDirection {
    pub fn reverse(self) -> Self {
        match self {
            FlowDirection::AtoB => FlowDirection::BtoA,
            FlowDirection::BtoA => FlowDirection::AtoB,
        }
    }

    fn index(self) -> usize {
        match self {
            FlowDirection::AtoB => 0,
            FlowDirection::BtoA => 1,
        }
    }
}

impl fmt::Display for FlowDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowDirection::AtoB => write!(f, "a_to_b"),
            FlowDirection::BtoA => write!(f, "b_to_a"),
        }
    }
}

/// Direction-independent 4-tuple; `a` is the lower endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct FlowKey {
    pub a: Endpoint,
    pub b: Endpoint,
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <-> {}", self.a, self.b)
    }
}

impl FlowKey {
    pub fn new(src: Endpoint, dst: Endpoint) -> (Self, FlowDirection) {
        let src_key = endpoint_key(&src);
        let dst_key = endpoint_key(&dst);
        if src_key <= dst_key {
            (FlowKey { a: src, b: dst }, FlowDirection::AtoB)
        } else {
            (FlowKey { a: dst, b: src }, FlowDirection::BtoA)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TcpState {
    SynSent,
    SynAck,
    Established,
    FinWait,
    Closed,
    Reset,
    Unknown,
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TcpState::SynSent => write!(f, "syn_sent"),
            TcpState::SynAck => write!(f, "syn_ack"),
            TcpState::Established => write!(f, "established"),
            TcpState::FinWait => write!(f, "fin_wait"),
            TcpState::Closed => write!(f, "closed"),
            TcpState::Reset => write!(f, "reset"),
            TcpState::Unknown => write!(f, "unknown"),
        }
    }
}

bitflags! {
    /// Which parts of a conversation were observed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
    #[serde(into = "u8")]
    pub struct Completeness: u8 {
        const SYN = 0x01;
        const SYN_ACK = 0x02;
        const ACK = 0x04;
        const DATA = 0x08;
        const FIN = 0x10;
        const RST = 0x20;
    }
}

impl From<Completeness> for u8 {
    fn from(bits: Completeness) -> Self {
        bits.bits()
    }
}

impl fmt::Display for Completeness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Completeness::SYN, "SYN"),
            (Completeness::SYN_ACK, "SYN-ACK"),
            (Completeness::ACK, "ACK"),
            (Completeness::DATA, "DATA"),
            (Completeness::FIN, "FIN"),
            (Completeness::RST, "RST"),
        ];
        let parts: Vec<&str> = names
            .iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "{}", parts.join("|"))
    }
}

/// Counters and state summary kept alongside the analysis state of a flow.
#[derive(Debug, Clone, Serialize)]
pub struct FlowStats {
    pub first_seen: f64,
    pub last_seen: f64,
    pub last_frame: u64,
    pub packets_a_to_b: u64,
    pub packets_b_to_a: u64,
    pub bytes_a_to_b: u64,
    pub bytes_b_to_a: u64,
    pub tcp_state: TcpState,
    pub client: Option<FlowDirection>,
    #[serde(skip)]
    first_direction: Option<FlowDirection>,
    pub completeness: Completeness,
    pub retransmissions: u64,
    pub out_of_order: u64,
    pub lost_segments: u64,
    pub dup_acks: u64,
    pub zero_windows: u64,
    pub rtt_last_ms: Option<f64>,
    pub rtt_min_ms: Option<f64>,
    pub rtt_ewma_ms: Option<f64>,
    pub rtt_samples: u64,
}

impl FlowStats {
    fn new(ts: f64) -> Self {
        FlowStats {
            first_seen: ts,
            last_seen: ts,
            last_frame: 0,
            packets_a_to_b: 0,
            packets_b_to_a: 0,
            bytes_a_to_b: 0,
            bytes_b_to_a: 0,
            tcp_state: TcpState::Unknown,
            client: None,
            first_direction: None,
            completeness: Completeness::empty(),
            retransmissions: 0,
            out_of_order: 0,
            lost_segments: 0,
            dup_acks: 0,
            zero_windows: 0,
            rtt_last_ms: None,
            rtt_min_ms: None,
            rtt_ewma_ms: None,
            rtt_samples: 0,
        }
    }

    fn observe(&mut self, segment: &Segment, direction: FlowDirection) {
        self.last_seen = segment.ts;
        self.last_frame = segment.frame;
        self.first_direction.get_or_insert(direction);
        let bytes = segment.seglen as u64;
        match direction {
            FlowDirection::AtoB => {
                self.packets_a_to_b += 1;
                self.bytes_a_to_b += bytes;
            }
            FlowDirection::BtoA => {
                self.packets_b_to_a += 1;
                self.bytes_b_to_a += bytes;
            }
        }
        if segment.seglen > 0 {
            self.completeness |= Completeness::DATA;
        }
        self.update_tcp_state(segment.flags, direction);
    }

    pub(crate) fn record(&mut self, annotation: &Annotation) {
        if annotation.is_retransmission() {
            self.retransmissions += 1;
        }
        if annotation.has(AnalysisFlags::OUT_OF_ORDER) {
            self.out_of_order += 1;
        }
        if annotation.has(AnalysisFlags::LOST_PACKET) {
            self.lost_segments += 1;
        }
        if annotation.has(AnalysisFlags::DUPLICATE_ACK) {
            self.dup_acks += 1;
        }
        if annotation.has(AnalysisFlags::ZERO_WINDOW) {
            self.zero_windows += 1;
        }
        if let Some(rtt) = annotation.ack_rtt {
            self.record_rtt(rtt * 1000.0);
        }
    }

    fn record_rtt(&mut self, rtt_ms: f64) {
        self.rtt_last_ms = Some(rtt_ms);
        self.rtt_min_ms = Some(self.rtt_min_ms.map_or(rtt_ms, |min| min.min(rtt_ms)));
        let ewma = match self.rtt_ewma_ms {
            Some(prev) => 0.875 * prev + 0.125 * rtt_ms,
            None => rtt_ms,
        };
        self.rtt_ewma_ms = Some(ewma);
        self.rtt_samples += 1;
    }

    fn total_bytes(&self) -> u64 {
        self.bytes_a_to_b + self.bytes_b_to_a
    }

    fn total_packets(&self) -> u64 {
        self.packets_a_to_b + self.packets_b_to_a
    }

    fn update_tcp_state(&mut self, flags: TcpFlags, direction: FlowDirection) {
        if flags.contains(TcpFlags::RST) {
            self.completeness |= Completeness::RST;
            self.tcp_state = TcpState::Reset;
            return;
        }
        let syn = flags.contains(TcpFlags::SYN);
        let ack = flags.contains(TcpFlags::ACK);
        if syn && !ack {
            if self.client.is_none() {
                self.client = Some(direction);
            }
            self.completeness |= Completeness::SYN;
            self.tcp_state = TcpState::SynSent;
            return;
        }
        if syn && ack {
            if self.client.is_none() {
                self.client = Some(direction.reverse());
            }
            self.completeness |= Completeness::SYN_ACK;
            self.tcp_state = TcpState::SynAck;
            return;
        }
        if flags.contains(TcpFlags::FIN) {
            self.completeness |= Completeness::FIN;
            self.tcp_state = match self.tcp_state {
                // second FIN, from the other side
                TcpState::FinWait => TcpState::Closed,
                _ => TcpState::FinWait,
            };
            return;
        }
        if ack {
            if self.completeness.contains(Completeness::SYN_ACK) {
                self.completeness |= Completeness::ACK;
            }
            if !matches!(
                self.tcp_state,
                TcpState::Reset | TcpState::Closed | TcpState::FinWait
            ) {
                self.tcp_state = TcpState::Established;
            }
        }
    }
}

/// One TCP conversation: both half-connections plus its bookkeeping.
#[derive(Debug)]
pub struct Flow {
    stream: StreamId,
    key: FlowKey,
    dirs: [Direction; 2],
    handshake: Handshake,
    stats: FlowStats,
    follow: Vec<FollowRecord>,
    prev_ts: Option<f64>,
    /// A newer connection took over this 4-tuple.
    superseded: bool,
}

impl Flow {
    fn new(stream: StreamId, key: FlowKey, ts: f64) -> Self {
        Flow {
            stream,
            key,
            dirs: [Direction::new(), Direction::new()],
            handshake: Handshake::default(),
            stats: FlowStats::new(ts),
            follow: Vec::new(),
            prev_ts: None,
            superseded: false,
        }
    }

    pub fn stream(&self) -> StreamId {
        self.stream
    }

    pub fn key(&self) -> FlowKey {
        self.key
    }

    pub fn direction(&self, direction: FlowDirection) -> &Direction {
        &self.dirs[direction.index()]
    }

    pub fn stats(&self) -> &FlowStats {
        &self.stats
    }

    pub fn handshake(&self) -> &Handshake {
        &self.handshake
    }

    /// The side that sent the first SYN (or the one a SYN+ACK answered),
    /// else whoever sent the first segment.
    pub fn initiator(&self) -> Option<FlowDirection> {
        self.stats.client.or(self.stats.first_direction)
    }

    pub fn is_superseded(&self) -> bool {
        self.superseded
    }

    pub fn follow_records(&self) -> &[FollowRecord] {
        &self.follow
    }

    /// Sender side, receiver side and handshake, borrowed together.
    pub(crate) fn split(
        &mut self,
        direction: FlowDirection,
    ) -> (&mut Direction, &mut Direction, &mut Handshake) {
        let [a, b] = &mut self.dirs;
        let (fwd, rev) = match direction {
            FlowDirection::AtoB => (a, b),
            FlowDirection::BtoA => (b, a),
        };
        (fwd, rev, &mut self.handshake)
    }

    pub(crate) fn stats_mut(&mut self) -> &mut FlowStats {
        &mut self.stats
    }

    pub(crate) fn push_follow(&mut self, records: Vec<FollowRecord>) {
        self.follow.extend(records);
    }

    /// Count the segment and return (time since first frame, time since
    /// previous frame) for this flow.
    pub(crate) fn observe(&mut self, segment: &Segment, direction: FlowDirection) -> (f64, f64) {
        self.stats.observe(segment, direction);
        let relative = (segment.ts - self.stats.first_seen).max(0.0);
        let delta = self.prev_ts.map_or(0.0, |prev| (segment.ts - prev).max(0.0));
        self.prev_ts = Some(segment.ts);
        (relative, delta)
    }

    /// A SYN whose sequence number disagrees with the base this side
    /// already latched starts a new connection on the same ports.
    fn reused_by(&self, segment: &Segment, direction: FlowDirection) -> bool {
        segment.syn()
            && self
                .direction(direction)
                .base_seq()
                .is_some_and(|base| base != segment.seq)
    }

    pub fn snapshot(&self) -> FlowSnapshot {
        FlowSnapshot::from_flow(self)
    }
}

/// Outcome of looking a segment up in the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    pub stream: StreamId,
    pub direction: FlowDirection,
    pub is_new: bool,
    pub reused_ports: bool,
}

/// Every flow seen so far, in order of first sight, plus an index from
/// 4-tuple to the newest flow using it.
#[derive(Debug, Default)]
pub struct FlowDirectory {
    flows: Vec<Flow>,
    active: AHashMap<FlowKey, StreamId>,
}

impl FlowDirectory {
    pub fn new() -> Self {
        FlowDirectory::default()
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn get(&self, stream: StreamId) -> Option<&Flow> {
        self.flows.get(stream as usize)
    }

    pub(crate) fn get_mut(&mut self, stream: StreamId) -> Option<&mut Flow> {
        self.flows.get_mut(stream as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Flow> {
        self.flows.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Flow> {
        self.flows.iter_mut()
    }

    pub fn resolve(&mut self, segment: &Segment) -> Result<Resolved, SegmentError> {
        if segment.src == segment.dst {
            return Err(SegmentError::Unresolvable {
                frame: segment.frame,
                src: segment.src.to_string(),
                dst: segment.dst.to_string(),
            });
        }
        let (key, direction) = FlowKey::new(segment.src, segment.dst);

        let Some(&stream) = self.active.get(&key) else {
            let stream = self.open(key, segment.ts);
            return Ok(Resolved {
                stream,
                direction,
                is_new: true,
                reused_ports: false,
            });
        };

        let reused = match self.flows.get_mut(stream as usize) {
            Some(flow) if flow.reused_by(segment, direction) => {
                flow.superseded = true;
                true
            }
            _ => false,
        };
        if !reused {
            return Ok(Resolved {
                stream,
                direction,
                is_new: false,
                reused_ports: false,
            });
        }

        let stream = self.open(key, segment.ts);
        tracing::debug!(
            frame = segment.frame,
            stream,
            flow = %key,
            "port reuse, new conversation"
        );
        Ok(Resolved {
            stream,
            direction,
            is_new: true,
            reused_ports: true,
        })
    }

    fn open(&mut self, key: FlowKey, ts: f64) -> StreamId {
        let stream = self.flows.len() as StreamId;
        self.flows.push(Flow::new(stream, key, ts));
        self.active.insert(key, stream);
        stream
    }

    pub fn snapshot(&self) -> Vec<FlowSnapshot> {
        self.flows.iter().map(Flow::snapshot).collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FlowSnapshot {
    pub stream: StreamId,
    pub endpoint_a: Endpoint,
    pub endpoint_b: Endpoint,
    pub first_seen: f64,
    pub last_seen: f64,
    pub duration_secs: f64,
    pub packets_a_to_b: u64,
    pub packets_b_to_a: u64,
    pub bytes_a_to_b: u64,
    pub bytes_b_to_a: u64,
    pub packets_total: u64,
    pub bytes_total: u64,
    pub avg_bps: f64,
    pub tcp_state: TcpState,
    pub client: Option<FlowDirection>,
    pub completeness: Completeness,
    pub retransmissions: u64,
    pub out_of_order: u64,
    pub lost_segments: u64,
    pub dup_acks: u64,
    pub zero_windows: u64,
    pub initial_rtt_ms: Option<f64>,
    pub rtt_last_ms: Option<f64>,
    pub rtt_min_ms: Option<f64>,
    pub rtt_ewma_ms: Option<f64>,
    pub rtt_samples: u64,
}

impl FlowSnapshot {
    fn from_flow(flow: &Flow) -> Self {
        let stats = &flow.stats;
        let duration = (stats.last_seen - stats.first_seen).max(0.0);
        let bytes_total = stats.total_bytes();
        let avg_bps = if duration > 0.0 {
            bytes_total as f64 * 8.0 / duration
        } else {
            0.0
        };

        FlowSnapshot {
            stream: flow.stream,
            endpoint_a: flow.key.a,
            endpoint_b: flow.key.b,
            first_seen: stats.first_seen,
            last_seen: stats.last_seen,
            duration_secs: duration,
            packets_a_to_b: stats.packets_a_to_b,
            packets_b_to_a: stats.packets_b_to_a,
            bytes_a_to_b: stats.bytes_a_to_b,
            bytes_b_to_a: stats.bytes_b_to_a,
            packets_total: stats.total_packets(),
            bytes_total,
            avg_bps,
            tcp_state: stats.tcp_state,
            client: flow.initiator(),
            completeness: stats.completeness,
            retransmissions: stats.retransmissions,
            out_of_order: stats.out_of_order,
            lost_segments: stats.lost_segments,
            dup_acks: stats.dup_acks,
            zero_windows: stats.zero_windows,
            initial_rtt_ms: flow.handshake.initial_rtt().map(|rtt| rtt * 1000.0),
            rtt_last_ms: stats.rtt_last_ms,
            rtt_min_ms: stats.rtt_min_ms,
            rtt_ewma_ms: stats.rtt_ewma_ms,
            rtt_samples: stats.rtt_samples,
        }
    }
}

pub fn write_flow_json(
    path: &Path,
    flows: &[FlowSnapshot],
) -> Result<(), Box<dyn std::error::Error>> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, flows)?;
    Ok(())
}

pub fn write_flow_csv(
    path: &Path,
    flows: &[FlowSnapshot],
) -> Result<(), Box<dyn std::error::Error>> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    writeln!(
        writer,
        "stream,endpoint_a_ip,endpoint_a_port,endpoint_b_ip,endpoint_b_port,first_seen,last_seen,duration_secs,packets_total,bytes_total,avg_bps,tcp_state,client,completeness,retransmissions,out_of_order,lost_segments,dup_acks,zero_windows,initial_rtt_ms,rtt_min_ms,rtt_ewma_ms"
    )?;
    let ms = |value: Option<f64>| value.map(|v| format!("{:.3}", v)).unwrap_or_default();
    for flow in flows {
        let client = flow.client.map(|dir| dir.to_string()).unwrap_or_default();
        writeln!(
            writer,
            "{},{},{},{},{},{:.6},{:.6},{:.6},{},{},{:.3},{},{},{},{},{},{},{},{},{},{},{}",
            flow.stream,
            csv_escape(&flow.endpoint_a.ip.to_string()),
            flow.endpoint_a.port,
            csv_escape(&flow.endpoint_b.ip.to_string()),
            flow.endpoint_b.port,
            flow.first_seen,
            flow.last_seen,
            flow.duration_secs,
            flow.packets_total,
            flow.bytes_total,
            flow.avg_bps,
            flow.tcp_state,
            client,
            csv_escape(&flow.completeness.to_string()),
            flow.retransmissions,
            flow.out_of_order,
            flow.lost_segments,
            flow.dup_acks,
            flow.zero_windows,
            ms(flow.initial_rtt_ms),
            ms(flow.rtt_min_ms),
            ms(flow.rtt_ewma_ms),
        )?;
    }
    writer.flush()?;
    Ok(())
}

/// Escape a CSV field: wrap in double quotes if it contains comma, quote, or newline.
fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') || field.contains('\r') {
        let escaped = field.replace('"', "\"\"");
        format!("\"{}\"", escaped)
    } else {
        field.to_string()
    }
}

fn endpoint_key(endpoint: &Endpoint) -> (u8, [u8; 16], u16) {
    let (version, addr) = ip_key(endpoint.ip);
    (version, addr, endpoint.port)
}

fn ip_key(ip: IpAddr) -> (u8, [u8; 16]) {
    match ip {
        IpAddr::V4(addr) => {
            let mut bytes = [0u8; 16];
            bytes[12..].copy_from_slice(&addr.octets());
            (4, bytes)
        }
        IpAddr::V6(addr) => (6, addr.octets()),
    }
}
