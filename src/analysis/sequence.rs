//! Sequence number analysis: classifies each segment against what has been
//! seen in both directions of its flow and keeps the per-direction state
//! (next expected sequence, unacked list, dup-ACK counter, window) current.

use crate::analysis::{AnalysisFlags, Annotation, DupAck, Rto};
use crate::config::{AnalysisConfig, RetransmissionPrecedence};
use crate::direction::{Direction, UnackedSegment, WindowScale};
use crate::segment::{Segment, TcpFlags};
use crate::seq;

/// Handshake timing for one flow; yields the initial RTT once the
/// initiator acknowledges the SYN+ACK.
#[derive(Debug, Clone, Default)]
pub struct Handshake {
    syn_time: Option<f64>,
    syn_ack_seen: bool,
    initial_rtt: Option<f64>,
}

impl Handshake {
    pub fn initial_rtt(&self) -> Option<f64> {
        self.initial_rtt
    }
}

#[derive(Debug, Clone)]
pub struct SequenceAnalyzer {
    config: AnalysisConfig,
}

impl SequenceAnalyzer {
    pub fn new(config: AnalysisConfig) -> Self {
        SequenceAnalyzer { config }
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Base sequence latching, window scale negotiation and handshake RTT.
    /// Runs for every segment whether or not classification is enabled.
    pub(crate) fn observe_handshake(
        &self,
        segment: &Segment,
        fwd: &mut Direction,
        rev: &mut Direction,
        handshake: &mut Handshake,
        from_initiator: bool,
    ) {
        if segment.syn() {
            fwd.latch_base(segment.seq, true);
        } else {
            fwd.latch_base(segment.seq.wrapping_sub(1), false);
        }
        if let Some(ack) = segment.ack_number() {
            rev.latch_base(ack.wrapping_sub(1), false);
        }

        if segment.syn() {
            fwd.window_scale = WindowScale::from_option(segment.window_scale);
            if segment.flags.contains(TcpFlags::ACK)
                && (fwd.window_scale == WindowScale::NoScaling
                    || rev.window_scale == WindowScale::NoScaling)
            {
                fwd.window_scale = WindowScale::NoScaling;
                rev.window_scale = WindowScale::NoScaling;
            }
        }

        if segment.syn() && !segment.flags.contains(TcpFlags::ACK) {
            if handshake.syn_time.is_none() {
                handshake.syn_time = Some(segment.ts);
            }
        } else if segment.syn() {
            handshake.syn_ack_seen = true;
        } else if from_initiator
            && handshake.syn_ack_seen
            && handshake.initial_rtt.is_none()
            && segment.ack_number().is_some()
        {
            if let Some(syn_time) = handshake.syn_time {
                let rtt = (segment.ts - syn_time).max(0.0);
                tracing::debug!(frame = segment.frame, initial_rtt = rtt, "handshake complete");
                handshake.initial_rtt = Some(rtt);
            }
        }
    }

    /// Classify `segment` (travelling in `fwd`) and update both directions.
    pub(crate) fn analyze(
        &self,
        segment: &Segment,
        fwd: &mut Direction,
        rev: &mut Direction,
        initial_rtt: Option<f64>,
    ) -> Annotation {
        let mut ann = Annotation {
            initial_rtt,
            ..Annotation::default()
        };
        let seg_seq = segment.seq;
        let seglen = segment.seglen;
        let ts = segment.ts;
        let control = segment.is_control();
        let ack = segment.ack_number();

        let zero_window_probe = seglen == 1
            && fwd.next_seq == Some(seg_seq)
            && rev.window == Some(0);

        if zero_window_probe {
            ann.flags |= AnalysisFlags::ZERO_WINDOW_PROBE;
        } else {
            self.classify(segment, fwd, rev, initial_rtt, &mut ann);
        }

        if segment.window == 0 && !control {
            ann.flags |= AnalysisFlags::ZERO_WINDOW;
        }

        if let Some(ack) = ack {
            if ann.flags.contains(AnalysisFlags::ACK_LOST_PACKET) {
                rev.max_seq_to_be_acked = Some(ack);
            }
        }

        let next_seq = segment.next_seq();
        if !zero_window_probe
            && fwd.next_seq.map_or(true, |current| seq::gt(next_seq, current))
        {
            fwd.next_seq = Some(next_seq);
            fwd.next_seq_frame = segment.frame;
            fwd.next_seq_time = ts;
        }
        if segment.seq_len() > 0 && !zero_window_probe {
            fwd.push_unacked(
                UnackedSegment {
                    frame: segment.frame,
                    seq: seg_seq,
                    next_seq,
                    ts,
                },
                self.config.max_unacked_segments,
            );
            if fwd
                .max_seq_to_be_acked
                .map_or(true, |current| seq::gt(next_seq, current))
            {
                fwd.max_seq_to_be_acked = Some(next_seq);
            }
        }

        fwd.window = Some(segment.window);
        if let Some(ack) = ack {
            fwd.last_ack = Some(ack);
            fwd.last_ack_time = ts;
            fwd.sack.clone_from(&segment.sack);
        }
        fwd.last_segment_flags = ann.flags;

        if let Some(ack) = ack {
            if let Some(acked) = rev.prune_acked(ack) {
                ann.frame_acked = Some(acked.frame);
                ann.ack_rtt = Some((ts - acked.ts).max(0.0));
            }
            rev.bif_valid = true;
        }

        if self.config.track_bytes_in_flight && seglen > 0 {
            if fwd.bif_valid {
                let in_flight = fwd.bytes_in_flight(&rev.sack);
                if in_flight > 0 {
                    ann.bytes_in_flight = Some(in_flight);
                }
            }
            fwd.push_bytes = fwd.push_bytes.wrapping_add(seglen);
            ann.push_bytes_sent = Some(fwd.push_bytes);
            if segment.psh() {
                fwd.push_bytes = 0;
            }
        }

        if !ann.flags.is_empty() {
            tracing::debug!(
                frame = segment.frame,
                seq = seg_seq,
                flags = %ann.flags,
                "segment classified"
            );
        }
        ann
    }

    /// Everything a zero-window probe skips.
    fn classify(
        &self,
        segment: &Segment,
        fwd: &mut Direction,
        rev: &Direction,
        initial_rtt: Option<f64>,
        ann: &mut Annotation,
    ) {
        let seg_seq = segment.seq;
        let seglen = segment.seglen;
        let ts = segment.ts;
        let control = segment.is_control();
        let ack = segment.ack_number();

        if let Some(next) = fwd.next_seq {
            if seq::gt(seg_seq, next) && !segment.rst() {
                ann.flags |= AnalysisFlags::LOST_PACKET;
                fwd.bif_valid = false;
            }
        }

        if seglen <= 1
            && !control
            && fwd.next_seq.map(|next| next.wrapping_sub(1)) == Some(seg_seq)
        {
            ann.flags |= AnalysisFlags::KEEP_ALIVE;
        }

        // Same seq/ack as the previous segment in this direction, no data.
        let repeats_previous = seglen == 0
            && !control
            && fwd.next_seq == Some(seg_seq)
            && ack.is_some()
            && ack == fwd.last_ack;

        if repeats_previous && fwd.window.is_some_and(|w| w != segment.window) {
            ann.flags |= AnalysisFlags::WINDOW_UPDATE;
        }

        if seglen > 0 && !control {
            let scale = rev.window_scale.or(self.config.default_window_scale);
            if let (Some(shift), Some(window), Some(last_ack)) =
                (scale.shift(), rev.window, rev.last_ack)
            {
                let limit = last_ack.wrapping_add((window as u32) << shift);
                if seg_seq.wrapping_add(seglen) == limit {
                    ann.flags |= AnalysisFlags::WINDOW_FULL;
                }
            }
        }

        let same_window = fwd.window == Some(segment.window);
        // Answers to a keep-alive or a probe end classification here.
        if repeats_previous && same_window {
            if rev
                .last_segment_flags
                .contains(AnalysisFlags::KEEP_ALIVE)
            {
                ann.flags |= AnalysisFlags::KEEP_ALIVE_ACK;
                return;
            } else if segment.window == 0
                && rev
                    .last_segment_flags
                    .contains(AnalysisFlags::ZERO_WINDOW_PROBE)
            {
                ann.flags |= AnalysisFlags::ZERO_WINDOW_PROBE_ACK;
                return;
            }
        }

        if repeats_previous && same_window {
            fwd.dupack_count += 1;
            ann.flags |= AnalysisFlags::DUPLICATE_ACK;
            ann.dupack = Some(DupAck {
                num: fwd.dupack_count,
                frame: fwd.last_nondup_ack_frame,
            });
        }
        if !ann.flags.contains(AnalysisFlags::DUPLICATE_ACK) {
            fwd.last_nondup_ack_frame = segment.frame;
            fwd.dupack_count = 0;
        }

        if let (Some(ack), Some(max_seq)) = (ack, rev.max_seq_to_be_acked) {
            if seq::gt(ack, max_seq) {
                ann.flags |= AnalysisFlags::ACK_LOST_PACKET;
            }
        }

        self.classify_retransmission(segment, fwd, rev, initial_rtt, ann);

        tracing::trace!(
            frame = segment.frame,
            ts,
            dupacks = fwd.dupack_count,
            "sequence rules evaluated"
        );
    }

    fn classify_retransmission(
        &self,
        segment: &Segment,
        fwd: &Direction,
        rev: &Direction,
        initial_rtt: Option<f64>,
        ann: &mut Annotation,
    ) {
        let carries_sequence = segment.seglen > 0 || segment.syn() || segment.fin();
        let Some(next) = fwd.next_seq else {
            return;
        };
        if !carries_sequence
            || !seq::lt(segment.seq, next)
            || ann.flags.contains(AnalysisFlags::KEEP_ALIVE)
        {
            return;
        }

        let end = segment.seq.wrapping_add(segment.seglen);
        if rev.last_ack.is_some_and(|last_ack| seq::le(end, last_ack)) {
            ann.flags |= AnalysisFlags::SPURIOUS_RETRANSMISSION;
            return;
        }

        let fast = rev.dupack_count >= 2
            && rev.last_ack == Some(segment.seq)
            && segment.ts - rev.last_ack_time < self.config.fast_retransmission_window();

        let threshold = initial_rtt
            .filter(|rtt| *rtt > 0.0)
            .unwrap_or_else(|| self.config.out_of_order_threshold());
        let out_of_order =
            segment.ts - fwd.next_seq_time < threshold && next != segment.next_seq();

        let order = match self.config.retransmission_precedence {
            RetransmissionPrecedence::FastRetransmission => [
                (fast, AnalysisFlags::FAST_RETRANSMISSION),
                (out_of_order, AnalysisFlags::OUT_OF_ORDER),
            ],
            RetransmissionPrecedence::OutOfOrder => [
                (out_of_order, AnalysisFlags::OUT_OF_ORDER),
                (fast, AnalysisFlags::FAST_RETRANSMISSION),
            ],
        };
        if let Some((_, flag)) = order.iter().find(|(hit, _)| *hit) {
            ann.flags |= *flag;
            return;
        }

        ann.flags |= AnalysisFlags::RETRANSMISSION;
        let original = fwd
            .unacked
            .iter()
            .rev()
            .find(|earlier| earlier.seq == segment.seq);
        ann.rto = Some(match original {
            Some(earlier) => Rto {
                delta: (segment.ts - earlier.ts).max(0.0),
                frame: earlier.frame,
            },
            None => Rto {
                delta: (segment.ts - fwd.next_seq_time).max(0.0),
                frame: fwd.next_seq_frame,
            },
        });
    }
}
