//! Reliability buffer (C4, §4.4): tracks every in-flight packet's frames so they can be
//! reinjected on loss, drives RTT estimation off incoming ACKs, and gates new packet emission on
//! a congestion window. One `Recovery` instance is shared across all three packet-number spaces,
//! which are tracked independently per §4.6 ("packet-number spaces are strictly isolated").

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::packet::frame::{AckRange, Frame};
use crate::packet::header::PnSpace;

/// A packet this endpoint has sent and not yet had acked or declared lost.
pub struct SentPacket {
    pub frames: Vec<Frame>,
    pub sent_at: Instant,
    pub size: u64,
    pub ack_eliciting: bool,
    pub in_flight: bool,
}

/// RTT estimator per RFC-9002-style exponential smoothing, parameterized by the configured
/// initial RTT (§4.9 `TransportConfig::initial_rtt`) until the first real sample arrives.
pub struct RttEstimator {
    latest_rtt: Duration,
    smoothed_rtt: Duration,
    rttvar: Duration,
    min_rtt: Duration,
    has_sample: bool,
}

impl RttEstimator {
    pub fn new(initial_rtt: Duration) -> Self {
        Self {
            latest_rtt: initial_rtt,
            smoothed_rtt: initial_rtt,
            rttvar: initial_rtt / 2,
            min_rtt: initial_rtt,
            has_sample: false,
        }
    }

    /// Folds in one RTT sample. `ack_delay` is the peer-reported delay between receipt and ACK
    /// (subtracted from the sample, per §4.6's ACK policy, but never below `min_rtt`).
    pub fn update(&mut self, rtt_sample: Duration, ack_delay: Duration) {
        self.latest_rtt = rtt_sample;
        if !self.has_sample {
            self.min_rtt = rtt_sample;
            self.smoothed_rtt = rtt_sample;
            self.rttvar = rtt_sample / 2;
            self.has_sample = true;
            return;
        }
        self.min_rtt = self.min_rtt.min(rtt_sample);
        let adjusted = rtt_sample.saturating_sub(ack_delay).max(self.min_rtt);
        let diff = if adjusted > self.smoothed_rtt { adjusted - self.smoothed_rtt } else { self.smoothed_rtt - adjusted };
        self.rttvar = (self.rttvar * 3 + diff) / 4;
        self.smoothed_rtt = (self.smoothed_rtt * 7 + adjusted) / 8;
    }

    pub fn smoothed(&self) -> Duration {
        self.smoothed_rtt
    }

    pub fn latest(&self) -> Duration {
        self.latest_rtt
    }

    /// Probe timeout: `smoothed_rtt + max(4 * rttvar, 1ms)`, the basis for the retransmit timer
    /// (§4.6/§4.8) when no loss has been detected by the time-threshold rule yet.
    pub fn pto(&self) -> Duration {
        self.smoothed_rtt + (self.rttvar * 4).max(Duration::from_millis(1))
    }
}

struct SpaceState {
    sent: BTreeMap<u64, SentPacket>,
    largest_acked: Option<u64>,
}

impl SpaceState {
    fn new() -> Self {
        Self { sent: BTreeMap::new(), largest_acked: None }
    }
}

/// Minimal slow-start/congestion-avoidance window, sized generously for the tunnel's traffic
/// pattern (two long-lived control streams, not bulk transfer) — a full loss-based congestion
/// controller (Cubic, BBR, ...) is out of scope (§1 Non-goals: "congestion-control research
/// beyond what a correct QUIC endpoint needs").
const MINIMUM_WINDOW: u64 = 2 * 1200;
const INITIAL_WINDOW: u64 = 10 * 1200;

pub struct Recovery {
    spaces: [SpaceState; 3],
    rtt: RttEstimator,
    bytes_in_flight: u64,
    congestion_window: u64,
    packet_threshold: u32,
    time_threshold: f32,
}

fn space_index(space: PnSpace) -> usize {
    match space {
        PnSpace::Initial => 0,
        PnSpace::Handshake => 1,
        PnSpace::Application => 2,
    }
}

impl Recovery {
    pub fn new(initial_rtt: Duration, packet_threshold: u32, time_threshold: f32) -> Self {
        Self {
            spaces: [SpaceState::new(), SpaceState::new(), SpaceState::new()],
            rtt: RttEstimator::new(initial_rtt),
            bytes_in_flight: 0,
            congestion_window: INITIAL_WINDOW,
            packet_threshold,
            time_threshold,
        }
    }

    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    pub fn bytes_in_flight(&self) -> u64 {
        self.bytes_in_flight
    }

    /// The peer's most recently acknowledged packet number in this space, used to pick the
    /// narrowest safe packet-number encoding for the next packet sent (§3).
    pub fn largest_acked(&self, space: PnSpace) -> Option<u64> {
        self.spaces[space_index(space)].largest_acked
    }

    /// Whether a packet of `size` bytes may be sent as new (non-retransmission) data right now
    /// (§4.4: "a congestion-window check gates new packet emission but does not gate
    /// retransmissions of lost data" — retransmissions go through `on_packet_sent` directly).
    pub fn can_send(&self, size: u64) -> bool {
        self.bytes_in_flight + size <= self.congestion_window
    }

    pub fn on_packet_sent(&mut self, space: PnSpace, pn: u64, frames: Vec<Frame>, size: u64, now: Instant) {
        let ack_eliciting = frames.iter().any(Frame::is_ack_eliciting);
        let in_flight = ack_eliciting || !frames.is_empty();
        if in_flight {
            self.bytes_in_flight += size;
        }
        self.spaces[space_index(space)]
            .sent
            .insert(pn, SentPacket { frames, sent_at: now, size, ack_eliciting, in_flight });
    }

    /// Processes an incoming ACK frame against this space's sent-packet record (§4.4 steps 1-3).
    /// Returns the frames carried by newly-acked packets, for the caller to feed stream/crypto
    /// offset advancement.
    pub fn on_ack_received(&mut self, space: PnSpace, ranges: &[AckRange]) -> Vec<Frame> {
        let state = &mut self.spaces[space_index(space)];
        let highest_range_largest = ranges.iter().map(|r| r.largest).max().unwrap_or(0);
        state.largest_acked = Some(state.largest_acked.map_or(highest_range_largest, |l| l.max(highest_range_largest)));

        let mut newly_acked_frames = Vec::new();
        for range in ranges {
            let keys: Vec<u64> = state.sent.range(range.smallest..=range.largest).map(|(pn, _)| *pn).collect();
            for pn in keys {
                if let Some(pkt) = state.sent.remove(&pn) {
                    if pkt.in_flight {
                        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(pkt.size);
                        self.congestion_window += pkt.size.min(MINIMUM_WINDOW);
                    }
                    newly_acked_frames.extend(pkt.frames);
                }
            }
        }
        newly_acked_frames
    }

    /// Records a fresh RTT sample when the packet that was just acked is the newest acked so far
    /// in this space. Called by the connection state machine with the send time it captured
    /// before handing the packet number space off to `on_ack_received` for removal, since the
    /// sent-packet record doesn't survive that call.
    pub fn sample_rtt(&mut self, sent_at: Instant, now: Instant, ack_delay: Duration) {
        let sample = now.saturating_duration_since(sent_at);
        self.rtt.update(sample, ack_delay);
    }

    /// Finds the send time of a still-tracked packet without removing it, so the caller can
    /// decide whether it's the newest-acked packet and capture an RTT sample before the ack
    /// processing above evicts it.
    pub fn sent_at(&self, space: PnSpace, pn: u64) -> Option<Instant> {
        self.spaces[space_index(space)].sent.get(&pn).map(|p| p.sent_at)
    }

    /// Loss detection (§4.4): a packet is lost when either a newer packet in the same space has
    /// been acked and the time gap exceeds `time_threshold * max(smoothed_rtt, latest_rtt)`, or
    /// it sits at least `packet_threshold` packets behind the largest acked. Lost packets are
    /// unlinked from in-flight and their frames returned for rebuilding into a fresh packet;
    /// non-retransmittable frames (ACK, PADDING, PING, the close frames) are dropped.
    pub fn detect_lost(&mut self, space: PnSpace, now: Instant) -> Vec<Frame> {
        let loss_delay = self.time_threshold_duration();
        let state = &mut self.spaces[space_index(space)];
        let Some(largest_acked) = state.largest_acked else { return Vec::new() };
        let packet_threshold = self.packet_threshold as u64;

        let lost_pns: Vec<u64> = state
            .sent
            .iter()
            .filter(|(pn, pkt)| {
                let too_old_in_time = now.saturating_duration_since(pkt.sent_at) > loss_delay;
                let too_far_behind = largest_acked.saturating_sub(**pn) >= packet_threshold;
                **pn < largest_acked && (too_old_in_time || too_far_behind)
            })
            .map(|(pn, _)| *pn)
            .collect();

        let mut lost_frames = Vec::new();
        for pn in lost_pns {
            if let Some(pkt) = state.sent.remove(&pn) {
                if pkt.in_flight {
                    self.bytes_in_flight = self.bytes_in_flight.saturating_sub(pkt.size);
                    self.congestion_window = (self.congestion_window / 2).max(MINIMUM_WINDOW);
                }
                lost_frames.extend(pkt.frames.into_iter().filter(Frame::is_retransmittable));
            }
        }
        lost_frames
    }

    fn time_threshold_duration(&self) -> Duration {
        let base = self.rtt.smoothed().max(self.rtt.latest());
        base.mul_f32(self.time_threshold)
    }

    /// Declares every in-flight 0-RTT packet lost in one sweep (§4.6: "if the server rejects
    /// early data, all 0-RTT packets are declared lost in one sweep"). 0-RTT shares the
    /// Application space's packet numbers, so the caller passes the set of PNs it knows were
    /// sent before 1-RTT keys existed.
    pub fn declare_zero_rtt_rejected(&mut self, zero_rtt_pns: &[u64]) -> Vec<Frame> {
        let state = &mut self.spaces[space_index(PnSpace::Application)];
        let mut frames = Vec::new();
        for pn in zero_rtt_pns {
            if let Some(pkt) = state.sent.remove(pn) {
                if pkt.in_flight {
                    self.bytes_in_flight = self.bytes_in_flight.saturating_sub(pkt.size);
                }
                frames.extend(pkt.frames.into_iter().filter(Frame::is_retransmittable));
            }
        }
        frames
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    fn recovery() -> Recovery {
        Recovery::new(Duration::from_millis(100), 3, 9.0 / 8.0)
    }

    #[test]
    fn acked_packet_is_removed_from_in_flight() {
        let mut r = recovery();
        let now = Instant::now();
        r.on_packet_sent(PnSpace::Application, 1, vec![Frame::Ping], 100, now);
        assert_eq!(r.bytes_in_flight(), 100);

        let ranges = vec![AckRange { smallest: 1, largest: 1 }];
        let acked = r.on_ack_received(PnSpace::Application, &ranges);
        assert_eq!(acked.len(), 1);
        assert_eq!(r.bytes_in_flight(), 0);
    }

    #[test]
    fn old_unacked_packet_is_declared_lost_by_packet_threshold() {
        let mut r = recovery();
        let now = Instant::now();
        for pn in 0..5 {
            r.on_packet_sent(PnSpace::Application, pn, vec![Frame::Stream { stream_id: 4, offset: 0, fin: false, data: bytes::Bytes::new() }], 50, now);
        }
        let ranges = vec![AckRange { smallest: 4, largest: 4 }];
        r.on_ack_received(PnSpace::Application, &ranges);

        let lost = r.detect_lost(PnSpace::Application, now);
        // pn 0 is 4 behind the largest acked (4), at least packet_threshold (3) -> lost.
        assert!(lost.iter().any(|f| matches!(f, Frame::Stream { .. })));
    }

    #[test]
    fn non_retransmittable_frames_are_not_rebuilt_on_loss() {
        let mut r = recovery();
        let now = Instant::now();
        r.on_packet_sent(PnSpace::Application, 0, vec![Frame::Ping, Frame::Padding { len: 4 }], 50, now);
        for pn in 1..4 {
            r.on_packet_sent(PnSpace::Application, pn, vec![Frame::Ping], 50, now);
        }
        let ranges = vec![AckRange { smallest: 3, largest: 3 }];
        r.on_ack_received(PnSpace::Application, &ranges);
        let lost = r.detect_lost(PnSpace::Application, now);
        assert!(lost.is_empty());
    }
}
