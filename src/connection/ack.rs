//! Per-space received-packet tracking and ACK generation policy (§4.6 "ACK policy"). One
//! `AckTracker` exists per packet-number space, grounded on the per-space split
//! `aws-s2n-quic/quic/s2n-quic-transport/src/space/mod.rs` uses to keep Initial/Handshake/
//! Application bookkeeping from leaking into each other.

use std::time::{Duration, Instant};

use crate::packet::frame::{AckRange, Frame};

pub struct AckTracker {
    /// Received packet numbers not yet acknowledged, stored as disjoint descending ranges.
    pending: Vec<AckRange>,
    largest_received: Option<u64>,
    /// When the oldest unacked ack-eliciting packet in this space arrived; cleared once an ACK
    /// covering it is sent. `None` means no ACK is currently owed.
    armed_at: Option<Instant>,
    immediate: bool,
}

impl AckTracker {
    /// `immediate` is set for the handshake spaces, where §4.6 calls for acking right away
    /// rather than waiting out the delay timer used in the Application space.
    pub fn new(immediate: bool) -> Self {
        Self { pending: Vec::new(), largest_received: None, armed_at: None, immediate }
    }

    /// Records that `pn` arrived. `ack_eliciting` arms the delay timer if nothing was owed yet.
    pub fn on_packet_received(&mut self, pn: u64, ack_eliciting: bool, now: Instant) {
        self.largest_received = Some(self.largest_received.map_or(pn, |l| l.max(pn)));
        insert_range(&mut self.pending, pn);
        if ack_eliciting && self.armed_at.is_none() {
            self.armed_at = Some(now);
        }
    }

    /// Whether an ACK should be emitted right now, given the space's delay policy.
    pub fn ack_due(&self, now: Instant, max_ack_delay: Duration) -> bool {
        match self.armed_at {
            None => false,
            Some(armed) => self.immediate || now.saturating_duration_since(armed) >= max_ack_delay,
        }
    }

    pub fn next_deadline(&self, max_ack_delay: Duration) -> Option<Instant> {
        self.armed_at.map(|armed| if self.immediate { armed } else { armed + max_ack_delay })
    }

    /// The highest packet number received in this space so far, used to reconstruct truncated
    /// packet numbers on subsequent packets (§3).
    pub fn largest_received(&self) -> Option<u64> {
        self.largest_received
    }

    /// Builds the ACK frame covering everything received so far and disarms the delay timer.
    /// Ranges are already kept sorted descending by `largest` per the wire format's requirement.
    pub fn generate(&mut self, ack_delay: Duration) -> Option<Frame> {
        let largest_acked = self.largest_received?;
        self.armed_at = None;
        Some(Frame::Ack { largest_acked, ack_delay: ack_delay.as_micros() as u64, ranges: self.pending.clone() })
    }
}

/// Inserts `pn` into a sorted-descending, non-overlapping set of inclusive ranges, merging with
/// neighbors that become contiguous.
fn insert_range(ranges: &mut Vec<AckRange>, pn: u64) {
    if let Some(pos) = ranges.iter().position(|r| pn >= r.smallest.saturating_sub(1) && pn <= r.largest + 1) {
        let merged_with_next = pos > 0 && ranges[pos - 1].smallest <= pn + 1;
        ranges[pos].smallest = ranges[pos].smallest.min(pn);
        ranges[pos].largest = ranges[pos].largest.max(pn);
        if merged_with_next {
            let upper = ranges.remove(pos - 1);
            ranges[pos - 1].largest = upper.largest;
        }
        return;
    }
    let insert_at = ranges.iter().position(|r| pn > r.largest).unwrap_or(ranges.len());
    ranges.insert(insert_at, AckRange { smallest: pn, largest: pn });
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sequential_packets_collapse_into_one_range() {
        let mut t = AckTracker::new(true);
        let now = Instant::now();
        for pn in 0..5 {
            t.on_packet_received(pn, true, now);
        }
        let Frame::Ack { largest_acked, ranges, .. } = t.generate(Duration::ZERO).unwrap() else { panic!() };
        assert_eq!(largest_acked, 4);
        assert_eq!(ranges, vec![AckRange { smallest: 0, largest: 4 }]);
    }

    #[test]
    fn reordered_packets_leave_a_gap_range() {
        let mut t = AckTracker::new(true);
        let now = Instant::now();
        t.on_packet_received(0, true, now);
        t.on_packet_received(1, true, now);
        t.on_packet_received(5, true, now);
        let Frame::Ack { ranges, .. } = t.generate(Duration::ZERO).unwrap() else { panic!() };
        assert_eq!(ranges, vec![AckRange { smallest: 5, largest: 5 }, AckRange { smallest: 0, largest: 1 }]);
    }

    #[test]
    fn application_space_waits_for_the_delay_timer() {
        let mut t = AckTracker::new(false);
        let now = Instant::now();
        t.on_packet_received(0, true, now);
        assert!(!t.ack_due(now, Duration::from_millis(25)));
        assert!(t.ack_due(now + Duration::from_millis(30), Duration::from_millis(25)));
    }
}
