//! Receive-side acknowledgement scoreboard (section 4.C), grounded in the
//! original `MozQuicStreamAck`/ack-range-list design: a sorted, coalescing
//! list of contiguous received-packet-number ranges.

use std::time::Instant;

use crate::packet::frame::AckFrame;
use crate::packet::types::KeyPhase;

/// One contiguous range of received packet numbers `{n, n-1, ..., n-extra}`,
/// plus bookkeeping for what has been transmitted about it.
#[derive(Debug, Clone)]
pub struct AckEntry {
    pub packet_number: u64,
    pub extra: u64,
    pub phase: KeyPhase,
    pub receive_times: Vec<Instant>,
    pub timestamp_ever_transmitted: bool,
    pub transmits: Vec<(u64, Instant)>,
}

impl AckEntry {
    fn lowest(&self) -> u64 {
        self.packet_number - self.extra
    }

    fn covers(&self, n: u64) -> bool {
        n <= self.packet_number && n >= self.lowest()
    }
}

/// Sorted highest-first list of received-packet-number ranges.
#[derive(Debug, Default)]
pub struct AckScoreboard {
    entries: Vec<AckEntry>,
}

impl AckScoreboard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a newly received packet number. Duplicates are silently
    /// dropped; adjacent entries are coalesced (section 4.C steps 1-4).
    pub fn record(&mut self, n: u64, phase: KeyPhase, now: Instant) {
        if self.entries.iter().any(|e| e.covers(n)) {
            return;
        }

        let extend_down = self
            .entries
            .iter()
            .position(|e| e.lowest().checked_sub(1) == Some(n));
        let extend_up = self
            .entries
            .iter()
            .position(|e| e.packet_number + 1 == n);

        match (extend_down, extend_up) {
            (Some(down_idx), Some(up_idx)) if down_idx != up_idx => {
                // n bridges two entries: the "down" entry sits directly
                // above n, the "up" entry sits directly below it. Keep the
                // higher-indexed one in place (lower packet numbers sort
                // later in the vec) and fold the other into it.
                let (keep_idx, drop_idx) = (up_idx.max(down_idx), up_idx.min(down_idx));
                let dropped = self.entries.remove(drop_idx);
                let keep_idx = if keep_idx > drop_idx { keep_idx - 1 } else { keep_idx };
                let keep = &mut self.entries[keep_idx];
                let merged_lowest = keep.lowest().min(dropped.lowest());
                keep.packet_number = keep.packet_number.max(dropped.packet_number);
                keep.extra = keep.packet_number - merged_lowest;
                keep.receive_times.extend(dropped.receive_times);
            }
            (Some(down_idx), _) => {
                let entry = &mut self.entries[down_idx];
                entry.extra += 1;
            }
            (_, Some(up_idx)) => {
                let entry = &mut self.entries[up_idx];
                entry.packet_number = n;
                entry.extra += 1;
                entry.receive_times.insert(0, now);
            }
            (None, None) => {
                let pos = self
                    .entries
                    .iter()
                    .position(|e| e.packet_number < n)
                    .unwrap_or(self.entries.len());
                self.entries.insert(
                    pos,
                    AckEntry {
                        packet_number: n,
                        extra: 0,
                        phase,
                        receive_times: vec![now],
                        timestamp_ever_transmitted: false,
                        transmits: vec![],
                    },
                );
            }
        }
    }

    /// Builds an ACK frame covering as many entries as fit in `avail`
    /// bytes, largest packet number first, and records that `carrier_pn`
    /// carried each placed entry.
    pub fn ack_piggyback(&mut self, avail: usize, carrier_pn: u64, now: Instant) -> Option<AckFrame> {
        if self.entries.is_empty() {
            return None;
        }

        let head = &self.entries[0];
        let mut frame = AckFrame {
            largest_acked: head.packet_number,
            ack_delay: 0,
            first_ack_block: head.extra,
            blocks: Vec::new(),
            timestamps: Vec::new(),
        };
        self.entries[0].transmits.push((carrier_pn, now));

        let mut placed = vec![0usize];
        let mut prev_lowest = head.lowest();
        for (idx, entry) in self.entries.iter().enumerate().skip(1) {
            let candidate = frame.clone_with_block(prev_lowest, entry);
            if candidate.encode().len() > avail {
                break;
            }
            frame = candidate;
            prev_lowest = entry.lowest();
            placed.push(idx);
        }

        for idx in &placed[1..] {
            self.entries[*idx].transmits.push((carrier_pn, now));
        }

        Some(frame)
    }

    /// Ack-of-ack pruning: removes any entry whose transmits vector
    /// contains a packet number the peer has now acknowledged.
    pub fn process_peer_ack(&mut self, acked_packet_numbers: &[u64]) {
        self.entries
            .retain(|e| !e.transmits.iter().any(|(pn, _)| acked_packet_numbers.contains(pn)));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

trait AckFrameExt {
    fn clone_with_block(&self, prev_lowest: u64, entry: &AckEntry) -> AckFrame;
}

impl AckFrameExt for AckFrame {
    fn clone_with_block(&self, prev_lowest: u64, entry: &AckEntry) -> AckFrame {
        let gap = prev_lowest - entry.packet_number - 2;
        let mut blocks = self.blocks.clone();
        blocks.push((gap, entry.extra));
        AckFrame {
            largest_acked: self.largest_acked,
            ack_delay: self.ack_delay,
            first_ack_block: self.first_ack_block,
            blocks,
            timestamps: self.timestamps.clone(),
        }
    }
}

/// Expands an incoming ACK frame's ranges back into the set of packet
/// numbers the peer is acknowledging, for the reliability queue to retire.
pub fn acked_packet_numbers(frame: &AckFrame) -> Vec<u64> {
    let mut out = Vec::new();
    if frame.first_ack_block > frame.largest_acked {
        // Malformed: the first block can't reach below packet number 0.
        // Section 7: discard the packet silently, no state change.
        return out;
    }
    let mut largest = frame.largest_acked;
    let mut smallest_so_far = largest.saturating_sub(frame.first_ack_block);
    for pn in smallest_so_far..=largest {
        out.push(pn);
    }
    for &(gap, len) in &frame.blocks {
        largest = smallest_so_far.saturating_sub(gap + 2);
        let range_start = largest.saturating_sub(len);
        for pn in range_start..=largest {
            out.push(pn);
        }
        smallest_so_far = range_start;
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn records_disjoint_then_coalesces_on_bridge() {
        let mut board = AckScoreboard::new();
        let now = Instant::now();
        board.record(10, KeyPhase::OneRtt, now);
        board.record(8, KeyPhase::OneRtt, now);
        assert_eq!(board.len(), 2);
        board.record(9, KeyPhase::OneRtt, now);
        assert_eq!(board.len(), 1);
        assert_eq!(board.entries[0].packet_number, 10);
        assert_eq!(board.entries[0].extra, 2);
    }

    #[test]
    fn duplicate_packet_number_is_ignored() {
        let mut board = AckScoreboard::new();
        let now = Instant::now();
        board.record(5, KeyPhase::OneRtt, now);
        board.record(4, KeyPhase::OneRtt, now);
        board.record(5, KeyPhase::OneRtt, now);
        assert_eq!(board.len(), 1);
        assert_eq!(board.entries[0].extra, 1);
    }

    #[test]
    fn ack_piggyback_emits_largest_first() {
        let mut board = AckScoreboard::new();
        let now = Instant::now();
        board.record(20, KeyPhase::OneRtt, now);
        board.record(5, KeyPhase::OneRtt, now);
        let frame = board.ack_piggyback(200, 1, now).unwrap();
        assert_eq!(frame.largest_acked, 20);
    }

    #[test]
    fn peer_ack_prunes_entries_whose_carrier_was_acked() {
        let mut board = AckScoreboard::new();
        let now = Instant::now();
        board.record(1, KeyPhase::OneRtt, now);
        board.ack_piggyback(200, 42, now);
        assert_eq!(board.len(), 1);
        board.process_peer_ack(&[42]);
        assert!(board.is_empty());
    }

    #[test]
    fn acked_packet_numbers_expands_ranges_with_gaps() {
        let frame = AckFrame {
            largest_acked: 10,
            ack_delay: 0,
            first_ack_block: 2, // acks 8,9,10
            blocks: vec![(1, 1)], // gap skips 7, then a 2-packet range ending before the gap
            timestamps: vec![],
        };
        let acked = acked_packet_numbers(&frame);
        assert!(acked.contains(&10));
        assert!(acked.contains(&9));
        assert!(acked.contains(&8));
    }

    #[test]
    fn acked_packet_numbers_discards_a_first_ack_block_larger_than_largest_acked() {
        let frame = AckFrame {
            largest_acked: 0,
            ack_delay: 0,
            first_ack_block: 5,
            blocks: vec![],
            timestamps: vec![],
        };
        assert!(acked_packet_numbers(&frame).is_empty());
    }
}
