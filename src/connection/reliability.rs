//! Reliability queue: unwritten/unacked chunk FIFOs and the retransmit
//! timer (section 4.D).

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::connection::stream::StreamChunk;

/// A chunk is retransmitted once it has sat unacked for this long.
pub const RETRANSMIT_TIMEOUT: Duration = Duration::from_millis(500);
/// A chunk is given up on (dropped from unacked outright) after this long.
pub const GIVE_UP_TIMEOUT: Duration = Duration::from_millis(4000);

#[derive(Debug, Default)]
pub struct ReliabilityQueue {
    /// Chunks waiting to be placed into an outgoing packet.
    pub unwritten: VecDeque<StreamChunk>,
    /// Chunks already transmitted, sorted by transmission order (front =
    /// oldest packet number).
    pub unacked: VecDeque<(StreamChunk, Instant)>,
}

impl ReliabilityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, chunk: StreamChunk) {
        self.unwritten.push_back(chunk);
    }

    /// Moves a chunk from unwritten into unacked once it has been placed
    /// on the wire in `packet_number`.
    pub fn mark_transmitted(&mut self, mut chunk: StreamChunk, packet_number: u64, now: Instant) {
        chunk.packet_number = Some(packet_number);
        chunk.transmit_count += 1;
        self.unacked.push_back((chunk, now));
    }

    /// Removes any unacked chunk whose carrier packet number is in
    /// `acked`, unless it was already retransmitted (in which case it is
    /// simply dropped without further action, since the retransmit clone
    /// now owns delivery).
    pub fn process_ack(&mut self, acked: &[u64]) {
        self.unacked.retain(|(chunk, _)| {
            chunk
                .packet_number
                .map(|pn| !acked.contains(&pn))
                .unwrap_or(true)
        });
    }

    /// One retransmit-timer tick (section 4.D): clone any chunk unacked
    /// for >= 500ms (marking the original `retransmitted`), drop any chunk
    /// unacked for >= 4000ms outright.
    pub fn retransmit_tick(&mut self, now: Instant) {
        let mut retransmits = Vec::new();
        for (chunk, transmit_time) in self.unacked.iter_mut() {
            if chunk.retransmitted {
                continue;
            }
            if now.duration_since(*transmit_time) >= RETRANSMIT_TIMEOUT {
                retransmits.push(chunk.retransmit_clone());
                chunk.retransmitted = true;
            }
        }
        self.unwritten.extend(retransmits);

        self.unacked
            .retain(|(_, transmit_time)| now.duration_since(*transmit_time) < GIVE_UP_TIMEOUT);
    }

    pub fn is_drained(&self) -> bool {
        self.unwritten.is_empty() && self.unacked.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn retransmit_tick_clones_chunks_past_timeout() {
        let mut queue = ReliabilityQueue::new();
        let chunk = StreamChunk::new(3, 0, b"hi".to_vec(), false);
        let sent_at = Instant::now() - Duration::from_millis(600);
        queue.mark_transmitted(chunk, 1, sent_at);

        queue.retransmit_tick(Instant::now());

        assert_eq!(queue.unwritten.len(), 1);
        assert!(queue.unacked[0].0.retransmitted);
        assert!(!queue.unwritten[0].retransmitted);
    }

    #[test]
    fn retransmit_tick_does_not_reclone_already_retransmitted_chunk() {
        let mut queue = ReliabilityQueue::new();
        let mut chunk = StreamChunk::new(3, 0, b"hi".to_vec(), false);
        chunk.retransmitted = true;
        let sent_at = Instant::now() - Duration::from_millis(600);
        queue.mark_transmitted(chunk, 1, sent_at);

        queue.retransmit_tick(Instant::now());

        assert!(queue.unwritten.is_empty());
    }

    #[test]
    fn give_up_timeout_drops_stale_unacked_chunks() {
        let mut queue = ReliabilityQueue::new();
        let chunk = StreamChunk::new(3, 0, b"hi".to_vec(), false);
        let sent_at = Instant::now() - Duration::from_millis(5000);
        queue.mark_transmitted(chunk, 1, sent_at);

        queue.retransmit_tick(Instant::now());

        assert!(queue.unacked.is_empty());
    }

    #[test]
    fn process_ack_removes_matching_carrier() {
        let mut queue = ReliabilityQueue::new();
        queue.mark_transmitted(StreamChunk::new(3, 0, b"a".to_vec(), false), 1, Instant::now());
        queue.mark_transmitted(StreamChunk::new(3, 1, b"b".to_vec(), false), 2, Instant::now());
        queue.process_ack(&[1]);
        assert_eq!(queue.unacked.len(), 1);
        assert_eq!(queue.unacked[0].0.packet_number, Some(2));
    }
}
