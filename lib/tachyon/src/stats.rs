//! End-to-end statistics: RTT tracking, acknowledgement bookkeeping and the
//! lifetime/instantaneous counters reported in the inline stats blob.

use crate::proto;
use std::collections::{BTreeMap, VecDeque};

/// Oldest pending ack may wait at most this long before a flush is forced.
pub const ACK_MAX_DELAY_USEC: u64 = 20_000;

/// Cadence of unsolicited full stats blobs on an active connection.
pub const STATS_INTERVAL_USEC: u64 = 5_000_000;

/// Pending acks are bounded; beyond this a flush is overdue anyway.
const ACK_QUEUE_LIMIT: usize = 64;

/// Histogram bucket upper bounds, in milliseconds. Last bucket is open.
const PING_BUCKETS_MS: [u32; 7] = [25, 50, 75, 100, 150, 200, 300];

/// Smoothed round-trip tracking plus the in-flight ping probe, if any.
pub struct PingTracker {
    srtt_usec: Option<u64>,
    min_rtt_usec: u64,
    last_ping_sent_usec: u64,
    in_flight: Option<InFlightPing>,
    consecutive_timeouts: u32,
}

struct InFlightPing {
    sent_usec: u64,
    timeout_usec: u64,
}

impl PingTracker {
    pub fn new() -> PingTracker {
        PingTracker {
            srtt_usec: None,
            min_rtt_usec: u64::max_value(),
            last_ping_sent_usec: 0,
            in_flight: None,
            consecutive_timeouts: 0,
        }
    }

    /// Smoothed RTT in integer milliseconds, or -1 while unknown.
    #[inline]
    pub fn smoothed_ms(&self) -> i32 {
        match self.srtt_usec {
            Some(usec) => (usec / 1000) as i32,
            None => -1,
        }
    }

    #[inline]
    pub fn min_rtt_usec(&self) -> u64 {
        self.min_rtt_usec
    }

    #[inline]
    pub fn consecutive_timeouts(&self) -> u32 {
        self.consecutive_timeouts
    }

    /// Folds in a new sample: standard 7/8 exponential smoothing.
    pub fn on_sample(&mut self, rtt_usec: u64) {
        self.srtt_usec = Some(match self.srtt_usec {
            Some(srtt) => (srtt * 7 + rtt_usec) / 8,
            None => rtt_usec,
        });

        if rtt_usec < self.min_rtt_usec {
            self.min_rtt_usec = rtt_usec;
        }

        self.in_flight = None;
        self.consecutive_timeouts = 0;
    }

    /// True when it is time to solicit a fresh RTT measurement. The interval
    /// adapts: an idle smooth connection pings slowly, an unmeasured or
    /// struggling one quickly.
    pub fn want_ping(&self, now_usec: u64) -> bool {
        if self.in_flight.is_some() {
            return false;
        }

        let interval = match self.srtt_usec {
            None => 200_000,
            Some(srtt) => (srtt * 8).max(1_000_000).min(10_000_000),
        };

        now_usec >= self.last_ping_sent_usec + interval
    }

    pub fn ping_sent(&mut self, now_usec: u64, reply_timeout_usec: u64) {
        self.last_ping_sent_usec = now_usec;
        self.in_flight = Some(InFlightPing {
            sent_usec: now_usec,
            timeout_usec: now_usec + reply_timeout_usec,
        });
    }

    /// Expires an overdue probe. Returns true when a timeout was recorded.
    pub fn check_timeout(&mut self, now_usec: u64) -> bool {
        match &self.in_flight {
            Some(ping) if now_usec >= ping.timeout_usec => {
                self.in_flight = None;
                self.consecutive_timeouts += 1;
                true
            }
            _ => false,
        }
    }

    /// RTT of the probe an ack would answer right now.
    #[inline]
    pub fn in_flight_rtt(&self, now_usec: u64) -> Option<u64> {
        self.in_flight
            .as_ref()
            .map(|ping| now_usec.saturating_sub(ping.sent_usec))
    }

    /// Next deadline this tracker needs attention at: the in-flight probe's
    /// timeout, or the next scheduled probe.
    pub fn next_event_usec(&self) -> u64 {
        match &self.in_flight {
            Some(ping) => ping.timeout_usec,
            None => {
                let interval = match self.srtt_usec {
                    None => 200_000,
                    Some(srtt) => (srtt * 8).max(1_000_000).min(10_000_000),
                };
                self.last_ping_sent_usec + interval
            }
        }
    }
}

/// Bounded queue of wire sequence numbers waiting to be acknowledged.
pub struct AckQueue {
    pending: VecDeque<(u16, u64)>,
    immediate: bool,
}

impl AckQueue {
    pub fn new() -> AckQueue {
        AckQueue {
            pending: VecDeque::new(),
            immediate: false,
        }
    }

    pub fn push(&mut self, wire_seq: u16, received_usec: u64) {
        if self.pending.len() == ACK_QUEUE_LIMIT {
            self.immediate = true;
        }
        self.pending.push_back((wire_seq, received_usec));
    }

    /// Peer explicitly demanded a prompt ack.
    #[inline]
    pub fn request_immediate(&mut self) {
        self.immediate = true;
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// True when an ack flush should happen now: either the peer asked, or
    /// the oldest pending ack has waited past the delay budget.
    pub fn flush_due(&self, now_usec: u64) -> bool {
        if self.pending.is_empty() {
            return false;
        }

        if self.immediate {
            return true;
        }

        match self.pending.front() {
            Some((_, received)) => now_usec >= received + ACK_MAX_DELAY_USEC,
            None => false,
        }
    }

    /// Earliest time at which `flush_due` turns true, for scheduling.
    pub fn next_flush_usec(&self) -> Option<u64> {
        if self.pending.is_empty() {
            return None;
        }

        if self.immediate {
            return Some(0);
        }

        self.pending
            .front()
            .map(|(_, received)| received + ACK_MAX_DELAY_USEC)
    }

    /// Drains the queue into run-length-encoded entries for the stats blob:
    /// each entry packs `(first_wire_seq << 16) | run_len`.
    pub fn drain_runs(&mut self) -> Vec<u32> {
        let mut seqs: Vec<u16> = self.pending.drain(..).map(|(seq, _)| seq).collect();
        self.immediate = false;

        seqs.sort_unstable();
        seqs.dedup();

        let mut runs = Vec::new();
        let mut i = 0;
        while i < seqs.len() {
            let first = seqs[i];
            let mut len: u16 = 1;

            while i + (len as usize) < seqs.len()
                && seqs[i + len as usize] == first.wrapping_add(len)
            {
                len += 1;
            }

            runs.push((first as u32) << 16 | len as u32);
            i += len as usize;
        }

        runs
    }
}

/// Expands run-length-encoded ack entries back into wire sequence numbers.
pub fn expand_ack_runs(runs: &[u32]) -> Vec<u16> {
    let mut seqs = Vec::new();

    for &run in runs {
        let first = (run >> 16) as u16;
        let len = (run & 0xFFFF) as u16;

        for i in 0..len {
            seqs.push(first.wrapping_add(i));
        }
    }

    seqs
}

/// Record of one sent data packet, kept until acked or declared lost.
pub struct SentPacket {
    pub sent_usec: u64,
    pub bytes: u32,
    /// Reliable frame ids carried by this packet. Empty for pure
    /// unreliable/ack traffic.
    pub reliable_frames: Vec<u64>,
    /// Whether this packet asked the peer for a prompt ack.
    pub ack_requested: bool,
}

/// Maps full sequence numbers of in-flight packets to what they carried.
pub struct SentPacketMap {
    packets: BTreeMap<u64, SentPacket>,
}

impl SentPacketMap {
    pub fn new() -> SentPacketMap {
        SentPacketMap {
            packets: BTreeMap::new(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn insert(&mut self, full_seq: u64, packet: SentPacket) {
        self.packets.insert(full_seq, packet);
    }

    /// Resolves an acked 16-bit wire sequence to the most recent matching
    /// in-flight packet and removes it.
    pub fn ack_wire(&mut self, wire_seq: u16) -> Option<(u64, SentPacket)> {
        let full_seq = self
            .packets
            .keys()
            .rev()
            .find(|&&seq| seq as u16 == wire_seq)
            .copied()?;

        self.packets
            .remove(&full_seq)
            .map(|packet| (full_seq, packet))
    }

    /// Removes and returns every packet sent before the deadline; these are
    /// treated as lost and their reliable frames rescheduled.
    pub fn take_expired(&mut self, deadline_usec: u64) -> Vec<(u64, SentPacket)> {
        let expired: Vec<u64> = self
            .packets
            .iter()
            .take_while(|(_, packet)| packet.sent_usec < deadline_usec)
            .map(|(&seq, _)| seq)
            .collect();

        expired
            .into_iter()
            .filter_map(|seq| self.packets.remove(&seq).map(|packet| (seq, packet)))
            .collect()
    }

    /// Oldest unacked send time, if anything is outstanding.
    pub fn oldest_sent_usec(&self) -> Option<u64> {
        self.packets.values().map(|packet| packet.sent_usec).min()
    }
}

/// Monotonic per-connection counters.
#[derive(Default)]
pub struct LifetimeStats {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_recv: u64,
    pub bytes_recv: u64,
    pub packets_dropped: u64,
    pub packets_out_of_order: u64,
    ping_histogram: [u32; PING_BUCKETS_MS.len() + 1],
}

impl LifetimeStats {
    pub fn new() -> LifetimeStats {
        Default::default()
    }

    pub fn on_ping_sample(&mut self, rtt_usec: u64) {
        let ms = (rtt_usec / 1000) as u32;
        let bucket = PING_BUCKETS_MS
            .iter()
            .position(|&edge| ms <= edge)
            .unwrap_or(PING_BUCKETS_MS.len());
        self.ping_histogram[bucket] += 1;
    }

    pub fn to_proto(&self) -> proto::StatsLifetime {
        proto::StatsLifetime {
            packets_sent: self.packets_sent,
            bytes_sent: self.bytes_sent,
            packets_recv: self.packets_recv,
            bytes_recv: self.bytes_recv,
            packets_dropped: self.packets_dropped,
            packets_out_of_order: self.packets_out_of_order,
            ping_histogram: self.ping_histogram.to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_srtt_smoothing() {
        let mut tracker = PingTracker::new();
        assert_eq!(tracker.smoothed_ms(), -1);

        tracker.on_sample(80_000);
        assert_eq!(tracker.smoothed_ms(), 80);

        // One slow sample moves the estimate by an eighth
        tracker.on_sample(160_000);
        assert_eq!(tracker.smoothed_ms(), 90);
        assert_eq!(tracker.min_rtt_usec(), 80_000);
    }

    #[test]
    fn test_ping_timeout_counting() {
        let mut tracker = PingTracker::new();

        tracker.ping_sent(1_000, 500_000);
        assert!(!tracker.check_timeout(100_000));
        assert!(tracker.check_timeout(501_000));
        assert_eq!(tracker.consecutive_timeouts(), 1);

        tracker.ping_sent(600_000, 500_000);
        assert!(tracker.check_timeout(2_000_000));
        assert_eq!(tracker.consecutive_timeouts(), 2);

        tracker.ping_sent(3_000_000, 500_000);
        tracker.on_sample(40_000);
        assert_eq!(tracker.consecutive_timeouts(), 0);
    }

    #[test]
    fn test_want_ping_respects_in_flight() {
        let mut tracker = PingTracker::new();
        assert!(tracker.want_ping(1_000_000));

        tracker.ping_sent(1_000_000, 500_000);
        assert!(!tracker.want_ping(1_100_000));
    }

    #[test]
    fn test_ack_queue_delay_flush() {
        let mut queue = AckQueue::new();
        assert!(!queue.flush_due(0));

        queue.push(5, 1_000);
        assert!(!queue.flush_due(1_000 + ACK_MAX_DELAY_USEC - 1));
        assert!(queue.flush_due(1_000 + ACK_MAX_DELAY_USEC));
    }

    #[test]
    fn test_ack_queue_immediate_flush() {
        let mut queue = AckQueue::new();
        queue.push(5, 1_000);
        queue.request_immediate();
        assert!(queue.flush_due(1_001));
    }

    #[test]
    fn test_ack_run_encoding() {
        let mut queue = AckQueue::new();
        for seq in [3u16, 4, 5, 9, 10, 20].iter() {
            queue.push(*seq, 0);
        }
        // Out-of-order and duplicate arrivals collapse
        queue.push(4, 0);

        let runs = queue.drain_runs();
        assert_eq!(runs, vec![3 << 16 | 3, 9 << 16 | 2, 20 << 16 | 1]);
        assert!(queue.is_empty());

        assert_eq!(expand_ack_runs(&runs), vec![3, 4, 5, 9, 10, 20]);
    }

    #[test]
    fn test_ack_run_wraparound() {
        let runs = vec![0xFFFFu32 << 16 | 2];
        assert_eq!(expand_ack_runs(&runs), vec![0xFFFF, 0]);
    }

    #[test]
    fn test_sent_packet_ack_matches_most_recent() {
        let mut map = SentPacketMap::new();

        // Two packets an epoch apart share the same wire bits
        map.insert(
            0x0000_0005,
            SentPacket {
                sent_usec: 10,
                bytes: 100,
                reliable_frames: vec![1],
                ack_requested: false,
            },
        );
        map.insert(
            0x0001_0005,
            SentPacket {
                sent_usec: 20,
                bytes: 100,
                reliable_frames: vec![2],
                ack_requested: false,
            },
        );

        let (seq, packet) = map.ack_wire(5).unwrap();
        assert_eq!(seq, 0x0001_0005);
        assert_eq!(packet.reliable_frames, vec![2]);

        let (seq, _) = map.ack_wire(5).unwrap();
        assert_eq!(seq, 0x0000_0005);

        assert!(map.ack_wire(5).is_none());
    }

    #[test]
    fn test_sent_packet_expiry() {
        let mut map = SentPacketMap::new();
        for seq in 0..5u64 {
            map.insert(
                seq,
                SentPacket {
                    sent_usec: seq * 100,
                    bytes: 10,
                    reliable_frames: Vec::new(),
                    ack_requested: false,
                },
            );
        }

        let expired = map.take_expired(250);
        let seqs: Vec<u64> = expired.iter().map(|(seq, _)| *seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_ping_histogram_buckets() {
        let mut stats = LifetimeStats::new();
        stats.on_ping_sample(10_000);
        stats.on_ping_sample(60_000);
        stats.on_ping_sample(500_000);

        let proto = stats.to_proto();
        assert_eq!(proto.ping_histogram[0], 1);
        assert_eq!(proto.ping_histogram[2], 1);
        assert_eq!(proto.ping_histogram[7], 1);
    }
}
