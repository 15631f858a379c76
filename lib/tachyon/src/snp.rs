//! The message transport carried inside encrypted data packets: framing of
//! user messages into fragments, reliable retransmission, reassembly and
//! ordered delivery, plus the send-rate governor.

use crate::shared::{ErrorType, NetworkError, NetworkResult};
use crate::wire;
use flare::logging;
use hashbrown::{HashMap, HashSet};
use std::collections::VecDeque;

pub const FRAME_RELIABLE: u8 = 0x01;
pub const FRAME_FRAGMENT: u8 = 0x02;

/// Unreliable fragments that cannot complete within this horizon are junk.
const REASSEMBLY_TIMEOUT_USEC: u64 = 1_000_000;

/// How far behind the newest delivered message id the delivered-set is kept.
const DELIVERED_HISTORY: u64 = 4096;

pub mod sendflag {
    pub const RELIABLE: u32 = 0x01;
    pub const NO_NAGLE: u32 = 0x02;
}

/// A message handed to the application.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ReceivedMessage {
    pub message_id: u64,
    pub channel: u16,
    pub reliable: bool,
    pub payload: Vec<u8>,
    pub receive_usec: u64,
}

/// One frame as it travels inside a packet's plaintext.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Frame {
    pub reliable: bool,
    pub message_id: u64,
    pub channel: u16,
    pub total_size: u32,
    pub offset: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    #[inline]
    fn is_fragment(&self) -> bool {
        (self.offset != 0) || (self.payload.len() as u32) < self.total_size
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        let mut flags = 0u8;
        if self.reliable {
            flags |= FRAME_RELIABLE;
        }
        if self.is_fragment() {
            flags |= FRAME_FRAGMENT;
        }

        out.push(flags);
        wire::write_varint(out, self.message_id);
        wire::write_varint(out, self.channel as u64);

        if flags & FRAME_FRAGMENT != 0 {
            wire::write_varint(out, self.total_size as u64);
            wire::write_varint(out, self.offset as u64);
        }

        wire::write_blob(out, &self.payload);
    }

    /// Encoded size without building the bytes, for packet budgeting.
    pub fn encoded_len(&self) -> usize {
        let mut len = 1 + varint_len(self.message_id) + varint_len(self.channel as u64);

        if self.is_fragment() {
            len += varint_len(self.total_size as u64) + varint_len(self.offset as u64);
        }

        len + varint_len(self.payload.len() as u64) + self.payload.len()
    }

    pub fn parse(data: &[u8]) -> NetworkResult<(Frame, usize)> {
        if data.is_empty() {
            return Err(NetworkError::Fatal(ErrorType::BadPacket));
        }

        let flags = data[0];
        let mut offset = 1;

        let (message_id, used) = wire::read_varint(&data[offset..])?;
        offset += used;
        let (channel, used) = wire::read_varint(&data[offset..])?;
        offset += used;

        if channel > u16::max_value() as u64 {
            return Err(NetworkError::Fatal(ErrorType::BadPacket));
        }

        let (total_size, frag_offset) = match flags & FRAME_FRAGMENT {
            0 => (None, 0u64),
            _ => {
                let (total, used) = wire::read_varint(&data[offset..])?;
                offset += used;
                let (frag, used) = wire::read_varint(&data[offset..])?;
                offset += used;
                (Some(total), frag)
            }
        };

        let (payload, used) = wire::read_blob(&data[offset..])?;
        offset += used;

        let total_size = total_size.unwrap_or(payload.len() as u64);

        if total_size > u32::max_value() as u64
            || frag_offset + payload.len() as u64 > total_size
        {
            return Err(NetworkError::Fatal(ErrorType::BadPacket));
        }

        Ok((
            Frame {
                reliable: flags & FRAME_RELIABLE != 0,
                message_id,
                channel: channel as u16,
                total_size: total_size as u32,
                offset: frag_offset as u32,
                payload: payload.to_vec(),
            },
            offset,
        ))
    }

    /// Parses every frame in a packet's plaintext.
    pub fn parse_all(mut data: &[u8]) -> NetworkResult<Vec<Frame>> {
        let mut frames = Vec::new();

        while !data.is_empty() {
            let (frame, used) = Frame::parse(data)?;
            frames.push(frame);
            data = &data[used..];
        }

        Ok(frames)
    }
}

#[inline]
fn varint_len(value: u64) -> usize {
    let mut len = 1;
    let mut value = value >> 7;
    while value != 0 {
        len += 1;
        value >>= 7;
    }
    len
}

/// Additive-increase / multiplicative-decrease send rate governor with a
/// token bucket for pacing.
pub struct RateControl {
    rate: u32,
    min_rate: u32,
    max_rate: u32,

    bucket_bytes: i64,
    last_refill_usec: u64,

    window_start_usec: u64,
    window_sent: u32,
    window_lost: u32,
    decreased_this_window: bool,
}

/// Loss above this fraction of a window triggers a rate cut.
const LOSS_THRESHOLD_PERMILLE: u32 = 20;

/// Additive raise applied after each clean window.
const INCREASE_STEP_BYTES: u32 = 8 * 1024;

/// Loss/latency accounting window.
const RATE_WINDOW_USEC: u64 = 500_000;

impl RateControl {
    pub fn new(min_rate: u32, max_rate: u32) -> RateControl {
        let min_rate = min_rate.max(1);
        let max_rate = max_rate.max(min_rate);

        RateControl {
            rate: min_rate,
            min_rate,
            max_rate,
            bucket_bytes: 0,
            last_refill_usec: 0,
            window_start_usec: 0,
            window_sent: 0,
            window_lost: 0,
            decreased_this_window: false,
        }
    }

    #[inline]
    pub fn rate(&self) -> u32 {
        self.rate
    }

    #[inline]
    pub fn recent_loss_permille(&self) -> u32 {
        match self.window_sent {
            0 => 0,
            sent => self.window_lost * 1000 / sent,
        }
    }

    fn refill(&mut self, now_usec: u64, burst_cap: i64) {
        if now_usec > self.last_refill_usec {
            let elapsed = now_usec - self.last_refill_usec;
            self.bucket_bytes += (self.rate as i64 * elapsed as i64) / 1_000_000;
            self.last_refill_usec = now_usec;
        }

        if self.bucket_bytes > burst_cap {
            self.bucket_bytes = burst_cap;
        }
    }

    #[inline]
    fn burst_cap(&self, mtu: usize) -> i64 {
        ((self.rate as i64) / 10).max(2 * mtu as i64)
    }

    /// True when pacing allows `bytes` to go out now.
    pub fn can_send(&mut self, now_usec: u64, bytes: usize, mtu: usize) -> bool {
        let cap = self.burst_cap(mtu);
        self.refill(now_usec, cap);
        self.bucket_bytes >= bytes as i64
    }

    /// Microseconds until `bytes` worth of tokens will have accumulated.
    pub fn usec_until_send(&self, bytes: usize) -> u64 {
        let deficit = bytes as i64 - self.bucket_bytes;
        if deficit <= 0 {
            return 0;
        }

        (deficit as u64 * 1_000_000) / self.rate as u64 + 1
    }

    pub fn on_packet_sent(&mut self, now_usec: u64, bytes: usize) {
        self.bucket_bytes -= bytes as i64;
        self.window_sent += 1;

        if self.window_start_usec == 0 {
            self.window_start_usec = now_usec;
        }
    }

    pub fn on_packet_lost(&mut self) {
        self.window_lost += 1;
    }

    /// Explicit congestion signal from the wire.
    pub fn on_ecn_ce(&mut self, now_usec: u64) {
        self.decrease(now_usec);
    }

    fn decrease(&mut self, now_usec: u64) {
        if self.decreased_this_window {
            return;
        }

        self.rate = (self.rate / 2).max(self.min_rate);
        self.decreased_this_window = true;
        self.window_start_usec = now_usec;
    }

    /// Rolls the accounting window; call from the connection's think loop.
    /// `srtt_usec`/`min_rtt_usec` feed the delay-based backoff.
    pub fn tick(&mut self, now_usec: u64, srtt_usec: Option<u64>, min_rtt_usec: u64) {
        if self.window_start_usec == 0 || now_usec < self.window_start_usec + RATE_WINDOW_USEC {
            return;
        }

        let lossy = self.recent_loss_permille() > LOSS_THRESHOLD_PERMILLE;
        let delayed = match srtt_usec {
            Some(srtt) if min_rtt_usec != u64::max_value() => srtt > min_rtt_usec * 2,
            _ => false,
        };

        if lossy || delayed {
            self.decreased_this_window = false;
            self.decrease(now_usec);
        } else if self.window_lost == 0 && self.window_sent > 0 {
            self.rate = (self.rate + INCREASE_STEP_BYTES).min(self.max_rate);
        }

        self.window_start_usec = now_usec;
        self.window_sent = 0;
        self.window_lost = 0;
        self.decreased_this_window = false;
    }
}

struct QueuedFrame {
    frame_id: u64,
    frame: Frame,
}

/// Send side: message queue, fragmentation, reliable frame bookkeeping.
pub struct SnpSender {
    next_message_id: u64,
    next_frame_id: u64,

    /// Fragments awaiting their first transmission.
    queued: VecDeque<QueuedFrame>,
    /// Reliable fragments declared lost, waiting to go out again. Drained
    /// before `queued` so older data keeps its head start.
    retransmit: VecDeque<QueuedFrame>,
    /// Reliable fragments on the wire, by frame id.
    in_flight: HashMap<u64, Frame>,

    /// Queued-but-unacked payload bytes, measured against the buffer ceiling.
    buffered_bytes: usize,
    buffer_limit: usize,

    mtu: usize,
    nagle_usec: u64,
    nagle_deadline: Option<u64>,

    pub rate: RateControl,
    log: logging::Logger,
}

impl SnpSender {
    pub fn new(
        mtu: usize,
        buffer_limit: usize,
        nagle_usec: u64,
        min_rate: u32,
        max_rate: u32,
        log: logging::Logger,
    ) -> SnpSender {
        SnpSender {
            next_message_id: 1,
            next_frame_id: 1,
            queued: VecDeque::new(),
            retransmit: VecDeque::new(),
            in_flight: HashMap::new(),
            buffered_bytes: 0,
            buffer_limit,
            mtu,
            nagle_usec,
            nagle_deadline: None,
            rate: RateControl::new(min_rate, max_rate),
            log,
        }
    }

    #[inline]
    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes
    }

    #[inline]
    pub fn pending_reliable(&self) -> usize {
        self.retransmit.len() + self.in_flight.len()
            + self.queued.iter().filter(|q| q.frame.reliable).count()
    }

    #[inline]
    pub fn is_drained(&self) -> bool {
        self.queued.is_empty() && self.retransmit.is_empty() && self.in_flight.is_empty()
    }

    /// Queues a message, fragmenting above the MTU. Returns the message id.
    /// Reliable sends beyond the buffer ceiling fail with `Wait`; the caller
    /// surfaces that as would-block.
    pub fn queue_message(
        &mut self,
        payload: &[u8],
        channel: u16,
        flags: u32,
        now_usec: u64,
    ) -> NetworkResult<u64> {
        if payload.is_empty() {
            return Err(NetworkError::Fatal(ErrorType::EmptyPayload));
        }

        let reliable = flags & sendflag::RELIABLE != 0;

        if reliable && self.buffered_bytes + payload.len() > self.buffer_limit {
            return Err(NetworkError::Wait);
        }

        let message_id = self.next_message_id;
        self.next_message_id += 1;

        let total_size = payload.len() as u32;

        for chunk_start in (0..payload.len()).step_by(self.mtu) {
            let chunk_end = (chunk_start + self.mtu).min(payload.len());

            let frame_id = match reliable {
                true => {
                    let id = self.next_frame_id;
                    self.next_frame_id += 1;
                    id
                }
                false => 0,
            };

            self.queued.push_back(QueuedFrame {
                frame_id,
                frame: Frame {
                    reliable,
                    message_id,
                    channel,
                    total_size,
                    offset: chunk_start as u32,
                    payload: payload[chunk_start..chunk_end].to_vec(),
                },
            });
        }

        self.buffered_bytes += payload.len();

        match flags & sendflag::NO_NAGLE {
            0 => {
                if self.nagle_deadline.is_none() {
                    self.nagle_deadline = Some(now_usec + self.nagle_usec);
                }
            }
            _ => self.nagle_deadline = Some(0),
        }

        logging::trace!(self.log, "message queued";
                        "context" => "queue",
                        "message_id" => message_id,
                        "size" => payload.len(),
                        "reliable" => reliable);

        Ok(message_id)
    }

    /// True when there is something the wire should carry right now.
    pub fn want_transmit(&self, now_usec: u64) -> bool {
        if !self.retransmit.is_empty() {
            return true;
        }

        if self.queued.is_empty() {
            return false;
        }

        // Nagle: hold small payloads briefly; a full MTU goes immediately
        let queued_bytes: usize = self.queued.iter().map(|q| q.frame.payload.len()).sum();
        if queued_bytes >= self.mtu {
            return true;
        }

        match self.nagle_deadline {
            Some(deadline) => now_usec >= deadline,
            None => true,
        }
    }

    /// Next deadline the connection should think at for this sender.
    pub fn next_event_usec(&self) -> Option<u64> {
        if !self.retransmit.is_empty() {
            return Some(0);
        }

        match self.queued.is_empty() {
            true => None,
            false => self.nagle_deadline,
        }
    }

    /// Builds the plaintext for one outgoing packet: as many frames as fit in
    /// `max_plain` bytes, retransmissions first. Returns the plaintext and
    /// the reliable frame ids it carries, or None if nothing is ready.
    pub fn build_packet(
        &mut self,
        now_usec: u64,
        max_plain: usize,
    ) -> Option<(Vec<u8>, Vec<u64>)> {
        if !self.want_transmit(now_usec) {
            return None;
        }

        let mut plain = Vec::with_capacity(max_plain);
        let mut reliable_ids = Vec::new();

        loop {
            let from_retransmit = !self.retransmit.is_empty();
            let candidate = match from_retransmit {
                true => self.retransmit.front(),
                false => self.queued.front(),
            };

            let frame_len = match candidate {
                Some(queued) => queued.frame.encoded_len(),
                None => break,
            };

            if plain.len() + frame_len > max_plain {
                break;
            }

            let queued = match from_retransmit {
                true => self.retransmit.pop_front().unwrap(),
                false => self.queued.pop_front().unwrap(),
            };

            queued.frame.encode(&mut plain);

            match queued.frame.reliable {
                true => {
                    reliable_ids.push(queued.frame_id);
                    self.in_flight.insert(queued.frame_id, queued.frame);
                }
                false => {
                    // Fire and forget: the buffer space frees on send
                    self.buffered_bytes =
                        self.buffered_bytes.saturating_sub(queued.frame.payload.len());
                }
            }
        }

        if self.queued.is_empty() {
            self.nagle_deadline = None;
        }

        match plain.is_empty() {
            true => None,
            false => Some((plain, reliable_ids)),
        }
    }

    /// The peer acknowledged a packet carrying these reliable frames.
    pub fn on_frames_acked(&mut self, frame_ids: &[u64]) {
        for frame_id in frame_ids {
            if let Some(frame) = self.in_flight.remove(frame_id) {
                self.buffered_bytes = self.buffered_bytes.saturating_sub(frame.payload.len());
            }
        }
    }

    /// A packet carrying these reliable frames is presumed lost; requeue any
    /// that have not been acked in the meantime.
    pub fn on_frames_lost(&mut self, frame_ids: &[u64]) {
        for frame_id in frame_ids {
            if let Some(frame) = self.in_flight.remove(frame_id) {
                logging::trace!(self.log, "reliable frame requeued";
                                "context" => "loss",
                                "message_id" => frame.message_id,
                                "offset" => frame.offset);

                self.rate.on_packet_lost();
                self.retransmit.push_back(QueuedFrame {
                    frame_id: *frame_id,
                    frame,
                });
            }
        }

        // Keep retransmissions ordered by message/offset so older data still
        // hits the wire first
        self.retransmit
            .make_contiguous()
            .sort_by_key(|q| (q.frame.message_id, q.frame.offset));
    }
}

struct Reassembly {
    reliable: bool,
    channel: u16,
    total_size: u32,
    received_bytes: u32,
    ranges: Vec<(u32, u32)>,
    buffer: Vec<u8>,
    started_usec: u64,
}

struct ChannelState {
    /// Highest message id delivered on this channel.
    last_delivered: u64,
    /// Ids at or below `last_delivered` that were actually delivered, so a
    /// reliable retransmit of an already-consumed message is recognized and
    /// swallowed rather than re-delivered.
    delivered: HashSet<u64>,
}

impl ChannelState {
    fn new() -> ChannelState {
        ChannelState {
            last_delivered: 0,
            delivered: HashSet::new(),
        }
    }

    fn mark_delivered(&mut self, message_id: u64) {
        self.delivered.insert(message_id);
        if message_id > self.last_delivered {
            self.last_delivered = message_id;
        }

        if self.delivered.len() as u64 > DELIVERED_HISTORY {
            let floor = self.last_delivered.saturating_sub(DELIVERED_HISTORY);
            self.delivered.retain(|&id| id > floor);
        }
    }
}

/// Receive side: reassembly and ordered delivery.
pub struct SnpReceiver {
    reassembly: HashMap<u64, Reassembly>,
    channels: HashMap<u16, ChannelState>,
    /// Completed reliable messages held back for channel ordering.
    held: HashMap<u16, Vec<ReceivedMessage>>,
    ready: VecDeque<ReceivedMessage>,
    log: logging::Logger,
}

impl SnpReceiver {
    pub fn new(log: logging::Logger) -> SnpReceiver {
        SnpReceiver {
            reassembly: HashMap::new(),
            channels: HashMap::new(),
            held: HashMap::new(),
            ready: VecDeque::new(),
            log,
        }
    }

    /// Feeds one frame from a freshly decrypted packet.
    pub fn on_frame(&mut self, frame: Frame, now_usec: u64) {
        let channel_state = self
            .channels
            .entry(frame.channel)
            .or_insert_with(ChannelState::new);

        // Already delivered: a retransmit whose ack got lost. Swallow.
        if channel_state.delivered.contains(&frame.message_id) {
            return;
        }

        // Unreliable traffic that predates newer delivery on the channel is
        // stale by definition.
        if !frame.reliable && frame.message_id <= channel_state.last_delivered {
            return;
        }

        let complete = match frame.payload.len() as u32 == frame.total_size && frame.offset == 0 {
            true => Some(ReceivedMessage {
                message_id: frame.message_id,
                channel: frame.channel,
                reliable: frame.reliable,
                payload: frame.payload,
                receive_usec: now_usec,
            }),
            false => self.absorb_fragment(frame, now_usec),
        };

        if let Some(message) = complete {
            self.finish_message(message);
        }
    }

    fn absorb_fragment(&mut self, frame: Frame, now_usec: u64) -> Option<ReceivedMessage> {
        let entry = self
            .reassembly
            .entry(frame.message_id)
            .or_insert_with(|| Reassembly {
                reliable: frame.reliable,
                channel: frame.channel,
                total_size: frame.total_size,
                received_bytes: 0,
                ranges: Vec::new(),
                buffer: vec![0u8; frame.total_size as usize],
                started_usec: now_usec,
            });

        if entry.total_size != frame.total_size {
            logging::debug!(self.log, "fragment with inconsistent total size dropped";
                            "context" => "reassembly",
                            "message_id" => frame.message_id);
            return None;
        }

        let start = frame.offset;
        let end = frame.offset + frame.payload.len() as u32;

        // Overlaps indicate retransmits; only count fresh bytes
        let fresh = !entry
            .ranges
            .iter()
            .any(|&(s, e)| start >= s && end <= e);

        if fresh {
            entry.buffer[start as usize..end as usize].copy_from_slice(&frame.payload);
            entry.ranges.push((start, end));
            entry.received_bytes += frame.payload.len() as u32;
        }

        if entry.received_bytes < entry.total_size {
            return None;
        }

        let entry = self.reassembly.remove(&frame.message_id).unwrap();
        Some(ReceivedMessage {
            message_id: frame.message_id,
            channel: frame.channel,
            reliable: entry.reliable,
            payload: entry.buffer,
            receive_usec: now_usec,
        })
    }

    fn finish_message(&mut self, message: ReceivedMessage) {
        let channel = message.channel;

        if message.reliable {
            // Hold back if an older reliable message on this channel is still
            // being reassembled; per-channel delivery is id-ordered.
            let blocked = self.reassembly.iter().any(|(&id, entry)| {
                entry.reliable && entry.channel == channel && id < message.message_id
            });

            if blocked {
                self.held.entry(channel).or_insert_with(Vec::new).push(message);
                return;
            }
        }

        self.deliver(message);
        self.release_held(channel);
    }

    /// Re-examines held messages once the blocking reassembly completes.
    fn release_held(&mut self, channel: u16) {
        let mut held = match self.held.remove(&channel) {
            Some(held) => held,
            None => return,
        };

        held.sort_by_key(|m| m.message_id);

        for message in held {
            let blocked = self.reassembly.iter().any(|(&id, entry)| {
                entry.reliable && entry.channel == channel && id < message.message_id
            });

            match blocked {
                true => self
                    .held
                    .entry(channel)
                    .or_insert_with(Vec::new)
                    .push(message),
                false => self.deliver(message),
            }
        }
    }

    fn deliver(&mut self, message: ReceivedMessage) {
        let channel_state = self
            .channels
            .entry(message.channel)
            .or_insert_with(ChannelState::new);

        channel_state.mark_delivered(message.message_id);

        logging::trace!(self.log, "message delivered";
                        "context" => "deliver",
                        "message_id" => message.message_id,
                        "channel" => message.channel,
                        "size" => message.payload.len());

        self.ready.push_back(message);
    }

    /// Hands out up to `max` delivered messages.
    pub fn take_messages(&mut self, max: usize) -> Vec<ReceivedMessage> {
        let count = self.ready.len().min(max);
        self.ready.drain(..count).collect()
    }

    #[inline]
    pub fn ready_count(&self) -> usize {
        self.ready.len()
    }

    /// Drops unreliable reassemblies that have idled past the staleness
    /// horizon. Reliable ones persist; their sender keeps retransmitting.
    pub fn drop_stale(&mut self, now_usec: u64) {
        self.reassembly.retain(|_, entry| {
            entry.reliable || now_usec < entry.started_usec + REASSEMBLY_TIMEOUT_USEC
        });
    }
}
