//! Binary telemetry stream.
//!
//! Every frame is [`FRAME_LEN`] bytes, little-endian:
//!
//! | Offset | Size | Field                     |
//! |--------|------|---------------------------|
//! | 0      | 2    | magic `0x4D43`            |
//! | 2      | 2    | frame length              |
//! | 4      | 2    | channel id                |
//! | 6      | 1    | state code                |
//! | 7      | 1    | protocol version          |
//! | 8      | 4    | sequence number           |
//! | 12     | 8    | test time (ms, u64)       |
//! | 20     | 8    | voltage (V, f64)          |
//! | 28     | 8    | current (A, f64)          |
//! | 36     | 8    | capacity (Ah, f64)        |
//! | 44     | 8    | energy (Wh, f64)          |
//! | 52     | 4    | cycle (u32)               |
//! | 56     | 2    | step (u16)                |
//! | 58     | 2    | reserved                  |
//!
//! Clients open the stream by sending a subscription message: magic
//! `0x4D53`, a `u16` count, then `count` channel ids. A count of zero
//! subscribes to every channel.

use crate::channel::{Channel, ChannelId, ChannelState, Measurement};
use crate::error::ProtocolError;
use static_assertions::{const_assert, const_assert_eq};
use std::collections::{HashMap, VecDeque};

pub const FRAME_MAGIC: u16 = 0x4D43;
pub const SUBSCRIPTION_MAGIC: u16 = 0x4D53;
pub const PROTOCOL_VERSION: u8 = 1;

pub const HEADER_LEN: usize = 12;
pub const PAYLOAD_LEN: usize = 48;
pub const FRAME_LEN: usize = HEADER_LEN + PAYLOAD_LEN;
pub const SUBSCRIPTION_HEADER_LEN: usize = 4;

const_assert_eq!(FRAME_LEN, 60);
const_assert!(FRAME_LEN <= u16::MAX as usize);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TelemetryFrame {
    pub channel_id: ChannelId,
    pub state: ChannelState,
    pub sequence: u32,
    pub measurement: Measurement,
}

impl TelemetryFrame {
    pub fn capture(channel: &Channel) -> Self {
        Self {
            channel_id: channel.id(),
            state: channel.state(),
            sequence: channel.sequence_counter(),
            measurement: *channel.measurement(),
        }
    }
}

pub fn encode_telemetry(frame: &TelemetryFrame) -> [u8; FRAME_LEN] {
    let m = &frame.measurement;
    let mut bytes = [0u8; FRAME_LEN];
    bytes[0..2].copy_from_slice(&FRAME_MAGIC.to_le_bytes());
    bytes[2..4].copy_from_slice(&(FRAME_LEN as u16).to_le_bytes());
    bytes[4..6].copy_from_slice(&frame.channel_id.to_le_bytes());
    bytes[6] = frame.state.code();
    bytes[7] = PROTOCOL_VERSION;
    bytes[8..12].copy_from_slice(&frame.sequence.to_le_bytes());
    bytes[12..20].copy_from_slice(&m.test_time_ms.to_le_bytes());
    bytes[20..28].copy_from_slice(&m.voltage_v.to_le_bytes());
    bytes[28..36].copy_from_slice(&m.current_a.to_le_bytes());
    bytes[36..44].copy_from_slice(&m.capacity_ah.to_le_bytes());
    bytes[44..52].copy_from_slice(&m.energy_wh.to_le_bytes());
    bytes[52..56].copy_from_slice(&m.cycle.to_le_bytes());
    bytes[56..58].copy_from_slice(&m.step.to_le_bytes());
    bytes
}

/// Decodes one frame from the front of `bytes`. Trailing bytes are ignored.
pub fn decode_telemetry(bytes: &[u8]) -> Result<TelemetryFrame, ProtocolError> {
    if bytes.len() < 4 {
        return Err(ProtocolError::IncompleteFrame {
            needed: FRAME_LEN,
            available: bytes.len(),
        });
    }

    let magic = u16::from_le_bytes(field(bytes, 0));
    if magic != FRAME_MAGIC {
        return Err(ProtocolError::malformed(format!(
            "bad frame magic {magic:#06x}"
        )));
    }
    let length = usize::from(u16::from_le_bytes(field(bytes, 2)));
    if length != FRAME_LEN {
        return Err(ProtocolError::malformed(format!(
            "frame length {length} does not match {FRAME_LEN}"
        )));
    }
    if bytes.len() < FRAME_LEN {
        return Err(ProtocolError::IncompleteFrame {
            needed: FRAME_LEN,
            available: bytes.len(),
        });
    }

    let state = ChannelState::from_code(bytes[6])
        .ok_or_else(|| ProtocolError::malformed(format!("unknown state code {}", bytes[6])))?;
    if bytes[7] != PROTOCOL_VERSION {
        return Err(ProtocolError::malformed(format!(
            "unsupported protocol version {}",
            bytes[7]
        )));
    }

    Ok(TelemetryFrame {
        channel_id: u16::from_le_bytes(field(bytes, 4)),
        state,
        sequence: u32::from_le_bytes(field(bytes, 8)),
        measurement: Measurement {
            test_time_ms: u64::from_le_bytes(field(bytes, 12)),
            voltage_v: f64::from_le_bytes(field(bytes, 20)),
            current_a: f64::from_le_bytes(field(bytes, 28)),
            capacity_ah: f64::from_le_bytes(field(bytes, 36)),
            energy_wh: f64::from_le_bytes(field(bytes, 44)),
            cycle: u32::from_le_bytes(field(bytes, 52)),
            step: u16::from_le_bytes(field(bytes, 56)),
        },
    })
}

// Callers check the length first.
fn field<const N: usize>(bytes: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[offset..offset + N]);
    out
}

/// Reassembles frames from an arbitrarily chunked byte stream.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// A corrupt frame is reported once and then skipped: the buffer is
    /// advanced to the next frame magic so later calls can resync.
    pub fn next_frame(&mut self) -> Result<Option<TelemetryFrame>, ProtocolError> {
        match decode_telemetry(&self.buffer) {
            Ok(frame) => {
                self.buffer.drain(..FRAME_LEN);
                Ok(Some(frame))
            }
            Err(ProtocolError::IncompleteFrame { .. }) => Ok(None),
            Err(e) => {
                self.skip_to_next_magic();
                Err(e)
            }
        }
    }

    fn skip_to_next_magic(&mut self) {
        let magic = FRAME_MAGIC.to_le_bytes();
        let skip = self
            .buffer
            .windows(2)
            .skip(1)
            .position(|pair| pair == magic)
            .map(|offset| offset + 1)
            // A trailing first magic byte may be the start of the next frame.
            .unwrap_or_else(|| match self.buffer.last() {
                Some(&last) if last == magic[0] => self.buffer.len() - 1,
                _ => self.buffer.len(),
            });
        self.buffer.drain(..skip);
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subscription {
    All,
    Channels(Vec<ChannelId>),
}

impl Subscription {
    pub fn includes(&self, channel_id: ChannelId) -> bool {
        match self {
            Subscription::All => true,
            Subscription::Channels(ids) => ids.contains(&channel_id),
        }
    }

    pub fn channel_ids(&self, num_channels: u16) -> Vec<ChannelId> {
        match self {
            Subscription::All => (0..num_channels).collect(),
            Subscription::Channels(ids) => ids.iter().copied().filter(|id| *id < num_channels).collect(),
        }
    }
}

pub fn encode_subscription(subscription: &Subscription) -> Vec<u8> {
    let ids: &[ChannelId] = match subscription {
        Subscription::All => &[],
        Subscription::Channels(ids) => ids,
    };
    let count = u16::try_from(ids.len()).unwrap_or(u16::MAX);

    let mut bytes = Vec::with_capacity(SUBSCRIPTION_HEADER_LEN + ids.len() * 2);
    bytes.extend_from_slice(&SUBSCRIPTION_MAGIC.to_le_bytes());
    bytes.extend_from_slice(&count.to_le_bytes());
    for id in ids.iter().take(usize::from(count)) {
        bytes.extend_from_slice(&id.to_le_bytes());
    }
    bytes
}

/// Decodes a subscription message from the front of `bytes`, returning it and
/// the number of bytes consumed.
pub fn decode_subscription(
    bytes: &[u8],
    num_channels: u16,
) -> Result<(Subscription, usize), ProtocolError> {
    if bytes.len() < SUBSCRIPTION_HEADER_LEN {
        return Err(ProtocolError::IncompleteFrame {
            needed: SUBSCRIPTION_HEADER_LEN,
            available: bytes.len(),
        });
    }
    let magic = u16::from_le_bytes(field(bytes, 0));
    if magic != SUBSCRIPTION_MAGIC {
        return Err(ProtocolError::malformed(format!(
            "bad subscription magic {magic:#06x}"
        )));
    }

    let count = usize::from(u16::from_le_bytes(field(bytes, 2)));
    let needed = SUBSCRIPTION_HEADER_LEN + count * 2;
    if bytes.len() < needed {
        return Err(ProtocolError::IncompleteFrame {
            needed,
            available: bytes.len(),
        });
    }
    if count == 0 {
        return Ok((Subscription::All, needed));
    }

    let mut ids = Vec::with_capacity(count);
    for index in 0..count {
        let id = u16::from_le_bytes(field(bytes, SUBSCRIPTION_HEADER_LEN + index * 2));
        if id >= num_channels {
            return Err(ProtocolError::InvalidChannel {
                channel_id: i64::from(id),
                num_channels,
            });
        }
        ids.push(id);
    }
    ids.sort_unstable();
    ids.dedup();

    Ok((Subscription::Channels(ids), needed))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchingStats {
    pub frames_offered: u64,
    pub frames_queued: u64,
    pub frames_replaced: u64,
    pub frames_sent: u64,
    pub batches_sent: u64,
    pub frames_deferred: u64,
}

/// Per-connection outbound queue.
///
/// Holds at most one pending frame per channel: a newer sample replaces an
/// unsent older one, and samples not newer than the last one sent are
/// refused, so sequence numbers leave strictly increasing. Each batch is at
/// most `buffer_size` bytes; frames that do not fit stay queued for the next
/// batch.
#[derive(Debug)]
pub struct TelemetryBatcher {
    buffer_size: usize,
    pending: VecDeque<TelemetryFrame>,
    last_sent: Vec<Option<u32>>,
    stats: BatchingStats,
}

impl TelemetryBatcher {
    /// `buffer_size` must hold at least one frame; smaller values are
    /// rejected during configuration.
    pub fn new(num_channels: u16, buffer_size: usize) -> Self {
        debug_assert!(buffer_size >= FRAME_LEN, "buffer of {buffer_size} bytes cannot hold a frame");
        Self {
            buffer_size,
            pending: VecDeque::with_capacity(usize::from(num_channels)),
            last_sent: vec![None; usize::from(num_channels)],
            stats: BatchingStats::default(),
        }
    }

    pub fn frames_per_batch(&self) -> usize {
        (self.buffer_size / FRAME_LEN).max(1)
    }

    /// Queues a frame. Returns false when the frame was refused.
    pub fn offer(&mut self, frame: TelemetryFrame) -> bool {
        self.stats.frames_offered += 1;

        let Some(last_sent) = self.last_sent.get(usize::from(frame.channel_id)) else {
            return false;
        };
        if last_sent.is_some_and(|seq| frame.sequence <= seq) {
            return false;
        }

        if let Some(slot) = self
            .pending
            .iter_mut()
            .find(|pending| pending.channel_id == frame.channel_id)
        {
            if frame.sequence <= slot.sequence {
                return false;
            }
            *slot = frame;
            self.stats.frames_replaced += 1;
        } else {
            self.pending.push_back(frame);
        }
        self.stats.frames_queued += 1;
        true
    }

    /// Encodes the next batch, oldest frames first.
    pub fn next_batch(&mut self) -> Option<Vec<u8>> {
        if self.pending.is_empty() {
            return None;
        }

        let count = self.pending.len().min(self.frames_per_batch());
        let mut batch = Vec::with_capacity(count * FRAME_LEN);
        for frame in self.pending.drain(..count) {
            batch.extend_from_slice(&encode_telemetry(&frame));
            self.last_sent[usize::from(frame.channel_id)] = Some(frame.sequence);
        }

        self.stats.frames_sent += count as u64;
        self.stats.batches_sent += 1;
        self.stats.frames_deferred += self.pending.len() as u64;
        Some(batch)
    }

    /// Drops queued frames for channels the subscription no longer covers.
    pub fn retain_subscribed(&mut self, subscription: &Subscription) {
        self.pending.retain(|frame| subscription.includes(frame.channel_id));
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn stats(&self) -> &BatchingStats {
        &self.stats
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceCheck {
    First,
    InOrder,
    Gap { missed: u32 },
    /// Sequence did not increase: a duplicate or reordered frame.
    Stale,
}

/// Client-side gap detection over a telemetry session.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    last_seen: HashMap<ChannelId, u32>,
    gaps: u64,
    missed: u64,
    stale: u64,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, frame: &TelemetryFrame) -> SequenceCheck {
        let Some(last) = self.last_seen.get(&frame.channel_id).copied() else {
            self.last_seen.insert(frame.channel_id, frame.sequence);
            return SequenceCheck::First;
        };

        if frame.sequence <= last {
            self.stale += 1;
            return SequenceCheck::Stale;
        }

        self.last_seen.insert(frame.channel_id, frame.sequence);
        let missed = frame.sequence - last - 1;
        if missed == 0 {
            SequenceCheck::InOrder
        } else {
            self.gaps += 1;
            self.missed += u64::from(missed);
            SequenceCheck::Gap { missed }
        }
    }

    pub fn last_seen(&self, channel_id: ChannelId) -> Option<u32> {
        self.last_seen.get(&channel_id).copied()
    }

    pub fn gap_count(&self) -> u64 {
        self.gaps
    }

    pub fn missed_count(&self) -> u64 {
        self.missed
    }

    pub fn stale_count(&self) -> u64 {
        self.stale
    }
}
