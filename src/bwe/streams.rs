use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::rtp::{Bitrate, DataSize, Ssrc};

/// Read-only view of a stream's transmit queue.
///
/// The estimators never own the packets waiting to be sent. They only look at the queue
/// to decide whether the next packet may go, and how much the queue adds to the latency.
pub trait TxQueue: Send + Sync {
    /// Size of the packet at the head of the queue.
    fn size_of_next(&self) -> Option<DataSize>;

    /// RTP sequence number of the packet at the head of the queue.
    fn seq_of_next(&self) -> Option<u16>;

    /// Total bytes waiting.
    fn bytes(&self) -> DataSize;

    /// Number of packets waiting.
    fn len(&self) -> usize;

    /// How long the oldest packet has been waiting.
    fn queue_delay(&self, now: Instant) -> Duration;

    /// Size of the most recently completed frame.
    fn size_of_last_frame(&self) -> DataSize;

    /// Whether the queue is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A media stream known to the estimator.
#[derive(Clone)]
pub struct StreamRegistration {
    /// Stream identifier.
    pub ssrc: Ssrc,
    /// Relative weight when splitting the total rate.
    pub priority: f64,
    /// Lowest rate handed to the encoder.
    pub min_bitrate: Bitrate,
    /// Rate before any feedback has arrived.
    pub start_bitrate: Bitrate,
    /// Highest rate handed to the encoder.
    pub max_bitrate: Bitrate,
    /// Transmit queue view.
    pub queue: Arc<dyn TxQueue>,
}

impl fmt::Debug for StreamRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamRegistration")
            .field("ssrc", &self.ssrc)
            .field("priority", &self.priority)
            .field("min_bitrate", &self.min_bitrate)
            .field("start_bitrate", &self.start_bitrate)
            .field("max_bitrate", &self.max_bitrate)
            .field("queued", &self.queue.len())
            .finish()
    }
}

/// Streams by SSRC.
#[derive(Debug, Default)]
pub struct StreamTable {
    streams: HashMap<Ssrc, StreamRegistration>,
}

impl StreamTable {
    /// Empty table.
    pub fn new() -> Self {
        StreamTable::default()
    }

    /// Add a stream. Returns the registration back if the SSRC is taken.
    pub fn insert(&mut self, reg: StreamRegistration) -> Result<(), StreamRegistration> {
        if self.streams.contains_key(&reg.ssrc) {
            return Err(reg);
        }
        self.streams.insert(reg.ssrc, reg);
        Ok(())
    }

    /// Remove a stream.
    pub fn remove(&mut self, ssrc: Ssrc) -> Option<StreamRegistration> {
        self.streams.remove(&ssrc)
    }

    /// Look up a stream.
    pub fn get(&self, ssrc: Ssrc) -> Option<&StreamRegistration> {
        self.streams.get(&ssrc)
    }

    /// All streams, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &StreamRegistration> {
        self.streams.values()
    }

    /// Number of streams.
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    /// Whether there are no streams.
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Sum of all priorities.
    pub fn total_priority(&self) -> f64 {
        self.streams.values().map(|s| s.priority).sum()
    }

    /// The share of `total` that goes to `ssrc`, clamped to the stream's bounds.
    ///
    /// Returns `None` for unknown streams.
    pub(crate) fn share(&self, ssrc: Ssrc, total: Bitrate) -> Option<Bitrate> {
        let stream = self.get(ssrc)?;
        let total_priority = self.total_priority();
        let weight = if total_priority > 0.0 {
            stream.priority / total_priority
        } else {
            1.0 / self.len() as f64
        };
        Some((total * weight).clamp(stream.min_bitrate, stream.max_bitrate))
    }
}

#[derive(Debug, Clone, Copy)]
struct QueuedPacket {
    size: DataSize,
    seq: u16,
    enqueued_at: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    packets: VecDeque<QueuedPacket>,
    bytes: DataSize,
    frame_bytes: DataSize,
    last_frame: DataSize,
}

/// A simple FIFO transmit queue of RTP packet sizes.
///
/// Useful when the application keeps the payloads elsewhere and only needs the estimator
/// to see what is waiting.
#[derive(Debug, Default)]
pub struct RtpQueue {
    inner: Mutex<Inner>,
}

impl RtpQueue {
    /// Empty queue.
    pub fn new() -> Self {
        RtpQueue::default()
    }

    /// Add a packet. `is_mark` closes the current frame.
    pub fn push(&self, size: DataSize, seq: u16, is_mark: bool, now: Instant) {
        let mut inner = self.inner.lock();
        inner.packets.push_back(QueuedPacket {
            size,
            seq,
            enqueued_at: now,
        });
        inner.bytes += size;
        inner.frame_bytes += size;
        if is_mark {
            inner.last_frame = inner.frame_bytes;
            inner.frame_bytes = DataSize::ZERO;
        }
    }

    /// Remove the head packet, returning its size and sequence number.
    pub fn pop(&self) -> Option<(DataSize, u16)> {
        let mut inner = self.inner.lock();
        let p = inner.packets.pop_front()?;
        inner.bytes -= p.size;
        Some((p.size, p.seq))
    }

    /// Drop everything waiting. Returns the number of packets dropped.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let n = inner.packets.len();
        inner.packets.clear();
        inner.bytes = DataSize::ZERO;
        n
    }
}

impl TxQueue for RtpQueue {
    fn size_of_next(&self) -> Option<DataSize> {
        self.inner.lock().packets.front().map(|p| p.size)
    }

    fn seq_of_next(&self) -> Option<u16> {
        self.inner.lock().packets.front().map(|p| p.seq)
    }

    fn bytes(&self) -> DataSize {
        self.inner.lock().bytes
    }

    fn len(&self) -> usize {
        self.inner.lock().packets.len()
    }

    fn queue_delay(&self, now: Instant) -> Duration {
        self.inner
            .lock()
            .packets
            .front()
            .map(|p| now.saturating_duration_since(p.enqueued_at))
            .unwrap_or(Duration::ZERO)
    }

    fn size_of_last_frame(&self) -> DataSize {
        self.inner.lock().last_frame
    }
}
