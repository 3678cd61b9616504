use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use super::{Ecn, FeedbackFormat, FeedbackReport, PacketReport, RtcpHeader, RtcpPacket, FMT_TWCC};
use crate::rtp::{RtpHeader, SeqNo, SeqUnwrapper, Ssrc};

/// Largest report we build, in bytes. Keeps a report within one datagram.
const MAX_REPORT_SIZE: usize = 1100;

/// Packets to retain after they are reported, to cope with reordering.
const KEEP_REPORTED: usize = 100;

/// Force a report after this many unreported packets.
const REPORT_EVERY_PACKETS: usize = 50;

/// Transport Wide Congestion Control feedback packet.
///
/// Sent in response to RTP packets carrying the transport-wide sequence number extension,
/// reporting on ranges of packets.
#[derive(Clone, PartialEq, Eq)]
pub struct Twcc {
    /// Sender of this feedback.
    pub sender_ssrc: Ssrc,
    /// The media SSRC this report is for.
    pub ssrc: Ssrc,
    /// Start sequence number.
    pub base_seq: u16,
    /// Number of reported statuses.
    pub status_count: u16,
    /// Reference time in multiples of 64ms, 24 bit.
    pub reference_time: u32,
    /// Increasing counter for each report. For deduping.
    pub feedback_count: u8,
    /// Status chunks.
    pub chunks: VecDeque<PacketChunk>,
    /// Receive deltas for the received packets.
    pub delta: VecDeque<Delta>,
}

impl Twcc {
    fn chunks_byte_len(&self) -> usize {
        self.chunks.len() * 2
    }

    fn delta_byte_len(&self) -> usize {
        self.delta.iter().map(|d| d.byte_len()).sum()
    }

    /// Time on the remote clock the first delta is relative to.
    pub fn reference(&self) -> Duration {
        Duration::from_millis(self.reference_time as u64 * 64)
    }

    /// The status of each reported packet, in order.
    fn statuses(&self) -> Vec<PacketStatus> {
        let mut out = Vec::with_capacity(self.status_count as usize);

        for chunk in &self.chunks {
            match *chunk {
                PacketChunk::Run(s, n) => {
                    let s = if s == PacketStatus::Unknown {
                        PacketStatus::NotReceived
                    } else {
                        s
                    };
                    out.extend(std::iter::repeat(s).take(n as usize));
                }
                PacketChunk::VectorSingle(v, _) => {
                    for i in 0..14 {
                        let received = v & (1 << (13 - i)) > 0;
                        out.push(if received {
                            PacketStatus::ReceivedSmallDelta
                        } else {
                            PacketStatus::NotReceived
                        });
                    }
                }
                PacketChunk::VectorDouble(v, _) => {
                    for i in 0..7 {
                        let bits = ((v >> (12 - i * 2)) & 0b11) as u8;
                        out.push(match PacketStatus::from(bits) {
                            PacketStatus::Unknown => PacketStatus::NotReceived,
                            s => s,
                        });
                    }
                }
            }
        }

        out.truncate(self.status_count as usize);
        out
    }

    /// Convert to a report.
    ///
    /// `extend` receives `None` and the 16 bit base sequence, and should give back the
    /// transport-wide sequence number of the sent packet.
    pub fn into_report(self, mut extend: impl FnMut(Option<Ssrc>, u16) -> SeqNo) -> FeedbackReport {
        let base_seq = *extend(None, self.base_seq);
        // Accumulate in signed micros, negative deltas may dip below 0.
        let mut time = self.reference().as_micros() as i64;
        let mut deltas = self.delta.iter();

        let mut packets = Vec::with_capacity(self.status_count as usize);

        for (i, status) in self.statuses().into_iter().enumerate() {
            let arrival = match status {
                PacketStatus::NotReceived | PacketStatus::Unknown => None,
                _ => {
                    let Some(delta) = deltas.next() else {
                        // Decode ensures there are enough deltas.
                        break;
                    };
                    time += delta.as_micros();
                    Some(Duration::from_micros(time.max(0) as u64))
                }
            };

            packets.push(PacketReport {
                ssrc: self.ssrc,
                seq: (base_seq + i as u64).into(),
                arrival,
                ecn: Ecn::NotEct,
            });
        }

        FeedbackReport {
            format: FeedbackFormat::Twcc,
            sender_ssrc: self.sender_ssrc,
            packets,
            report_time: Some(self.reference()),
        }
    }
}

impl RtcpPacket for Twcc {
    fn length_words(&self) -> usize {
        // header: 1
        // sender ssrc: 1
        // ssrc: 1
        // base seq + packet status: 1
        // ref time + feedback count: 1
        // chunks byte len + delta byte len + padding
        let total = self.chunks_byte_len() + self.delta_byte_len();

        5 + (total + 3) / 4
    }

    fn write_to(&self, buf: &mut [u8]) -> usize {
        let words = self.length_words();
        RtcpHeader::transport_feedback(FMT_TWCC, words).write_to(buf);

        buf[4..8].copy_from_slice(&self.sender_ssrc.to_be_bytes());
        buf[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
        buf[12..14].copy_from_slice(&self.base_seq.to_be_bytes());
        buf[14..16].copy_from_slice(&self.status_count.to_be_bytes());

        let ref_time = self.reference_time.to_be_bytes();
        buf[16..19].copy_from_slice(&ref_time[1..4]);
        buf[19] = self.feedback_count;

        let mut offset = 20;
        for p in &self.chunks {
            p.write_to(&mut buf[offset..]);
            offset += 2;
        }
        for d in &self.delta {
            offset += d.write_to(&mut buf[offset..]);
        }

        let pad = words * 4 - offset;
        if pad > 0 {
            buf[offset..offset + pad].fill(0);
            buf[offset + pad - 1] = pad as u8;
            buf[0] |= 0b00_1_00000;
        }

        words * 4
    }
}

impl fmt::Debug for Twcc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Twcc")
            .field("sender_ssrc", &self.sender_ssrc)
            .field("ssrc", &self.ssrc)
            .field("base_seq", &self.base_seq)
            .field("status_count", &self.status_count)
            .field("reference_time", &self.reference_time)
            .field("feedback_count", &self.feedback_count)
            .field("chunks", &self.chunks.len())
            .field("delta", &self.delta.len())
            .finish()
    }
}

/// Collects arrival times of transport-wide sequence numbers into TWCC reports.
#[derive(Debug)]
pub struct TwccRecvRegister {
    /// How many packets to keep after they are reported. Packets arriving out of order
    /// can make a subsequent report go "backwards" in base_seq.
    keep_reported: usize,

    /// Arrivals ordered by sequence number.
    ///
    /// Once there is some content, at least one entry is kept to anchor the next report.
    queue: VecDeque<Receipt>,

    /// Index into queue of the first unreported packet.
    report_from: usize,

    /// Scratch space reused for every report.
    interims: VecDeque<ChunkInterim>,

    /// Local time corresponding to reference time 0. Set on the first report.
    time_start: Option<Instant>,

    /// Counter that increases by one for each report generated.
    generated_reports: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Receipt {
    seq: SeqNo,
    time: Instant,
}

impl TwccRecvRegister {
    /// Create a register keeping `keep_reported` already reported arrivals.
    pub fn new(keep_reported: usize) -> Self {
        TwccRecvRegister {
            keep_reported,
            queue: VecDeque::new(),
            report_from: 0,
            interims: VecDeque::new(),
            time_start: None,
            generated_reports: 0,
        }
    }

    /// Highest recorded sequence number.
    pub fn max_seq(&self) -> SeqNo {
        self.queue.back().map(|r| r.seq).unwrap_or_default()
    }

    /// Record an arrival.
    pub fn update_seq(&mut self, seq: SeqNo, time: Instant) {
        let idx = match self.queue.binary_search_by_key(&seq, |r| r.seq) {
            // Duplicate sequence number. Keep the first.
            Ok(_) => return,
            Err(idx) => idx,
        };

        if let Some(time_start) = self.time_start {
            // A delta can't go further back than 8192ms from the reference.
            if time_start.saturating_duration_since(time) >= Duration::from_millis(8192) {
                return;
            }
        }

        self.queue.insert(idx, Receipt { seq, time });

        if idx < self.report_from {
            self.report_from = idx;
        }
    }

    /// Whether there are arrivals not yet reported.
    pub fn has_unreported(&self) -> bool {
        self.queue.len() > self.report_from
    }

    /// Number of arrivals not yet reported.
    pub fn unreported(&self) -> usize {
        self.queue.len() - self.report_from
    }

    /// Build a report of at most `max_byte_size` bytes from unreported arrivals.
    pub fn build_report(&mut self, max_byte_size: usize) -> Option<Twcc> {
        if max_byte_size > 10_000 || max_byte_size < 32 {
            warn!("Refuse to build Twcc report of size: {}", max_byte_size);
            return None;
        }

        let first = *self.queue.get(self.report_from)?;

        let time_start = *self.time_start.get_or_insert(first.time);

        // Reference time is in 64ms steps, relative to time_start.
        let first_rel = first.time.saturating_duration_since(time_start);
        let reference_time = (first_rel.as_micros() / 64_000) as u32 & 0x00ff_ffff;

        let mut twcc = Twcc {
            sender_ssrc: 0.into(),
            ssrc: 0.into(),
            feedback_count: self.generated_reports as u8,
            base_seq: first.seq.as_u16(),
            reference_time,
            status_count: 0,
            chunks: VecDeque::new(),
            delta: VecDeque::new(),
        };

        // The first delta is relative to the truncated reference time.
        let base_time = time_start + Duration::from_micros(reference_time as u64 * 64_000);

        build_interims(
            &self.queue,
            self.report_from,
            first.seq,
            base_time,
            &mut self.interims,
        );
        let interims = &mut self.interims;

        // 20 bytes of fixed fields, including the RTCP header.
        let mut bytes_left = max_byte_size - 20;

        // 2 chunk + 2 large delta + 3 padding
        const MIN_RUN_SIZE: usize = 2 + 2 + 3;
        // 2 chunk + 14 small delta + 3 padding
        const MAX_SINGLE_SIZE: usize = 2 + 14 + 3;
        // 2 chunk + 7 large delta + 3 padding
        const MAX_DOUBLE_SIZE: usize = 2 + 14 + 3;

        while let Some(front) = interims.front() {
            if bytes_left < MIN_RUN_SIZE {
                break;
            }

            // Pick the chunk type that covers the most interims.
            let (mut chunk, mut todo) = {
                let c_run = PacketChunk::Run(front.status(), 0);
                let c_single = PacketChunk::VectorSingle(0, 0);
                let c_double = PacketChunk::VectorDouble(0, 0);

                let max_run = c_run.append_max(interims.iter());
                let max_single = c_single.append_max(interims.iter());
                let max_double = c_double.append_max(interims.iter());

                let max = max_run.max(max_single).max(max_double);

                if max == max_run {
                    (c_run, max_run)
                } else if max == max_single && bytes_left >= MAX_SINGLE_SIZE {
                    (c_single, max_single)
                } else if max == max_double && bytes_left >= MAX_DOUBLE_SIZE {
                    (c_double, max_double)
                } else {
                    // Runs always fit.
                    (c_run, max_run)
                }
            };

            while todo > 0 && bytes_left >= MIN_RUN_SIZE {
                let Some(i) = interims.front_mut() else {
                    break;
                };

                let appended = chunk.append(i);
                if appended == 0 {
                    break;
                }
                todo -= appended.min(todo);
                twcc.status_count += appended;

                if !i.consume(appended) {
                    // Chunk is full.
                    break;
                }

                if matches!(i, ChunkInterim::Received(_, _)) {
                    self.report_from += 1;
                }
                if let Some(delta) = i.delta() {
                    twcc.delta.push_back(delta);
                    bytes_left -= delta.byte_len();
                }
                interims.pop_front();
            }

            let free = chunk.free();
            if chunk.must_be_full() && free > 0 {
                // Only at the end, shift in missing to fill the vector.
                chunk.append(&ChunkInterim::Missing(free));
            }

            twcc.chunks.push_back(chunk);
            bytes_left -= 2;
        }

        // libWebRTC demands at least one chunk.
        if twcc.chunks.is_empty() {
            return None;
        }

        self.generated_reports += 1;

        if self.report_from > self.keep_reported {
            let to_remove = self.report_from - self.keep_reported;
            self.queue.drain(..to_remove);
            self.report_from -= to_remove;
        }

        Some(twcc)
    }
}

/// Interims are deltas between receipts, an intermediary step before populating the report.
fn build_interims(
    queue: &VecDeque<Receipt>,
    report_from: usize,
    base_seq: SeqNo,
    base_time: Instant,
    interims: &mut VecDeque<ChunkInterim>,
) {
    interims.clear();

    let mut prev = (base_seq, base_time);

    for (i, r) in queue.iter().skip(report_from).enumerate() {
        // The first receipt is at base_seq and should not produce a gap.
        let diff_seq = if i == 0 { 1 } else { *r.seq - *prev.0 };

        let mut missing = diff_seq.saturating_sub(1);
        while missing > 0 {
            // max 2^13 run length in each missing chunk
            let n = missing.min(8192);
            interims.push_back(ChunkInterim::Missing(n as u16));
            missing -= n;
        }

        let diff_time = if r.time < prev.1 {
            -((prev.1 - r.time).as_micros() as i64)
        } else {
            (r.time - prev.1).as_micros() as i64
        };

        let t = diff_time / 250;
        let status = if diff_time < -8_192_000 || diff_time > 8_191_750 {
            // Not representable. Report what we got, and start anew on the next report.
            break;
        } else if diff_time < 0 || diff_time > 63_750 {
            PacketStatus::ReceivedLargeOrNegativeDelta
        } else {
            PacketStatus::ReceivedSmallDelta
        };

        interims.push_back(ChunkInterim::Received(status, t as i16));
        prev = (r.seq, r.time);
    }
}

#[derive(Debug, Clone, Copy)]
enum ChunkInterim {
    Missing(u16), // max 2^13 (one run length)
    Received(PacketStatus, i16),
}

impl ChunkInterim {
    fn status(&self) -> PacketStatus {
        match self {
            ChunkInterim::Missing(_) => PacketStatus::NotReceived,
            ChunkInterim::Received(s, _) => *s,
        }
    }

    fn delta(&self) -> Option<Delta> {
        match self {
            ChunkInterim::Missing(_) => None,
            ChunkInterim::Received(PacketStatus::ReceivedSmallDelta, d) => Some(Delta::Small(*d as u8)),
            ChunkInterim::Received(_, d) => Some(Delta::Large(*d)),
        }
    }

    /// Consume n entries. True if fully consumed.
    fn consume(&mut self, n: u16) -> bool {
        match self {
            ChunkInterim::Missing(c) => {
                *c -= n;
                *c == 0
            }
            ChunkInterim::Received(_, _) => n == 1,
        }
    }
}

/// A packet status chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketChunk {
    /// Run length chunk, 13 bit repeat of one status.
    Run(PacketStatus, u16),
    /// 14 one-bit symbols. Second value is number of filled symbols.
    VectorSingle(u16, u16),
    /// 7 two-bit symbols. Second value is number of filled symbols.
    VectorDouble(u16, u16),
}

impl PacketChunk {
    fn append_max<'a>(&self, iter: impl Iterator<Item = &'a ChunkInterim>) -> u16 {
        let mut to_fill = *self;

        let mut reached_end = true;

        for i in iter {
            if to_fill.free() == 0 || !to_fill.can_append_status(i.status()) {
                reached_end = false;
                break;
            }

            to_fill.append(i);
        }

        // Vectors must be completely filled, unless we are at the end of the interims
        // where missing can be shifted in.
        if to_fill.must_be_full() && to_fill.free() > 0 && !reached_end {
            return 0;
        }

        self.free() - to_fill.free()
    }

    fn append(&mut self, i: &ChunkInterim) -> u16 {
        use ChunkInterim::*;
        use PacketChunk::*;
        let free = self.free();
        match (self, i) {
            (Run(s, n), Missing(c)) => {
                if *s != PacketStatus::NotReceived {
                    return 0;
                }
                let max = free.min(*c);
                *n += max;
                max
            }
            (Run(s, n), Received(s2, _)) => {
                if *s != *s2 {
                    return 0;
                }
                let max = free.min(1);
                *n += max;
                max
            }
            (VectorSingle(n, f), Missing(c)) => {
                let max = free.min(*c);
                *n <<= max;
                *f += max;
                max
            }
            (VectorSingle(n, f), Received(s2, _)) => {
                if *s2 == PacketStatus::ReceivedLargeOrNegativeDelta || free == 0 {
                    return 0;
                }
                *n = (*n << 1) | 1;
                *f += 1;
                1
            }
            (VectorDouble(n, f), Missing(c)) => {
                let max = free.min(*c);
                *n <<= max * 2;
                *f += max;
                max
            }
            (VectorDouble(n, f), Received(s2, _)) => {
                if free == 0 {
                    return 0;
                }
                *n = (*n << 2) | *s2 as u16;
                *f += 1;
                1
            }
        }
    }

    fn must_be_full(&self) -> bool {
        !matches!(self, PacketChunk::Run(_, _))
    }

    fn free(&self) -> u16 {
        match self {
            PacketChunk::Run(_, n) => 8192 - *n,
            PacketChunk::VectorSingle(_, filled) => 14 - *filled,
            PacketChunk::VectorDouble(_, filled) => 7 - *filled,
        }
    }

    fn can_append_status(&self, status: PacketStatus) -> bool {
        match self {
            PacketChunk::Run(s, _) => *s == status,
            PacketChunk::VectorSingle(_, _) => status != PacketStatus::ReceivedLargeOrNegativeDelta,
            PacketChunk::VectorDouble(_, _) => true,
        }
    }

    fn max_possible_status_count(&self) -> usize {
        match self {
            PacketChunk::Run(_, n) => *n as usize,
            PacketChunk::VectorSingle(_, _) => 14,
            PacketChunk::VectorDouble(_, _) => 7,
        }
    }

    fn write_to(&self, buf: &mut [u8]) {
        let x = match self {
            //  0                   1
            //  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5
            // +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
            // |T| S |       Run Length        |
            // +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
            PacketChunk::Run(s, n) => ((*s as u16) << 13) | (*n & 0x1fff),

            //  0                   1
            //  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5
            // +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
            // |T|S|       symbol list         |
            // +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
            PacketChunk::VectorSingle(n, _) => (1 << 15) | (*n & 0x3fff),
            PacketChunk::VectorDouble(n, _) => (1 << 15) | (1 << 14) | (*n & 0x3fff),
        };
        buf[..2].copy_from_slice(&x.to_be_bytes());
    }
}

/// Packet status symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketStatus {
    /// Lost, or not yet received.
    NotReceived = 0b00,
    /// Received, delta fits in one byte.
    ReceivedSmallDelta = 0b01,
    /// Received, delta is two bytes.
    ReceivedLargeOrNegativeDelta = 0b10,
    /// Reserved.
    Unknown = 0b11,
}

impl From<u8> for PacketStatus {
    fn from(v: u8) -> Self {
        match v {
            0b00 => Self::NotReceived,
            0b01 => Self::ReceivedSmallDelta,
            0b10 => Self::ReceivedLargeOrNegativeDelta,
            _ => Self::Unknown,
        }
    }
}

/// Receive delta in multiples of 250us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delta {
    /// 0 to 63.75ms.
    Small(u8),
    /// -8192ms to 8191.75ms.
    Large(i16),
}

impl Delta {
    fn write_to(&self, buf: &mut [u8]) -> usize {
        match self {
            Delta::Small(v) => {
                buf[0] = *v;
                1
            }
            Delta::Large(v) => {
                buf[..2].copy_from_slice(&v.to_be_bytes());
                2
            }
        }
    }

    fn byte_len(&self) -> usize {
        match self {
            Delta::Small(_) => 1,
            Delta::Large(_) => 2,
        }
    }

    fn as_micros(&self) -> i64 {
        match *self {
            Delta::Small(v) => 250 * v as i64,
            Delta::Large(v) => 250 * v as i64,
        }
    }
}

impl<'a> TryFrom<&'a [u8]> for Twcc {
    type Error = &'static str;

    fn try_from(buf: &'a [u8]) -> Result<Self, Self::Error> {
        if buf.len() < 16 {
            return Err("Less than 16 bytes for start of Twcc");
        }

        let mut twcc = Twcc {
            sender_ssrc: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]).into(),
            ssrc: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]).into(),
            base_seq: u16::from_be_bytes([buf[8], buf[9]]),
            status_count: u16::from_be_bytes([buf[10], buf[11]]),
            reference_time: u32::from_be_bytes([0, buf[12], buf[13], buf[14]]),
            feedback_count: buf[15],
            chunks: VecDeque::new(),
            delta: VecDeque::new(),
        };

        let mut todo = twcc.status_count as isize;
        let mut buf = &buf[16..];
        while todo > 0 {
            let chunk: PacketChunk = buf.try_into()?;
            todo -= chunk.max_possible_status_count() as isize;
            twcc.chunks.push_back(chunk);
            buf = &buf[2..];
        }

        for status in twcc.statuses() {
            match status {
                PacketStatus::ReceivedSmallDelta => {
                    let Some(v) = buf.first() else {
                        return Err("Not enough buf for small delta");
                    };
                    twcc.delta.push_back(Delta::Small(*v));
                    buf = &buf[1..];
                }
                PacketStatus::ReceivedLargeOrNegativeDelta => {
                    if buf.len() < 2 {
                        return Err("Not enough buf for large delta");
                    }
                    twcc.delta.push_back(Delta::Large(i16::from_be_bytes([buf[0], buf[1]])));
                    buf = &buf[2..];
                }
                _ => {}
            }
        }

        Ok(twcc)
    }
}

impl<'a> TryFrom<&'a [u8]> for PacketChunk {
    type Error = &'static str;

    fn try_from(buf: &'a [u8]) -> Result<Self, Self::Error> {
        if buf.len() < 2 {
            return Err("Less than 2 bytes for PacketChunk");
        }

        let x = u16::from_be_bytes([buf[0], buf[1]]);

        let is_vec = (x & 0b1000_0000_0000_0000) > 0;

        let p = if is_vec {
            let is_double = (x & 0b0100_0000_0000_0000) > 0;
            let n = x & 0b0011_1111_1111_1111;
            if is_double {
                PacketChunk::VectorDouble(n, 7)
            } else {
                PacketChunk::VectorSingle(n, 14)
            }
        } else {
            let s: PacketStatus = ((x >> 13) as u8 & 0b11).into();
            let n = x & 0b0001_1111_1111_1111;
            PacketChunk::Run(s, n)
        };

        Ok(p)
    }
}

/// Receiving side TWCC: unwraps the transport-wide sequence and emits reports.
///
/// A report is due when `interval` has passed since the last one, or when enough packets
/// are unreported.
#[derive(Debug)]
pub struct TwccGenerator {
    sender_ssrc: Ssrc,
    media_ssrc: Ssrc,
    unwrapper: SeqUnwrapper,
    register: TwccRecvRegister,
    interval: Duration,
    last_report: Option<Instant>,
}

impl TwccGenerator {
    /// New generator sending feedback as `sender_ssrc`.
    pub fn new(sender_ssrc: Ssrc, interval: Duration) -> Self {
        TwccGenerator {
            sender_ssrc,
            media_ssrc: 0.into(),
            unwrapper: SeqUnwrapper::new(),
            register: TwccRecvRegister::new(KEEP_REPORTED),
            interval,
            last_report: None,
        }
    }

    /// Record an arriving RTP packet. Packets without the extension are ignored.
    pub fn on_packet(&mut self, header: &RtpHeader, now: Instant) {
        let Some(seq) = header.transport_cc else {
            return;
        };
        self.media_ssrc = header.ssrc;
        let seq = self.unwrapper.unwrap(seq);
        self.register.update_seq(seq, now);
    }

    /// Whether a report should be sent.
    pub fn is_feedback_due(&self, now: Instant) -> bool {
        if !self.register.has_unreported() {
            return false;
        }
        if self.register.unreported() >= REPORT_EVERY_PACKETS {
            return true;
        }
        match self.last_report {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.interval,
        }
    }

    /// Build a serialized report if one is due.
    pub fn poll_feedback(&mut self, now: Instant) -> Option<Vec<u8>> {
        if !self.is_feedback_due(now) {
            return None;
        }
        let mut twcc = self.register.build_report(MAX_REPORT_SIZE)?;
        twcc.sender_ssrc = self.sender_ssrc;
        twcc.ssrc = self.media_ssrc;
        self.last_report = Some(now);

        trace!("Created TWCC {:?}", twcc);

        Some(twcc.to_vec())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::feedback::Feedback;

    fn roundtrip(twcc: Twcc) -> Twcc {
        let buf = twcc.to_vec();
        assert_eq!(buf.len() % 4, 0);
        let mut parsed = Feedback::parse(&buf).unwrap();
        match parsed.pop() {
            Some(Feedback::Twcc(v)) => v,
            v => panic!("Expected twcc: {:?}", v),
        }
    }

    #[test]
    fn build_report_contiguous() {
        let mut reg = TwccRecvRegister::new(100);
        let now = Instant::now();

        reg.update_seq(10.into(), now + Duration::from_millis(0));
        reg.update_seq(11.into(), now + Duration::from_millis(12));
        reg.update_seq(12.into(), now + Duration::from_millis(23));
        reg.update_seq(13.into(), now + Duration::from_millis(43));

        let report = reg.build_report(1000).unwrap();

        assert_eq!(report.base_seq, 10);
        assert_eq!(report.status_count, 4);
        assert_eq!(
            report.chunks,
            vec![PacketChunk::Run(PacketStatus::ReceivedSmallDelta, 4)]
        );
        assert_eq!(
            report.delta,
            vec![
                Delta::Small(0),
                Delta::Small(48),
                Delta::Small(44),
                Delta::Small(80)
            ]
        );
        assert!(!reg.has_unreported());
        assert!(reg.build_report(1000).is_none());

        let report = roundtrip(report);
        assert_eq!(report.status_count, 4);
    }

    #[test]
    fn build_report_with_gap() {
        let mut reg = TwccRecvRegister::new(100);
        let now = Instant::now();

        reg.update_seq(10.into(), now + Duration::from_millis(0));
        reg.update_seq(11.into(), now + Duration::from_millis(12));
        reg.update_seq(15.into(), now + Duration::from_millis(23));

        let report = reg.build_report(1000).unwrap();
        assert_eq!(report.status_count, 6);
        assert_eq!(report.chunks, vec![PacketChunk::VectorSingle(0b11_0001_0000_0000, 14)]);

        let report = roundtrip(report).into_report(|_, s| (s as u64).into());
        let received: Vec<_> = report.packets.iter().map(|p| p.is_received()).collect();
        assert_eq!(received, vec![true, true, false, false, false, true]);
        assert_eq!(*report.packets[5].seq, 15);
        assert_eq!(report.packets[5].arrival, Some(Duration::from_millis(23)));
    }

    #[test]
    fn build_report_negative_delta() {
        let mut reg = TwccRecvRegister::new(100);
        let now = Instant::now() + Duration::from_secs(1);

        reg.update_seq(1.into(), now);
        reg.update_seq(2.into(), now - Duration::from_millis(10));
        reg.update_seq(3.into(), now + Duration::from_millis(100));

        let report = reg.build_report(1000).unwrap();
        assert_eq!(report.status_count, 3);
        assert_eq!(
            report.delta,
            vec![Delta::Small(0), Delta::Large(-40), Delta::Large(440)]
        );

        let report = roundtrip(report).into_report(|_, s| (s as u64).into());
        let arrivals: Vec<_> = report.packets.iter().map(|p| p.arrival).collect();
        assert_eq!(
            arrivals,
            vec![
                Some(Duration::ZERO),
                Some(Duration::ZERO),
                Some(Duration::from_millis(100))
            ]
        );
    }

    #[test]
    fn out_of_order_goes_back() {
        let mut reg = TwccRecvRegister::new(100);
        let now = Instant::now();

        reg.update_seq(10.into(), now);
        reg.update_seq(12.into(), now + Duration::from_millis(5));
        let r1 = reg.build_report(1000).unwrap();
        assert_eq!(r1.base_seq, 10);
        assert_eq!(r1.status_count, 3);

        reg.update_seq(11.into(), now + Duration::from_millis(8));
        assert!(reg.has_unreported());
        let r2 = reg.build_report(1000).unwrap();
        assert_eq!(r2.base_seq, 11);
        assert_eq!(r2.feedback_count, 1);
    }

    #[test]
    fn duplicate_is_ignored() {
        let mut reg = TwccRecvRegister::new(100);
        let now = Instant::now();
        reg.update_seq(1.into(), now);
        reg.update_seq(1.into(), now + Duration::from_millis(1));
        assert_eq!(reg.unreported(), 1);
        assert_eq!(*reg.max_seq(), 1);
    }

    #[test]
    fn parse_large_run() {
        // Run of 2 large deltas.
        #[rustfmt::skip]
        let body = [
            0, 0, 0, 1,
            0, 0, 0, 2,
            0, 5, 0, 2,
            0, 0, 1, 7,
            0b010_00000, 2,
            0x01, 0x00,
            0xff, 0x00,
        ];
        let twcc = Twcc::try_from(&body[..]).unwrap();
        assert_eq!(twcc.base_seq, 5);
        assert_eq!(twcc.reference(), Duration::from_millis(64));
        assert_eq!(twcc.delta, vec![Delta::Large(256), Delta::Large(-256)]);
    }

    #[test]
    fn parse_missing_deltas() {
        #[rustfmt::skip]
        let body = [
            0, 0, 0, 1,
            0, 0, 0, 2,
            0, 5, 0, 2,
            0, 0, 1, 7,
            0b001_00000, 2,
            0x01,
        ];
        assert!(Twcc::try_from(&body[..]).is_err());
    }

    #[test]
    fn into_report_extends_seq() {
        let mut reg = TwccRecvRegister::new(100);
        let now = Instant::now();
        reg.update_seq(65_535.into(), now);
        reg.update_seq(65_536.into(), now + Duration::from_millis(1));
        let twcc = reg.build_report(1000).unwrap();

        let report = twcc.into_report(|space, s| {
            assert!(space.is_none());
            crate::rtp::extend_u16(65_530, s).into()
        });
        let seqs: Vec<_> = report.packets.iter().map(|p| *p.seq).collect();
        assert_eq!(seqs, vec![65_535, 65_536]);
    }

    #[test]
    fn generator_interval_and_count() {
        let mut gen = TwccGenerator::new(1.into(), Duration::from_millis(100));
        let now = Instant::now();

        let mut header = RtpHeader {
            marker: false,
            payload_type: 96,
            sequence_number: 0,
            timestamp: 0,
            ssrc: 7.into(),
            transport_cc: None,
            header_len: 12,
        };

        // No extension, nothing to report.
        gen.on_packet(&header, now);
        assert!(!gen.is_feedback_due(now));

        header.transport_cc = Some(0);
        gen.on_packet(&header, now);
        assert!(gen.poll_feedback(now).is_some());

        header.transport_cc = Some(1);
        gen.on_packet(&header, now + Duration::from_millis(10));
        assert!(gen.poll_feedback(now + Duration::from_millis(10)).is_none());
        assert!(gen.poll_feedback(now + Duration::from_millis(100)).is_some());

        let t = now + Duration::from_millis(110);
        for i in 2..(2 + REPORT_EVERY_PACKETS as u16) {
            header.transport_cc = Some(i);
            gen.on_packet(&header, t);
        }
        let buf = gen.poll_feedback(t).unwrap();
        let fb = Feedback::parse(&buf).unwrap();
        match &fb[0] {
            Feedback::Twcc(v) => {
                assert_eq!(v.ssrc, 7.into());
                assert_eq!(v.sender_ssrc, 1.into());
                assert_eq!(v.status_count as usize, REPORT_EVERY_PACKETS);
            }
            _ => panic!("expected twcc"),
        }
    }
}
