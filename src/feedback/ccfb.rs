use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use super::{Ecn, FeedbackFormat, FeedbackReport, PacketReport, RtcpHeader, RtcpPacket, FMT_CCFB};
use crate::rtp::{SeqNo, SeqUnwrapper, Ssrc};

/// Arrivals kept per SSRC. Every report covers this window, so a lost report is
/// covered by the next one.
const TRACE_LEN: u64 = 64;

/// Report after this many unreported packets regardless of interval.
const ACK_EVERY: usize = 16;

/// RFC 8888 limits a block to 16384 reports.
const MAX_REPORTS: usize = 16384;

/// Arrival time offset, "over-range".
const ATO_OVER_RANGE: u16 = 0x1ffe;
/// Arrival time offset, "unavailable".
const ATO_UNAVAILABLE: u16 = 0x1fff;

/// RTCP Feedback for Congestion Control, RFC 8888.
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P| FMT=11  |   PT = 205    |          length               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                 SSRC of RTCP packet sender                    |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                   SSRC of 1st RTP Stream                      |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |          begin_seq            |          num_reports          |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |R|ECN|  Arrival time offset    | ...                           .
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// .                                                               .
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                 Report Timestamp (32 bits)                    |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ccfb {
    /// Sender of this feedback.
    pub sender_ssrc: Ssrc,
    /// One block per reported RTP stream.
    pub blocks: Vec<CcfbBlock>,
    /// Middle 32 bits of an NTP timestamp, i.e. 16.16 fixed point seconds.
    pub report_timestamp: u32,
}

/// Reports for one RTP stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CcfbBlock {
    /// The reported stream.
    pub ssrc: Ssrc,
    /// Sequence number of the first metric.
    pub begin_seq: u16,
    /// One entry per sequence number from `begin_seq`.
    pub metrics: Vec<CcfbMetric>,
}

/// Per packet metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CcfbMetric {
    /// Whether the packet was received.
    pub received: bool,
    /// ECN mark on arrival.
    pub ecn: Ecn,
    /// Arrival time offset before the report timestamp, in 1/1024 s. 13 bits.
    pub ato: u16,
}

impl CcfbMetric {
    const LOST: CcfbMetric = CcfbMetric {
        received: false,
        ecn: Ecn::NotEct,
        ato: 0,
    };

    fn received(ecn: Ecn, offset: Duration) -> Self {
        let ato = (offset.as_secs_f64() * 1024.0).round();
        let ato = if ato >= ATO_OVER_RANGE as f64 {
            ATO_OVER_RANGE
        } else {
            ato as u16
        };
        CcfbMetric {
            received: true,
            ecn,
            ato,
        }
    }

    fn to_u16(self) -> u16 {
        if !self.received {
            return 0;
        }
        (1 << 15) | ((self.ecn as u16) << 13) | (self.ato & 0x1fff)
    }

    fn from_u16(v: u16) -> Self {
        CcfbMetric {
            received: v & (1 << 15) > 0,
            ecn: Ecn::from((v >> 13) as u8),
            ato: v & 0x1fff,
        }
    }

    /// Time before the report timestamp the packet arrived.
    ///
    /// "Unavailable" is reported as zero, i.e. the packet arrived at the latest at report
    /// time. "Over-range" is the largest representable offset.
    pub fn offset(&self) -> Duration {
        if self.ato == ATO_UNAVAILABLE {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.ato as f64 / 1024.0)
    }
}

impl CcfbBlock {
    fn byte_len(&self) -> usize {
        // ssrc + begin_seq/num_reports + metrics padded to word.
        8 + (self.metrics.len() * 2 + 3) / 4 * 4
    }
}

impl Ccfb {
    /// The report timestamp as a time since the reporter's time base.
    pub fn report_time(&self) -> Duration {
        ntp32_to_duration(self.report_timestamp)
    }

    /// Convert to a report.
    ///
    /// `extend` receives the SSRC and the 16 bit `begin_seq` of each block, and should give
    /// back the extended RTP sequence number of the sent packet.
    pub fn into_report(self, mut extend: impl FnMut(Option<Ssrc>, u16) -> SeqNo) -> FeedbackReport {
        let report_time = self.report_time();
        let mut packets = vec![];

        for block in self.blocks {
            let begin = *extend(Some(block.ssrc), block.begin_seq);

            for (i, m) in block.metrics.iter().enumerate() {
                let arrival = m.received.then(|| report_time.saturating_sub(m.offset()));
                packets.push(PacketReport {
                    ssrc: block.ssrc,
                    seq: (begin + i as u64).into(),
                    arrival,
                    ecn: if m.received { m.ecn } else { Ecn::NotEct },
                });
            }
        }

        FeedbackReport {
            format: FeedbackFormat::Ccfb,
            sender_ssrc: self.sender_ssrc,
            packets,
            report_time: Some(report_time),
        }
    }
}

impl RtcpPacket for Ccfb {
    fn length_words(&self) -> usize {
        // header + sender ssrc + blocks + report timestamp
        let blocks: usize = self.blocks.iter().map(|b| b.byte_len()).sum();
        2 + blocks / 4 + 1
    }

    fn write_to(&self, buf: &mut [u8]) -> usize {
        let words = self.length_words();
        RtcpHeader::transport_feedback(FMT_CCFB, words).write_to(buf);
        buf[4..8].copy_from_slice(&self.sender_ssrc.to_be_bytes());

        let mut offset = 8;
        for block in &self.blocks {
            buf[offset..offset + 4].copy_from_slice(&block.ssrc.to_be_bytes());
            buf[offset + 4..offset + 6].copy_from_slice(&block.begin_seq.to_be_bytes());
            let n = block.metrics.len() as u16;
            buf[offset + 6..offset + 8].copy_from_slice(&n.to_be_bytes());
            offset += 8;

            for m in &block.metrics {
                buf[offset..offset + 2].copy_from_slice(&m.to_u16().to_be_bytes());
                offset += 2;
            }

            if block.metrics.len() % 2 == 1 {
                buf[offset..offset + 2].fill(0);
                offset += 2;
            }
        }

        buf[offset..offset + 4].copy_from_slice(&self.report_timestamp.to_be_bytes());
        offset += 4;

        debug_assert_eq!(offset, words * 4);
        offset
    }
}

impl<'a> TryFrom<&'a [u8]> for Ccfb {
    type Error = &'static str;

    fn try_from(buf: &'a [u8]) -> Result<Self, Self::Error> {
        if buf.len() < 8 {
            return Err("Less than 8 bytes for Ccfb");
        }
        if buf.len() % 4 != 0 {
            return Err("Ccfb not word aligned");
        }

        let sender_ssrc = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]).into();

        let ts = &buf[buf.len() - 4..];
        let report_timestamp = u32::from_be_bytes([ts[0], ts[1], ts[2], ts[3]]);

        let mut buf = &buf[4..buf.len() - 4];
        let mut blocks = vec![];

        while !buf.is_empty() {
            if buf.len() < 8 {
                return Err("Less than 8 bytes for Ccfb block");
            }

            let ssrc = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]).into();
            let begin_seq = u16::from_be_bytes([buf[4], buf[5]]);
            let num_reports = u16::from_be_bytes([buf[6], buf[7]]) as usize;

            if num_reports > MAX_REPORTS {
                return Err("Ccfb num_reports larger than 16384");
            }

            let metrics_len = (num_reports * 2 + 3) / 4 * 4;
            let rest = &buf[8..];
            if rest.len() < metrics_len {
                return Err("Not enough buf for Ccfb metrics");
            }

            let metrics = rest[..num_reports * 2]
                .chunks_exact(2)
                .map(|c| CcfbMetric::from_u16(u16::from_be_bytes([c[0], c[1]])))
                .collect();

            blocks.push(CcfbBlock {
                ssrc,
                begin_seq,
                metrics,
            });

            buf = &rest[metrics_len..];
        }

        Ok(Ccfb {
            sender_ssrc,
            blocks,
            report_timestamp,
        })
    }
}

fn duration_to_ntp32(d: Duration) -> u32 {
    let secs = (d.as_secs() & 0xffff) as u32;
    let frac = ((d.subsec_nanos() as u64) << 16) / 1_000_000_000;
    (secs << 16) | frac as u32
}

fn ntp32_to_duration(v: u32) -> Duration {
    let secs = (v >> 16) as u64;
    let frac = ((v & 0xffff) as u64 * 1_000_000_000) >> 16;
    Duration::new(secs, frac as u32)
}

#[derive(Debug)]
struct StreamTrace {
    ssrc: Ssrc,
    unwrapper: SeqUnwrapper,
    arrivals: BTreeMap<u64, (Instant, Ecn)>,
}

impl StreamTrace {
    fn new(ssrc: Ssrc) -> Self {
        StreamTrace {
            ssrc,
            unwrapper: SeqUnwrapper::new(),
            arrivals: BTreeMap::new(),
        }
    }

    /// True if the arrival was recorded.
    fn record(&mut self, seq: u16, ecn: Ecn, now: Instant) -> bool {
        let seq = *self.unwrapper.unwrap(seq);
        let highest = self.unwrapper.highest().map(|v| *v).unwrap_or(seq);
        let lowest = (highest + 1).saturating_sub(TRACE_LEN);

        if seq < lowest || self.arrivals.contains_key(&seq) {
            return false;
        }

        self.arrivals.insert(seq, (now, ecn));

        // Keep only the rolling window.
        while let Some((&first, _)) = self.arrivals.first_key_value() {
            if first >= lowest {
                break;
            }
            self.arrivals.remove(&first);
        }

        true
    }

    fn block(&self, now: Instant) -> Option<CcfbBlock> {
        let (&begin, _) = self.arrivals.first_key_value()?;
        let (&end, _) = self.arrivals.last_key_value()?;

        let metrics = (begin..=end)
            .map(|seq| match self.arrivals.get(&seq) {
                Some((at, ecn)) => CcfbMetric::received(*ecn, now.saturating_duration_since(*at)),
                None => CcfbMetric::LOST,
            })
            .collect();

        Some(CcfbBlock {
            ssrc: self.ssrc,
            begin_seq: begin as u16,
            metrics,
        })
    }
}

/// Receiving side of RFC 8888.
///
/// Keeps a rolling per-SSRC trace of arrivals (sequence number, ECN, arrival time) and
/// turns it into feedback packets.
#[derive(Debug)]
pub struct CcfbRecvRegister {
    sender_ssrc: Ssrc,
    interval: Duration,
    time_base: Option<Instant>,
    streams: Vec<StreamTrace>,
    last_feedback: Option<Instant>,
    unreported: usize,
    mark_pending: bool,
}

impl CcfbRecvRegister {
    /// New register sending feedback as `sender_ssrc`, at least every `interval` while
    /// packets arrive.
    pub fn new(sender_ssrc: Ssrc, interval: Duration) -> Self {
        CcfbRecvRegister {
            sender_ssrc,
            interval,
            time_base: None,
            streams: vec![],
            last_feedback: None,
            unreported: 0,
            mark_pending: false,
        }
    }

    /// Record an arriving RTP packet.
    ///
    /// `is_mark` is the RTP marker bit. A frame ending makes feedback due.
    pub fn receive(&mut self, now: Instant, ssrc: Ssrc, seq: u16, ecn: Ecn, is_mark: bool) {
        self.time_base.get_or_insert(now);

        let idx = match self.streams.iter().position(|s| s.ssrc == ssrc) {
            Some(idx) => idx,
            None => {
                self.streams.push(StreamTrace::new(ssrc));
                self.streams.len() - 1
            }
        };

        if self.streams[idx].record(seq, ecn, now) {
            self.unreported += 1;
            self.mark_pending |= is_mark;
        } else {
            trace!("Ignore duplicate or too old {} {}", ssrc, seq);
        }
    }

    /// Whether feedback should be sent now.
    pub fn is_feedback(&self, now: Instant) -> bool {
        if self.unreported == 0 {
            return false;
        }
        if self.mark_pending || self.unreported >= ACK_EVERY {
            return true;
        }
        match self.last_feedback {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.interval,
        }
    }

    /// Create a feedback packet.
    ///
    /// With `is_mark` set, feedback is created as soon as there is anything unreported.
    /// Otherwise only when [`CcfbRecvRegister::is_feedback`] says so. Returns whether a
    /// packet was created, and the packet.
    pub fn create_feedback(&mut self, now: Instant, is_mark: bool) -> (bool, Vec<u8>) {
        if self.unreported == 0 || !(is_mark || self.is_feedback(now)) {
            return (false, vec![]);
        }

        let Some(time_base) = self.time_base else {
            return (false, vec![]);
        };

        let ccfb = Ccfb {
            sender_ssrc: self.sender_ssrc,
            blocks: self.streams.iter().filter_map(|s| s.block(now)).collect(),
            report_timestamp: duration_to_ntp32(now.saturating_duration_since(time_base)),
        };

        self.unreported = 0;
        self.mark_pending = false;
        self.last_feedback = Some(now);

        trace!("Created CCFB with {} blocks", ccfb.blocks.len());

        (true, ccfb.to_vec())
    }

    pub(crate) fn mark_pending(&self) -> bool {
        self.mark_pending
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::feedback::Feedback;

    fn parse_one(buf: &[u8]) -> Ccfb {
        match Feedback::parse(buf).unwrap().pop() {
            Some(Feedback::Ccfb(v)) => v,
            v => panic!("Expected ccfb: {:?}", v),
        }
    }

    #[test]
    fn ntp32_conversion() {
        let d = Duration::from_millis(1_500);
        let v = duration_to_ntp32(d);
        assert_eq!(v, (1 << 16) | 0x8000);
        assert_eq!(ntp32_to_duration(v), d);
    }

    #[test]
    fn metric_bits() {
        let m = CcfbMetric::received(Ecn::Ce, Duration::from_millis(500));
        assert_eq!(m.ato, 512);
        assert_eq!(m.to_u16(), 0b1_11_0_0010_0000_0000);
        assert_eq!(CcfbMetric::from_u16(m.to_u16()), m);

        let m = CcfbMetric::received(Ecn::NotEct, Duration::from_secs(10));
        assert_eq!(m.ato, ATO_OVER_RANGE);

        assert_eq!(CcfbMetric::LOST.to_u16(), 0);

        let m = CcfbMetric::from_u16(0x8000 | ATO_UNAVAILABLE);
        assert_eq!(m.offset(), Duration::ZERO);
    }

    #[test]
    fn odd_number_of_reports_is_padded() {
        let ccfb = Ccfb {
            sender_ssrc: 1.into(),
            blocks: vec![CcfbBlock {
                ssrc: 2.into(),
                begin_seq: 65_535,
                metrics: vec![
                    CcfbMetric::received(Ecn::Ect0, Duration::from_millis(10)),
                    CcfbMetric::LOST,
                    CcfbMetric::received(Ecn::Ce, Duration::ZERO),
                ],
            }],
            report_timestamp: 0x0001_0000,
        };

        let buf = ccfb.to_vec();
        // header 4 + sender 4 + block 8 + 3 metrics 6 + pad 2 + ts 4
        assert_eq!(buf.len(), 28);
        assert_eq!(buf[0] & 0b0001_1111, 11);
        assert_eq!(buf[1], 205);

        assert_eq!(parse_one(&buf), ccfb);
    }

    #[test]
    fn into_report_arrivals() {
        let ccfb = Ccfb {
            sender_ssrc: 1.into(),
            blocks: vec![CcfbBlock {
                ssrc: 2.into(),
                begin_seq: 65_535,
                metrics: vec![
                    CcfbMetric::received(Ecn::Ect0, Duration::from_millis(250)),
                    CcfbMetric::LOST,
                ],
            }],
            report_timestamp: duration_to_ntp32(Duration::from_secs(2)),
        };

        let report = ccfb.into_report(|ssrc, s| {
            assert_eq!(ssrc, Some(2.into()));
            crate::rtp::extend_u16(65_530, s).into()
        });

        assert_eq!(report.format, FeedbackFormat::Ccfb);
        assert_eq!(report.packets.len(), 2);
        assert_eq!(*report.packets[0].seq, 65_535);
        assert_eq!(*report.packets[1].seq, 65_536);
        assert_eq!(report.packets[0].arrival, Some(Duration::from_millis(1_750)));
        assert_eq!(report.packets[0].ecn, Ecn::Ect0);
        assert_eq!(report.packets[1].arrival, None);
    }

    #[test]
    fn register_creates_feedback_with_gap() {
        let mut reg = CcfbRecvRegister::new(9.into(), Duration::from_millis(50));
        let now = Instant::now();

        reg.receive(now, 1.into(), 100, Ecn::Ect0, false);
        reg.receive(now + Duration::from_millis(5), 1.into(), 102, Ecn::Ce, false);
        reg.receive(now + Duration::from_millis(5), 2.into(), 7, Ecn::NotEct, false);

        let (created, buf) = reg.create_feedback(now + Duration::from_millis(10), false);
        assert!(created);

        let ccfb = parse_one(&buf);
        assert_eq!(ccfb.sender_ssrc, 9.into());
        // 16 bit fraction, resolution is ~15us.
        let skew = ccfb.report_time().as_micros() as i64 - 10_000;
        assert!(skew.abs() < 20, "skew: {}", skew);
        assert_eq!(ccfb.blocks.len(), 2);

        let b = &ccfb.blocks[0];
        assert_eq!(b.begin_seq, 100);
        let received: Vec<_> = b.metrics.iter().map(|m| m.received).collect();
        assert_eq!(received, vec![true, false, true]);
        assert_eq!(b.metrics[2].ecn, Ecn::Ce);
        // 5ms in 1/1024 s
        assert_eq!(b.metrics[2].ato, 5);

        // Nothing new.
        let (created, _) = reg.create_feedback(now + Duration::from_secs(1), true);
        assert!(!created);
    }

    #[test]
    fn register_triggers() {
        let mut reg = CcfbRecvRegister::new(9.into(), Duration::from_millis(50));
        let now = Instant::now();

        reg.receive(now, 1.into(), 0, Ecn::NotEct, false);
        assert!(reg.is_feedback(now));
        assert!(reg.create_feedback(now, false).0);

        reg.receive(now, 1.into(), 1, Ecn::NotEct, false);
        assert!(!reg.is_feedback(now + Duration::from_millis(10)));
        assert!(!reg.create_feedback(now + Duration::from_millis(10), false).0);
        assert!(reg.create_feedback(now + Duration::from_millis(10), true).0);

        reg.receive(now, 1.into(), 2, Ecn::NotEct, true);
        assert!(reg.is_feedback(now + Duration::from_millis(11)));
        assert!(reg.create_feedback(now + Duration::from_millis(11), false).0);

        for i in 3..(3 + ACK_EVERY as u16) {
            reg.receive(now, 1.into(), i, Ecn::NotEct, false);
        }
        assert!(reg.is_feedback(now + Duration::from_millis(12)));
    }

    #[test]
    fn trace_is_rolling() {
        let mut reg = CcfbRecvRegister::new(9.into(), Duration::from_millis(50));
        let now = Instant::now();

        for i in 0..200_u16 {
            reg.receive(now, 1.into(), i, Ecn::NotEct, false);
        }
        // Too old, outside the window.
        reg.receive(now, 1.into(), 3, Ecn::NotEct, false);

        let (_, buf) = reg.create_feedback(now, true);
        let ccfb = parse_one(&buf);
        assert_eq!(ccfb.blocks[0].begin_seq, 200 - TRACE_LEN as u16);
        assert_eq!(ccfb.blocks[0].metrics.len(), TRACE_LEN as usize);
    }

    #[test]
    fn malformed() {
        // Block claims 4 reports but has room for 2.
        #[rustfmt::skip]
        let body = [
            0, 0, 0, 1,
            0, 0, 0, 2,
            0, 0, 0, 4,
            0x80, 0, 0x80, 0,
            0, 0, 0, 0,
        ];
        assert!(Ccfb::try_from(&body[..]).is_err());
        assert!(Ccfb::try_from(&body[..6]).is_err());
    }
}
