//! Congestion control feedback.
//!
//! Two wire formats are supported, both carried as RTCP transport layer feedback (PT=205):
//!
//! * Transport-wide congestion control, FMT=15, [draft-holmer-rmcat-transport-wide-cc-extensions-01][twcc].
//!   Reports on a single transport-wide sequence number carried in an RTP header extension.
//! * RTP Control Protocol Feedback for Congestion Control, FMT=11, [RFC 8888][ccfb].
//!   Reports per SSRC on the RTP sequence numbers, including ECN marks.
//!
//! The receiving side collects arrivals in a [`FeedbackGenerator`]. The sending side
//! decodes with [`Feedback::parse`] and turns the result into a [`FeedbackReport`], which is
//! what the estimators consume.
//!
//! [twcc]: https://datatracker.ietf.org/doc/html/draft-holmer-rmcat-transport-wide-cc-extensions-01
//! [ccfb]: https://www.rfc-editor.org/rfc/rfc8888

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::rtp::{RtpHeader, SeqNo, Ssrc};

mod twcc;
pub use twcc::{Delta, PacketChunk, PacketStatus, Twcc, TwccGenerator, TwccRecvRegister};

mod ccfb;
pub use ccfb::{Ccfb, CcfbBlock, CcfbMetric, CcfbRecvRegister};

/// RTCP_PT_RTPFB, <https://tools.ietf.org/html/rfc4585>
const PT_TRANSPORT_FEEDBACK: u8 = 205;
const FMT_CCFB: u8 = 11;
const FMT_TWCC: u8 = 15;

/// Errors decoding feedback.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeedbackError {
    /// The data is truncated or invalid.
    #[error("malformed feedback: {0}")]
    Malformed(&'static str),
}

/// Which feedback format is used in a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackFormat {
    /// Transport-wide congestion control.
    Twcc,
    /// RFC 8888 congestion control feedback.
    Ccfb,
}

/// Explicit congestion notification codepoint, RFC 3168.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Ecn {
    /// Not ECN-capable transport.
    #[default]
    NotEct = 0b00,
    /// ECN capable, codepoint 1.
    Ect1 = 0b01,
    /// ECN capable, codepoint 0.
    Ect0 = 0b10,
    /// Congestion experienced.
    Ce = 0b11,
}

impl From<u8> for Ecn {
    fn from(v: u8) -> Self {
        match v & 0b11 {
            0b00 => Ecn::NotEct,
            0b01 => Ecn::Ect1,
            0b10 => Ecn::Ect0,
            _ => Ecn::Ce,
        }
    }
}

/// Decoded feedback about one or more sent packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedbackReport {
    /// Format this report was decoded from.
    pub format: FeedbackFormat,
    /// Sender of the feedback.
    pub sender_ssrc: Ssrc,
    /// One entry per reported packet, in sequence order.
    pub packets: Vec<PacketReport>,
    /// Time the report was produced, on the remote clock.
    pub report_time: Option<Duration>,
}

/// Feedback for a single packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketReport {
    /// Media stream. For TWCC, this is the media SSRC field of the feedback packet.
    pub ssrc: Ssrc,
    /// Extended sequence number. Transport-wide for TWCC, RTP for RFC 8888.
    pub seq: SeqNo,
    /// Arrival time on the remote clock, `None` if the packet is reported lost.
    pub arrival: Option<Duration>,
    /// ECN mark the packet arrived with.
    pub ecn: Ecn,
}

impl PacketReport {
    /// Whether the remote received the packet.
    pub fn is_received(&self) -> bool {
        self.arrival.is_some()
    }
}

impl FeedbackReport {
    /// Highest reported sequence number in each sequence space.
    ///
    /// TWCC has a single transport-wide space (`None`), RFC 8888 has one per SSRC.
    pub fn highest_seqs(&self) -> Vec<(Option<Ssrc>, SeqNo)> {
        let mut out: Vec<(Option<Ssrc>, SeqNo)> = vec![];
        for p in &self.packets {
            let space = match self.format {
                FeedbackFormat::Twcc => None,
                FeedbackFormat::Ccfb => Some(p.ssrc),
            };
            match out.iter_mut().find(|(s, _)| *s == space) {
                Some((_, seq)) => *seq = (*seq).max(p.seq),
                None => out.push((space, p.seq)),
            }
        }
        out
    }

    /// Number of packets reported lost.
    pub fn lost_count(&self) -> usize {
        self.packets.iter().filter(|p| !p.is_received()).count()
    }
}

/// Feedback packets found in an RTCP compound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Feedback {
    /// Transport-wide congestion control.
    Twcc(Twcc),
    /// RFC 8888.
    Ccfb(Ccfb),
}

impl Feedback {
    /// Parse all feedback packets in an RTCP compound packet.
    ///
    /// RTCP packets that are not congestion control feedback are skipped.
    pub fn parse(mut buf: &[u8]) -> Result<Vec<Feedback>, FeedbackError> {
        let mut out = vec![];

        while !buf.is_empty() {
            let header = RtcpHeader::parse(buf)?;

            let full_length = header.length_words * 4;
            if full_length > buf.len() {
                return Err(FeedbackError::Malformed("RTCP length larger than buffer"));
            }

            let unpadded_length = if header.has_padding {
                let pad = buf[full_length - 1] as usize;
                if pad == 0 || full_length < 4 + pad {
                    return Err(FeedbackError::Malformed("RTCP padding larger than packet"));
                }
                full_length - pad
            } else {
                full_length
            };

            let body = &buf[4..unpadded_length];

            match (header.packet_type, header.fmt) {
                (PT_TRANSPORT_FEEDBACK, FMT_TWCC) => {
                    let twcc = Twcc::try_from(body).map_err(FeedbackError::Malformed)?;
                    out.push(Feedback::Twcc(twcc));
                }
                (PT_TRANSPORT_FEEDBACK, FMT_CCFB) => {
                    let ccfb = Ccfb::try_from(body).map_err(FeedbackError::Malformed)?;
                    out.push(Feedback::Ccfb(ccfb));
                }
                (pt, fmt) => {
                    trace!("Skip RTCP packet PT={} FMT={}", pt, fmt);
                }
            }

            buf = &buf[full_length..];
        }

        Ok(out)
    }

    /// Convert to a report.
    ///
    /// `extend` maps a 16 bit sequence number on the wire to the extended sequence number
    /// of the sent packet. It is given the SSRC for RFC 8888, and `None` for the
    /// transport-wide sequence of TWCC.
    pub fn into_report(self, extend: impl FnMut(Option<Ssrc>, u16) -> SeqNo) -> FeedbackReport {
        match self {
            Feedback::Twcc(v) => v.into_report(extend),
            Feedback::Ccfb(v) => v.into_report(extend),
        }
    }
}

/// Common RTCP header.
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|   FMT   |       PT      |             length            |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RtcpHeader {
    pub has_padding: bool,
    pub fmt: u8,
    pub packet_type: u8,
    /// Total length in words, including the header.
    pub length_words: usize,
}

impl RtcpHeader {
    fn parse(buf: &[u8]) -> Result<Self, FeedbackError> {
        if buf.len() < 4 {
            return Err(FeedbackError::Malformed("RTCP header too short"));
        }

        let version = (buf[0] & 0b1100_0000) >> 6;
        if version != 2 {
            return Err(FeedbackError::Malformed("RTCP version is not 2"));
        }

        // https://tools.ietf.org/html/rfc3550#section-6.4.1
        //   The length of this RTCP packet in 32-bit words minus one,
        //   including the header and any padding.
        let length = u16::from_be_bytes([buf[2], buf[3]]) as usize + 1;

        Ok(RtcpHeader {
            has_padding: buf[0] & 0b0010_0000 > 0,
            fmt: buf[0] & 0b0001_1111,
            packet_type: buf[1],
            length_words: length,
        })
    }

    fn transport_feedback(fmt: u8, length_words: usize) -> Self {
        RtcpHeader {
            has_padding: false,
            fmt,
            packet_type: PT_TRANSPORT_FEEDBACK,
            length_words,
        }
    }

    fn write_to(&self, buf: &mut [u8]) -> usize {
        buf[0] = 0b10_0_00000 | self.fmt;
        if self.has_padding {
            buf[0] |= 0b00_1_00000;
        }
        buf[1] = self.packet_type;
        let words_less_one = (self.length_words - 1) as u16;
        buf[2..4].copy_from_slice(&words_less_one.to_be_bytes());
        4
    }
}

/// An RTCP packet we can serialize.
pub trait RtcpPacket {
    /// Length of the entire packet in 32 bit words, including header.
    fn length_words(&self) -> usize;

    /// Write the packet. `buf` must be at least `length_words() * 4` long.
    fn write_to(&self, buf: &mut [u8]) -> usize;

    /// Serialize into a new buffer.
    fn to_vec(&self) -> Vec<u8> {
        let mut buf = vec![0; self.length_words() * 4];
        let n = self.write_to(&mut buf);
        buf.truncate(n);
        buf
    }
}

/// Produces outgoing feedback on the receiving side.
#[derive(Debug)]
pub enum FeedbackGenerator {
    /// Transport-wide congestion control.
    Twcc(TwccGenerator),
    /// RFC 8888.
    Ccfb(CcfbRecvRegister),
}

impl FeedbackGenerator {
    /// New generator of the given format.
    ///
    /// `interval` is the longest time between two reports while packets are arriving.
    pub fn new(format: FeedbackFormat, sender_ssrc: Ssrc, interval: Duration) -> Self {
        match format {
            FeedbackFormat::Twcc => FeedbackGenerator::Twcc(TwccGenerator::new(sender_ssrc, interval)),
            FeedbackFormat::Ccfb => {
                FeedbackGenerator::Ccfb(CcfbRecvRegister::new(sender_ssrc, interval))
            }
        }
    }

    /// Format of the produced feedback.
    pub fn format(&self) -> FeedbackFormat {
        match self {
            FeedbackGenerator::Twcc(_) => FeedbackFormat::Twcc,
            FeedbackGenerator::Ccfb(_) => FeedbackFormat::Ccfb,
        }
    }

    /// Record an incoming RTP packet.
    pub fn on_packet(&mut self, header: &RtpHeader, ecn: Ecn, now: Instant) {
        match self {
            FeedbackGenerator::Twcc(v) => v.on_packet(header, now),
            FeedbackGenerator::Ccfb(v) => v.receive(
                now,
                header.ssrc,
                header.sequence_number,
                ecn,
                header.marker,
            ),
        }
    }

    /// Whether a report should be sent now.
    pub fn is_feedback_due(&self, now: Instant) -> bool {
        match self {
            FeedbackGenerator::Twcc(v) => v.is_feedback_due(now),
            FeedbackGenerator::Ccfb(v) => v.is_feedback(now),
        }
    }

    /// Produce a serialized report if one is due.
    pub fn poll_feedback(&mut self, now: Instant) -> Option<Vec<u8>> {
        match self {
            FeedbackGenerator::Twcc(v) => v.poll_feedback(now),
            FeedbackGenerator::Ccfb(v) => {
                let is_mark = v.mark_pending();
                let (created, buf) = v.create_feedback(now, is_mark);
                created.then_some(buf)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_skips_unknown() {
        // A receiver report (PT=201) with no report blocks.
        let rr = [0x80, 201, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01];
        assert_eq!(Feedback::parse(&rr).unwrap(), vec![]);
    }

    #[test]
    fn parse_truncated() {
        let rr = [0x80, 201, 0x00, 0x02, 0x00, 0x00, 0x00, 0x01];
        assert_eq!(
            Feedback::parse(&rr),
            Err(FeedbackError::Malformed("RTCP length larger than buffer"))
        );
        assert!(Feedback::parse(&[0x80]).is_err());
        assert!(Feedback::parse(&[0x40, 201, 0, 0]).is_err());
    }

    #[test]
    fn ecn_from_bits() {
        assert_eq!(Ecn::from(0), Ecn::NotEct);
        assert_eq!(Ecn::from(1), Ecn::Ect1);
        assert_eq!(Ecn::from(2), Ecn::Ect0);
        assert_eq!(Ecn::from(3), Ecn::Ce);
    }

    #[test]
    fn highest_seqs_by_space() {
        let p = |ssrc: u32, seq: u64| PacketReport {
            ssrc: ssrc.into(),
            seq: seq.into(),
            arrival: None,
            ecn: Ecn::NotEct,
        };
        let mut r = FeedbackReport {
            format: FeedbackFormat::Ccfb,
            sender_ssrc: 1.into(),
            packets: vec![p(1, 10), p(1, 12), p(2, 3)],
            report_time: None,
        };
        assert_eq!(
            r.highest_seqs(),
            vec![(Some(1.into()), 12.into()), (Some(2.into()), 3.into())]
        );
        assert_eq!(r.lost_count(), 3);

        r.format = FeedbackFormat::Twcc;
        assert_eq!(r.highest_seqs(), vec![(None, 12.into())]);
    }
}
