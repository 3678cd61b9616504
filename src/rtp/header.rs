#![allow(clippy::unusual_byte_groupings)]

use super::Ssrc;

/// "Defined by profile" value of the one-byte header extension form, RFC 8285.
const ONE_BYTE_FORM: u16 = 0xbede;
/// Two-byte form. The low 4 bits are "appbits", which we ignore.
const TWO_BYTE_FORM: u16 = 0x1000;

/// The parts of an RTP header the feedback loop needs.
///
/// This is a view, not a full codec. CSRC lists and extensions other than the
/// transport-wide sequence number are skipped over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    /// For video, this marker signifies the end of a series of packets that
    /// together form a single video frame.
    pub marker: bool,
    /// Type of payload being carried.
    pub payload_type: u8,
    /// Sequence number increasing by 1 for each RTP packet.
    pub sequence_number: u16,
    /// Timestamp in media time.
    pub timestamp: u32,
    /// Sender source identifier.
    pub ssrc: Ssrc,
    /// Transport-wide sequence number, if the extension is present.
    pub transport_cc: Option<u16>,
    /// Length of header including extensions.
    pub header_len: usize,
}

impl RtpHeader {
    /// Parse the header of an RTP packet.
    ///
    /// `twcc_id` is the negotiated extension id of the transport-wide sequence number.
    pub fn parse(buf: &[u8], twcc_id: Option<u8>) -> Option<RtpHeader> {
        let orig_len = buf.len();
        if buf.len() < 12 {
            trace!("RTP header too short < 12: {}", buf.len());
            return None;
        }

        let version = (buf[0] & 0b1100_0000) >> 6;
        if version != 2 {
            trace!("RTP version is not 2");
            return None;
        }
        let has_extension = buf[0] & 0b0001_0000 > 0;
        let csrc_count = (buf[0] & 0b0000_1111) as usize;
        let marker = buf[1] & 0b1000_0000 > 0;
        let payload_type = buf[1] & 0b0111_1111;
        let sequence_number = u16::from_be_bytes([buf[2], buf[3]]);
        let timestamp = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let ssrc = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);

        let buf = &buf[12..];

        let csrc_len = 4 * csrc_count;
        if buf.len() < csrc_len {
            trace!("RTP header invalid, not enough csrc");
            return None;
        }
        let buf = &buf[csrc_len..];

        let mut transport_cc = None;

        let rest = if !has_extension {
            buf
        } else {
            if buf.len() < 4 {
                trace!("RTP bad header extension");
                return None;
            }
            let form = u16::from_be_bytes([buf[0], buf[1]]);
            let ext_len = u16::from_be_bytes([buf[2], buf[3]]) as usize * 4;
            let buf = &buf[4..];

            if buf.len() < ext_len {
                trace!("RTP ext len larger than header {} > {}", ext_len, buf.len());
                return None;
            }

            if let Some(id) = twcc_id {
                transport_cc = find_transport_cc(&buf[..ext_len], form, id);
            }

            &buf[ext_len..]
        };

        Some(RtpHeader {
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc: ssrc.into(),
            transport_cc,
            header_len: orig_len - rest.len(),
        })
    }

    /// Write the header, including a one-byte extension block carrying the transport-wide
    /// sequence number if `transport_cc` is set.
    ///
    /// Returns the number of bytes written. `buf` must have room for 20 bytes.
    pub fn write_to(&self, buf: &mut [u8], twcc_id: u8) -> usize {
        let has_ext = self.transport_cc.is_some();

        buf[0] = 0b10_0_0_0000 | if has_ext { 1 << 4 } else { 0 };
        buf[1] = self.payload_type & 0b0111_1111 | if self.marker { 1 << 7 } else { 0 };
        buf[2..4].copy_from_slice(&self.sequence_number.to_be_bytes());
        buf[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[8..12].copy_from_slice(&self.ssrc.to_be_bytes());

        let Some(seq) = self.transport_cc else {
            return 12;
        };

        buf[12..14].copy_from_slice(&ONE_BYTE_FORM.to_be_bytes());
        // One word: 3 bytes element + 1 byte padding.
        buf[14..16].copy_from_slice(&1_u16.to_be_bytes());
        TransportSequence(seq).write_to(&mut buf[16..], twcc_id);
        buf[19] = 0;

        20
    }
}

/// The transport-wide sequence number header extension.
///
/// <https://datatracker.ietf.org/doc/html/draft-holmer-rmcat-transport-wide-cc-extensions-01>
///
/// ```text
///  0                   1                   2
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |  ID   | L=1   |transport-wide sequence number |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportSequence(pub u16);

impl TransportSequence {
    /// Write the one-byte form element. Returns 3.
    pub fn write_to(&self, buf: &mut [u8], id: u8) -> usize {
        buf[0] = (id << 4) | 1;
        buf[1..3].copy_from_slice(&self.0.to_be_bytes());
        3
    }

    /// The serialized element.
    pub fn to_bytes(&self, id: u8) -> [u8; 3] {
        let mut buf = [0; 3];
        self.write_to(&mut buf, id);
        buf
    }
}

fn find_transport_cc(mut buf: &[u8], form: u16, want: u8) -> Option<u16> {
    let two_byte = if form == ONE_BYTE_FORM {
        false
    } else if form & 0xfff0 == TWO_BYTE_FORM {
        true
    } else {
        trace!("Ignoring unknown RTP header extensions form: {:x}", form);
        return None;
    };

    loop {
        if buf.is_empty() {
            return None;
        }

        if buf[0] == 0 {
            // padding
            buf = &buf[1..];
            continue;
        }

        let (id, len, hlen) = if two_byte {
            if buf.len() < 2 {
                return None;
            }
            (buf[0], buf[1] as usize, 2)
        } else {
            let id = buf[0] >> 4;
            if id == 15 {
                // Reserved, stop parsing.
                return None;
            }
            (id, (buf[0] & 0xf) as usize + 1, 1)
        };

        if buf.len() < hlen + len {
            trace!("Not enough ext header len: {} < {}", buf.len(), hlen + len);
            return None;
        }

        let value = &buf[hlen..hlen + len];
        if id == want && len == 2 {
            return Some(u16::from_be_bytes([value[0], value[1]]));
        }

        buf = &buf[hlen + len..];
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn transport_sequence_element() {
        assert_eq!(TransportSequence(0x1234).to_bytes(3), [0x31, 0x12, 0x34]);
    }

    #[test]
    fn write_then_parse() {
        let h = RtpHeader {
            marker: true,
            payload_type: 96,
            sequence_number: 4711,
            timestamp: 90_000,
            ssrc: 42.into(),
            transport_cc: Some(65_535),
            header_len: 20,
        };

        let mut buf = [0; 20];
        let n = h.write_to(&mut buf, 5);
        assert_eq!(n, 20);

        let parsed = RtpHeader::parse(&buf, Some(5)).unwrap();
        assert_eq!(parsed, h);
    }

    #[test]
    fn parse_skips_other_extensions() {
        #[rustfmt::skip]
        let buf = [
            0x90, 0x60, 0x00, 0x01,
            0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x07,
            0xbe, 0xde, 0x00, 0x02,
            // id 1, len 4
            0x13, 0xaa, 0xbb, 0xcc,
            0xdd,
            // id 2, len 2
            0x21, 0x00, 0x09,
            // payload
            0xff,
        ];

        let h = RtpHeader::parse(&buf, Some(2)).unwrap();
        assert_eq!(h.transport_cc, Some(9));
        assert_eq!(h.ssrc, 7.into());
        assert_eq!(h.header_len, 24);
        assert!(!h.marker);

        let h = RtpHeader::parse(&buf, Some(3)).unwrap();
        assert_eq!(h.transport_cc, None);
    }

    #[test]
    fn parse_two_byte_form() {
        #[rustfmt::skip]
        let buf = [
            0x90, 0xe0, 0x00, 0x01,
            0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x07,
            0x10, 0x00, 0x00, 0x01,
            0x04, 0x02, 0x01, 0x02,
        ];

        let h = RtpHeader::parse(&buf, Some(4)).unwrap();
        assert_eq!(h.transport_cc, Some(0x0102));
        assert!(h.marker);
    }

    #[test]
    fn parse_short() {
        assert!(RtpHeader::parse(&[0x80, 0x60, 0x00], None).is_none());
        // version 1
        assert!(RtpHeader::parse(&[0x40; 12], None).is_none());
    }
}
