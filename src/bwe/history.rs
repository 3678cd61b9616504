use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::feedback::{Ecn, FeedbackFormat, FeedbackReport};
use crate::rtp::{extend_u16, DataSize, SeqNo, Ssrc};

use super::SentPacket;

/// Sends older than this are forgotten, and no longer count as in flight.
const MAX_AGE: Duration = Duration::from_secs(2);

/// Upper bound on the number of remembered sends.
const MAX_RECORDS: usize = 8192;

/// How a packet is identified in feedback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum PacketId {
    /// Transport-wide sequence number (TWCC).
    Transport(SeqNo),
    /// Per-stream RTP sequence number (RFC 8888).
    Rtp(Ssrc, SeqNo),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordState {
    InFlight,
    Acked,
    Lost,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct SendRecord {
    /// Position in send order, starting at 1.
    pub number: u64,
    pub size: DataSize,
    pub sent_at: Instant,
    state: RecordState,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Outcome {
    Acked { arrival: Duration, ecn: Ecn },
    Lost,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct PacketResult {
    pub record: SendRecord,
    pub outcome: Outcome,
}

/// Bounded record of sent packets, used to match feedback to sends.
#[derive(Debug)]
pub struct SendHistory {
    format: FeedbackFormat,
    records: HashMap<PacketId, SendRecord>,
    order: VecDeque<PacketId>,
    bytes_in_flight: DataSize,
    last_number: u64,
    highest_transport: Option<SeqNo>,
    highest_rtp: HashMap<Ssrc, SeqNo>,
    last_processed: HashMap<Option<Ssrc>, SeqNo>,
}

impl SendHistory {
    pub(crate) fn new(format: FeedbackFormat) -> Self {
        SendHistory {
            format,
            records: HashMap::new(),
            order: VecDeque::new(),
            bytes_in_flight: DataSize::ZERO,
            last_number: 0,
            highest_transport: None,
            highest_rtp: HashMap::new(),
            last_processed: HashMap::new(),
        }
    }

    /// Which feedback format the sends are matched against.
    pub fn format(&self) -> FeedbackFormat {
        self.format
    }

    /// Bytes sent that have been neither acked nor declared lost.
    pub fn bytes_in_flight(&self) -> DataSize {
        self.bytes_in_flight
    }

    /// Number of remembered sends.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether nothing is remembered.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Extend a 16 bit sequence number from feedback relative to what we have sent.
    ///
    /// `space` is `None` for the transport-wide sequence, `Some(ssrc)` for RTP sequences.
    pub fn extend(&self, space: Option<Ssrc>, seq: u16) -> SeqNo {
        let reference = match space {
            None => self.highest_transport,
            Some(ssrc) => self.highest_rtp.get(&ssrc).copied(),
        };
        match reference {
            Some(r) => extend_u16(*r, seq).into(),
            None => (seq as u64).into(),
        }
    }

    /// The send order number of the last recorded packet.
    pub(crate) fn last_number(&self) -> u64 {
        self.last_number
    }

    /// Record a send. Returns the send order number, or `None` if the packet
    /// can't be matched against feedback.
    pub(crate) fn record(&mut self, packet: SentPacket, now: Instant) -> Option<u64> {
        self.expire(now);

        let id = match self.format {
            FeedbackFormat::Twcc => {
                let Some(seq) = packet.transport_seq else {
                    trace!("Untracked send, no transport sequence: {}", packet.ssrc);
                    return None;
                };
                self.highest_transport = Some(self.highest_transport.map_or(seq, |h| h.max(seq)));
                PacketId::Transport(seq)
            }
            FeedbackFormat::Ccfb => {
                let h = self.highest_rtp.entry(packet.ssrc).or_insert(packet.seq);
                *h = (*h).max(packet.seq);
                PacketId::Rtp(packet.ssrc, packet.seq)
            }
        };

        self.last_number += 1;
        let record = SendRecord {
            number: self.last_number,
            size: packet.size,
            sent_at: now,
            state: RecordState::InFlight,
        };

        if let Some(prev) = self.records.insert(id, record) {
            // Resend of the same id replaces the earlier record.
            if prev.state == RecordState::InFlight {
                self.bytes_in_flight -= prev.size;
            }
        } else {
            self.order.push_back(id);
        }
        self.bytes_in_flight += packet.size;

        while self.order.len() > MAX_RECORDS {
            self.evict_front();
        }

        Some(self.last_number)
    }

    /// Whether the report brings nothing newer than what we already processed.
    ///
    /// A fresh report updates the highest processed sequence per space.
    pub(crate) fn check_stale(&mut self, report: &FeedbackReport) -> bool {
        let highest = report.highest_seqs();

        let fresh = highest
            .iter()
            .any(|(space, seq)| self.last_processed.get(space).map_or(true, |last| seq > last));

        if fresh {
            for (space, seq) in highest {
                let last = self.last_processed.entry(space).or_insert(seq);
                *last = (*last).max(seq);
            }
        }

        !fresh
    }

    /// Match a report to the recorded sends.
    ///
    /// Packets reported missing are only declared lost when a later packet in the same
    /// sequence space was received. Results are in send order.
    pub(crate) fn apply(&mut self, report: &FeedbackReport, now: Instant) -> Vec<PacketResult> {
        self.expire(now);

        let space_of = |ssrc: Ssrc| match report.format {
            FeedbackFormat::Twcc => None,
            FeedbackFormat::Ccfb => Some(ssrc),
        };

        let mut highest_received: HashMap<Option<Ssrc>, SeqNo> = HashMap::new();
        for p in report.packets.iter().filter(|p| p.is_received()) {
            let h = highest_received.entry(space_of(p.ssrc)).or_insert(p.seq);
            *h = (*h).max(p.seq);
        }

        let mut results = vec![];

        for p in &report.packets {
            let id = match report.format {
                FeedbackFormat::Twcc => PacketId::Transport(p.seq),
                FeedbackFormat::Ccfb => PacketId::Rtp(p.ssrc, p.seq),
            };

            let Some(record) = self.records.get_mut(&id) else {
                continue;
            };

            if record.state != RecordState::InFlight {
                continue;
            }

            let outcome = match p.arrival {
                Some(arrival) => Outcome::Acked {
                    arrival,
                    ecn: p.ecn,
                },
                None => {
                    let later_received = highest_received
                        .get(&space_of(p.ssrc))
                        .map_or(false, |h| *h > p.seq);
                    if !later_received {
                        continue;
                    }
                    Outcome::Lost
                }
            };

            record.state = match outcome {
                Outcome::Acked { .. } => RecordState::Acked,
                Outcome::Lost => RecordState::Lost,
            };
            let record = *record;
            self.bytes_in_flight -= record.size;

            results.push(PacketResult { record, outcome });
        }

        results.sort_by_key(|r| r.record.number);
        results
    }

    fn expire(&mut self, now: Instant) {
        while let Some(id) = self.order.front() {
            let too_old = self
                .records
                .get(id)
                .map_or(true, |r| now.saturating_duration_since(r.sent_at) > MAX_AGE);
            if !too_old {
                break;
            }
            self.evict_front();
        }
    }

    fn evict_front(&mut self) {
        let Some(id) = self.order.pop_front() else {
            return;
        };
        if let Some(r) = self.records.remove(&id) {
            if r.state == RecordState::InFlight {
                self.bytes_in_flight -= r.size;
            }
        }
    }
}
