//! Bandwidth estimation.
//!
//! Two estimators are provided:
//!
//! * [`WindowBwe`] keeps a congestion window that grows on acks and shrinks on loss, and on
//!   delay over-use detected by a trendline filter over the arrival times.
//! * [`ScreamBwe`] is a self-clocked estimator in the spirit of RFC 8298. It keeps the
//!   queueing delay near a target and requires a [`TxQueue`] view for every stream.
//!
//! Both implement [`BandwidthEstimator`], and the [`Bwe`] enum picks one at construction.
//!
//! Both share the same state machine:
//!
//! ```text
//!   Startup ──(delay or loss)──► CongestionAvoidance
//!      │                            ▲        │
//!      └───(loss)──► LossRecovery ──┘◄─(loss)┘
//!                     (report without loss)
//! ```
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::{EstimatorKind, SessionConfig};
use crate::feedback::{Feedback, FeedbackReport};
use crate::rtp::{Bitrate, DataSize, SeqNo, Ssrc};

mod history;
pub use history::SendHistory;

pub(crate) mod macros;

mod pacer;

mod scream;
pub use scream::{ScreamBwe, Transmit};

mod streams;
pub use streams::{RtpQueue, StreamRegistration, StreamTable, TxQueue};

mod trendline;

mod window;
pub use window::WindowBwe;

/// Rate handed to the encoder, or a signal that a loss happened.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TargetBitrate {
    /// Encode at this rate.
    Rate(Bitrate),
    /// A loss event happened since the last query for this stream.
    LossDetected,
}

impl TargetBitrate {
    /// Bits per second, with `-1.0` meaning loss was detected.
    pub fn as_bps(&self) -> f64 {
        match self {
            TargetBitrate::Rate(v) => v.as_f64(),
            TargetBitrate::LossDetected => -1.0,
        }
    }
}

impl fmt::Display for TargetBitrate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetBitrate::Rate(v) => write!(f, "{v}"),
            TargetBitrate::LossDetected => write!(f, "loss detected"),
        }
    }
}

/// An estimate for a single stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BandwidthEstimate {
    /// The stream.
    pub ssrc: Ssrc,
    /// The target.
    pub target: TargetBitrate,
    /// When the estimate was produced.
    pub at: Instant,
}

/// Congestion control state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CcState {
    /// Probing for capacity, the window grows quickly.
    Startup,
    /// Steady state.
    CongestionAvoidance,
    /// After a loss, the window doesn't grow until a report without loss.
    LossRecovery,
}

/// A packet that was handed to the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentPacket {
    /// The stream.
    pub ssrc: Ssrc,
    /// Extended RTP sequence number.
    pub seq: SeqNo,
    /// Extended transport-wide sequence number, if the packet carries one.
    pub transport_seq: Option<SeqNo>,
    /// Size on the wire.
    pub size: DataSize,
}

/// What came of a feedback report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackOutcome {
    /// The report updated the estimate.
    Processed {
        /// Packets acknowledged by the report.
        acked: usize,
        /// Packets declared lost.
        lost: usize,
    },
    /// The report was not newer than what was already processed.
    Dropped,
}

impl FeedbackOutcome {
    /// Combine the outcomes of reports in the same compound packet.
    pub fn merge(self, other: FeedbackOutcome) -> FeedbackOutcome {
        use FeedbackOutcome::*;
        match (self, other) {
            (Processed { acked: a1, lost: l1 }, Processed { acked: a2, lost: l2 }) => Processed {
                acked: a1 + a2,
                lost: l1 + l2,
            },
            (Dropped, v) | (v, Dropped) => v,
        }
    }
}

/// Common interface of the estimators.
pub trait BandwidthEstimator {
    /// Record a packet handed to the network.
    fn on_packet_sent(&mut self, packet: SentPacket, now: Instant);

    /// A stream joined the session.
    ///
    /// Loss events from before this point are never reported to the new stream.
    fn stream_added(&mut self, ssrc: Ssrc);

    /// Update the estimate from a decoded feedback report.
    ///
    /// Reports that bring nothing newer than the last processed report are dropped.
    fn on_feedback(
        &mut self,
        report: &FeedbackReport,
        streams: &StreamTable,
        now: Instant,
    ) -> FeedbackOutcome;

    /// The current target for a stream.
    ///
    /// Before any feedback this is the stream's start bitrate. After each loss event this
    /// returns [`TargetBitrate::LossDetected`] exactly once per stream.
    fn target_bitrate(&mut self, ssrc: Ssrc, streams: &StreamTable) -> TargetBitrate;

    /// Current congestion control state.
    fn state(&self) -> CcState;

    /// Record of sent packets.
    fn send_history(&self) -> &SendHistory;

    /// Bytes sent and not yet acked or declared lost.
    fn bytes_in_flight(&self) -> DataSize {
        self.send_history().bytes_in_flight()
    }

    /// Turn parsed feedback into a report, extending sequence numbers against the sends.
    fn decode(&self, feedback: Feedback) -> FeedbackReport {
        let history = self.send_history();
        feedback.into_report(|space, seq| history.extend(space, seq))
    }
}

/// One of the estimators, selected at construction.
#[derive(Debug)]
pub enum Bwe {
    /// Window based, see [`WindowBwe`].
    Window(WindowBwe),
    /// Self-clocked, see [`ScreamBwe`].
    SelfClocked(ScreamBwe),
}

impl Bwe {
    /// Create the estimator the configuration asks for.
    pub fn new(config: &SessionConfig) -> Self {
        match config.estimator() {
            EstimatorKind::Window => Bwe::Window(WindowBwe::new(config)),
            EstimatorKind::SelfClocked => Bwe::SelfClocked(ScreamBwe::new(config)),
        }
    }

    /// Which estimator this is.
    pub fn kind(&self) -> EstimatorKind {
        match self {
            Bwe::Window(_) => EstimatorKind::Window,
            Bwe::SelfClocked(_) => EstimatorKind::SelfClocked,
        }
    }

    /// Whether a packet of `size` may be sent on `ssrc` now.
    ///
    /// Returns the time to wait, or `None` if the window is full.
    pub fn time_until_send(
        &mut self,
        streams: &StreamTable,
        ssrc: Ssrc,
        now: Instant,
    ) -> Option<Duration> {
        match self {
            Bwe::Window(v) => {
                let in_flight = v.bytes_in_flight();
                v.time_until_send(in_flight, now)
            }
            Bwe::SelfClocked(v) => match v.is_ok_to_transmit(streams, ssrc, now) {
                Transmit::Now => Some(Duration::ZERO),
                Transmit::Wait(d) => Some(d),
                Transmit::None => None,
            },
        }
    }
}

impl BandwidthEstimator for Bwe {
    fn on_packet_sent(&mut self, packet: SentPacket, now: Instant) {
        match self {
            Bwe::Window(v) => v.on_packet_sent(packet, now),
            Bwe::SelfClocked(v) => v.on_packet_sent(packet, now),
        }
    }

    fn stream_added(&mut self, ssrc: Ssrc) {
        match self {
            Bwe::Window(v) => v.stream_added(ssrc),
            Bwe::SelfClocked(v) => v.stream_added(ssrc),
        }
    }

    fn on_feedback(
        &mut self,
        report: &FeedbackReport,
        streams: &StreamTable,
        now: Instant,
    ) -> FeedbackOutcome {
        match self {
            Bwe::Window(v) => v.on_feedback(report, streams, now),
            Bwe::SelfClocked(v) => v.on_feedback(report, streams, now),
        }
    }

    fn target_bitrate(&mut self, ssrc: Ssrc, streams: &StreamTable) -> TargetBitrate {
        match self {
            Bwe::Window(v) => v.target_bitrate(ssrc, streams),
            Bwe::SelfClocked(v) => v.target_bitrate(ssrc, streams),
        }
    }

    fn state(&self) -> CcState {
        match self {
            Bwe::Window(v) => v.state(),
            Bwe::SelfClocked(v) => v.state(),
        }
    }

    fn send_history(&self) -> &SendHistory {
        match self {
            Bwe::Window(v) => v.send_history(),
            Bwe::SelfClocked(v) => v.send_history(),
        }
    }
}

/// Hands out [`TargetBitrate::LossDetected`] once per stream and loss event.
#[derive(Debug, Default)]
pub(crate) struct LossSentinel {
    epoch: u64,
    seen: HashMap<Ssrc, u64>,
}

impl LossSentinel {
    /// A new loss event.
    pub fn arm(&mut self) {
        self.epoch += 1;
    }

    /// Whether the stream has yet to be told about the latest loss event.
    pub fn take(&mut self, ssrc: Ssrc) -> bool {
        let seen = self.seen.entry(ssrc).or_insert(0);
        if *seen < self.epoch {
            *seen = self.epoch;
            true
        } else {
            false
        }
    }

    /// Mark every loss event so far as seen by `ssrc`.
    pub fn register(&mut self, ssrc: Ssrc) {
        self.seen.insert(ssrc, self.epoch);
    }
}

/// The last rate handed out per stream. In loss recovery a stream never gets more than that.
#[derive(Debug, Default)]
pub(crate) struct RateCap {
    last: HashMap<Ssrc, Bitrate>,
}

impl RateCap {
    pub fn apply(&mut self, ssrc: Ssrc, rate: Bitrate, in_recovery: bool) -> Bitrate {
        let rate = match self.last.get(&ssrc) {
            Some(last) if in_recovery => rate.min(*last),
            _ => rate,
        };
        self.last.insert(ssrc, rate);
        rate
    }

    pub fn forget(&mut self, ssrc: Ssrc) {
        self.last.remove(&ssrc);
    }
}

/// The seed target before any feedback has arrived.
pub(crate) fn seed_target(streams: &StreamTable, ssrc: Ssrc, initial: Bitrate) -> Bitrate {
    streams
        .get(ssrc)
        .map(|s| s.start_bitrate)
        .unwrap_or(initial)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sentinel_once_per_stream() {
        let mut s = LossSentinel::default();
        assert!(!s.take(1.into()));

        s.arm();
        assert!(s.take(1.into()));
        assert!(!s.take(1.into()));
        assert!(s.take(2.into()));

        s.arm();
        assert!(s.take(1.into()));
        assert!(s.take(2.into()));
        assert!(!s.take(2.into()));
    }

    #[test]
    fn registered_stream_skips_earlier_losses() {
        let mut s = LossSentinel::default();
        s.arm();
        s.arm();

        s.register(3.into());
        assert!(!s.take(3.into()));

        s.arm();
        assert!(s.take(3.into()));
        assert!(!s.take(3.into()));
    }

    #[test]
    fn cap_holds_in_recovery() {
        let mut cap = RateCap::default();
        let ssrc = 1.into();

        assert_eq!(cap.apply(ssrc, Bitrate::kbps(500), false), Bitrate::kbps(500));
        assert_eq!(cap.apply(ssrc, Bitrate::kbps(800), true), Bitrate::kbps(500));
        assert_eq!(cap.apply(ssrc, Bitrate::kbps(300), true), Bitrate::kbps(300));
        assert_eq!(cap.apply(ssrc, Bitrate::kbps(400), true), Bitrate::kbps(300));
        assert_eq!(cap.apply(ssrc, Bitrate::kbps(900), false), Bitrate::kbps(900));

        // No history, nothing to hold to.
        assert_eq!(cap.apply(2.into(), Bitrate::kbps(700), true), Bitrate::kbps(700));

        cap.forget(ssrc);
        assert_eq!(cap.apply(ssrc, Bitrate::kbps(800), true), Bitrate::kbps(800));
    }

    #[test]
    fn loss_as_negative_bps() {
        assert_eq!(TargetBitrate::LossDetected.as_bps(), -1.0);
        assert_eq!(TargetBitrate::Rate(Bitrate::kbps(300)).as_bps(), 300_000.0);
    }

    #[test]
    fn merge_outcomes() {
        let a = FeedbackOutcome::Processed { acked: 3, lost: 1 };
        let b = FeedbackOutcome::Processed { acked: 2, lost: 0 };
        assert_eq!(
            a.merge(b),
            FeedbackOutcome::Processed { acked: 5, lost: 1 }
        );
        assert_eq!(FeedbackOutcome::Dropped.merge(a), a);
        assert_eq!(
            FeedbackOutcome::Dropped.merge(FeedbackOutcome::Dropped),
            FeedbackOutcome::Dropped
        );
    }
}
