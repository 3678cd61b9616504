use std::time::{Duration, Instant};

use crate::config::SessionConfig;
use crate::feedback::FeedbackReport;
use crate::rtp::{Bitrate, DataSize, Ssrc};

use super::history::{Outcome, SendHistory};
use super::macros::{log_congestion_window, log_loss, log_rtt, log_target_bitrate};
use super::pacer::LeakyBudget;
use super::trendline::{ArrivalGroups, BandwidthUsage, TrendlineEstimator};
use super::{seed_target, BandwidthEstimator, CcState, FeedbackOutcome, LossSentinel, RateCap};
use super::{SentPacket, StreamTable, TargetBitrate};

/// Maximum segment size used for window arithmetic.
const MSS: DataSize = DataSize::bytes(1200);
const MIN_CWND: DataSize = DataSize::bytes(2 * 1200);

/// RTT assumed before the first sample.
const INITIAL_RTT: Duration = Duration::from_millis(100);

const BETA_LOSS: f64 = 0.7;
const BETA_DELAY: f64 = 0.85;

/// Pacing rate relative to the window rate.
const PACING_GAIN: f64 = 1.25;

/// Number of delay variations the trendline fits over.
const TRENDLINE_WINDOW: usize = 20;

/// Window estimator driven by loss and delay gradient.
///
/// The congestion window grows by the acked bytes during slow start, and by one MSS per
/// window during congestion avoidance. A loss multiplies the window by 0.7, once per
/// recovery period. A delay over-use from the trendline filter multiplies it by 0.85, at
/// most once per RTT.
///
/// The target bitrate is `cwnd / srtt`.
pub struct WindowBwe {
    history: SendHistory,

    initial_bitrate: Bitrate,
    min_bitrate: Bitrate,
    max_bitrate: Bitrate,

    cwnd: DataSize,
    ssthresh: Option<DataSize>,
    state: CcState,

    srtt: Option<Duration>,
    min_rtt: Option<Duration>,

    /// Losses of packets up to this send number belong to the current recovery.
    largest_sent_at_cutback: Option<u64>,
    last_delay_cutback: Option<Instant>,

    arrival_groups: ArrivalGroups,
    trendline: TrendlineEstimator,
    budget: LeakyBudget,

    sentinel: LossSentinel,
    has_feedback: bool,
    cap: RateCap,
}

impl WindowBwe {
    /// New estimator from the session configuration.
    pub fn new(config: &SessionConfig) -> Self {
        let initial_bitrate = config.initial_bitrate();
        let cwnd = (initial_bitrate * INITIAL_RTT).max(MIN_CWND);

        WindowBwe {
            history: SendHistory::new(config.feedback_format()),
            initial_bitrate,
            min_bitrate: config.min_bitrate(),
            max_bitrate: config.max_bitrate(),
            cwnd,
            ssthresh: None,
            state: CcState::Startup,
            srtt: None,
            min_rtt: None,
            largest_sent_at_cutback: None,
            last_delay_cutback: None,
            arrival_groups: ArrivalGroups::default(),
            trendline: TrendlineEstimator::new(TRENDLINE_WINDOW),
            budget: LeakyBudget::new(initial_bitrate * PACING_GAIN),
            sentinel: LossSentinel::default(),
            has_feedback: false,
            cap: RateCap::default(),
        }
    }

    /// Whether the window has room.
    pub fn can_send(&self, bytes_in_flight: DataSize) -> bool {
        bytes_in_flight < self.cwnd
    }

    /// Time until the next send.
    ///
    /// `None` if window limited, `Some(Duration::ZERO)` to send right away, otherwise the
    /// pacing wait.
    pub fn time_until_send(&mut self, bytes_in_flight: DataSize, now: Instant) -> Option<Duration> {
        if !self.can_send(bytes_in_flight) {
            return None;
        }
        Some(self.budget.time_until_send(now))
    }

    /// Whether the window grows by the acked bytes.
    pub fn in_slow_start(&self) -> bool {
        !self.in_recovery() && self.ssthresh.map_or(true, |s| self.cwnd < s)
    }

    /// Whether we are recovering from a loss.
    pub fn in_recovery(&self) -> bool {
        self.state == CcState::LossRecovery
    }

    /// Current congestion window.
    pub fn congestion_window(&self) -> DataSize {
        self.cwnd
    }

    /// Smoothed round trip time, if sampled.
    pub fn smoothed_rtt(&self) -> Option<Duration> {
        self.srtt
    }

    /// Lowest sampled round trip time.
    pub fn min_rtt(&self) -> Option<Duration> {
        self.min_rtt
    }

    /// A packet with send number `number` was acked.
    pub fn on_packet_acked(
        &mut self,
        number: u64,
        acked_bytes: DataSize,
        prior_in_flight: DataSize,
        _now: Instant,
    ) {
        if self.in_recovery() {
            return;
        }

        // Application limited, the window wasn't the constraint.
        if prior_in_flight * 2.0 < self.cwnd {
            trace!(
                "No window growth for {}, in flight {} < cwnd {}",
                number,
                prior_in_flight,
                self.cwnd
            );
            return;
        }

        if self.in_slow_start() {
            self.cwnd += acked_bytes;
        } else {
            let inc = MSS.as_bytes_f64() * acked_bytes.as_bytes_f64() / self.cwnd.as_bytes_f64();
            self.cwnd += DataSize::bytes(inc.round() as u64);
        }

        let max = self.max_cwnd();
        if self.cwnd > max {
            self.cwnd = max;
        }
    }

    /// A packet with send number `number` was declared lost.
    pub fn on_packet_lost(&mut self, number: u64, lost_bytes: DataSize, prior_in_flight: DataSize) {
        log_loss!(number, lost_bytes.as_bytes_usize());

        if let Some(largest) = self.largest_sent_at_cutback {
            if number <= largest {
                // Part of the loss event we already reacted to.
                return;
            }
        }

        let cwnd = (self.cwnd * BETA_LOSS).max(MIN_CWND);
        debug!(
            "Loss of {} ({}), in flight {}, cwnd {} -> {}",
            number, lost_bytes, prior_in_flight, self.cwnd, cwnd
        );

        self.cwnd = cwnd;
        self.ssthresh = Some(cwnd);
        self.largest_sent_at_cutback = Some(self.history.last_number());
        self.set_state(CcState::LossRecovery);
        self.sentinel.arm();
        log_congestion_window!(self.cwnd.as_bytes_usize());
    }

    fn on_delay_overuse(&mut self, now: Instant) {
        if self.state == CcState::Startup {
            self.ssthresh = Some(self.cwnd);
            self.set_state(CcState::CongestionAvoidance);
        }

        let rtt = self.srtt.unwrap_or(INITIAL_RTT);
        let due = self
            .last_delay_cutback
            .map_or(true, |t| now.saturating_duration_since(t) >= rtt);

        if !due {
            return;
        }

        let cwnd = (self.cwnd * BETA_DELAY).max(MIN_CWND);
        debug!("Delay over-use, cwnd {} -> {}", self.cwnd, cwnd);
        self.cwnd = cwnd;
        self.ssthresh = Some(cwnd);
        self.last_delay_cutback = Some(now);
        log_congestion_window!(self.cwnd.as_bytes_usize());
    }

    fn update_rtt(&mut self, sample: Duration) {
        self.min_rtt = Some(self.min_rtt.map_or(sample, |m| m.min(sample)));
        self.srtt = Some(match self.srtt {
            None => sample,
            Some(srtt) => srtt.mul_f64(7.0 / 8.0) + sample.mul_f64(1.0 / 8.0),
        });
        log_rtt!(sample.as_micros(), self.srtt.unwrap_or(sample).as_micros());
    }

    fn set_state(&mut self, state: CcState) {
        if self.state != state {
            debug!("Window state {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    fn rtt(&self) -> Duration {
        self.srtt.unwrap_or(INITIAL_RTT)
    }

    fn max_cwnd(&self) -> DataSize {
        (self.max_bitrate * (self.rtt() * 2)).max(MIN_CWND)
    }

    fn total_target(&self) -> Bitrate {
        (self.cwnd / self.rtt()).clamp(self.min_bitrate, self.max_bitrate)
    }
}

impl BandwidthEstimator for WindowBwe {
    fn on_packet_sent(&mut self, packet: SentPacket, now: Instant) {
        let size = packet.size;
        self.history.record(packet, now);
        self.budget.on_sent(size, now);
    }

    fn stream_added(&mut self, ssrc: Ssrc) {
        self.sentinel.register(ssrc);
        self.cap.forget(ssrc);
    }

    fn on_feedback(
        &mut self,
        report: &FeedbackReport,
        _streams: &StreamTable,
        now: Instant,
    ) -> FeedbackOutcome {
        if self.history.check_stale(report) {
            debug!("Drop stale feedback from {}", report.sender_ssrc);
            return FeedbackOutcome::Dropped;
        }

        let prior_in_flight = self.history.bytes_in_flight();
        let results = self.history.apply(report, now);

        let lost = results
            .iter()
            .filter(|r| r.outcome == Outcome::Lost)
            .count();
        let acked = results.len() - lost;

        if lost == 0 && self.in_recovery() {
            self.set_state(CcState::CongestionAvoidance);
        }

        let newest_acked = results
            .iter()
            .filter(|r| r.outcome != Outcome::Lost)
            .max_by_key(|r| r.record.number);
        if let Some(r) = newest_acked {
            self.update_rtt(now.saturating_duration_since(r.record.sent_at));
        }

        for r in &results {
            if let Outcome::Acked { arrival, .. } = r.outcome {
                if let Some(v) = self.arrival_groups.add(r.record.sent_at, arrival) {
                    self.trendline.add_delay_observation(v, now);
                }
            }
        }

        if self.trendline.hypothesis() == BandwidthUsage::Overuse {
            self.on_delay_overuse(now);
        }

        // Losses first, a report with loss never grows the window.
        for r in results.iter().filter(|r| r.outcome == Outcome::Lost) {
            self.on_packet_lost(r.record.number, r.record.size, prior_in_flight);
        }
        for r in results.iter().filter(|r| r.outcome != Outcome::Lost) {
            self.on_packet_acked(r.record.number, r.record.size, prior_in_flight, now);
        }

        let pacing = (self.cwnd / self.rtt()).max(self.min_bitrate) * PACING_GAIN;
        self.budget.set_pacing_rate(pacing);

        self.has_feedback = true;
        log_congestion_window!(self.cwnd.as_bytes_usize());

        FeedbackOutcome::Processed { acked, lost }
    }

    fn target_bitrate(&mut self, ssrc: Ssrc, streams: &StreamTable) -> TargetBitrate {
        if self.sentinel.take(ssrc) {
            return TargetBitrate::LossDetected;
        }

        if !self.has_feedback {
            let seed = seed_target(streams, ssrc, self.initial_bitrate);
            return TargetBitrate::Rate(self.cap.apply(ssrc, seed, false));
        }

        let total = self.total_target();
        let share = streams.share(ssrc, total).unwrap_or(total);
        let rate = self.cap.apply(ssrc, share, self.in_recovery());
        log_target_bitrate!(*ssrc, rate.as_u64());

        TargetBitrate::Rate(rate)
    }

    fn state(&self) -> CcState {
        self.state
    }

    fn send_history(&self) -> &SendHistory {
        &self.history
    }
}

impl std::fmt::Debug for WindowBwe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowBwe")
            .field("state", &self.state)
            .field("cwnd", &self.cwnd)
            .field("ssthresh", &self.ssthresh)
            .field("srtt", &self.srtt)
            .field("in_flight", &self.history.bytes_in_flight())
            .field("pacing_rate", &self.budget.pacing_rate())
            .finish()
    }
}
