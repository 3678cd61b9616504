//! Self-clocked rate adaptation, after RFC 8298.
//!
//! The congestion window is steered by the estimated queueing delay: it grows when the
//! delay is below a 60ms target and shrinks when it is above. The queueing delay is the
//! one-way delay of each acked packet minus the lowest one-way delay seen over the last
//! ten seconds. Since only differences matter, the clocks of the two ends need not agree.
use std::collections::{HashMap, VecDeque};
use std::fmt::Write;
use std::time::{Duration, Instant};

use crate::config::SessionConfig;
use crate::feedback::{Ecn, Feedback, FeedbackError, FeedbackFormat, FeedbackReport};
use crate::rtp::{Bitrate, DataSize, SeqUnwrapper, Ssrc};
use crate::util::already_happened;

use super::history::{Outcome, SendHistory};
use super::macros::{log_congestion_window, log_loss, log_queue_delay, log_target_bitrate};
use super::{seed_target, BandwidthEstimator, CcState, FeedbackOutcome, LossSentinel, RateCap};
use super::{SentPacket, StreamTable, TargetBitrate};

const QDELAY_TARGET: Duration = Duration::from_millis(60);

/// Above this, a stream's own transmit queue holds its rate back.
const TX_QUEUE_DELAY_LIMIT: Duration = Duration::from_millis(100);

const MSS: DataSize = DataSize::bytes(1200);
const MIN_CWND: DataSize = DataSize::bytes(3000);

const INITIAL_RTT: Duration = Duration::from_millis(100);

const GAIN: f64 = 1.0;
const BETA_LOSS: f64 = 0.8;
const BETA_ECN: f64 = 0.9;

const PACING_HEADROOM: f64 = 1.25;

const BASE_DELAY_BUCKET: Duration = Duration::from_secs(1);
const BASE_DELAY_BUCKETS: usize = 10;

const MEDIA_RATE_WINDOW: Duration = Duration::from_secs(1);

/// Whether a stream may transmit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transmit {
    /// Send the next packet now.
    Now,
    /// The window has room, but pacing asks to wait this long.
    Wait(Duration),
    /// Nothing to send, or no room in the window.
    None,
}

/// Running minimum of the one-way delay, in buckets.
#[derive(Debug, Default)]
struct BaseDelay {
    buckets: VecDeque<(Instant, i64)>,
}

impl BaseDelay {
    fn update(&mut self, now: Instant, owd: i64) {
        match self.buckets.back_mut() {
            Some((start, min)) if now.saturating_duration_since(*start) < BASE_DELAY_BUCKET => {
                *min = (*min).min(owd);
            }
            _ => {
                self.buckets.push_back((now, owd));
                while self.buckets.len() > BASE_DELAY_BUCKETS {
                    self.buckets.pop_front();
                }
            }
        }
    }

    fn get(&self) -> Option<i64> {
        self.buckets.iter().map(|(_, m)| *m).min()
    }
}

#[derive(Debug)]
struct MediaRate {
    window_start: Instant,
    bytes: DataSize,
    frames: u64,
    rate: Bitrate,
}

impl MediaRate {
    fn new(now: Instant) -> Self {
        MediaRate {
            window_start: now,
            bytes: DataSize::ZERO,
            frames: 0,
            rate: Bitrate::ZERO,
        }
    }

    fn add(&mut self, bytes: DataSize, now: Instant) {
        self.bytes += bytes;
        self.frames += 1;

        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed >= MEDIA_RATE_WINDOW {
            self.rate = self.bytes / elapsed;
            self.bytes = DataSize::ZERO;
            self.window_start = now;
        }
    }
}

/// Self-clocked estimator.
pub struct ScreamBwe {
    history: SendHistory,

    initial_bitrate: Bitrate,
    min_bitrate: Bitrate,
    max_bitrate: Bitrate,

    cwnd: DataSize,
    state: CcState,
    srtt: Option<Duration>,

    base_delay: BaseDelay,
    qdelay: Duration,

    last_loss_cutback: Option<Instant>,
    last_ecn_cutback: Option<Instant>,

    next_transmit: Option<Instant>,
    unwrappers: HashMap<Ssrc, SeqUnwrapper>,
    media: HashMap<Ssrc, MediaRate>,

    sentinel: LossSentinel,
    has_feedback: bool,
    cap: RateCap,
    last_now: Option<Instant>,
}

impl ScreamBwe {
    /// New estimator from the session configuration.
    ///
    /// Sends are always matched against RFC 8888 feedback.
    pub fn new(config: &SessionConfig) -> Self {
        let initial_bitrate = config.initial_bitrate();

        ScreamBwe {
            history: SendHistory::new(FeedbackFormat::Ccfb),
            initial_bitrate,
            min_bitrate: config.min_bitrate(),
            max_bitrate: config.max_bitrate(),
            cwnd: (initial_bitrate * INITIAL_RTT).max(MIN_CWND),
            state: CcState::Startup,
            srtt: None,
            base_delay: BaseDelay::default(),
            qdelay: Duration::ZERO,
            last_loss_cutback: None,
            last_ecn_cutback: None,
            next_transmit: None,
            unwrappers: HashMap::new(),
            media: HashMap::new(),
            sentinel: LossSentinel::default(),
            has_feedback: false,
            cap: RateCap::default(),
            last_now: None,
        }
    }

    /// Account for a media frame produced by the encoder.
    pub fn new_media_frame(&mut self, ssrc: Ssrc, bytes: DataSize, now: Instant) {
        self.media
            .entry(ssrc)
            .or_insert_with(|| MediaRate::new(now))
            .add(bytes, now);
    }

    /// Whether the head of the stream's transmit queue may be sent.
    pub fn is_ok_to_transmit(&mut self, streams: &StreamTable, ssrc: Ssrc, now: Instant) -> Transmit {
        self.last_now = Some(now);

        let Some(stream) = streams.get(ssrc) else {
            return Transmit::None;
        };
        let Some(size) = stream.queue.size_of_next() else {
            return Transmit::None;
        };

        let in_flight = self.history.bytes_in_flight();
        // An empty network always takes one packet.
        if in_flight > DataSize::ZERO && in_flight + size > self.cwnd {
            return Transmit::None;
        }

        match self.next_transmit {
            Some(t) if t > now => Transmit::Wait(t - now),
            _ => Transmit::Now,
        }
    }

    /// Record a transmitted RTP packet. Returns the pacing interval until the next one.
    pub fn add_transmitted(
        &mut self,
        ssrc: Ssrc,
        size: DataSize,
        seq: u16,
        is_mark: bool,
        now: Instant,
    ) -> Duration {
        let seq = self.unwrappers.entry(ssrc).or_default().unwrap(seq);

        self.on_packet_sent(
            SentPacket {
                ssrc,
                seq,
                transport_seq: None,
                size,
            },
            now,
        );

        if is_mark {
            trace!("End of frame {} at {}", ssrc, seq);
        }

        let pacing_rate = (self.window_rate() * PACING_HEADROOM).max(self.min_bitrate);
        let interval = size / pacing_rate;
        self.next_transmit = Some(now + interval);

        interval
    }

    /// Parse and process RFC 8888 feedback.
    pub fn incoming_feedback(
        &mut self,
        buf: &[u8],
        streams: &StreamTable,
        now: Instant,
    ) -> Result<FeedbackOutcome, FeedbackError> {
        let mut outcome = FeedbackOutcome::Dropped;

        for feedback in Feedback::parse(buf)? {
            if !matches!(feedback, Feedback::Ccfb(_)) {
                debug!("Ignore non RFC 8888 feedback");
                continue;
            }
            let report = self.decode(feedback);
            outcome = outcome.merge(self.on_feedback(&report, streams, now));
        }

        Ok(outcome)
    }

    /// Current congestion window.
    pub fn congestion_window(&self) -> DataSize {
        self.cwnd
    }

    /// Estimated queueing delay.
    pub fn queue_delay(&self) -> Duration {
        self.qdelay
    }

    /// A one line summary of the estimator state.
    pub fn statistics(&self, now: Instant) -> String {
        let mut s = String::new();

        let _ = write!(
            s,
            "state: {:?} cwnd: {} in_flight: {} srtt: {}ms qdelay: {}ms rate: {}",
            self.state,
            self.cwnd,
            self.history.bytes_in_flight(),
            self.rtt().as_millis(),
            self.qdelay.as_millis(),
            self.window_rate(),
        );

        let mut ssrcs: Vec<_> = self.media.keys().copied().collect();
        ssrcs.sort();

        for ssrc in ssrcs {
            if let Some(m) = self.media.get(&ssrc) {
                let age = now.saturating_duration_since(m.window_start).as_millis();
                let _ = write!(
                    s,
                    " [{}: media {} frames {} age {}ms]",
                    ssrc, m.rate, m.frames, age
                );
            }
        }

        s
    }

    fn rtt(&self) -> Duration {
        self.srtt.unwrap_or(INITIAL_RTT)
    }

    fn window_rate(&self) -> Bitrate {
        self.cwnd / self.rtt()
    }

    fn max_cwnd(&self) -> DataSize {
        (self.max_bitrate * (self.rtt() * 2)).max(MIN_CWND)
    }

    fn set_state(&mut self, state: CcState) {
        if self.state != state {
            debug!("Self-clocked state {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    fn once_per_rtt(last: Option<Instant>, rtt: Duration, now: Instant) -> bool {
        last.map_or(true, |t| now.saturating_duration_since(t) >= rtt)
    }

    fn on_loss(&mut self, now: Instant) {
        if !Self::once_per_rtt(self.last_loss_cutback, self.rtt(), now) {
            return;
        }
        self.cwnd = (self.cwnd * BETA_LOSS).max(MIN_CWND);
        self.last_loss_cutback = Some(now);
        self.set_state(CcState::LossRecovery);
        self.sentinel.arm();
        debug!("Loss, cwnd reduced to {}", self.cwnd);
    }

    fn on_ecn_ce(&mut self, now: Instant) {
        if self.state == CcState::Startup {
            self.set_state(CcState::CongestionAvoidance);
        }
        if !Self::once_per_rtt(self.last_ecn_cutback, self.rtt(), now) {
            return;
        }
        self.cwnd = (self.cwnd * BETA_ECN).max(MIN_CWND);
        self.last_ecn_cutback = Some(now);
        debug!("ECN-CE, cwnd reduced to {}", self.cwnd);
    }

    fn update_window(&mut self, acked: DataSize, prior_in_flight: DataSize) {
        let target_ms = QDELAY_TARGET.as_secs_f64() * 1000.0;
        let qdelay_ms = self.qdelay.as_secs_f64() * 1000.0;
        let off_target = (target_ms - qdelay_ms) / target_ms;

        if self.state == CcState::Startup && self.qdelay > QDELAY_TARGET / 2 {
            self.set_state(CcState::CongestionAvoidance);
        }

        let cwnd_limited = prior_in_flight * 2.0 >= self.cwnd;
        let cwnd = self.cwnd.as_bytes_f64();

        let next = match self.state {
            CcState::Startup if cwnd_limited => cwnd + acked.as_bytes_f64(),
            CcState::Startup => cwnd,
            // Only decrease while recovering.
            CcState::LossRecovery if off_target >= 0.0 => cwnd,
            _ if off_target >= 0.0 && !cwnd_limited => cwnd,
            _ => cwnd + GAIN * off_target * acked.as_bytes_f64() * MSS.as_bytes_f64() / cwnd,
        };

        self.cwnd = DataSize::bytes(next.max(0.0).round() as u64)
            .max(MIN_CWND)
            .min(self.max_cwnd());
    }

    fn total_target(&self) -> Bitrate {
        self.window_rate().clamp(self.min_bitrate, self.max_bitrate)
    }
}

/// One-way delay in micros. Only meaningful relative to other values.
fn one_way_delay(sent_at: Instant, arrival: Duration) -> i64 {
    let sent = sent_at.saturating_duration_since(already_happened());
    arrival.as_micros() as i64 - sent.as_micros() as i64
}

impl BandwidthEstimator for ScreamBwe {
    fn on_packet_sent(&mut self, packet: SentPacket, now: Instant) {
        self.last_now = Some(now);
        self.history.record(packet, now);
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
        self.last_now = Some(now);

        if self.history.check_stale(report) {
            debug!("Drop stale feedback from {}", report.sender_ssrc);
            return FeedbackOutcome::Dropped;
        }

        let prior_in_flight = self.history.bytes_in_flight();
        let results = self.history.apply(report, now);

        let mut acked_bytes = DataSize::ZERO;
        let mut acked = 0;
        let mut lost = 0;
        let mut ce = 0;
        let mut qdelay_sum = 0;
        let mut newest: Option<(u64, Instant)> = None;

        for r in &results {
            match r.outcome {
                Outcome::Acked { arrival, ecn } => {
                    acked += 1;
                    acked_bytes += r.record.size;
                    if ecn == Ecn::Ce {
                        ce += 1;
                    }

                    let owd = one_way_delay(r.record.sent_at, arrival);
                    self.base_delay.update(now, owd);
                    let base = self.base_delay.get().unwrap_or(owd);
                    qdelay_sum += (owd - base).max(0);

                    if newest.map_or(true, |(n, _)| r.record.number > n) {
                        newest = Some((r.record.number, r.record.sent_at));
                    }
                }
                Outcome::Lost => {
                    lost += 1;
                    log_loss!(r.record.number, r.record.size.as_bytes_usize());
                }
            }
        }

        if let Some((_, sent_at)) = newest {
            let sample = now.saturating_duration_since(sent_at);
            self.srtt = Some(match self.srtt {
                None => sample,
                Some(srtt) => srtt.mul_f64(7.0 / 8.0) + sample.mul_f64(1.0 / 8.0),
            });
        }

        if acked > 0 {
            self.qdelay = Duration::from_micros((qdelay_sum / acked as i64) as u64);
            log_queue_delay!(self.qdelay.as_micros());
        }

        if lost > 0 {
            self.on_loss(now);
        } else if self.state == CcState::LossRecovery {
            self.set_state(CcState::CongestionAvoidance);
        }

        if ce > 0 {
            self.on_ecn_ce(now);
        }

        if acked > 0 {
            self.update_window(acked_bytes, prior_in_flight);
        }

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

        let in_recovery = self.state == CcState::LossRecovery;
        let total = self.total_target();
        let Some(mut rate) = streams.share(ssrc, total) else {
            return TargetBitrate::Rate(self.cap.apply(ssrc, total, in_recovery));
        };

        if let (Some(stream), Some(now)) = (streams.get(ssrc), self.last_now) {
            let delay = stream.queue.queue_delay(now);
            if delay > TX_QUEUE_DELAY_LIMIT {
                let factor = (TX_QUEUE_DELAY_LIMIT.as_secs_f64() / delay.as_secs_f64()).max(0.5);
                rate = (rate * factor).max(stream.min_bitrate);
                debug!("Queue delay {:?} on {}, rate reduced to {}", delay, ssrc, rate);
            }
        }

        let rate = self.cap.apply(ssrc, rate, in_recovery);
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

impl std::fmt::Debug for ScreamBwe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScreamBwe")
            .field("state", &self.state)
            .field("cwnd", &self.cwnd)
            .field("srtt", &self.srtt)
            .field("qdelay", &self.qdelay)
            .field("in_flight", &self.history.bytes_in_flight())
            .finish()
    }
}
