//! Delay gradient detection.
//!
//! Packets are grouped by send time. For each pair of consecutive groups, the difference
//! between the arrival delta and the send delta is the delay variation. A growing
//! accumulated variation means queues are building somewhere on the path. The trendline
//! filter fits a line through the smoothed accumulated delay and compares the slope to an
//! adaptive threshold.
use std::collections::VecDeque;
use std::fmt;
use std::ops::RangeInclusive;
use std::time::{Duration, Instant};

use super::macros::{log_delay_variation, log_trendline_estimate, log_trendline_modified_trend};

const SEND_TIME_GROUP_LENGTH: Duration = Duration::from_millis(5);

const SMOOTHING_COEF: f64 = 0.9;
const OVER_USE_THRESHOLD_DEFAULT_MS: f64 = 12.5;
const OVER_USE_TIME_THRESHOLD_MS: f64 = 10.0;
const MAX_ADOPT_OFFSET_MS: f64 = 15.0;
const THRESHOLD_GAIN: f64 = 4.0;

const K_UP: f64 = 0.0087;
const K_DOWN: f64 = 0.039;

const DELAY_COUNT_RANGE: RangeInclusive<usize> = 60..=1000;

/// Our hypothesis about the path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BandwidthUsage {
    Overuse,
    Normal,
    Underuse,
}

impl fmt::Display for BandwidthUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BandwidthUsage::Overuse => write!(f, "overuse"),
            BandwidthUsage::Normal => write!(f, "normal"),
            BandwidthUsage::Underuse => write!(f, "underuse"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Group {
    first_send: Instant,
    last_send: Instant,
    last_arrival: Duration,
}

/// Delay variation between two send groups.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct DelayVariation {
    /// Arrival delta minus send delta, in ms.
    pub delay: f64,
    /// Send delta, in ms.
    pub send_delta: f64,
    /// Arrival of the last packet in the completed group, remote clock.
    pub last_arrival: Duration,
}

/// Splits acked packets into send groups of 5ms.
#[derive(Debug, Default)]
pub(crate) struct ArrivalGroups {
    previous: Option<Group>,
    current: Option<Group>,
}

impl ArrivalGroups {
    /// Add an acked packet. Packets must be given in send order.
    ///
    /// Returns a variation whenever a group completes.
    pub fn add(&mut self, sent_at: Instant, arrival: Duration) -> Option<DelayVariation> {
        if self.current.is_none() {
            self.current = Some(Group {
                first_send: sent_at,
                last_send: sent_at,
                last_arrival: arrival,
            });
            return None;
        }
        let current = self.current.as_mut()?;

        if sent_at < current.first_send {
            // Out of order, skip.
            return None;
        }

        if sent_at - current.first_send <= SEND_TIME_GROUP_LENGTH {
            current.last_send = current.last_send.max(sent_at);
            current.last_arrival = current.last_arrival.max(arrival);
            return None;
        }

        let completed = *current;
        let previous = self.previous.replace(completed);
        self.current = Some(Group {
            first_send: sent_at,
            last_send: sent_at,
            last_arrival: arrival,
        });

        let previous = previous?;

        let send_delta = ms(completed.last_send - previous.last_send);
        let arrival_delta = signed_ms(completed.last_arrival, previous.last_arrival);

        let v = DelayVariation {
            delay: arrival_delta - send_delta,
            send_delta,
            last_arrival: completed.last_arrival,
        };
        log_delay_variation!(v.delay);

        Some(v)
    }
}

fn ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

fn signed_ms(a: Duration, b: Duration) -> f64 {
    if a >= b {
        ms(a - b)
    } else {
        -ms(b - a)
    }
}

/// Linear regression over the smoothed accumulated delay.
pub(crate) struct TrendlineEstimator {
    /// The window size in samples.
    window_size: usize,

    /// First arrival we saw, used as zero point.
    zero_time: Option<Duration>,

    history: VecDeque<Timing>,

    /// Number of observed delay variations, capped.
    num_delay_variations: usize,

    accumulated_delay: f64,
    smoothed_delay: f64,

    /// The adaptive delay threshold.
    delay_threshold: f64,

    previous_trend: f64,

    overuse: Option<Overuse>,

    last_threshold_update: Option<Instant>,

    hypothesis: BandwidthUsage,
}

impl TrendlineEstimator {
    pub fn new(window_size: usize) -> Self {
        Self {
            window_size,
            zero_time: None,
            history: VecDeque::default(),
            num_delay_variations: 0,
            accumulated_delay: 0.0,
            smoothed_delay: 0.0,
            delay_threshold: OVER_USE_THRESHOLD_DEFAULT_MS,
            previous_trend: 0.0,
            overuse: None,
            last_threshold_update: None,
            hypothesis: BandwidthUsage::Normal,
        }
    }

    pub fn add_delay_observation(&mut self, variation: DelayVariation, now: Instant) {
        let zero_time = *self.zero_time.get_or_insert(variation.last_arrival);

        self.num_delay_variations = (self.num_delay_variations + 1).min(*DELAY_COUNT_RANGE.end());
        self.accumulated_delay += variation.delay;
        self.smoothed_delay =
            self.smoothed_delay * SMOOTHING_COEF + (1.0 - SMOOTHING_COEF) * self.accumulated_delay;

        self.history.push_back(Timing {
            arrival: ms(variation.last_arrival.saturating_sub(zero_time)),
            smoothed_delay: self.smoothed_delay,
        });

        while self.history.len() > self.window_size {
            self.history.pop_front();
        }

        if self.history.len() == self.window_size {
            let trend = self.linear_fit().unwrap_or(self.previous_trend);
            trace!("Computed trend {:?}", trend);
            log_trendline_estimate!(trend);

            self.detect(trend, variation.send_delta, now);
        }
    }

    pub fn hypothesis(&self) -> BandwidthUsage {
        self.hypothesis
    }

    fn linear_fit(&self) -> Option<f64> {
        let n = self.history.len() as f64;
        if n < 2.0 {
            return None;
        }

        let (sum_x, sum_y) = self
            .history
            .iter()
            .fold((0.0, 0.0), |acc, t| (acc.0 + t.arrival, acc.1 + t.smoothed_delay));

        let avg_x = sum_x / n;
        let avg_y = sum_y / n;

        let (numerator, denominator) = self.history.iter().fold((0.0, 0.0), |acc, t| {
            let dx = t.arrival - avg_x;
            (acc.0 + dx * (t.smoothed_delay - avg_y), acc.1 + dx * dx)
        });

        if denominator == 0.0 {
            return None;
        }

        Some(numerator / denominator)
    }

    fn detect(&mut self, trend: f64, send_delta: f64, now: Instant) {
        let modified_trend = self.num_delay_variations.min(*DELAY_COUNT_RANGE.start()) as f64
            * trend
            * THRESHOLD_GAIN;

        log_trendline_modified_trend!(modified_trend, self.delay_threshold);

        if modified_trend > self.delay_threshold {
            let overuse = self.overuse.get_or_insert(Overuse {
                count: 0,
                // Assume we've been over-using half of the time since the previous sample.
                time_overusing: send_delta / 2.0,
            });
            if overuse.count > 0 {
                overuse.time_overusing += send_delta;
            }
            overuse.count += 1;

            if overuse.time_overusing > OVER_USE_TIME_THRESHOLD_MS
                && overuse.count > 1
                && trend >= self.previous_trend
            {
                self.overuse = None;
                self.update_hypothesis(BandwidthUsage::Overuse);
            }
        } else if modified_trend < -self.delay_threshold {
            self.overuse = None;
            self.update_hypothesis(BandwidthUsage::Underuse);
        } else {
            self.overuse = None;
            self.update_hypothesis(BandwidthUsage::Normal);
        }

        self.previous_trend = trend;
        self.update_threshold(modified_trend, now);
    }

    fn update_threshold(&mut self, modified_trend: f64, now: Instant) {
        let last = *self.last_threshold_update.get_or_insert(now);

        if modified_trend.abs() > self.delay_threshold + MAX_ADOPT_OFFSET_MS {
            // Don't adapt to big latency spikes, like those caused by a sudden capacity drop.
            self.last_threshold_update = Some(now);
            return;
        }

        let k = if modified_trend.abs() < self.delay_threshold {
            K_DOWN
        } else {
            K_UP
        };
        let time_delta_ms = now.saturating_duration_since(last).as_millis() as f64;
        self.delay_threshold +=
            k * (modified_trend.abs() - self.delay_threshold) * time_delta_ms.min(100.0);
        self.delay_threshold = self.delay_threshold.clamp(6.0, 600.0);
        self.last_threshold_update = Some(now);
    }

    fn update_hypothesis(&mut self, new_hypothesis: BandwidthUsage) {
        if self.hypothesis == new_hypothesis {
            return;
        }

        debug!("Trendline hypothesis: {}", new_hypothesis);
        self.hypothesis = new_hypothesis;
    }
}

#[derive(Debug)]
struct Timing {
    arrival: f64,
    smoothed_delay: f64,
}

struct Overuse {
    count: usize,
    time_overusing: f64,
}
