use std::time::{Duration, Instant};

use crate::rtp::{Bitrate, DataSize};

use super::macros::log_pacer_debt;

/// Debt that can be cleared within this time is not worth waiting for.
const PACING: Duration = Duration::from_millis(5);

/// Never accumulate more debt than can be drained in this time.
const MAX_DEBT_IN_TIME: Duration = Duration::from_millis(500);

/// Leaky bucket pacing budget.
///
/// Every send adds to a debt that drains at the pacing rate. As long as the debt can be
/// drained within one pacing interval, the next packet may go.
#[derive(Debug)]
pub(crate) struct LeakyBudget {
    pacing_bitrate: Bitrate,
    debt: DataSize,
    last_handle_time: Option<Instant>,
}

impl LeakyBudget {
    pub fn new(pacing_bitrate: Bitrate) -> Self {
        LeakyBudget {
            pacing_bitrate,
            debt: DataSize::ZERO,
            last_handle_time: None,
        }
    }

    pub fn set_pacing_rate(&mut self, pacing_bitrate: Bitrate) {
        self.pacing_bitrate = pacing_bitrate;
    }

    pub fn pacing_rate(&self) -> Bitrate {
        self.pacing_bitrate
    }

    fn clear_debt(&mut self, now: Instant) {
        let Some(previous_handle_time) = self.last_handle_time else {
            self.last_handle_time = Some(now);
            return;
        };

        let elapsed = now.saturating_duration_since(previous_handle_time);
        self.last_handle_time = Some(now.max(previous_handle_time));

        self.debt = self.debt.saturating_sub(self.pacing_bitrate * elapsed);
        log_pacer_debt!(self.debt.as_bytes_usize());
    }

    /// Register a send of `size` at `now`.
    pub fn on_sent(&mut self, size: DataSize, now: Instant) {
        self.clear_debt(now);
        self.debt += size;

        let max_debt = self.pacing_bitrate * MAX_DEBT_IN_TIME;
        if self.debt > max_debt {
            self.debt = max_debt;
        }
    }

    /// Time until the budget allows another send.
    pub fn time_until_send(&mut self, now: Instant) -> Duration {
        self.clear_debt(now);

        if self.pacing_bitrate <= Bitrate::ZERO {
            return Duration::ZERO;
        }

        let drain_debt_time = self.debt / self.pacing_bitrate;
        if drain_debt_time > PACING {
            drain_debt_time - PACING
        } else {
            Duration::ZERO
        }
    }
}
