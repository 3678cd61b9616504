use std::time::{Duration, Instant};

use once_cell::sync::Lazy;

/// An instant that is guaranteed to be before any instant passed in by the user.
pub(crate) fn already_happened() -> Instant {
    static PAST: Lazy<Instant> = Lazy::new(|| {
        let now = Instant::now();
        // Instant can't go before boot on some platforms. Back off until it works.
        let mut secs = 3600;
        loop {
            if let Some(v) = now.checked_sub(Duration::from_secs(secs)) {
                break v;
            }
            secs /= 2;
            if secs == 0 {
                break now;
            }
        }
    });
    *PAST
}

pub(crate) trait Soonest {
    fn soonest(self, other: Self) -> Self;
}

impl Soonest for Option<Duration> {
    fn soonest(self, other: Self) -> Self {
        match (self, other) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (None, v) | (v, None) => v,
        }
    }
}
