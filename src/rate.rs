use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::bwe::{BandwidthEstimate, TargetBitrate};
use crate::rtp::Bitrate;

/// The media encoder, as seen by the rate controller.
pub trait Encoder: Send {
    /// Change the target bitrate.
    fn set_bitrate(&mut self, bitrate: Bitrate);

    /// The current target bitrate.
    fn bitrate(&self) -> Bitrate;
}

/// What the controller did with an estimate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateDecision {
    /// The encoder was set to this bitrate.
    Applied(Bitrate),
    /// The estimate was ignored.
    Dropped,
    /// Loss was detected. The bitrate is unchanged, but the encoder should produce a
    /// keyframe.
    KeyframeRequested,
}

struct Inner {
    encoder: Box<dyn Encoder>,
    interval: Duration,
    min_bitrate: Bitrate,
    max_bitrate: Bitrate,
    last_update: Option<Instant>,
    last_seq: Option<u64>,
}

impl Inner {
    fn apply(&mut self, estimate: &BandwidthEstimate, now: Instant) -> RateDecision {
        let target = match estimate.target {
            TargetBitrate::LossDetected => {
                debug!("Loss on {}, request keyframe", estimate.ssrc);
                return RateDecision::KeyframeRequested;
            }
            TargetBitrate::Rate(v) => v,
        };

        let current = self.encoder.bitrate();

        if target < current {
            let rate = target.max(self.min_bitrate);
            if rate >= current {
                return RateDecision::Dropped;
            }
            self.encoder.set_bitrate(rate);
            self.last_update = Some(now);
            debug!("Decrease {} {} -> {}", estimate.ssrc, current, rate);
            return RateDecision::Applied(rate);
        }

        let too_soon = self
            .last_update
            .map_or(false, |t| now.saturating_duration_since(t) < self.interval);
        if too_soon {
            trace!("Drop increase {} to {}, too soon", estimate.ssrc, target);
            return RateDecision::Dropped;
        }

        let rate = target.min(self.max_bitrate);
        if rate <= current {
            return RateDecision::Dropped;
        }

        self.encoder.set_bitrate(rate);
        self.last_update = Some(now);
        debug!("Increase {} {} -> {}", estimate.ssrc, current, rate);

        RateDecision::Applied(rate)
    }
}

/// Damps bandwidth estimates before handing them to an [`Encoder`].
///
/// Decreases go straight through. Increases are held back until `interval` has passed
/// since the last accepted change, and are never above the estimate or the max bitrate.
/// An increase that arrives too early is dropped, not queued.
pub struct RateController {
    inner: Mutex<Inner>,
}

impl RateController {
    /// New controller for an encoder.
    pub fn new(
        encoder: impl Encoder + 'static,
        interval: Duration,
        min_bitrate: Bitrate,
        max_bitrate: Bitrate,
    ) -> Self {
        RateController {
            inner: Mutex::new(Inner {
                encoder: Box::new(encoder),
                interval,
                min_bitrate,
                max_bitrate,
                last_update: None,
                last_seq: None,
            }),
        }
    }

    /// Handle an estimate.
    pub fn on_estimate(&self, estimate: &BandwidthEstimate, now: Instant) -> RateDecision {
        self.inner.lock().apply(estimate, now)
    }

    /// Handle an estimate stamped with the order it was produced in.
    ///
    /// A rate older than one already handled is dropped. Loss is always passed on.
    pub(crate) fn on_estimate_in_order(
        &self,
        estimate: &BandwidthEstimate,
        seq: u64,
        now: Instant,
    ) -> RateDecision {
        let mut inner = self.inner.lock();

        if matches!(estimate.target, TargetBitrate::Rate(_)) {
            if inner.last_seq.map_or(false, |last| seq <= last) {
                trace!("Drop stale estimate {} for {}", seq, estimate.ssrc);
                return RateDecision::Dropped;
            }
            inner.last_seq = Some(seq);
        }

        inner.apply(estimate, now)
    }

    /// The encoder's current bitrate.
    pub fn bitrate(&self) -> Bitrate {
        self.inner.lock().encoder.bitrate()
    }
}

impl fmt::Debug for RateController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("RateController")
            .field("bitrate", &inner.encoder.bitrate())
            .field("interval", &inner.interval)
            .field("last_update", &inner.last_update)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;

    #[derive(Clone)]
    struct TestEncoder(Arc<Mutex<(Bitrate, usize)>>);

    impl Encoder for TestEncoder {
        fn set_bitrate(&mut self, bitrate: Bitrate) {
            let mut v = self.0.lock();
            v.0 = bitrate;
            v.1 += 1;
        }

        fn bitrate(&self) -> Bitrate {
            self.0.lock().0
        }
    }

    fn estimate(target: TargetBitrate, at: Instant) -> BandwidthEstimate {
        BandwidthEstimate {
            ssrc: 1.into(),
            target,
            at,
        }
    }

    fn rate(kbps: u64) -> TargetBitrate {
        TargetBitrate::Rate(Bitrate::kbps(kbps))
    }

    fn setup() -> (RateController, Arc<Mutex<(Bitrate, usize)>>) {
        let state = Arc::new(Mutex::new((Bitrate::kbps(500), 0)));
        let rc = RateController::new(
            TestEncoder(state.clone()),
            Duration::from_millis(200),
            Bitrate::kbps(100),
            Bitrate::mbps(2),
        );
        (rc, state)
    }

    #[test]
    fn increase_is_damped() {
        let now = Instant::now();
        let (rc, state) = setup();

        assert_eq!(
            rc.on_estimate(&estimate(rate(800), now), now),
            RateDecision::Applied(Bitrate::kbps(800))
        );

        let t = now + Duration::from_millis(100);
        assert_eq!(rc.on_estimate(&estimate(rate(900), t), t), RateDecision::Dropped);
        assert_eq!(rc.bitrate(), Bitrate::kbps(800));

        let t = now + Duration::from_millis(200);
        assert_eq!(
            rc.on_estimate(&estimate(rate(900), t), t),
            RateDecision::Applied(Bitrate::kbps(900))
        );
        assert_eq!(state.lock().1, 2);
    }

    #[test]
    fn decrease_is_immediate() {
        let now = Instant::now();
        let (rc, _) = setup();

        rc.on_estimate(&estimate(rate(800), now), now);

        let t = now + Duration::from_millis(10);
        assert_eq!(
            rc.on_estimate(&estimate(rate(300), t), t),
            RateDecision::Applied(Bitrate::kbps(300))
        );

        // A decrease counts as an update.
        let t = t + Duration::from_millis(100);
        assert_eq!(rc.on_estimate(&estimate(rate(400), t), t), RateDecision::Dropped);

        // Not below min.
        assert_eq!(
            rc.on_estimate(&estimate(rate(10), t), t),
            RateDecision::Applied(Bitrate::kbps(100))
        );
    }

    #[test]
    fn clamped_to_max() {
        let now = Instant::now();
        let (rc, _) = setup();
        assert_eq!(
            rc.on_estimate(&estimate(rate(10_000), now), now),
            RateDecision::Applied(Bitrate::mbps(2))
        );
    }

    #[test]
    fn loss_requests_keyframe() {
        let now = Instant::now();
        let (rc, state) = setup();
        assert_eq!(
            rc.on_estimate(&estimate(TargetBitrate::LossDetected, now), now),
            RateDecision::KeyframeRequested
        );
        assert_eq!(*state.lock(), (Bitrate::kbps(500), 0));
    }

    #[test]
    fn stale_rate_after_newer_is_dropped() {
        let now = Instant::now();
        let (rc, state) = setup();

        // Produced second, handled first.
        assert_eq!(
            rc.on_estimate_in_order(&estimate(rate(300), now), 2, now),
            RateDecision::Applied(Bitrate::kbps(300))
        );

        let t = now + Duration::from_millis(500);
        assert_eq!(
            rc.on_estimate_in_order(&estimate(rate(900), now), 1, t),
            RateDecision::Dropped
        );
        assert_eq!(*state.lock(), (Bitrate::kbps(300), 1));

        // Loss is never stale.
        assert_eq!(
            rc.on_estimate_in_order(&estimate(TargetBitrate::LossDetected, now), 1, t),
            RateDecision::KeyframeRequested
        );

        assert_eq!(
            rc.on_estimate_in_order(&estimate(rate(900), t), 3, t),
            RateDecision::Applied(Bitrate::kbps(900))
        );
    }
}
