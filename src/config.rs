use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use crate::feedback::FeedbackFormat;
use crate::rtp::{Bitrate, Ssrc};

/// Which bandwidth estimator a [`Session`][crate::Session] uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimatorKind {
    /// Loss and delay gradient driven window, see [`WindowBwe`][crate::bwe::WindowBwe].
    Window,
    /// Queueing delay driven, see [`ScreamBwe`][crate::bwe::ScreamBwe].
    SelfClocked,
}

/// Errors from [`SessionConfig::validate`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// The minimum bitrate is above the maximum.
    #[error("min bitrate {min} is above max bitrate {max}")]
    BitrateBounds {
        /// Configured minimum.
        min: Bitrate,
        /// Configured maximum.
        max: Bitrate,
    },

    /// The initial bitrate is not within min and max.
    #[error("initial bitrate {0} is outside the bounds")]
    InitialBitrate(Bitrate),

    /// The inbound queue can't hold anything.
    #[error("inbound capacity must be at least 1")]
    ZeroCapacity,

    /// One-byte header extension ids are 1 to 14.
    #[error("transport-wide extension id {0} is not in 1..=14")]
    ExtensionId(u8),

    /// Intervals must be non-zero.
    #[error("{0} interval must be non-zero")]
    ZeroInterval(&'static str),

    /// Stream priorities must be positive.
    #[error("default priority {0} is not positive")]
    Priority(f64),

    /// The self-clocked estimator only works with RFC 8888 feedback.
    #[error("estimator {0:?} can't be used with {1:?} feedback")]
    Incompatible(EstimatorKind, FeedbackFormat),
}

/// Configuration of a [`Session`][crate::Session].
///
/// ```
/// use std::time::Duration;
/// use roq::{SessionConfig, EstimatorKind, FeedbackFormat};
///
/// let config = SessionConfig::new()
///     .set_estimator(EstimatorKind::SelfClocked)
///     .set_feedback_format(FeedbackFormat::Ccfb)
///     .set_rate_interval(Duration::from_millis(500));
///
/// assert!(config.validate().is_ok());
/// ```
///
/// The config can be (de)serialized, durations are given in milliseconds and missing
/// fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    estimator: EstimatorKind,
    feedback_format: FeedbackFormat,
    initial_bitrate: Bitrate,
    min_bitrate: Bitrate,
    max_bitrate: Bitrate,
    #[serde(with = "millis")]
    rate_interval: Duration,
    inbound_capacity: usize,
    twcc_extension_id: u8,
    #[serde(with = "millis")]
    feedback_interval: Duration,
    default_priority: f64,
    feedback_ssrc: Ssrc,
}

impl SessionConfig {
    /// Creates a new default config.
    pub fn new() -> Self {
        SessionConfig::default()
    }

    /// Set the bandwidth estimator.
    ///
    /// Defaults to [`EstimatorKind::Window`].
    pub fn set_estimator(mut self, kind: EstimatorKind) -> Self {
        self.estimator = kind;
        self
    }

    /// The configured estimator.
    pub fn estimator(&self) -> EstimatorKind {
        self.estimator
    }

    /// Set the congestion control feedback format.
    ///
    /// Defaults to [`FeedbackFormat::Twcc`].
    pub fn set_feedback_format(mut self, format: FeedbackFormat) -> Self {
        self.feedback_format = format;
        self
    }

    /// The configured feedback format.
    pub fn feedback_format(&self) -> FeedbackFormat {
        self.feedback_format
    }

    /// Bitrate used before any feedback arrives, for streams without their own start
    /// bitrate. Defaults to 1Mbit/s.
    pub fn set_initial_bitrate(mut self, bitrate: Bitrate) -> Self {
        self.initial_bitrate = bitrate;
        self
    }

    /// The initial bitrate.
    pub fn initial_bitrate(&self) -> Bitrate {
        self.initial_bitrate
    }

    /// Lowest total bitrate. Defaults to 100kbit/s.
    pub fn set_min_bitrate(mut self, bitrate: Bitrate) -> Self {
        self.min_bitrate = bitrate;
        self
    }

    /// The minimum bitrate.
    pub fn min_bitrate(&self) -> Bitrate {
        self.min_bitrate
    }

    /// Highest total bitrate. Defaults to 15Mbit/s.
    pub fn set_max_bitrate(mut self, bitrate: Bitrate) -> Self {
        self.max_bitrate = bitrate;
        self
    }

    /// The maximum bitrate.
    pub fn max_bitrate(&self) -> Bitrate {
        self.max_bitrate
    }

    /// Minimum time between two bitrate increases handed to the encoder.
    ///
    /// Decreases are always applied right away. Defaults to 200ms.
    ///
    /// ```
    /// # use roq::SessionConfig;
    /// # use std::time::Duration;
    /// let config = SessionConfig::new();
    ///
    /// assert_eq!(config.rate_interval(), Duration::from_millis(200));
    /// ```
    pub fn set_rate_interval(mut self, interval: Duration) -> Self {
        self.rate_interval = interval;
        self
    }

    /// The minimum interval between increases.
    pub fn rate_interval(&self) -> Duration {
        self.rate_interval
    }

    /// How many received frames are held before new ones are discarded.
    ///
    /// Defaults to 1024.
    pub fn set_inbound_capacity(mut self, capacity: usize) -> Self {
        self.inbound_capacity = capacity;
        self
    }

    /// The inbound queue capacity.
    pub fn inbound_capacity(&self) -> usize {
        self.inbound_capacity
    }

    /// RTP header extension id of the transport-wide sequence number. Defaults to 1.
    pub fn set_twcc_extension_id(mut self, id: u8) -> Self {
        self.twcc_extension_id = id;
        self
    }

    /// The transport-wide sequence number extension id.
    pub fn twcc_extension_id(&self) -> u8 {
        self.twcc_extension_id
    }

    /// Longest time between two feedback reports while packets arrive.
    ///
    /// Defaults to 50ms.
    pub fn set_feedback_interval(mut self, interval: Duration) -> Self {
        self.feedback_interval = interval;
        self
    }

    /// The feedback interval.
    pub fn feedback_interval(&self) -> Duration {
        self.feedback_interval
    }

    /// Priority of streams registered with a priority of 0. Defaults to 1.0.
    pub fn set_default_priority(mut self, priority: f64) -> Self {
        self.default_priority = priority;
        self
    }

    /// The default stream priority.
    pub fn default_priority(&self) -> f64 {
        self.default_priority
    }

    /// SSRC used as sender of the feedback we generate. Defaults to 0.
    pub fn set_feedback_ssrc(mut self, ssrc: Ssrc) -> Self {
        self.feedback_ssrc = ssrc;
        self
    }

    /// The feedback sender SSRC.
    pub fn feedback_ssrc(&self) -> Ssrc {
        self.feedback_ssrc
    }

    /// Check the config for inconsistencies.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_bitrate > self.max_bitrate {
            return Err(ConfigError::BitrateBounds {
                min: self.min_bitrate,
                max: self.max_bitrate,
            });
        }

        if self.initial_bitrate < self.min_bitrate || self.initial_bitrate > self.max_bitrate {
            return Err(ConfigError::InitialBitrate(self.initial_bitrate));
        }

        if self.inbound_capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }

        if self.twcc_extension_id < 1 || self.twcc_extension_id > 14 {
            return Err(ConfigError::ExtensionId(self.twcc_extension_id));
        }

        if self.feedback_interval.is_zero() {
            return Err(ConfigError::ZeroInterval("feedback"));
        }

        if !(self.default_priority > 0.0) {
            return Err(ConfigError::Priority(self.default_priority));
        }

        if self.estimator == EstimatorKind::SelfClocked && self.feedback_format == FeedbackFormat::Twcc
        {
            return Err(ConfigError::Incompatible(
                self.estimator,
                self.feedback_format,
            ));
        }

        Ok(())
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            estimator: EstimatorKind::Window,
            feedback_format: FeedbackFormat::Twcc,
            initial_bitrate: Bitrate::mbps(1),
            min_bitrate: Bitrate::kbps(100),
            max_bitrate: Bitrate::mbps(15),
            rate_interval: Duration::from_millis(200),
            inbound_capacity: 1024,
            twcc_extension_id: 1,
            feedback_interval: Duration::from_millis(50),
            default_priority: 1.0,
            feedback_ssrc: 0.into(),
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
