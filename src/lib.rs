//! Unreliable datagram transport core for real-time media.
//!
//! `roq` sits between a media encoder and a byte-oriented duplex channel that can send and
//! receive discrete unreliable frames (such as QUIC DATAGRAM frames). It provides:
//!
//! * [`FrameQueue`], a bidirectional buffer of unreliable frames with backpressure,
//!   completion notification and a terminal, idempotent close.
//! * A feedback codec for transport-wide congestion control (TWCC) and for
//!   RFC 8888 congestion control feedback, see [`feedback`].
//! * Two bandwidth estimators behind the [`BandwidthEstimator`] trait: a window
//!   estimator driven by delay gradient and loss, and a self-clocked estimator driven by
//!   queueing delay. They are selected at construction via the [`Bwe`] enum.
//! * A [`RateController`] that damps estimates before handing them to the [`Encoder`].
//! * A [`Session`] tying it all together.
//!
//! Like the rest of this crate the estimators are driven purely by the caller. There is no
//! internal clock: every operation that depends on time takes `now: Instant`.
//!
//! # Feedback loop
//!
//! ```text
//!  encoder ─► packetizer ─► FrameQueue::enqueue_send ─► scheduler ─► network
//!                                                                       │
//!  Encoder::set_bitrate ◄─ RateController ◄─ estimator ◄─ feedback ◄────┘
//! ```
//!
//! The receiving side observes RTP packets with [`Session::observe_rtp`], and periodically
//! calls [`Session::flush_feedback`] to produce feedback which travels back over the same
//! frame queue.
//!
//! # Configuration
//!
//! [`SessionConfig`] is a builder that can also be (de)serialized with serde.
//!
//! ```
//! use roq::{SessionConfig, EstimatorKind, FeedbackFormat};
//! use roq::rtp::Bitrate;
//!
//! let config = SessionConfig::new()
//!     .set_estimator(EstimatorKind::Window)
//!     .set_feedback_format(FeedbackFormat::Twcc)
//!     .set_initial_bitrate(Bitrate::kbps(1_000));
//!
//! assert!(config.validate().is_ok());
//! ```
#![forbid(unsafe_code)]
#![allow(clippy::new_without_default)]
#![allow(clippy::manual_range_contains)]
#![deny(missing_docs)]

#[macro_use]
extern crate tracing;

use std::io;

use thiserror::Error;

mod util;

pub mod rtp;
use rtp::Ssrc;

mod queue;
pub use queue::{Completion, FrameQueue, QueueError};

pub mod feedback;
use feedback::FeedbackError;

pub mod bwe;
pub use bwe::{BandwidthEstimate, BandwidthEstimator, Bwe, CcState, TargetBitrate};

mod rate;
pub use rate::{Encoder, RateController, RateDecision};

mod config;
pub use config::{ConfigError, EstimatorKind, FeedbackFormat, SessionConfig};

mod session;
pub use session::{Session, SessionEvent, Subscription};

/// Errors for the whole crate.
pub mod error {
    pub use crate::config::ConfigError;
    pub use crate::feedback::FeedbackError;
    pub use crate::queue::QueueError;
}

/// Errors surfaced by the [`Session`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RoqError {
    /// The frame queue is closed.
    #[error("{0}")]
    Queue(#[from] QueueError),

    /// Feedback could not be decoded.
    #[error("{0}")]
    Feedback(#[from] FeedbackError),

    /// Invalid configuration.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// Other IO errors.
    #[error("{0}")]
    Io(#[from] io::Error),

    /// The SSRC is not registered in the stream table.
    #[error("SSRC is unknown {0}")]
    UnknownStream(Ssrc),

    /// The SSRC is already registered in the stream table.
    #[error("SSRC is already registered {0}")]
    DuplicateStream(Ssrc),
}

/// Log a statistic.
///
/// This macro can be used to log statistics that can then be parsed and graphed.
///
/// The name must be a literal string, the rest of the arguments are values.
///
/// ```ignore
/// log_stat!("BWE_TARGET", ssrc, bitrate);
/// ```
///
/// Results in a line on stdout of the form:
///
/// ```text
/// BWE_TARGET 1234,1000000,{unix_timestamp_ms}
/// ```
///
/// Compiles to nothing unless the `_internal_dont_use_log_stats` feature is enabled.
macro_rules! log_stat {
    ($name:expr, $($arg:expr),+) => {
        #[cfg(feature = "_internal_dont_use_log_stats")]
        {
            use std::io::{self, Write};
            use std::time::SystemTime;

            let unix_time_ms = SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .map(|d| d.as_millis())
                .unwrap_or_default();
            let mut lock = io::stdout().lock();
            let _ = write!(lock, "{} ", $name);
            $(
                let _ = write!(lock, "{},", $arg);
            )+
            let _ = writeln!(lock, "{}", unix_time_ms);
        }
    };
}
pub(crate) use log_stat;
