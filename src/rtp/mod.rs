//! Primitive RTP types shared by the feedback codec and the estimators.

mod bandwidth;
pub use bandwidth::{Bitrate, DataSize};

mod id;
pub use id::{extend_u16, SeqNo, SeqUnwrapper, Ssrc};

mod header;
pub use header::{RtpHeader, TransportSequence};
