use std::fmt;
use std::ops::Deref;

use serde::{Deserialize, Serialize};

macro_rules! num_id {
    ($id:ident, $t:ty, $doc:literal) => {
        #[doc = $doc]
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $id($t);

        impl Deref for $id {
            type Target = $t;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl From<$t> for $id {
            fn from(v: $t) -> Self {
                $id(v)
            }
        }

        impl fmt::Display for $id {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

num_id!(Ssrc, u32, "Synchronization source identifying one RTP stream.");
num_id!(
    SeqNo,
    u64,
    "Sequence number extended to 64 bits so it never wraps around."
);

impl SeqNo {
    /// The next sequence number.
    pub fn inc(&self) -> SeqNo {
        SeqNo(self.0 + 1)
    }

    /// The low 16 bits as they appear on the wire.
    pub fn as_u16(&self) -> u16 {
        self.0 as u16
    }
}

/// Extend a 16 bit sequence number to 64 bits by picking the value closest to `reference`.
///
/// Values that would end up before 0 are clamped to 0.
pub fn extend_u16(reference: u64, seq: u16) -> u64 {
    let delta = seq.wrapping_sub(reference as u16) as i16 as i64;
    let ext = reference as i64 + delta;
    ext.max(0) as u64
}

/// Recovers a monotonic 64 bit sequence from a stream of 16 bit sequence numbers.
///
/// Each value is extended relative to the highest value seen so far, which makes the
/// unwrapper tolerant to reordering of up to half the sequence space.
#[derive(Debug, Default, Clone)]
pub struct SeqUnwrapper {
    highest: Option<u64>,
}

impl SeqUnwrapper {
    /// New unwrapper that has not seen any value.
    pub fn new() -> Self {
        SeqUnwrapper::default()
    }

    /// Unwrap the next observed value.
    pub fn unwrap(&mut self, seq: u16) -> SeqNo {
        let ext = match self.highest {
            None => seq as u64,
            Some(h) => extend_u16(h, seq),
        };
        self.highest = Some(self.highest.map_or(ext, |h| h.max(ext)));
        ext.into()
    }

    /// The highest extended value seen.
    pub fn highest(&self) -> Option<SeqNo> {
        self.highest.map(SeqNo)
    }
}
