use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Div, Mul, Sub, SubAssign};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A data rate expressed as bits per second (bps).
///
/// Internally the value is tracked as a floating point number for accuracy in the presence of
/// repeated calculations that can yield decimal values.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Bitrate(f64);

impl Bitrate {
    /// Nothing.
    pub const ZERO: Self = Self::new(0);

    /// Create a bitrate from bits per second.
    pub const fn new(bps: u64) -> Self {
        Bitrate(bps as f64)
    }

    /// Create a bitrate from kilobits per second.
    pub const fn kbps(kbps: u64) -> Self {
        Self::new(kbps * 10_u64.pow(3))
    }

    /// Create a bitrate from megabits per second.
    pub const fn mbps(mbps: u64) -> Self {
        Self::new(mbps * 10_u64.pow(6))
    }

    /// The bitrate as a float of bits per second.
    pub fn as_f64(&self) -> f64 {
        self.0
    }

    /// The bitrate rounded up to whole bits per second.
    pub fn as_u64(&self) -> u64 {
        self.0.ceil() as u64
    }

    /// Restrict the bitrate to the given bounds.
    pub fn clamp(&self, min: Self, max: Self) -> Self {
        Self(self.0.clamp(min.0, max.0))
    }

    /// The smaller of two bitrates.
    pub fn min(self, other: Self) -> Self {
        Self(self.0.min(other.0))
    }

    /// The larger of two bitrates.
    pub fn max(self, other: Self) -> Self {
        Self(self.0.max(other.0))
    }
}

impl From<u64> for Bitrate {
    fn from(value: u64) -> Self {
        Self::new(value)
    }
}

impl From<f64> for Bitrate {
    fn from(value: f64) -> Self {
        Self(value)
    }
}

impl Mul<Duration> for Bitrate {
    type Output = DataSize;

    fn mul(self, rhs: Duration) -> Self::Output {
        let bytes = self.0 * rhs.as_secs_f64() / 8.0;

        DataSize::bytes(bytes.max(0.0).round() as u64)
    }
}

impl Mul<f64> for Bitrate {
    type Output = Bitrate;

    fn mul(self, rhs: f64) -> Self::Output {
        Bitrate(self.0 * rhs)
    }
}

impl Div<f64> for Bitrate {
    type Output = Bitrate;

    fn div(self, rhs: f64) -> Self::Output {
        Bitrate(self.0 / rhs)
    }
}

impl Add for Bitrate {
    type Output = Bitrate;

    fn add(self, rhs: Self) -> Self::Output {
        Bitrate(self.0 + rhs.0)
    }
}

impl Sub for Bitrate {
    type Output = Bitrate;

    fn sub(self, rhs: Self) -> Self::Output {
        Bitrate(self.0 - rhs.0)
    }
}

impl fmt::Display for Bitrate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rate = self.0;
        if rate < 1.0 {
            return write!(f, "{rate}bit/s");
        }
        let log = rate.log10().floor() as u64;

        match log {
            0..=2 => write!(f, "{rate}bit/s"),
            3..=5 => write!(f, "{:.3}kbit/s", rate / 1e3),
            6..=8 => write!(f, "{:.3}Mbit/s", rate / 1e6),
            _ => write!(f, "{:.3}Gbit/s", rate / 1e9),
        }
    }
}

/// An amount of data in bytes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataSize(u64);

impl DataSize {
    /// Nothing.
    pub const ZERO: Self = DataSize::bytes(0);

    /// Create a size from a number of bytes.
    pub const fn bytes(bytes: u64) -> DataSize {
        Self(bytes)
    }

    /// The size as a float number of bytes.
    pub fn as_bytes_f64(&self) -> f64 {
        self.0 as f64
    }

    /// The size in bytes.
    pub fn as_bytes_usize(&self) -> usize {
        self.0 as usize
    }

    /// Subtract, stopping at zero.
    pub fn saturating_sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }
}

impl From<usize> for DataSize {
    fn from(value: usize) -> Self {
        Self(value as u64)
    }
}

impl From<u64> for DataSize {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl Div<Duration> for DataSize {
    type Output = Bitrate;

    fn div(self, rhs: Duration) -> Self::Output {
        let secs = rhs.as_secs_f64();
        if secs == 0.0 {
            return Bitrate::ZERO;
        }

        ((self.as_bytes_f64() * 8.0) / secs).into()
    }
}

impl Div<Bitrate> for DataSize {
    type Output = Duration;

    fn div(self, rhs: Bitrate) -> Self::Output {
        if rhs.as_f64() <= 0.0 {
            return Duration::ZERO;
        }
        let seconds = self.as_bytes_f64() * 8.0 / rhs.as_f64();

        Duration::from_secs_f64(seconds)
    }
}

impl Mul<f64> for DataSize {
    type Output = DataSize;

    fn mul(self, rhs: f64) -> Self::Output {
        Self((self.0 as f64 * rhs).max(0.0).round() as u64)
    }
}

impl AddAssign<DataSize> for DataSize {
    fn add_assign(&mut self, rhs: DataSize) {
        self.0 += rhs.0;
    }
}

impl SubAssign<DataSize> for DataSize {
    fn sub_assign(&mut self, rhs: DataSize) {
        self.0 = self.0.saturating_sub(rhs.0);
    }
}

impl Add<DataSize> for DataSize {
    type Output = DataSize;

    fn add(self, rhs: DataSize) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl Sum<DataSize> for DataSize {
    fn sum<I: Iterator<Item = DataSize>>(iter: I) -> Self {
        iter.fold(DataSize::ZERO, |acc, s| acc + s)
    }
}

impl fmt::Display for DataSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let size = self.0 as f64;
        if self.0 == 0 {
            return write!(f, "0B");
        }
        let log = size.log10().floor() as u64;

        match log {
            0..=2 => write!(f, "{size}B"),
            3..=5 => write!(f, "{:.3}kB", size / 1e3),
            6..=8 => write!(f, "{:.3}MB", size / 1e6),
            _ => write!(f, "{:.3}GB", size / 1e9),
        }
    }
}
