use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Sub};

use serde::{Deserialize, Serialize};

use crate::error::{PoolError, PoolResult};

const UNITS: &[(u64, &str)] = &[
    (1 << 60, "EiB"),
    (1 << 50, "PiB"),
    (1 << 40, "TiB"),
    (1 << 30, "GiB"),
    (1 << 20, "MiB"),
    (1 << 10, "KiB"),
];

/// A byte count with a human-readable binary-unit formatter.
///
/// Arithmetic wraps on overflow.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ByteSize(pub u64);

impl ByteSize {
    pub const ZERO: ByteSize = ByteSize(0);

    pub fn new(bytes: u64) -> Self {
        ByteSize(bytes)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn saturating_sub(self, other: ByteSize) -> ByteSize {
        ByteSize(self.0.saturating_sub(other.0))
    }
}

impl fmt::Display for ByteSize {
    /// Picks the largest unit in which the value renders as at least
    /// two thirds (`size >= unit / 1.5`), with at most one fractional
    /// digit. Zero renders as `0B`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            return write!(f, "0B");
        }
        for &(unit, suffix) in UNITS {
            if self.0 as f64 >= unit as f64 / 1.5 {
                let value = (self.0 as f64 / unit as f64 * 10.0).round() / 10.0;
                return if value.fract() == 0.0 {
                    write!(f, "{}{}", value as u64, suffix)
                } else {
                    write!(f, "{value:.1}{suffix}")
                };
            }
        }
        write!(f, "{}B", self.0)
    }
}

impl From<u64> for ByteSize {
    fn from(bytes: u64) -> Self {
        ByteSize(bytes)
    }
}

impl Add for ByteSize {
    type Output = ByteSize;

    fn add(self, rhs: ByteSize) -> ByteSize {
        ByteSize(self.0.wrapping_add(rhs.0))
    }
}

impl AddAssign for ByteSize {
    fn add_assign(&mut self, rhs: ByteSize) {
        self.0 = self.0.wrapping_add(rhs.0);
    }
}

impl Sub for ByteSize {
    type Output = ByteSize;

    fn sub(self, rhs: ByteSize) -> ByteSize {
        ByteSize(self.0.wrapping_sub(rhs.0))
    }
}

impl Sum for ByteSize {
    fn sum<I: Iterator<Item = ByteSize>>(iter: I) -> ByteSize {
        iter.fold(ByteSize::ZERO, |acc, item| acc + item)
    }
}

/// Number of redundant copies expected beyond the primary, 0 through 10.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct DuplicationLevel(u8);

impl DuplicationLevel {
    pub const DISABLED: DuplicationLevel = DuplicationLevel(0);
    pub const SINGLE: DuplicationLevel = DuplicationLevel(1);
    pub const DOUBLE: DuplicationLevel = DuplicationLevel(2);
    pub const TRIPLE: DuplicationLevel = DuplicationLevel(3);
    pub const MAX: u8 = 10;

    pub fn new(level: u8) -> PoolResult<Self> {
        if level > Self::MAX {
            return Err(PoolError::InvalidArgument(format!(
                "duplication level {level} exceeds maximum {}",
                Self::MAX
            )));
        }
        Ok(DuplicationLevel(level))
    }

    /// Clamps an observed sentinel count into the valid range.
    pub fn clamped(level: u32) -> Self {
        DuplicationLevel(level.min(Self::MAX as u32) as u8)
    }

    pub fn get(self) -> u8 {
        self.0
    }

    pub fn is_disabled(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for DuplicationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
