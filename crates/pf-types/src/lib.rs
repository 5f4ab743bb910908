#![forbid(unsafe_code)]
//! Value types for the permafrost region cache.
//!
//! Defines byte-range and byte-size primitives plus node-role names used by
//! cache settings validation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Parse failure for a typed value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

impl ParseError {
    fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

/// Half-open byte interval `[start, end)`.
///
/// Invariant: `start <= end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteRange {
    start: u64,
    end: u64,
}

impl ByteRange {
    #[must_use]
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end, "byte range start {start} > end {end}");
        Self { start, end }
    }

    #[must_use]
    pub fn start(&self) -> u64 {
        self.start
    }

    #[must_use]
    pub fn end(&self) -> u64 {
        self.end
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    #[must_use]
    pub fn contains(&self, position: u64) -> bool {
        self.start <= position && position < self.end
    }

    #[must_use]
    pub fn contains_range(&self, other: ByteRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    #[must_use]
    pub fn overlaps(&self, other: ByteRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Intersection with `other`, or `None` when the ranges are disjoint.
    #[must_use]
    pub fn intersection(&self, other: ByteRange) -> Option<ByteRange> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start < end).then(|| ByteRange::new(start, end))
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

const KB: u64 = 1024;
const MB: u64 = 1024 * KB;
const GB: u64 = 1024 * MB;
const TB: u64 = 1024 * GB;

/// Byte count with `"500"`, `"4kb"`, `"16mb"`, `"100gb"` string forms.
///
/// Units are binary multiples.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ByteSize(pub u64);

impl ByteSize {
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub fn of_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn of_kb(kb: u64) -> Self {
        Self(kb * KB)
    }

    #[must_use]
    pub fn of_mb(mb: u64) -> Self {
        Self(mb * MB)
    }

    #[must_use]
    pub fn of_gb(gb: u64) -> Self {
        Self(gb * GB)
    }

    #[must_use]
    pub fn of_tb(tb: u64) -> Self {
        Self(tb * TB)
    }

    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0;
        for (unit, suffix) in [(TB, "tb"), (GB, "gb"), (MB, "mb"), (KB, "kb")] {
            if bytes >= unit && bytes % unit == 0 {
                return write!(f, "{}{suffix}", bytes / unit);
            }
        }
        write!(f, "{bytes}b")
    }
}

impl FromStr for ByteSize {
    type Err = ParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim().to_ascii_lowercase();
        let (digits, multiplier) = if let Some(rest) = trimmed.strip_suffix("kb") {
            (rest, KB)
        } else if let Some(rest) = trimmed.strip_suffix("mb") {
            (rest, MB)
        } else if let Some(rest) = trimmed.strip_suffix("gb") {
            (rest, GB)
        } else if let Some(rest) = trimmed.strip_suffix("tb") {
            (rest, TB)
        } else if let Some(rest) = trimmed.strip_suffix('b') {
            (rest, 1)
        } else {
            (trimmed.as_str(), 1)
        };
        let value: u64 = digits
            .trim()
            .parse()
            .map_err(|_| ParseError::new("byte size", format!("cannot parse [{input}]")))?;
        value
            .checked_mul(multiplier)
            .map(ByteSize)
            .ok_or_else(|| ParseError::new("byte size", format!("[{input}] overflows u64")))
    }
}

/// Byte size expressed either absolutely or as a percentage of a total.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum RelativeByteSize {
    Absolute(ByteSize),
    /// Percentage of the containing filesystem, in `0.0..=100.0`.
    Ratio(f64),
}

impl RelativeByteSize {
    pub const ZERO: Self = Self::Absolute(ByteSize::ZERO);

    #[must_use]
    pub fn is_absolute(&self) -> bool {
        matches!(self, Self::Absolute(_))
    }

    #[must_use]
    pub fn is_non_zero(&self) -> bool {
        match self {
            Self::Absolute(size) => !size.is_zero(),
            Self::Ratio(percent) => *percent > 0.0,
        }
    }

    /// Resolves this size against `total` bytes.
    ///
    /// A ratio leaves at most `max_headroom` bytes unused: the result is
    /// `max(total * ratio, total - max_headroom)`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn calculate(&self, total: u64, max_headroom: Option<ByteSize>) -> u64 {
        match self {
            Self::Absolute(size) => size.get(),
            Self::Ratio(percent) => {
                let from_ratio = (total as f64 * (percent / 100.0)) as u64;
                match max_headroom {
                    Some(headroom) => from_ratio.max(total.saturating_sub(headroom.get())),
                    None => from_ratio,
                }
            }
        }
    }
}

impl fmt::Display for RelativeByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absolute(size) => size.fmt(f),
            Self::Ratio(percent) => write!(f, "{percent}%"),
        }
    }
}

impl FromStr for RelativeByteSize {
    type Err = ParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();
        if let Some(digits) = trimmed.strip_suffix('%') {
            let percent: f64 = digits
                .trim()
                .parse()
                .map_err(|_| ParseError::new("ratio", format!("cannot parse [{input}]")))?;
            if !(0.0..=100.0).contains(&percent) {
                return Err(ParseError::new(
                    "ratio",
                    format!("[{input}] must lie in 0..=100"),
                ));
            }
            return Ok(Self::Ratio(percent));
        }
        trimmed.parse::<ByteSize>().map(Self::Absolute)
    }
}

/// Role carried by a node, used to gate cache settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeRole {
    DataContent,
    DataHot,
    DataWarm,
    DataCold,
    DataFrozen,
    Ingest,
    Master,
    Search,
    Index,
}

impl NodeRole {
    #[must_use]
    pub fn role_name(&self) -> &'static str {
        match self {
            Self::DataContent => "data_content",
            Self::DataHot => "data_hot",
            Self::DataWarm => "data_warm",
            Self::DataCold => "data_cold",
            Self::DataFrozen => "data_frozen",
            Self::Ingest => "ingest",
            Self::Master => "master",
            Self::Search => "search",
            Self::Index => "index",
        }
    }

    /// True for roles permitted to carry a shared region cache.
    #[must_use]
    pub fn supports_shared_cache(&self) -> bool {
        matches!(self, Self::DataFrozen | Self::Search | Self::Index)
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.role_name())
    }
}

impl FromStr for NodeRole {
    type Err = ParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim() {
            "data_content" => Ok(Self::DataContent),
            "data_hot" => Ok(Self::DataHot),
            "data_warm" => Ok(Self::DataWarm),
            "data_cold" => Ok(Self::DataCold),
            "data_frozen" => Ok(Self::DataFrozen),
            "ingest" => Ok(Self::Ingest),
            "master" => Ok(Self::Master),
            "search" => Ok(Self::Search),
            "index" => Ok(Self::Index),
            other => Err(ParseError::new(
                "node role",
                format!("unknown role [{other}]"),
            )),
        }
    }
}
