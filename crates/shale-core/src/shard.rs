//! Shard naming and timeframe algebra.
//!
//! Shards partition time into fixed 2^17-second quanta (roughly a day and
//! a half). A shard's directory name is the lower-case hex encoding of its
//! start time with the quantum bits stripped; the covered window runs from
//! that start to start + quantum.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of low bits removed when generating a shard name.
pub const SHARD_BITS: u32 = 17;

/// Width of one shard window in seconds.
pub const SHARD_QUANTUM_SECS: i64 = 1 << SHARD_BITS;

const SHARD_MASK: i64 = !(SHARD_QUANTUM_SECS - 1);

/// Errors produced when parsing shard names.
#[derive(Debug, Error)]
pub enum ShardNameError {
    #[error("empty shard name")]
    Empty,

    #[error("shard name {0:?} is not valid hex")]
    NotHex(String),

    #[error("shard name {0:?} is out of range")]
    OutOfRange(String),

    #[error("shard time {0} is not representable")]
    BadTimestamp(i64),
}

/// Identifier of one shard: the unix second its window starts on, with
/// the low quantum bits zeroed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShardId(i64);

impl ShardId {
    /// The shard covering the given instant.
    pub fn of(t: DateTime<Utc>) -> Self {
        Self(t.timestamp() & SHARD_MASK)
    }

    /// The shard immediately following this one.
    pub fn next(self) -> Self {
        Self((self.0 & SHARD_MASK) + SHARD_QUANTUM_SECS)
    }

    /// Unix second the shard's window starts on.
    pub fn start_secs(self) -> i64 {
        self.0
    }

    /// Directory name for this shard: hex of the start time with the
    /// quantum bits stripped.
    pub fn name(self) -> String {
        format!("{:x}", self.0 >> SHARD_BITS)
    }

    /// Parse a shard directory name. A single trailing dotted suffix
    /// (collision versions such as `769f2.1`) is ignored.
    pub fn parse(name: &str) -> Result<Self, ShardNameError> {
        let nm = trim_version(name);
        if nm.is_empty() {
            return Err(ShardNameError::Empty);
        }
        if nm.starts_with('-') {
            return Err(ShardNameError::NotHex(name.to_string()));
        }
        let v = i64::from_str_radix(nm, 16)
            .map_err(|_| ShardNameError::NotHex(name.to_string()))?;
        if v > (i64::MAX >> SHARD_BITS) {
            return Err(ShardNameError::OutOfRange(name.to_string()));
        }
        Ok(Self(v << SHARD_BITS))
    }

    /// The window covered by this shard as `[start, end)` instants.
    pub fn range(self) -> Result<(DateTime<Utc>, DateTime<Utc>), ShardNameError> {
        let start = DateTime::from_timestamp(self.0, 0)
            .ok_or(ShardNameError::BadTimestamp(self.0))?;
        let end = DateTime::from_timestamp(self.next().0, 0)
            .ok_or(ShardNameError::BadTimestamp(self.next().0))?;
        Ok((start, end))
    }
}

/// Parse a shard directory name straight into its covered window.
pub fn shard_name_range(name: &str) -> Result<(DateTime<Utc>, DateTime<Utc>), ShardNameError> {
    ShardId::parse(name)?.range()
}

/// Strip one trailing dotted suffix from a shard name, if present.
pub fn trim_version(name: &str) -> &str {
    match name.rfind('.') {
        Some(idx) => &name[..idx],
        None => name,
    }
}

/// A closed query window over instants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeframe {
    #[serde(rename = "Start")]
    pub start: DateTime<Utc>,
    #[serde(rename = "End")]
    pub end: DateTime<Utc>,
}

impl Timeframe {
    /// The degenerate empty timeframe, used when a well holds no shards.
    pub fn zero() -> Self {
        Self {
            start: DateTime::UNIX_EPOCH,
            end: DateTime::UNIX_EPOCH,
        }
    }

    /// Whether a shard window `[s, e)` should be returned for this query.
    ///
    /// A shard matches when the query start or end falls strictly inside
    /// the window, when any endpoint of the query lands exactly on either
    /// bound, or when the query entirely contains the window.
    pub fn overlaps(&self, s: DateTime<Utc>, e: DateTime<Utc>) -> bool {
        (s < self.start && e > self.start)
            || (s < self.end && e > self.end)
            || s == self.end
            || s == self.start
            || e == self.end
            || e == self.start
            || (self.start < s && self.end > e)
    }
}
