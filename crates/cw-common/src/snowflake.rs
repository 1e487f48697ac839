//! Time-ordered 63-bit identifiers
//!
//! Layout (most significant bit always zero):
//!
//! ```text
//! | 43 bits: milliseconds since EPOCH_MS | 20 bits: sequence |
//! ```
//!
//! There is no shared counter. The caller reads the most recently recorded
//! identifier back from the store inside the transaction that will insert the
//! new one, and the store's serializable isolation rejects the loser when two
//! writers race on the same value.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Width of the sequence field in the low bits.
pub const SEQUENCE_BITS: u32 = 20;

/// Fixed epoch, in Unix milliseconds (2024-01-01T05:00:00Z).
pub const EPOCH_MS: i64 = 1_704_085_200_000;

/// Exclusive upper bound of the timestamp field.
const TIMESTAMP_LIMIT: i64 = 1 << (63 - SEQUENCE_BITS);

const SEQUENCE_MASK: i64 = (1 << SEQUENCE_BITS) - 1;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SnowflakeError {
    #[error("snowflakes are unsigned 63-bit integers, got {0}")]
    Negative(i64),

    #[error("time is out of range: {millis}ms relative to the snowflake epoch")]
    ClockOutOfRange { millis: i64 },

    #[error("identifier space exhausted")]
    Exhausted,

    #[error("invalid snowflake: {0}")]
    Parse(String),
}

/// A time-ordered unique identifier.
///
/// Used both as the primary key of a recorded message and as the exclusive
/// cursor for incremental reads. Serialised as a decimal string because the
/// values exceed the safe integer range of JavaScript clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Snowflake(i64);

impl Snowflake {
    /// Wrap a raw value read from the store.
    pub fn from_raw(raw: i64) -> Result<Self, SnowflakeError> {
        if raw < 0 {
            return Err(SnowflakeError::Negative(raw));
        }
        Ok(Self(raw))
    }

    pub fn raw(self) -> i64 {
        self.0
    }

    /// Milliseconds since [`EPOCH_MS`].
    pub fn timestamp_field(self) -> i64 {
        self.0 >> SEQUENCE_BITS
    }

    pub fn sequence(self) -> i64 {
        self.0 & SEQUENCE_MASK
    }

    /// Wall-clock instant encoded in the timestamp field.
    pub fn timestamp(self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.timestamp_field() + EPOCH_MS)
    }

    /// Compute the identifier that follows `last` at time `now`.
    ///
    /// If the clock has not moved past the millisecond of `last`, the result is
    /// `last + 1`; a full sequence field carries into the timestamp field, so
    /// ordering still holds. Otherwise the result starts a fresh millisecond
    /// with a zero sequence.
    ///
    /// Errors indicate clock or epoch misconfiguration and must not be retried.
    pub fn next(last: Option<Snowflake>, now: DateTime<Utc>) -> Result<Snowflake, SnowflakeError> {
        let millis = now.timestamp_millis() - EPOCH_MS;
        if !(0..TIMESTAMP_LIMIT).contains(&millis) {
            return Err(SnowflakeError::ClockOutOfRange { millis });
        }

        let last_raw = last.map_or(0, Snowflake::raw);
        if millis <= last_raw >> SEQUENCE_BITS {
            last_raw
                .checked_add(1)
                .map(Snowflake)
                .ok_or(SnowflakeError::Exhausted)
        } else {
            Ok(Snowflake(millis << SEQUENCE_BITS))
        }
    }
}

impl fmt::Display for Snowflake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Snowflake {
    type Err = SnowflakeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw: i64 = s
            .trim()
            .parse()
            .map_err(|_| SnowflakeError::Parse(s.to_string()))?;
        Snowflake::from_raw(raw)
    }
}

impl Serialize for Snowflake {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Snowflake {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
