//! Session tokens
//!
//! 32 bytes: the first 8 hold the creation time in Unix nanoseconds
//! (big-endian) so tokens sort roughly by age in diagnostics, the remaining 24
//! come from the operating system's CSPRNG.

use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::Result;

pub const TOKEN_LEN: usize = 32;

const TIMESTAMP_LEN: usize = 8;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionToken([u8; TOKEN_LEN]);

impl SessionToken {
    /// Mint a new token stamped with `now`.
    pub fn mint(now: DateTime<Utc>) -> Result<Self> {
        let mut bytes = [0u8; TOKEN_LEN];
        let nanos = now
            .timestamp_nanos_opt()
            .and_then(|n| u64::try_from(n).ok())
            .unwrap_or_default();
        bytes[..TIMESTAMP_LEN].copy_from_slice(&nanos.to_be_bytes());
        OsRng.try_fill_bytes(&mut bytes[TIMESTAMP_LEN..])?;
        Ok(Self(bytes))
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; TOKEN_LEN] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; TOKEN_LEN] {
        &self.0
    }

    /// Cookie representation: URL-safe base64 without padding.
    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0)
    }

    /// Parse a cookie value. `None` for anything that is not exactly 32
    /// encoded bytes.
    pub fn decode(value: &str) -> Option<Self> {
        let bytes = URL_SAFE_NO_PAD.decode(value.trim()).ok()?;
        Self::from_bytes(&bytes)
    }

    /// Creation time recorded in the token prefix. `None` when the prefix of
    /// a client-supplied token is past what a signed nanosecond count holds.
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        let mut prefix = [0u8; TIMESTAMP_LEN];
        prefix.copy_from_slice(&self.0[..TIMESTAMP_LEN]);
        let nanos = i64::try_from(u64::from_be_bytes(prefix)).ok()?;
        Some(DateTime::from_timestamp_nanos(nanos))
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Only the timestamp prefix; the random part is a credential.
        match self.created_at() {
            Some(created) => write!(f, "SessionToken(created {})", created.to_rfc3339()),
            None => write!(f, "SessionToken(created unknown)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_token_round_trips_through_cookie_encoding() {
        let token = SessionToken::mint(Utc::now()).unwrap();
        let encoded = token.encode();

        assert_eq!(encoded.len(), 43);
        assert!(!encoded.contains('='));
        assert!(!encoded.contains('+') && !encoded.contains('/'));
        assert_eq!(SessionToken::decode(&encoded), Some(token));
    }

    #[test]
    fn test_mint_stamps_creation_time() {
        let now = Utc.with_ymd_and_hms(2025, 3, 14, 15, 9, 26).unwrap();
        let token = SessionToken::mint(now).unwrap();
        assert_eq!(token.created_at(), Some(now));
    }

    #[test]
    fn test_minted_tokens_differ() {
        let now = Utc::now();
        let a = SessionToken::mint(now).unwrap();
        let b = SessionToken::mint(now).unwrap();
        assert_eq!(a.as_bytes()[..8], b.as_bytes()[..8]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_decode_rejects_malformed_values() {
        assert_eq!(SessionToken::decode(""), None);
        assert_eq!(SessionToken::decode("not base64!!"), None);
        // Valid base64, wrong length.
        assert_eq!(SessionToken::decode(&URL_SAFE_NO_PAD.encode([7u8; 16])), None);
        assert_eq!(SessionToken::decode(&URL_SAFE_NO_PAD.encode([7u8; 33])), None);
    }

    #[test]
    fn test_debug_output_hides_random_bytes() {
        let token = SessionToken::from_bytes(&[0xAB; TOKEN_LEN]).unwrap();
        let debug = format!("{:?}", token);
        assert!(debug.starts_with("SessionToken(created "));
        assert!(!debug.contains("ab"));
    }

    #[test]
    fn test_out_of_range_prefix_has_no_creation_time() {
        let mut bytes = [0u8; TOKEN_LEN];
        bytes[0] = 0x80;
        let token = SessionToken::from_bytes(&bytes).unwrap();
        assert_eq!(token.created_at(), None);
        assert_eq!(format!("{:?}", token), "SessionToken(created unknown)");

        bytes[0] = 0x7F;
        let token = SessionToken::from_bytes(&bytes).unwrap();
        assert!(token.created_at().unwrap() > Utc.with_ymd_and_hms(2250, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_mint_before_epoch_stamps_zero() {
        let before = Utc.with_ymd_and_hms(1969, 7, 20, 20, 17, 0).unwrap();
        let token = SessionToken::mint(before).unwrap();
        assert_eq!(token.as_bytes()[..8], [0u8; 8]);
        assert_eq!(token.created_at(), Some(DateTime::from_timestamp_nanos(0)));
    }
}
