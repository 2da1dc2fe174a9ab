use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Default width of a discovery time bucket.
pub const DEFAULT_BUCKET: Duration = Duration::from_secs(3600);

const CHANNEL_ID_LEN: usize = 20;
const DOMAIN: &[u8] = b"drip:channel:v1";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChannelIdError {
    #[error("channel id must be {} hex characters", CHANNEL_ID_LEN * 2)]
    BadLength,
    #[error("channel id is not valid hex")]
    BadHex,
}

/// The time-bounded rendezvous key derived from the public channel word.
///
/// Both peers compute it independently; it is the only value that ever
/// reaches a discovery substrate. Two runs started in different time
/// buckets produce different ids and cannot discover each other — that
/// bounds the lifetime of a code by construction. A peer starting just
/// before a bucket boundary can miss one starting just after; buckets are
/// deliberately not straddled, since doubling the fan-out doubles the
/// collision surface on public substrates.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId([u8; CHANNEL_ID_LEN]);

impl ChannelId {
    /// Derives the channel id for the current wall-clock bucket.
    #[must_use]
    pub fn derive(channel_phrase: &str, granularity: Duration) -> Self {
        Self::derive_at(channel_phrase, granularity, SystemTime::now())
    }

    /// Derives the channel id for the bucket containing `at`.
    ///
    /// Pure function of its inputs, split out so tests can pin the clock.
    #[must_use]
    pub fn derive_at(channel_phrase: &str, granularity: Duration, at: SystemTime) -> Self {
        let unix_secs = at
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();
        let bucket = unix_secs / granularity.as_secs().max(1);

        let mut hasher = Sha256::new();
        hasher.update(DOMAIN);
        hasher.update(channel_phrase.as_bytes());
        hasher.update(bucket.to_be_bytes());
        let digest = hasher.finalize();

        let mut id = [0u8; CHANNEL_ID_LEN];
        id.copy_from_slice(&digest[..CHANNEL_ID_LEN]);
        Self(id)
    }

    /// Parses the hex form produced by `Display`.
    ///
    /// # Errors
    ///
    /// Fails on wrong length or non-hex input.
    pub fn parse_hex(input: &str) -> Result<Self, ChannelIdError> {
        if input.len() != CHANNEL_ID_LEN * 2 {
            return Err(ChannelIdError::BadLength);
        }
        let bytes = hex::decode(input).map_err(|_| ChannelIdError::BadHex)?;
        let mut id = [0u8; CHANNEL_ID_LEN];
        id.copy_from_slice(&bytes);
        Ok(Self(id))
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelId({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn when_derived_in_same_bucket_expect_equal_ids() {
        // 997_200 is a bucket boundary (997_200 / 3600 = 277), so both
        // offsets land inside bucket 277.
        let a = ChannelId::derive_at("amber", DEFAULT_BUCKET, at(997_200 + 100));
        let b = ChannelId::derive_at("amber", DEFAULT_BUCKET, at(997_200 + 1_800));
        assert_eq!(a, b, "same word, same hour bucket");
    }

    #[test]
    fn when_derived_in_different_buckets_expect_distinct_ids() {
        let a = ChannelId::derive_at("amber", DEFAULT_BUCKET, at(1_000_000));
        let b = ChannelId::derive_at("amber", DEFAULT_BUCKET, at(1_000_000 + 7200));
        assert_ne!(a, b);
    }

    #[test]
    fn when_words_differ_expect_distinct_ids() {
        let a = ChannelId::derive_at("amber", DEFAULT_BUCKET, at(1_000_000));
        let b = ChannelId::derive_at("river", DEFAULT_BUCKET, at(1_000_000));
        assert_ne!(a, b);
    }

    #[test]
    fn when_hex_round_tripped_expect_same_id() {
        let id = ChannelId::derive_at("amber", DEFAULT_BUCKET, at(1_000_000));
        let parsed = ChannelId::parse_hex(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn when_hex_is_malformed_expect_error() {
        assert_eq!(ChannelId::parse_hex("abcd"), Err(ChannelIdError::BadLength));
        assert_eq!(
            ChannelId::parse_hex(&"zz".repeat(CHANNEL_ID_LEN)),
            Err(ChannelIdError::BadHex)
        );
    }
}
