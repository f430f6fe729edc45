use rand_core::{OsRng, RngCore};
use std::fmt;
use thiserror::Error;
use time::OffsetDateTime;

pub const SESSION_ID_LEN: usize = 26;

const CROCKFORD_ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";
const MAX_TIMESTAMP_MS: u64 = (1 << 48) - 1;
const RANDOM_BYTES: usize = 10;

#[derive(Debug, Error)]
pub enum SessionIdError {
    #[error("timestamp exceeds 48-bit millisecond range: {millis}")]
    TimestampOutOfRange { millis: i128 },

    #[error("read random bytes: {0}")]
    Entropy(String),

    #[error("session id must be {SESSION_ID_LEN} characters, got {len}")]
    InvalidLength { len: usize },

    #[error("session id contains invalid character {ch:?} at position {position}")]
    InvalidCharacter { ch: char, position: usize },
}

/// Time-sortable 128-bit identifier rendered as 26 Crockford base32 symbols.
///
/// The high 48 bits carry the millisecond timestamp and the low 80 bits are
/// random, so ids from strictly later milliseconds always sort after earlier
/// ones. Ids generated within the same millisecond have no defined order.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate(now: OffsetDateTime) -> Result<Self, SessionIdError> {
        let mut random = [0u8; RANDOM_BYTES];
        OsRng
            .try_fill_bytes(&mut random)
            .map_err(|error| SessionIdError::Entropy(error.to_string()))?;
        Self::from_parts(now, random)
    }

    pub fn from_parts(
        now: OffsetDateTime,
        random: [u8; RANDOM_BYTES],
    ) -> Result<Self, SessionIdError> {
        let millis = now.unix_timestamp_nanos() / 1_000_000;
        let timestamp = u64::try_from(millis)
            .ok()
            .filter(|value| *value <= MAX_TIMESTAMP_MS)
            .ok_or(SessionIdError::TimestampOutOfRange { millis })?;
        Ok(Self(encode(timestamp, random)))
    }

    /// Strict syntax check used for caller-supplied ids.
    pub fn parse(value: &str) -> Result<Self, SessionIdError> {
        let len = value.chars().count();
        if len != SESSION_ID_LEN {
            return Err(SessionIdError::InvalidLength { len });
        }
        for (position, ch) in value.chars().enumerate() {
            let in_alphabet = ch.is_ascii() && CROCKFORD_ALPHABET.contains(&(ch as u8));
            // 26 symbols carry 130 bits; the leading symbol may only use the low 3.
            let fits_128_bits = position > 0 || ch <= '7';
            if !in_alphabet || !fits_128_bits {
                return Err(SessionIdError::InvalidCharacter { ch, position });
            }
        }
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn encode(timestamp: u64, random: [u8; RANDOM_BYTES]) -> String {
    let mut value = u128::from(timestamp) << 80;
    for (index, byte) in random.iter().enumerate() {
        value |= u128::from(*byte) << (8 * (RANDOM_BYTES - 1 - index));
    }

    let mut out = String::with_capacity(SESSION_ID_LEN);
    for index in 0..SESSION_ID_LEN {
        let shift = 5 * (SESSION_ID_LEN - 1 - index);
        let symbol = ((value >> shift) & 0x1f) as usize;
        out.push(char::from(CROCKFORD_ALPHABET[symbol]));
    }
    out
}
