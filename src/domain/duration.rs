use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);
/// Upper bound on `--retention`; expiry instants must stay within calendar range.
pub const MAX_RETENTION: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

#[derive(Debug, Error, Eq, PartialEq)]
pub enum DurationParseError {
    #[error("invalid duration: {0:?}")]
    Invalid(String),

    #[error("unknown unit {unit:?} in duration {value:?}")]
    UnknownUnit { value: String, unit: String },

    #[error("duration out of range: {0:?}")]
    Overflow(String),
}

#[derive(Debug, Error, Eq, PartialEq)]
pub enum RetentionError {
    #[error("retention must be positive")]
    NotPositive,

    #[error("retention must be a whole number of seconds (for example: 1s, 30s, 5m)")]
    FractionalSeconds,

    #[error("retention must not exceed 36500d")]
    TooLong,
}

/// Parses `1h30m`, `45s`, `2d`, `1.5h`, `500ms` style durations.
pub fn parse_duration(value: &str) -> Result<Duration, DurationParseError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(DurationParseError::Invalid(value.to_string()));
    }
    if trimmed == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total_nanos: u128 = 0;
    let mut rest = trimmed;
    while !rest.is_empty() {
        let number_len = rest
            .find(|ch: char| !(ch.is_ascii_digit() || ch == '.'))
            .unwrap_or(rest.len());
        let (number, after_number) = rest.split_at(number_len);
        if number.is_empty() || number == "." {
            return Err(DurationParseError::Invalid(value.to_string()));
        }

        let unit_len = after_number
            .find(|ch: char| ch.is_ascii_digit() || ch == '.')
            .unwrap_or(after_number.len());
        let (unit, after_unit) = after_number.split_at(unit_len);
        if unit.is_empty() {
            return Err(DurationParseError::Invalid(value.to_string()));
        }
        let unit_nanos = unit_nanos(unit).ok_or_else(|| DurationParseError::UnknownUnit {
            value: value.to_string(),
            unit: unit.to_string(),
        })?;

        let component = scale(number, unit_nanos)
            .ok_or_else(|| DurationParseError::Invalid(value.to_string()))?;
        total_nanos = total_nanos
            .checked_add(component)
            .ok_or_else(|| DurationParseError::Overflow(value.to_string()))?;
        rest = after_unit;
    }

    let secs = u64::try_from(total_nanos / 1_000_000_000)
        .map_err(|_| DurationParseError::Overflow(value.to_string()))?;
    let nanos = (total_nanos % 1_000_000_000) as u32;
    Ok(Duration::new(secs, nanos))
}

pub fn validate_retention(retention: Duration) -> Result<u64, RetentionError> {
    if retention.is_zero() {
        return Err(RetentionError::NotPositive);
    }
    if retention.subsec_nanos() != 0 {
        return Err(RetentionError::FractionalSeconds);
    }
    if retention > MAX_RETENTION {
        return Err(RetentionError::TooLong);
    }
    Ok(retention.as_secs())
}

pub fn format_duration(duration: Duration) -> String {
    let mut secs = duration.as_secs();
    if secs == 0 {
        return "0s".to_string();
    }
    let mut out = String::new();
    for (unit, size) in [("d", 86_400), ("h", 3_600), ("m", 60), ("s", 1)] {
        if secs >= size {
            out.push_str(&format!("{}{unit}", secs / size));
            secs %= size;
        }
    }
    out
}

fn unit_nanos(unit: &str) -> Option<u128> {
    match unit {
        "ns" => Some(1),
        "us" | "µs" => Some(1_000),
        "ms" => Some(1_000_000),
        "s" => Some(1_000_000_000),
        "m" => Some(60 * 1_000_000_000),
        "h" => Some(3_600 * 1_000_000_000),
        "d" => Some(86_400 * 1_000_000_000),
        _ => None,
    }
}

fn scale(number: &str, unit_nanos: u128) -> Option<u128> {
    let (whole, fraction) = match number.split_once('.') {
        Some((whole, fraction)) => (whole, fraction),
        None => (number, ""),
    };
    if fraction.contains('.') || (whole.is_empty() && fraction.is_empty()) {
        return None;
    }

    let whole_value: u128 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let mut total = whole_value.checked_mul(unit_nanos)?;

    let mut divisor: u128 = 1;
    let mut fraction_value: u128 = 0;
    for digit in fraction.chars().take(18) {
        fraction_value = fraction_value * 10 + u128::from(digit.to_digit(10)?);
        divisor *= 10;
    }
    total = total.checked_add(fraction_value.checked_mul(unit_nanos)? / divisor)?;
    Some(total)
}
