//! Decoding of systemd timestamp properties
//!
//! Properties exposing time values are encoded in microseconds on the bus,
//! even when the corresponding unit-file setting is in seconds.

use chrono::{DateTime, Utc};
use thiserror::Error;

const USEC_PER_SEC: i64 = 1_000_000;
const NSEC_PER_USEC: i64 = 1_000;

/// A timestamp string that is not a base-10 microsecond count.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed timestamp {value:?}: {reason}")]
pub struct TimestampError {
    pub value: String,
    pub reason: String,
}

/// Decode a base-10 count of microseconds since the Unix epoch.
///
/// Sub-second precision is kept to the microsecond. Empty or non-numeric
/// input fails with [`TimestampError`].
pub fn decode_usec_timestamp(value: &str) -> Result<DateTime<Utc>, TimestampError> {
    let usec: i64 = value
        .parse()
        .map_err(|e: std::num::ParseIntError| TimestampError {
            value: value.to_string(),
            reason: e.to_string(),
        })?;

    let secs = usec.div_euclid(USEC_PER_SEC);
    let nanos = (usec.rem_euclid(USEC_PER_SEC) * NSEC_PER_USEC) as u32;

    DateTime::from_timestamp(secs, nanos).ok_or_else(|| TimestampError {
        value: value.to_string(),
        reason: "out of range".to_string(),
    })
}

/// Encode an instant as whole microseconds since the Unix epoch.
pub fn encode_usec_timestamp(instant: DateTime<Utc>) -> String {
    instant.timestamp_micros().to_string()
}

/// Drop a leading GVariant type marker (`@t 1700000000000000` →
/// `1700000000000000`).
///
/// Tagging depends on the value, not the property, so untagged input is
/// returned unchanged.
pub fn strip_type_tag(value: &str) -> &str {
    value
        .strip_prefix('@')
        .and_then(|rest| {
            let mut chars = rest.chars();
            let tag = chars.next()?;
            let payload = chars.as_str().strip_prefix(' ')?;
            tag.is_ascii_alphabetic().then_some(payload)
        })
        .unwrap_or(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    #[test]
    fn test_decode_known_instant() {
        let expected = Utc
            .with_ymd_and_hms(2024, 3, 1, 12, 30, 45)
            .unwrap()
            .with_nanosecond(123_456_000)
            .unwrap();

        let encoded = encode_usec_timestamp(expected);
        assert_eq!(encoded, "1709296245123456");
        assert_eq!(decode_usec_timestamp(&encoded).unwrap(), expected);
    }

    #[test]
    fn test_decode_preserves_microseconds() {
        let decoded = decode_usec_timestamp("1000001").unwrap();
        assert_eq!(decoded.timestamp(), 1);
        assert_eq!(decoded.timestamp_subsec_micros(), 1);
    }

    #[test]
    fn test_decode_zero_is_epoch() {
        let epoch = DateTime::from_timestamp(0, 0).unwrap();
        assert_eq!(decode_usec_timestamp("0").unwrap(), epoch);
    }

    #[test]
    fn test_decode_negative_before_epoch() {
        let decoded = decode_usec_timestamp("-1").unwrap();
        assert_eq!(decoded.timestamp(), -1);
        assert_eq!(decoded.timestamp_subsec_micros(), 999_999);
    }

    #[test]
    fn test_decode_rejects_empty() {
        let err = decode_usec_timestamp("").unwrap_err();
        assert!(err.value.is_empty());
        assert!(err.to_string().starts_with("malformed timestamp \"\""));
    }

    #[test]
    fn test_decode_rejects_non_numeric() {
        for input in ["abc", "12.5", "0x10", " 12", "@t 12"] {
            let err = decode_usec_timestamp(input).unwrap_err();
            assert_eq!(err.value, input, "{input:?} should be malformed");
        }
    }

    #[test]
    fn test_strip_type_tag() {
        assert_eq!(strip_type_tag("@t 1709296245123456"), "1709296245123456");
        assert_eq!(strip_type_tag("@x -5"), "-5");
        assert_eq!(strip_type_tag("1709296245123456"), "1709296245123456");
        assert_eq!(strip_type_tag(""), "");
        // Not a tag: no separator, or a non-letter marker.
        assert_eq!(strip_type_tag("@t"), "@t");
        assert_eq!(strip_type_tag("@1 2"), "@1 2");
    }
}
