//! Bucket clock: maps a tick timestamp to the start of its interval bucket
//!
//! Buckets are aligned to local midnight of the configured UTC offset, so a
//! 15-minute bucket on an IST clock starts at 09:15, 09:30, ... local time and
//! a 1440-minute bucket starts at local midnight.

use crate::core::ConfigError;
use chrono::{FixedOffset, Offset, Utc};

const MS_PER_MINUTE: i64 = 60_000;

/// Pure bucket arithmetic in a fixed UTC offset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketClock {
    offset: FixedOffset,
}

impl BucketClock {
    pub fn new(offset: FixedOffset) -> Self {
        Self { offset }
    }

    /// Clock aligned to UTC
    pub fn utc() -> Self {
        Self::new(Utc.fix())
    }

    /// Parse an offset such as "+05:30", "-04:00" or "Z"
    pub fn from_offset_str(offset: &str) -> Result<Self, ConfigError> {
        parse_utc_offset(offset).map(Self::new)
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// Start (epoch ms) of the bucket containing `ts_ms`.
    ///
    /// None when the timestamp is so far out of range that the bucket cannot
    /// be represented.
    #[inline]
    pub fn bucket_start(&self, ts_ms: i64, interval_minutes: u32) -> Option<i64> {
        let width = width_ms(interval_minutes);
        let offset_ms = i64::from(self.offset.local_minus_utc()) * 1000;
        let local = ts_ms.checked_add(offset_ms)?;
        local
            .div_euclid(width)
            .checked_mul(width)?
            .checked_sub(offset_ms)
    }

    /// Exclusive end (epoch ms) of the bucket containing `ts_ms`
    #[inline]
    pub fn bucket_end(&self, ts_ms: i64, interval_minutes: u32) -> Option<i64> {
        self.bucket_start(ts_ms, interval_minutes)?
            .checked_add(width_ms(interval_minutes))
    }
}

impl Default for BucketClock {
    fn default() -> Self {
        Self::utc()
    }
}

/// Interval width in milliseconds (zero widths are clamped to one minute)
#[inline]
pub fn width_ms(interval_minutes: u32) -> i64 {
    i64::from(interval_minutes.max(1)) * MS_PER_MINUTE
}

/// Parse "+HH:MM", "-HH:MM", "+HHMM" or "Z"
pub fn parse_utc_offset(raw: &str) -> Result<FixedOffset, ConfigError> {
    let s = raw.trim();
    if s.eq_ignore_ascii_case("z") || s.eq_ignore_ascii_case("utc") {
        return Ok(Utc.fix());
    }

    let bad = || ConfigError::BadOffset(raw.to_string());

    let (sign, rest) = match s.chars().next() {
        Some('+') => (1, &s[1..]),
        Some('-') => (-1, &s[1..]),
        _ => return Err(bad()),
    };

    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(bad());
    }

    let hours: i32 = digits[..2].parse().map_err(|_| bad())?;
    let minutes: i32 = digits[2..].parse().map_err(|_| bad())?;
    if hours > 23 || minutes > 59 {
        return Err(bad());
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(bad)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ist() -> BucketClock {
        BucketClock::from_offset_str("+05:30").unwrap()
    }

    fn utc_ms(h: u32, m: u32, s: u32) -> i64 {
        Utc.with_ymd_and_hms(2024, 3, 4, h, m, s).unwrap().timestamp_millis()
    }

    #[test]
    fn test_one_minute_floor() {
        let clock = BucketClock::utc();
        let ts = utc_ms(10, 7, 42);
        assert_eq!(clock.bucket_start(ts, 1), Some(utc_ms(10, 7, 0)));
        assert_eq!(clock.bucket_end(ts, 1), Some(utc_ms(10, 8, 0)));
    }

    #[test]
    fn test_exact_boundary_starts_new_bucket() {
        let clock = BucketClock::utc();
        let ts = utc_ms(10, 15, 0);
        assert_eq!(clock.bucket_start(ts, 15), Some(ts));
        assert_eq!(clock.bucket_start(ts - 1, 15), Some(utc_ms(10, 0, 0)));
    }

    #[test]
    fn test_daily_bucket_aligns_to_local_midnight() {
        let clock = ist();
        // 04:00 UTC on the 4th is 09:30 IST on the 4th; IST midnight is 18:30 UTC on the 3rd
        let ts = utc_ms(4, 0, 0);
        let expected = Utc.with_ymd_and_hms(2024, 3, 3, 18, 30, 0).unwrap().timestamp_millis();
        assert_eq!(clock.bucket_start(ts, 1440), Some(expected));
    }

    #[test]
    fn test_seventy_five_minute_bucket_in_ist() {
        let clock = ist();
        // 09:15 IST = 03:45 UTC; 75-minute buckets from IST midnight start at 08:45, 10:00 ...
        let ts = utc_ms(3, 45, 0);
        let start = clock.bucket_start(ts, 75);
        assert_eq!(start, Some(utc_ms(3, 15, 0))); // 08:45 IST
    }

    #[test]
    fn test_negative_timestamps_floor_down() {
        let clock = BucketClock::utc();
        assert_eq!(clock.bucket_start(-1, 1), Some(-60_000));
    }

    #[test]
    fn test_out_of_range_timestamps_have_no_bucket() {
        let clock = ist();
        assert_eq!(clock.bucket_start(i64::MAX, 1), None);
        assert_eq!(clock.bucket_end(i64::MAX - 1_000, 1), None);
        assert_eq!(BucketClock::utc().bucket_end(i64::MAX - 1_000, 1), None);

        let west = BucketClock::from_offset_str("-04:00").unwrap();
        assert_eq!(west.bucket_start(i64::MIN, 15), None);
    }

    #[test]
    fn test_parse_offsets() {
        assert_eq!(parse_utc_offset("+05:30").unwrap().local_minus_utc(), 19_800);
        assert_eq!(parse_utc_offset("-0400").unwrap().local_minus_utc(), -14_400);
        assert_eq!(parse_utc_offset("Z").unwrap().local_minus_utc(), 0);
        assert!(parse_utc_offset("05:30").is_err());
        assert!(parse_utc_offset("+25:00").is_err());
        assert!(parse_utc_offset("+5:3").is_err());
    }
}
