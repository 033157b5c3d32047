//! Restaurant-local time handling.
//!
//! The kitchen operates in America/Toronto; the daily admin view and the
//! order-number date component follow that clock regardless of where the
//! service runs. Offsets are derived from the Canadian DST rule (second
//! Sunday of March 02:00 to first Sunday of November 02:00) rather than the
//! host timezone database.

use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, TimeZone, Utc, Weekday};

const EST_SECONDS: i32 = 5 * 3600;
const EDT_SECONDS: i32 = 4 * 3600;

fn west(seconds: i32) -> FixedOffset {
    FixedOffset::west_opt(seconds).expect("static offset in range")
}

/// First date with the given weekday on or after the first of the month.
fn nth_weekday(year: i32, month: u32, weekday: Weekday, nth: u32) -> NaiveDate {
    let first = NaiveDate::from_ymd_opt(year, month, 1).expect("valid month start");
    let shift = (7 + weekday.num_days_from_sunday() as i64
        - first.weekday().num_days_from_sunday() as i64)
        % 7;
    first + Duration::days(shift + 7 * (nth as i64 - 1))
}

/// DST window for a given year as UTC instants.
///
/// Clocks go forward at 02:00 EST (07:00 UTC) and back at 02:00 EDT
/// (06:00 UTC).
fn dst_bounds_utc(year: i32) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = nth_weekday(year, 3, Weekday::Sun, 2)
        .and_hms_opt(7, 0, 0)
        .expect("valid time");
    let end = nth_weekday(year, 11, Weekday::Sun, 1)
        .and_hms_opt(6, 0, 0)
        .expect("valid time");
    (Utc.from_utc_datetime(&start), Utc.from_utc_datetime(&end))
}

/// The Toronto UTC offset in effect at the given instant.
pub fn toronto_offset(at: DateTime<Utc>) -> FixedOffset {
    let (dst_start, dst_end) = dst_bounds_utc(at.year());
    if at >= dst_start && at < dst_end {
        west(EDT_SECONDS)
    } else {
        west(EST_SECONDS)
    }
}

/// The current Toronto-local day as a `[start, end)` pair of UTC instants.
///
/// Used by the admin dashboard's rolling same-day order query.
pub fn toronto_day_bounds(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let offset = toronto_offset(now);
    let local_date = now.with_timezone(&offset).date_naive();
    let start_local = local_date.and_hms_opt(0, 0, 0).expect("midnight exists");
    let start = offset
        .from_local_datetime(&start_local)
        .single()
        .expect("fixed offsets are unambiguous");
    (start.with_timezone(&Utc), (start + Duration::days(1)).with_timezone(&Utc))
}

/// Today's Toronto-local date, for order-number prefixes and daily rollups.
pub fn toronto_today(now: DateTime<Utc>) -> NaiveDate {
    now.with_timezone(&toronto_offset(now)).date_naive()
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        s.parse().expect("valid RFC 3339 timestamp")
    }

    #[test]
    fn test_winter_is_est() {
        let offset = toronto_offset(utc("2026-01-15T12:00:00Z"));
        assert_eq!(offset.utc_minus_local(), EST_SECONDS);
    }

    #[test]
    fn test_summer_is_edt() {
        let offset = toronto_offset(utc("2026-07-15T12:00:00Z"));
        assert_eq!(offset.utc_minus_local(), EDT_SECONDS);
    }

    #[test]
    fn test_spring_forward_boundary() {
        // Second Sunday of March 2026 is the 8th; switch at 07:00 UTC.
        assert_eq!(
            toronto_offset(utc("2026-03-08T06:59:59Z")).utc_minus_local(),
            EST_SECONDS
        );
        assert_eq!(
            toronto_offset(utc("2026-03-08T07:00:00Z")).utc_minus_local(),
            EDT_SECONDS
        );
    }

    #[test]
    fn test_fall_back_boundary() {
        // First Sunday of November 2026 is the 1st; switch at 06:00 UTC.
        assert_eq!(
            toronto_offset(utc("2026-11-01T05:59:59Z")).utc_minus_local(),
            EDT_SECONDS
        );
        assert_eq!(
            toronto_offset(utc("2026-11-01T06:00:00Z")).utc_minus_local(),
            EST_SECONDS
        );
    }

    #[test]
    fn test_day_bounds_cross_utc_midnight() {
        // 03:00 UTC on Aug 7 is 23:00 on Aug 6 in Toronto (EDT).
        let (start, end) = toronto_day_bounds(utc("2026-08-07T03:00:00Z"));
        assert_eq!(start, utc("2026-08-06T04:00:00Z"));
        assert_eq!(end, utc("2026-08-07T04:00:00Z"));
        assert_eq!(
            toronto_today(utc("2026-08-07T03:00:00Z")),
            NaiveDate::from_ymd_opt(2026, 8, 6).expect("valid date")
        );
    }

    #[test]
    fn test_day_bounds_in_winter() {
        let (start, end) = toronto_day_bounds(utc("2026-01-15T12:00:00Z"));
        assert_eq!(start, utc("2026-01-15T05:00:00Z"));
        assert_eq!(end, utc("2026-01-16T05:00:00Z"));
    }
}
