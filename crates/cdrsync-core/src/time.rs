//! Calendar-day helpers
//!
//! Records are bucketed by the PBX's local day, not by UTC day.

use crate::{AppError, AppResult};
use chrono::{Duration, LocalResult, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;

/// Parse an IANA timezone name
pub fn parse_timezone(name: &str) -> AppResult<Tz> {
    name.parse::<Tz>()
        .map_err(|e| AppError::Config(format!("invalid timezone '{}': {}", name, e)))
}

/// Epoch bounds `[start, end)` of `date` in `tz`
pub fn day_bounds(date: NaiveDate, tz: Tz) -> (i64, i64) {
    let next = date + Duration::days(1);
    (local_midnight(date, tz), local_midnight(next, tz))
}

fn local_midnight(date: NaiveDate, tz: Tz) -> i64 {
    let naive = date.and_time(chrono::NaiveTime::MIN);
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt.timestamp(),
        LocalResult::Ambiguous(earliest, _) => earliest.timestamp(),
        // Midnight skipped by a DST jump
        LocalResult::None => tz
            .from_local_datetime(&(naive + Duration::hours(1)))
            .earliest()
            .map(|dt| dt.timestamp())
            .unwrap_or_else(|| tz.from_utc_datetime(&naive).timestamp()),
    }
}

/// Today's date in `tz`
pub fn today_in(tz: Tz) -> NaiveDate {
    Utc::now().with_timezone(&tz).date_naive()
}

/// Yesterday's date in `tz`
pub fn yesterday_in(tz: Tz) -> NaiveDate {
    today_in(tz) - Duration::days(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_day_bounds_saigon() {
        let tz = parse_timezone("Asia/Ho_Chi_Minh").unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 12, 20).unwrap();
        let (start, end) = day_bounds(date, tz);

        // 2024-12-20T00:00:00+07:00
        assert_eq!(start, 1734627600);
        assert_eq!(end - start, 86_400);
    }

    #[test]
    fn test_invalid_timezone() {
        assert!(matches!(
            parse_timezone("Mars/Olympus_Mons"),
            Err(AppError::Config(_))
        ));
    }
}
