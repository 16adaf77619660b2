//! Business-day arithmetic (Monday to Friday, no holiday calendar)

use chrono::{Datelike, Duration, NaiveDate, Weekday};

pub fn is_business_day(date: NaiveDate) -> bool {
    !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

/// Move `days` business days forward from `date`
pub fn add_business_days(date: NaiveDate, days: u32) -> NaiveDate {
    let mut current = date;
    let mut remaining = days;
    while remaining > 0 {
        current += Duration::days(1);
        if is_business_day(current) {
            remaining -= 1;
        }
    }
    current
}

/// Number of business days between two dates, regardless of order
///
/// Counts business days in the half-open range `(earlier, later]`, so a
/// Friday and the following Monday are one business day apart.
pub fn business_days_between(a: NaiveDate, b: NaiveDate) -> u32 {
    let (earlier, later) = if a <= b { (a, b) } else { (b, a) };
    let mut count = 0;
    let mut current = earlier;
    while current < later {
        current += Duration::days(1);
        if is_business_day(current) {
            count += 1;
        }
    }
    count
}

/// Calendar days to widen a range so it covers `business_days` business days
pub fn calendar_span(business_days: u32) -> i64 {
    // every 5 business days span at most 7 calendar days, plus a weekend of slack
    i64::from(business_days) * 7 / 5 + 3
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, m, d).unwrap()
    }

    #[test]
    fn test_add_business_days_skips_weekend() {
        // 2024-01-05 is a Friday
        assert_eq!(add_business_days(date(1, 5), 2), date(1, 9));
        assert_eq!(add_business_days(date(1, 3), 2), date(1, 5));
        assert_eq!(add_business_days(date(1, 3), 0), date(1, 3));
    }

    #[test]
    fn test_business_days_between_is_symmetric() {
        assert_eq!(business_days_between(date(1, 4), date(1, 5)), 1);
        assert_eq!(business_days_between(date(1, 5), date(1, 4)), 1);
        assert_eq!(business_days_between(date(1, 5), date(1, 8)), 1);
        assert_eq!(business_days_between(date(1, 1), date(1, 12)), 9);
        assert_eq!(business_days_between(date(1, 6), date(1, 6)), 0);
    }

    #[test]
    fn test_calendar_span_covers_business_days() {
        for days in 0..15 {
            let start = date(1, 5);
            let reach = add_business_days(start, days);
            assert!((reach - start).num_days() <= calendar_span(days));
        }
    }
}
