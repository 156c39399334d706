//! UTC calendar periods: day from midnight, ISO week from Monday, month
//! from the 1st.

use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, NaiveTime, TimeZone, Utc};

use super::WindowType;

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN))
}

/// Start of the period containing `t`.
pub fn period_start(window: WindowType, t: DateTime<Utc>) -> DateTime<Utc> {
    let date = t.date_naive();
    let start = match window {
        WindowType::Daily => date,
        WindowType::Weekly => date - Duration::days(i64::from(date.weekday().num_days_from_monday())),
        WindowType::Monthly => date - Duration::days(i64::from(date.day0())),
    };
    midnight(start)
}

/// End (exclusive) of the period that starts at or contains `start`.
pub fn period_end(window: WindowType, start: DateTime<Utc>) -> DateTime<Utc> {
    let first = period_start(window, start);
    match window {
        WindowType::Daily => first + Duration::days(1),
        WindowType::Weekly => first + Duration::days(7),
        WindowType::Monthly => first
            .date_naive()
            .checked_add_months(Months::new(1))
            .map(midnight)
            .unwrap_or(DateTime::<Utc>::MAX_UTC),
    }
}

/// Reset `spent` when `now` has left the period `start` belongs to. An unset
/// start opens the period containing `now` and keeps the counter.
pub(super) fn roll_over(
    window: WindowType,
    spent: &mut u64,
    start: &mut Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) {
    match *start {
        Some(s) if now < period_end(window, s) => {}
        Some(_) => {
            *spent = 0;
            *start = Some(period_start(window, now));
        }
        None => *start = Some(period_start(window, now)),
    }
}
