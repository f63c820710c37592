//! Business-day arithmetic on a fixed UTC offset.
//!
//! A business day runs from local midnight to 23:59:59.999 in the configured
//! offset, independent of server locale. Both ends of a [`DayWindow`] are
//! inclusive.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, TimeZone, Utc};

use crate::error::LedgerError;

/// Philippine Standard Time, +08:00, no DST.
pub const DEFAULT_UTC_OFFSET_MINUTES: i32 = 8 * 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayWindow {
    pub date_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DayWindow {
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant <= self.end
    }

    pub fn start_ms(&self) -> i64 {
        self.start.timestamp_millis()
    }

    pub fn end_ms(&self) -> i64 {
        self.end.timestamp_millis()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusinessClock {
    offset: FixedOffset,
}

impl BusinessClock {
    pub fn new(offset_minutes: i32) -> Result<Self, LedgerError> {
        let offset = offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .ok_or_else(|| {
                LedgerError::Validation(format!("UTC offset out of range: {offset_minutes} min"))
            })?;
        Ok(Self { offset })
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    pub fn to_business(&self, instant: DateTime<Utc>) -> DateTime<FixedOffset> {
        instant.with_timezone(&self.offset)
    }

    pub fn business_date(&self, instant: DateTime<Utc>) -> NaiveDate {
        self.to_business(instant).date_naive()
    }

    /// Window of the business day containing `now`.
    pub fn day_window(&self, now: DateTime<Utc>) -> DayWindow {
        self.window_for(self.business_date(now))
    }

    /// Window for an explicit `YYYY-MM-DD` business date.
    pub fn window_for_date(&self, date_id: &str) -> Result<DayWindow, LedgerError> {
        let date = parse_date_id(date_id)?;
        Ok(self.window_for(date))
    }

    pub fn window_for(&self, date: NaiveDate) -> DayWindow {
        let start = self.local_to_utc(date, NaiveTime::MIN);
        let end = start + Duration::days(1) - Duration::milliseconds(1);
        DayWindow {
            date_id: date.format("%Y-%m-%d").to_string(),
            start,
            end,
        }
    }

    /// Next instant strictly after `now` at which the business wall clock
    /// reads `at`.
    pub fn next_trigger_after(&self, now: DateTime<Utc>, at: NaiveTime) -> DateTime<Utc> {
        let today = self.business_date(now);
        let candidate = self.local_to_utc(today, at);
        if candidate > now {
            candidate
        } else {
            candidate + Duration::days(1)
        }
    }

    fn local_to_utc(&self, date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
        let local = date.and_time(time);
        let utc = local - Duration::seconds(i64::from(self.offset.local_minus_utc()));
        Utc.from_utc_datetime(&utc)
    }
}

pub fn parse_date_id(date_id: &str) -> Result<NaiveDate, LedgerError> {
    NaiveDate::parse_from_str(date_id.trim(), "%Y-%m-%d")
        .map_err(|_| LedgerError::Validation(format!("invalid date id '{date_id}'")))
}
