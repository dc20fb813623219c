//! Timezone-aware period construction

use chrono::{DateTime, Datelike, Months, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;

use crate::usage::models::Period;

/// Builds calendar periods (today, this month) in a configured timezone
#[derive(Debug, Clone, Copy)]
pub struct PeriodFactory {
    timezone: Tz,
}

impl PeriodFactory {
    pub fn new(timezone: Tz) -> Self {
        Self { timezone }
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// Local midnight to the next local midnight
    pub fn today(&self, now: DateTime<Utc>) -> Period {
        let date = now.with_timezone(&self.timezone).date_naive();
        let next = date.succ_opt().unwrap_or(date);
        self.between(date, next)
    }

    /// First of the local month to the first of the next month
    pub fn this_month(&self, now: DateTime<Utc>) -> Period {
        let local = now.with_timezone(&self.timezone).date_naive();
        let first = local.with_day(1).unwrap_or(local);
        let next = first.checked_add_months(Months::new(1)).unwrap_or(first);
        self.between(first, next)
    }

    pub fn all_time(&self) -> Period {
        Period::all_time()
    }

    /// Number of days in the local month containing `now`
    pub fn days_in_month(&self, now: DateTime<Utc>) -> u32 {
        let month = self.this_month(now);
        let days = (month.end_at() - month.start_at()).num_hours() as f64 / 24.0;
        days.round() as u32
    }

    fn between(&self, start: NaiveDate, end: NaiveDate) -> Period {
        let start = self.local_midnight(start);
        let end = self.local_midnight(end);
        Period::new(start, end).unwrap_or_else(|_| Period::all_time())
    }

    fn local_midnight(&self, date: NaiveDate) -> DateTime<Utc> {
        let naive = date.and_hms_opt(0, 0, 0).unwrap_or_default();
        self.timezone
            .from_local_datetime(&naive)
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
            // midnight skipped by DST: fall back to treating it as UTC
            .unwrap_or_else(|| Utc.from_utc_datetime(&naive))
    }
}

impl Default for PeriodFactory {
    fn default() -> Self {
        Self::new(Tz::UTC)
    }
}
