//! Rolling 5-hour usage-limit blocks

use std::fmt::Display;

use chrono::{DateTime, Days, Duration, NaiveTime, TimeZone, Utc};

use crate::usage::models::{Period, Token};

/// Length of one usage-limit block (5 hours)
pub const BLOCK_DURATION_HOURS: i64 = 5;

pub fn block_duration() -> Duration {
    Duration::hours(BLOCK_DURATION_HOURS)
}

/// A fixed-length window starting at `start_at`. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    start_at: DateTime<Utc>,
    token_limit: Option<u64>,
}

impl Block {
    pub fn new(start_at: DateTime<Utc>) -> Self {
        Self {
            start_at,
            token_limit: None,
        }
    }

    pub fn with_limit(start_at: DateTime<Utc>, token_limit: u64) -> Self {
        Self {
            start_at,
            token_limit: Some(token_limit).filter(|limit| *limit > 0),
        }
    }

    /// Block anchored at `anchor_hour` local time, advanced to contain `now`.
    ///
    /// Uses today's anchor in `tz`, or yesterday's when `now` is earlier.
    pub fn from_anchor<Tz: TimeZone>(
        anchor_hour: u32,
        tz: &Tz,
        now: DateTime<Utc>,
        token_limit: Option<u64>,
    ) -> Option<Self> {
        let anchor = NaiveTime::from_hms_opt(anchor_hour, 0, 0)?;
        let local_today = now.with_timezone(tz).date_naive();

        let mut start = tz
            .from_local_datetime(&local_today.and_time(anchor))
            .earliest()?
            .with_timezone(&Utc);
        if now < start {
            let yesterday = local_today.checked_sub_days(Days::new(1))?;
            start = tz
                .from_local_datetime(&yesterday.and_time(anchor))
                .earliest()?
                .with_timezone(&Utc);
        }

        let block = match token_limit {
            Some(limit) => Block::with_limit(start, limit),
            None => Block::new(start),
        };
        Some(block.next_block(now))
    }

    pub fn start_at(&self) -> DateTime<Utc> {
        self.start_at
    }

    pub fn end_at(&self) -> DateTime<Utc> {
        self.start_at + block_duration()
    }

    pub fn period(&self) -> Period {
        // start < end always holds for a positive duration
        Period::new(self.start_at, self.end_at()).unwrap_or_else(|_| Period::all_time())
    }

    pub fn token_limit(&self) -> Option<u64> {
        self.token_limit
    }

    pub fn has_limit(&self) -> bool {
        self.token_limit.is_some()
    }

    /// The block containing `now`.
    ///
    /// `end_at` itself belongs to the following block. Jumps of many blocks
    /// are computed in one step by floor division of the elapsed time.
    /// A `now` before `start_at` leaves the block unchanged.
    pub fn next_block(&self, now: DateTime<Utc>) -> Block {
        if now < self.end_at() {
            return *self;
        }

        let elapsed = (now - self.start_at).num_seconds();
        let blocks = elapsed.div_euclid(block_duration().num_seconds());

        Block {
            start_at: self.start_at + Duration::seconds(blocks * block_duration().num_seconds()),
            token_limit: self.token_limit,
        }
    }

    /// 12-hour clock label such as `10am - 3pm`
    pub fn format_block_time<Tz>(&self, tz: &Tz) -> String
    where
        Tz: TimeZone,
        Tz::Offset: Display,
    {
        format!(
            "{} - {}",
            self.start_at.with_timezone(tz).format("%-I%P"),
            self.end_at().with_timezone(tz).format("%-I%P"),
        )
    }

    /// Limited tokens as a percentage of the limit. May exceed 100.
    pub fn calculate_progress(&self, tokens: &Token) -> f64 {
        match self.token_limit {
            Some(limit) => tokens.limited() as f64 / limit as f64 * 100.0,
            None => 0.0,
        }
    }

    /// Progress clamped to 100 for bar rendering
    pub fn clamped_progress(&self, tokens: &Token) -> f64 {
        self.calculate_progress(tokens).min(100.0)
    }

    /// Time left until `end_at`, zero once expired
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        if now < self.end_at() {
            self.end_at() - now
        } else {
            Duration::zero()
        }
    }
}
