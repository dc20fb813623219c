//! Read-side queries over stored usage records

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio_util::sync::CancellationToken;

use crate::usage::block::Block;
use crate::usage::cache::StatsCache;
use crate::usage::models::{ApiRequest, Period, Stats};
use crate::usage::period::PeriodFactory;
use crate::usage::pricing::Plan;
use crate::usage::telemetry::storage::{ApiRequestRepository, StorageError, UNLIMITED};

/// Aggregate stats for a period, served from the cache when possible
#[derive(Clone)]
pub struct CalculateStatsQuery {
    repository: Arc<dyn ApiRequestRepository>,
    cache: Arc<dyn StatsCache>,
}

impl CalculateStatsQuery {
    pub fn new(repository: Arc<dyn ApiRequestRepository>, cache: Arc<dyn StatsCache>) -> Self {
        Self { repository, cache }
    }

    pub fn execute(&self, period: &Period, cancel: &CancellationToken) -> Result<Stats, StorageError> {
        if let Some(stats) = self.cache.get(period) {
            log::debug!("Stats cache hit for {:?}", period);
            return Ok(stats);
        }

        let requests = self
            .repository
            .find_by_period_with_limit(period, UNLIMITED, 0, cancel)?;
        let stats = Stats::from_requests(*period, &requests);

        self.cache.set(*period, stats.clone());
        Ok(stats)
    }
}

/// Uncached page of raw records
#[derive(Clone)]
pub struct GetFilteredApiRequestsQuery {
    repository: Arc<dyn ApiRequestRepository>,
}

impl GetFilteredApiRequestsQuery {
    pub fn new(repository: Arc<dyn ApiRequestRepository>) -> Self {
        Self { repository }
    }

    pub fn execute(
        &self,
        period: &Period,
        limit: usize,
        offset: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<ApiRequest>, StorageError> {
        self.repository
            .find_by_period_with_limit(period, limit, offset, cancel)
    }

    /// Next page after the record stored under `after_key`
    pub fn execute_after(
        &self,
        period: &Period,
        after_key: Option<&str>,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<ApiRequest>, StorageError> {
        self.repository
            .find_by_period_after(period, after_key, limit, cancel)
    }
}

/// Usage of the block containing "now"
#[derive(Debug, Clone, PartialEq)]
pub struct BlockProgress {
    pub block: Block,
    pub stats: Stats,
    /// Premium limited tokens over the limit, may exceed 100
    pub percentage: f64,
    pub remaining: Duration,
}

impl BlockProgress {
    pub fn clamped_percentage(&self) -> f64 {
        self.percentage.min(100.0)
    }

    /// Tokens counted against the limit
    pub fn used_tokens(&self) -> u64 {
        self.stats.premium_tokens().limited()
    }
}

#[derive(Clone)]
pub struct GetBlockProgressQuery {
    stats: CalculateStatsQuery,
}

impl GetBlockProgressQuery {
    pub fn new(stats: CalculateStatsQuery) -> Self {
        Self { stats }
    }

    pub fn execute(
        &self,
        block: &Block,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<BlockProgress, StorageError> {
        let current = block.next_block(now);
        let stats = self.stats.execute(&current.period(), cancel)?;
        let percentage = current.calculate_progress(&stats.premium_tokens());

        Ok(BlockProgress {
            block: current,
            stats,
            percentage,
            remaining: current.remaining(now),
        })
    }
}

/// Daily and monthly totals against a plan
#[derive(Debug, Clone, PartialEq)]
pub struct UsageSummary {
    pub plan: Plan,
    pub daily: Stats,
    pub monthly: Stats,
    pub daily_plan_usage: u64,
    pub monthly_plan_usage: u64,
}

#[derive(Clone)]
pub struct GetUsageSummaryQuery {
    stats: CalculateStatsQuery,
}

impl GetUsageSummaryQuery {
    pub fn new(stats: CalculateStatsQuery) -> Self {
        Self { stats }
    }

    pub fn execute(
        &self,
        periods: &PeriodFactory,
        plan: &Plan,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<UsageSummary, StorageError> {
        let daily = self.stats.execute(&periods.today(now), cancel)?;
        let monthly = self.stats.execute(&periods.this_month(now), cancel)?;

        Ok(UsageSummary {
            plan: plan.clone(),
            daily_plan_usage: plan
                .daily_usage_percentage(daily.total_cost(), periods.days_in_month(now)),
            monthly_plan_usage: plan.usage_percentage(monthly.total_cost()),
            daily,
            monthly,
        })
    }
}
