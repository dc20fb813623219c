//! Domain models for Claude Code usage collection

use std::fmt;
use std::ops::Add;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Token counters for a single request or an aggregate of requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Token {
    input: u64,
    output: u64,
    cache_read: u64,
    cache_creation: u64,
}

impl Token {
    pub fn new(input: u64, output: u64, cache_read: u64, cache_creation: u64) -> Self {
        Self {
            input,
            output,
            cache_read,
            cache_creation,
        }
    }

    pub fn input(&self) -> u64 {
        self.input
    }

    pub fn output(&self) -> u64 {
        self.output
    }

    pub fn cache_read(&self) -> u64 {
        self.cache_read
    }

    pub fn cache_creation(&self) -> u64 {
        self.cache_creation
    }

    /// All four counters
    pub fn total(&self) -> u64 {
        self.input
            .saturating_add(self.output)
            .saturating_add(self.cache_read)
            .saturating_add(self.cache_creation)
    }

    /// Cache read plus cache creation
    pub fn cache(&self) -> u64 {
        self.cache_read.saturating_add(self.cache_creation)
    }

    /// Tokens counted against a usage-limit block: input plus output.
    ///
    /// Cache traffic never counts. Restricting to premium models is the
    /// caller's job (see `Stats::premium_tokens`).
    pub fn limited(&self) -> u64 {
        self.input.saturating_add(self.output)
    }
}

impl Add for Token {
    type Output = Token;

    fn add(self, other: Token) -> Token {
        Token {
            input: self.input.saturating_add(other.input),
            output: self.output.saturating_add(other.output),
            cache_read: self.cache_read.saturating_add(other.cache_read),
            cache_creation: self.cache_creation.saturating_add(other.cache_creation),
        }
    }
}

/// Monetary amount in USD, never negative
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
pub struct Cost(f64);

impl Cost {
    /// Negative and non-finite amounts collapse to zero
    pub fn new(amount: f64) -> Self {
        if amount.is_finite() && amount > 0.0 {
            Cost(amount)
        } else {
            Cost(0.0)
        }
    }

    pub fn amount(&self) -> f64 {
        self.0
    }
}

impl Add for Cost {
    type Output = Cost;

    fn add(self, other: Cost) -> Cost {
        Cost(self.0 + other.0)
    }
}

impl std::iter::Sum for Cost {
    fn sum<I: Iterator<Item = Cost>>(iter: I) -> Cost {
        iter.fold(Cost::default(), Add::add)
    }
}

/// Aggregation split used by every statistic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Base,
    Premium,
}

/// Model identity as reported by telemetry
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Model(String);

impl Model {
    pub fn new(name: impl Into<String>) -> Self {
        Model(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    /// Haiku models are base tier, everything else is premium
    pub fn tier(&self) -> ModelTier {
        if self.0.to_lowercase().contains("haiku") {
            ModelTier::Base
        } else {
            ModelTier::Premium
        }
    }

    pub fn is_base(&self) -> bool {
        self.tier() == ModelTier::Base
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One observed API call. Write-once: there are no setters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiRequest {
    session_id: String,
    timestamp: DateTime<Utc>,
    model: Model,
    tokens: Token,
    cost: Cost,
    duration_ms: i64,
}

impl ApiRequest {
    pub fn new(
        session_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        model: impl Into<String>,
        tokens: Token,
        cost: Cost,
        duration_ms: i64,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            timestamp,
            model: Model::new(model),
            tokens,
            cost,
            duration_ms: duration_ms.max(0),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn tokens(&self) -> Token {
        self.tokens
    }

    pub fn cost(&self) -> Cost {
        self.cost
    }

    pub fn duration_ms(&self) -> i64 {
        self.duration_ms
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PeriodError {
    #[error("period start {start} is after end {end}")]
    StartAfterEnd {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

/// Half-open UTC interval `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Period {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl Period {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, PeriodError> {
        if start > end {
            return Err(PeriodError::StartAfterEnd { start, end });
        }
        Ok(Self { start, end })
    }

    /// Everything from the Unix epoch until year 9999
    pub fn all_time() -> Self {
        let start = DateTime::<Utc>::UNIX_EPOCH;
        let end = Utc
            .with_ymd_and_hms(9999, 12, 31, 23, 59, 59)
            .single()
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self { start, end }
    }

    pub fn start_at(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end_at(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }
}

/// Aggregated usage over a period, split by model tier.
///
/// Only `from_requests` builds one, so every value is exactly derived
/// from the request set.
#[derive(Debug, Clone, PartialEq)]
pub struct Stats {
    base_requests: u64,
    premium_requests: u64,
    base_tokens: Token,
    premium_tokens: Token,
    base_cost: Cost,
    premium_cost: Cost,
    period: Period,
}

impl Stats {
    pub fn from_requests<'a, I>(period: Period, requests: I) -> Self
    where
        I: IntoIterator<Item = &'a ApiRequest>,
    {
        let mut stats = Stats::empty(period);

        for request in requests {
            match request.model().tier() {
                ModelTier::Base => {
                    stats.base_requests += 1;
                    stats.base_tokens = stats.base_tokens + request.tokens();
                    stats.base_cost = stats.base_cost + request.cost();
                }
                ModelTier::Premium => {
                    stats.premium_requests += 1;
                    stats.premium_tokens = stats.premium_tokens + request.tokens();
                    stats.premium_cost = stats.premium_cost + request.cost();
                }
            }
        }

        stats
    }

    pub fn empty(period: Period) -> Self {
        Self {
            base_requests: 0,
            premium_requests: 0,
            base_tokens: Token::default(),
            premium_tokens: Token::default(),
            base_cost: Cost::default(),
            premium_cost: Cost::default(),
            period,
        }
    }

    pub fn base_requests(&self) -> u64 {
        self.base_requests
    }

    pub fn premium_requests(&self) -> u64 {
        self.premium_requests
    }

    pub fn base_tokens(&self) -> Token {
        self.base_tokens
    }

    pub fn premium_tokens(&self) -> Token {
        self.premium_tokens
    }

    pub fn base_cost(&self) -> Cost {
        self.base_cost
    }

    pub fn premium_cost(&self) -> Cost {
        self.premium_cost
    }

    pub fn total_requests(&self) -> u64 {
        self.base_requests + self.premium_requests
    }

    pub fn total_tokens(&self) -> Token {
        self.base_tokens + self.premium_tokens
    }

    pub fn total_cost(&self) -> Cost {
        self.base_cost + self.premium_cost
    }

    pub fn period(&self) -> Period {
        self.period
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_token_derived_values() {
        let token = Token::new(100, 50, 30, 20);
        assert_eq!(token.total(), 200);
        assert_eq!(token.cache(), 50);
        assert_eq!(token.limited(), 150);
    }

    #[test]
    fn test_token_addition_is_commutative_and_associative() {
        let a = Token::new(1, 2, 3, 4);
        let b = Token::new(10, 20, 30, 40);
        let c = Token::new(7, 0, 9, 1);

        assert_eq!(a + b, b + a);
        assert_eq!((a + b) + c, a + (b + c));
        assert_eq!((a + b + c).total(), a.total() + b.total() + c.total());
    }

    #[test]
    fn test_token_arithmetic_saturates() {
        let huge = Token::new(10, u64::MAX, 0, 0);
        assert_eq!(huge.total(), u64::MAX);
        assert_eq!(huge.limited(), u64::MAX);
        assert_eq!(Token::new(0, 0, u64::MAX, 1).cache(), u64::MAX);

        let sum = huge + Token::new(1, 1, 1, 1);
        assert_eq!(sum, Token::new(11, u64::MAX, 1, 1));
    }

    #[test]
    fn test_limited_excludes_cache_tokens() {
        let cache_only = Token::new(0, 0, 5_000, 1_000);
        assert_eq!(cache_only.limited(), 0);

        let mixed = Token::new(666, 500, 5_000, 1_000);
        assert_eq!(mixed.limited(), 1_166);
    }

    #[test]
    fn test_cost_rejects_negative_and_nan() {
        assert_eq!(Cost::new(-1.5).amount(), 0.0);
        assert_eq!(Cost::new(f64::NAN).amount(), 0.0);
        assert_eq!(Cost::new(f64::INFINITY).amount(), 0.0);
        assert_eq!((Cost::new(0.01) + Cost::new(0.02)).amount(), 0.01 + 0.02);
    }

    #[test]
    fn test_model_classification() {
        assert!(Model::new("claude-3-haiku-20240307").is_base());
        assert!(Model::new("Claude-3-5-HAIKU").is_base());
        assert_eq!(Model::new("claude-sonnet-4-20250514").tier(), ModelTier::Premium);
        assert_eq!(Model::new("claude-opus-4").tier(), ModelTier::Premium);
        assert_eq!(Model::new("").tier(), ModelTier::Premium);
    }

    #[test]
    fn test_period_rejects_inverted_range() {
        assert!(Period::new(at(10), at(9)).is_err());
        assert!(Period::new(at(10), at(10)).is_ok());
    }

    #[test]
    fn test_period_is_half_open() {
        let period = Period::new(at(10), at(15)).unwrap();
        assert!(period.contains(at(10)));
        assert!(period.contains(at(14)));
        assert!(!period.contains(at(15)));
    }

    #[test]
    fn test_stats_split_by_tier() {
        let period = Period::new(at(0), at(23)).unwrap();
        let requests = vec![
            ApiRequest::new(
                "base-1",
                at(10),
                "claude-3-haiku-20240307",
                Token::new(200, 160, 0, 0),
                Cost::new(0.01),
                1000,
            ),
            ApiRequest::new(
                "premium-1",
                at(11),
                "claude-3-5-sonnet-20241022",
                Token::new(666, 500, 0, 0),
                Cost::new(0.02),
                1000,
            ),
        ];

        let stats = Stats::from_requests(period, &requests);

        assert_eq!(stats.base_requests(), 1);
        assert_eq!(stats.premium_requests(), 1);
        assert_eq!(stats.total_requests(), 2);
        assert_eq!(stats.base_tokens(), Token::new(200, 160, 0, 0));
        assert_eq!(stats.premium_tokens(), Token::new(666, 500, 0, 0));
        assert_eq!(stats.total_tokens().total(), 1526);
        assert!((stats.total_cost().amount() - 0.03).abs() < 1e-9);
        assert_eq!(stats.period(), period);
    }

    #[test]
    fn test_api_request_clamps_negative_duration() {
        let request = ApiRequest::new("s", at(1), "m", Token::default(), Cost::default(), -5);
        assert_eq!(request.duration_ms(), 0);
    }
}
