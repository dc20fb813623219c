//! Subscription plans and plan usage percentages

use crate::usage::models::Cost;

/// A subscription tier with its monthly price
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    name: String,
    price: Cost,
}

impl Plan {
    pub fn new(name: impl Into<String>, price: Cost) -> Self {
        Self {
            name: name.into(),
            price,
        }
    }

    /// Sentinel for "no plan configured"
    pub fn unset() -> Self {
        Self::new("unset", Cost::default())
    }

    /// Look up a known plan by name. Unknown names fall back to `unset`.
    pub fn from_name(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "pro" => Self::new("pro", Cost::new(20.0)),
            "max" | "max5" => Self::new("max", Cost::new(100.0)),
            "max20" => Self::new("max20", Cost::new(200.0)),
            _ => Self::unset(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn price(&self) -> Cost {
        self.price
    }

    pub fn is_unset(&self) -> bool {
        self.name == "unset" || self.price.amount() <= 0.0
    }

    /// Default token limit for a 5-hour block on this plan
    pub fn block_token_limit(&self) -> Option<u64> {
        match self.name.as_str() {
            "pro" => Some(7_000),
            "max" => Some(35_000),
            "max20" => Some(140_000),
            _ => None,
        }
    }

    /// Whole-percent share of the monthly price spent. Always 0 when unset.
    pub fn usage_percentage(&self, cost: Cost) -> u64 {
        if self.is_unset() {
            return 0;
        }
        (cost.amount() / self.price.amount() * 100.0).floor() as u64
    }

    /// Whole-percent share of the daily budget (price spread over the month)
    pub fn daily_usage_percentage(&self, daily_cost: Cost, days_in_month: u32) -> u64 {
        if self.is_unset() || days_in_month == 0 {
            return 0;
        }
        let daily_budget = self.price.amount() / days_in_month as f64;
        (daily_cost.amount() / daily_budget * 100.0).floor() as u64
    }
}

impl Default for Plan {
    fn default() -> Self {
        Self::unset()
    }
}
