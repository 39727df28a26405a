//! Usage accounting and budgets.
//!
//! Every terminal model call (success or terminal failure) is recorded with
//! model, provider, token counts, latency, retry count, fallback flag, and
//! estimated cost. Daily and monthly USD ceilings turn into
//! [`LlmError::BudgetExceeded`], which is never retried.

use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::provider::LlmError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    pub model: String,
    pub provider: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub latency_ms: u64,
    /// Attempts beyond the first, across all models tried.
    pub retries: u32,
    pub used_fallback: bool,
    pub cost_usd: f64,
    pub ok: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct BudgetConfig {
    pub daily_usd: Option<f64>,
    pub monthly_usd: Option<f64>,
}

#[derive(Debug, Default)]
pub struct UsageLedger {
    records: RwLock<Vec<RequestRecord>>,
    budget: BudgetConfig,
}

impl UsageLedger {
    pub fn new(budget: BudgetConfig) -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            budget,
        }
    }

    pub async fn record(&self, record: RequestRecord) {
        self.records.write().await.push(record);
    }

    pub async fn request_count(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn spent_since(&self, cutoff: DateTime<Utc>) -> f64 {
        self.records
            .read()
            .await
            .iter()
            .filter(|r| r.timestamp >= cutoff)
            .map(|r| r.cost_usd)
            .sum()
    }

    pub async fn spent_today(&self) -> f64 {
        self.spent_since(start_of_day(Utc::now())).await
    }

    pub async fn spent_this_month(&self) -> f64 {
        self.spent_since(start_of_month(Utc::now())).await
    }

    /// Fail with `BudgetExceeded` once either ceiling is reached.
    pub async fn check_budget(&self) -> Result<(), LlmError> {
        if let Some(limit) = self.budget.daily_usd {
            let spent = self.spent_today().await;
            if spent >= limit {
                return Err(LlmError::BudgetExceeded { spent, limit });
            }
        }
        if let Some(limit) = self.budget.monthly_usd {
            let spent = self.spent_this_month().await;
            if spent >= limit {
                return Err(LlmError::BudgetExceeded { spent, limit });
            }
        }
        Ok(())
    }

    pub async fn totals(&self) -> (u64, u64, f64) {
        let records = self.records.read().await;
        records.iter().fold((0, 0, 0.0), |acc, r| {
            (
                acc.0 + r.input_tokens,
                acc.1 + r.output_tokens,
                acc.2 + r.cost_usd,
            )
        })
    }
}

/// Estimated cost from a flat per-1k-token hint.
pub fn estimate_cost(cost_per_1k: f64, input_tokens: u64, output_tokens: u64) -> f64 {
    cost_per_1k * ((input_tokens + output_tokens) as f64 / 1_000.0)
}

fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year(), now.month(), now.day(), 0, 0, 0)
        .single()
        .unwrap_or(now)
}

fn start_of_month(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(now)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
