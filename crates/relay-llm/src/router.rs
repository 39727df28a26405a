//! Cross-provider routing.
//!
//! Sits above the per-provider [`ResilientClient`]s. Each request picks an
//! ordering of providers by the configured strategy, skips providers whose
//! breaker refuses the call, and fails over to the next on transient
//! exhaustion. Background health probes issue minimal calls so an open
//! breaker recovers without waiting for live traffic.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::provider::{
    AnthropicProvider, ChatConfig, ChatMessage, ChatResponse, KeyRing, LlmError, LlmProvider,
    MockProvider, OpenAiProvider, ToolSpec,
};
use crate::resilient::ResilientClient;
use crate::retry::RetryConfig;
use crate::usage::{estimate_cost, BudgetConfig, RequestRecord, UsageLedger};
use relay_core::config::{Config, ProviderConfig, ProviderKind};

// ---------------------------------------------------------------------------
// Strategy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteStrategy {
    /// Lowest latency EMA first.
    Latency,
    /// Cheapest cost hint first.
    Cost,
    /// Static priority, preferred provider first.
    Preference,
    RoundRobin,
}

impl RouteStrategy {
    pub fn parse(s: &str) -> Self {
        match s {
            "latency" => RouteStrategy::Latency,
            "cost" => RouteStrategy::Cost,
            "round_robin" => RouteStrategy::RoundRobin,
            _ => RouteStrategy::Preference,
        }
    }
}

// ---------------------------------------------------------------------------
// ProviderEntry
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct HealthStats {
    /// EMA of call latency in milliseconds (alpha 0.3).
    ema_latency_ms: f64,
    total_calls: u64,
    total_failures: u64,
    last_error_at: Option<Instant>,
}

impl HealthStats {
    fn record_latency(&mut self, latency: Duration) {
        const ALPHA: f64 = 0.3;
        let ms = latency.as_secs_f64() * 1_000.0;
        self.ema_latency_ms = if self.ema_latency_ms == 0.0 {
            ms
        } else {
            ALPHA * ms + (1.0 - ALPHA) * self.ema_latency_ms
        };
    }
}

pub struct ProviderEntry {
    pub name: String,
    pub client: ResilientClient,
    pub models: Vec<String>,
    pub priority: u32,
    pub cost_per_1k: f64,
    health: Mutex<HealthStats>,
}

impl ProviderEntry {
    pub fn new(name: impl Into<String>, client: ResilientClient) -> Self {
        Self {
            name: name.into(),
            client,
            models: Vec::new(),
            priority: 1,
            cost_per_1k: 0.0,
            health: Mutex::new(HealthStats::default()),
        }
    }

    pub fn with_models(mut self, models: Vec<String>) -> Self {
        self.models = models;
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_cost(mut self, cost_per_1k: f64) -> Self {
        self.cost_per_1k = cost_per_1k;
        self
    }

    async fn latency_ema(&self) -> f64 {
        self.health.lock().await.ema_latency_ms
    }
}

/// One provider's health as exposed to status surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    pub name: String,
    pub ema_latency_ms: f64,
    pub total_calls: u64,
    pub total_failures: u64,
    pub breaker_open: bool,
}

// ---------------------------------------------------------------------------
// ProviderRouter
// ---------------------------------------------------------------------------

pub struct ProviderRouter {
    entries: Vec<Arc<ProviderEntry>>,
    strategy: RouteStrategy,
    preferred: Option<String>,
    probe_interval: Duration,
    rr_cursor: AtomicUsize,
    ledger: Arc<UsageLedger>,
}

impl ProviderRouter {
    pub fn new(entries: Vec<ProviderEntry>, strategy: RouteStrategy) -> Self {
        Self {
            entries: entries.into_iter().map(Arc::new).collect(),
            strategy,
            preferred: None,
            probe_interval: Duration::from_secs(60),
            rr_cursor: AtomicUsize::new(0),
            ledger: Arc::new(UsageLedger::new(BudgetConfig::default())),
        }
    }

    pub fn with_preferred(mut self, preferred: Option<String>) -> Self {
        self.preferred = preferred;
        self
    }

    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    pub fn with_ledger(mut self, ledger: Arc<UsageLedger>) -> Self {
        self.ledger = ledger;
        self
    }

    /// Build the router from the application config.
    pub fn from_config(config: &Config) -> Self {
        let retry = RetryConfig::from_resilience(&config.resilience);
        let breaker_config = BreakerConfig {
            failure_threshold: config.resilience.circuit_breaker_threshold,
            cooldown: Duration::from_secs(config.resilience.circuit_breaker_cooldown),
        };

        let mut entries = Vec::new();
        for (name, provider_cfg) in &config.provider_router.providers {
            if !provider_cfg.enabled {
                continue;
            }
            entries.push(build_entry(name, provider_cfg, &retry, &breaker_config));
        }

        let router_cfg = &config.provider_router;
        let ledger = Arc::new(UsageLedger::new(BudgetConfig {
            daily_usd: router_cfg.daily_budget_usd,
            monthly_usd: router_cfg.monthly_budget_usd,
        }));

        info!(
            providers = entries.len(),
            strategy = %router_cfg.strategy,
            "provider router configured"
        );

        Self::new(entries, RouteStrategy::parse(&router_cfg.strategy))
            .with_preferred(router_cfg.preferred.clone())
            .with_probe_interval(Duration::from_secs(router_cfg.probe_interval))
            .with_ledger(ledger)
    }

    pub fn ledger(&self) -> &Arc<UsageLedger> {
        &self.ledger
    }

    pub fn provider_count(&self) -> usize {
        self.entries.len()
    }

    /// Route a chat call across providers.
    ///
    /// Budget is checked once up front - a `BudgetExceeded` is terminal and
    /// never retried. Fatal per-call errors stop the failover walk; anything
    /// transient moves on to the next provider in the strategy order.
    pub async fn chat(
        &self,
        messages: &[ChatMessage],
        config: &ChatConfig,
        tools: Option<&[ToolSpec]>,
        fallback_models: &[String],
    ) -> Result<(ChatResponse, String), LlmError> {
        self.ledger.check_budget().await?;

        let order = self.selection_order().await;
        if order.is_empty() {
            return Err(LlmError::NoProvider);
        }

        let mut last_error = None;
        for entry in order {
            match entry.client.chat(messages, config, tools, fallback_models).await {
                Ok((response, stats)) => {
                    {
                        let mut health = entry.health.lock().await;
                        health.total_calls += 1;
                        health.record_latency(stats.latency);
                    }
                    let usage = response.usage.unwrap_or_default();
                    self.ledger
                        .record(RequestRecord {
                            model: response.model.clone(),
                            provider: entry.name.clone(),
                            input_tokens: usage.input_tokens,
                            output_tokens: usage.output_tokens,
                            latency_ms: stats.latency.as_millis() as u64,
                            retries: stats.retries,
                            used_fallback: stats.used_fallback,
                            cost_usd: estimate_cost(
                                entry.cost_per_1k,
                                usage.input_tokens,
                                usage.output_tokens,
                            ),
                            ok: true,
                            timestamp: chrono::Utc::now(),
                        })
                        .await;
                    return Ok((response, entry.name.clone()));
                }
                Err(e) if e.is_fatal() => {
                    self.record_failure(&entry, &config.model).await;
                    return Err(e);
                }
                Err(e) => {
                    self.record_failure(&entry, &config.model).await;
                    warn!(provider = %entry.name, error = %e, "provider failed, trying next");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or(LlmError::NoProvider))
    }

    async fn record_failure(&self, entry: &ProviderEntry, model: &str) {
        let mut health = entry.health.lock().await;
        health.total_calls += 1;
        health.total_failures += 1;
        health.last_error_at = Some(Instant::now());
        drop(health);

        self.ledger
            .record(RequestRecord {
                model: model.to_string(),
                provider: entry.name.clone(),
                input_tokens: 0,
                output_tokens: 0,
                latency_ms: 0,
                retries: 0,
                used_fallback: false,
                cost_usd: 0.0,
                ok: false,
                timestamp: chrono::Utc::now(),
            })
            .await;
    }

    /// Providers in the order this request should try them.
    async fn selection_order(&self) -> Vec<Arc<ProviderEntry>> {
        let mut order: Vec<Arc<ProviderEntry>> = self.entries.clone();
        match self.strategy {
            RouteStrategy::Preference => {
                order.sort_by_key(|e| e.priority);
                if let Some(ref preferred) = self.preferred {
                    if let Some(pos) = order.iter().position(|e| &e.name == preferred) {
                        let entry = order.remove(pos);
                        order.insert(0, entry);
                    }
                }
            }
            RouteStrategy::Cost => {
                order.sort_by(|a, b| {
                    a.cost_per_1k
                        .partial_cmp(&b.cost_per_1k)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then(a.priority.cmp(&b.priority))
                });
            }
            RouteStrategy::Latency => {
                let mut keyed = Vec::with_capacity(order.len());
                for entry in order {
                    let ema = entry.latency_ema().await;
                    keyed.push((ema, entry));
                }
                keyed.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
                return keyed.into_iter().map(|(_, e)| e).collect();
            }
            RouteStrategy::RoundRobin => {
                if !order.is_empty() {
                    let shift = self.rr_cursor.fetch_add(1, Ordering::Relaxed) % order.len();
                    order.rotate_left(shift);
                }
            }
        }
        order
    }

    /// Current health of every provider.
    pub async fn statuses(&self) -> Vec<ProviderStatus> {
        let mut out = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            let health = entry.health.lock().await;
            out.push(ProviderStatus {
                name: entry.name.clone(),
                ema_latency_ms: health.ema_latency_ms,
                total_calls: health.total_calls,
                total_failures: health.total_failures,
                breaker_open: entry.client.breaker().state().await
                    == crate::breaker::CircuitState::Open,
            });
        }
        out
    }

    /// Probe every provider once (minimal call against its first model).
    pub async fn probe_all(&self) {
        for entry in &self.entries {
            let Some(model) = entry.models.first() else {
                continue;
            };
            let ok = entry.client.probe(model).await;
            debug!(provider = %entry.name, ok, "health probe");
        }
    }

    /// Spawn the background probe loop. Abort the handle on shutdown.
    pub fn spawn_probes(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let interval = self.probe_interval;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await; // consume the immediate first tick
            loop {
                tick.tick().await;
                self.probe_all().await;
            }
        })
    }
}

fn build_entry(
    name: &str,
    cfg: &ProviderConfig,
    retry: &RetryConfig,
    breaker_config: &BreakerConfig,
) -> ProviderEntry {
    let keys = Arc::new(KeyRing::from_env(&cfg.api_key_env));
    let provider: Arc<dyn LlmProvider> = match cfg.kind {
        ProviderKind::Anthropic => {
            let mut p = AnthropicProvider::new(KeyRing::from_env(&cfg.api_key_env));
            if let Some(ref url) = cfg.base_url {
                p = p.with_base_url(url.clone());
            }
            Arc::new(p)
        }
        ProviderKind::OpenAi => {
            let mut p = OpenAiProvider::new(KeyRing::from_env(&cfg.api_key_env)).with_name(name);
            if let Some(ref url) = cfg.base_url {
                p = p.with_base_url(url.clone());
            }
            Arc::new(p)
        }
        ProviderKind::Mock => Arc::new(MockProvider::new()),
    };

    let client = ResilientClient::new(
        name,
        provider,
        keys,
        CircuitBreaker::new(name, breaker_config.clone()),
        retry.clone(),
    );

    ProviderEntry::new(name, client)
        .with_models(cfg.models.clone())
        .with_priority(cfg.priority)
        .with_cost(cfg.cost_per_1k_tokens)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
