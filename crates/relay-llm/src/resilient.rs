//! Per-provider resilient calls.
//!
//! For one provider: try the primary model with the retry schedule, then
//! each fallback model in order. Rate-limit errors rotate the credential
//! ring; once a full rotation passes without success the failure propagates
//! to the retry layer as-is. Authentication errors become fatal after the
//! cycle completes. Every outcome is reported to the provider's circuit
//! breaker.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::breaker::CircuitBreaker;
use crate::provider::{
    ChatConfig, ChatMessage, ChatResponse, KeyRing, LlmError, LlmProvider, ToolSpec,
};
use crate::retry::{with_retry, RetryConfig};

/// Accounting for one resilient call.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallStats {
    /// Attempts beyond the first, summed across models.
    pub retries: u32,
    pub used_fallback: bool,
    pub latency: Duration,
}

pub struct ResilientClient {
    name: String,
    provider: Arc<dyn LlmProvider>,
    keys: Arc<KeyRing>,
    breaker: CircuitBreaker,
    retry: RetryConfig,
}

impl ResilientClient {
    pub fn new(
        name: impl Into<String>,
        provider: Arc<dyn LlmProvider>,
        keys: Arc<KeyRing>,
        breaker: CircuitBreaker,
        retry: RetryConfig,
    ) -> Self {
        Self {
            name: name.into(),
            provider,
            keys,
            breaker,
            retry,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Chat through the model fallback chain with retries.
    pub async fn chat(
        &self,
        messages: &[ChatMessage],
        config: &ChatConfig,
        tools: Option<&[ToolSpec]>,
        fallback_models: &[String],
    ) -> Result<(ChatResponse, CallStats), LlmError> {
        if !self.breaker.admit().await {
            return Err(LlmError::CircuitOpen(self.name.clone()));
        }

        let started = Instant::now();
        let attempts = AtomicU32::new(0);
        let mut models = vec![config.model.clone()];
        models.extend(fallback_models.iter().cloned());

        let mut last_error: Option<LlmError> = None;
        for (index, model) in models.iter().enumerate() {
            let model_config = ChatConfig {
                model: model.clone(),
                ..config.clone()
            };
            let operation = format!("{}:{}", self.name, model);

            let outcome = with_retry(&self.retry, &operation, || {
                attempts.fetch_add(1, Ordering::Relaxed);
                self.call_once(messages, &model_config, tools)
            })
            .await;

            match outcome {
                Ok(response) => {
                    self.breaker.record_success().await;
                    let total = attempts.load(Ordering::Relaxed);
                    return Ok((
                        response,
                        CallStats {
                            retries: total.saturating_sub(1),
                            used_fallback: index > 0,
                            latency: started.elapsed(),
                        },
                    ));
                }
                Err(e) if e.is_fatal() => {
                    self.breaker.record_failure().await;
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        provider = %self.name,
                        model = %model,
                        error = %e,
                        "model exhausted, trying next in fallback chain"
                    );
                    last_error = Some(e);
                }
            }
        }

        self.breaker.record_failure().await;
        match last_error {
            Some(e) => {
                debug!(provider = %self.name, error = %e, "all models exhausted");
                Err(LlmError::ProviderUnavailable(self.name.clone()))
            }
            None => Err(LlmError::ProviderUnavailable(self.name.clone())),
        }
    }

    /// One attempt, cycling credentials on rate-limit and auth rejections.
    async fn call_once(
        &self,
        messages: &[ChatMessage],
        config: &ChatConfig,
        tools: Option<&[ToolSpec]>,
    ) -> Result<ChatResponse, LlmError> {
        let cycle = self.keys.len().max(1);
        let mut last_error: Option<LlmError> = None;

        for rotation in 0..cycle {
            match self.provider.chat(messages, config, tools).await {
                Ok(response) => return Ok(response),
                Err(e @ LlmError::RateLimited { .. }) => {
                    self.keys.advance();
                    debug!(
                        provider = %self.name,
                        rotation = rotation + 1,
                        "rate limited, rotating credential"
                    );
                    last_error = Some(e);
                }
                Err(e @ LlmError::Auth { .. }) => {
                    self.keys.advance();
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        // Full credential cycle without success: rate limits stay retryable
        // for the outer schedule, auth is now fatal.
        Err(last_error.unwrap_or(LlmError::Timeout))
    }

    /// Minimal health probe. Goes through the breaker's admission gate, so
    /// a probe after the cooldown is exactly the half-open trial call; its
    /// success closes the circuit.
    pub async fn probe(&self, model: &str) -> bool {
        if !self.breaker.admit().await {
            return false;
        }
        let config = ChatConfig {
            model: model.to_string(),
            max_tokens: 8,
            timeout: Duration::from_secs(10),
            ..ChatConfig::default()
        };
        let messages = [ChatMessage::user("ping")];
        match self.provider.chat(&messages, &config, None).await {
            Ok(_) => {
                self.breaker.record_success().await;
                true
            }
            Err(e) => {
                debug!(provider = %self.name, error = %e, "health probe failed");
                self.breaker.record_failure().await;
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
