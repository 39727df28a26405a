//! Provider outage scenarios across the router / resilient / breaker stack.

use std::sync::Arc;
use std::time::Duration;

use relay_llm::breaker::{BreakerConfig, CircuitBreaker, CircuitState};
use relay_llm::provider::{ChatConfig, ChatMessage, KeyRing, LlmError, MockProvider};
use relay_llm::resilient::ResilientClient;
use relay_llm::retry::RetryConfig;
use relay_llm::router::{ProviderEntry, ProviderRouter, RouteStrategy};

fn single_attempt_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 1,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
        jitter: Duration::ZERO,
    }
}

fn entry(
    name: &str,
    provider: MockProvider,
    breaker: CircuitBreaker,
    priority: u32,
) -> ProviderEntry {
    let client = ResilientClient::new(
        name,
        Arc::new(provider),
        Arc::new(KeyRing::new(vec!["k".into()])),
        breaker,
        single_attempt_retry(),
    );
    ProviderEntry::new(name, client)
        .with_models(vec!["m".into()])
        .with_priority(priority)
}

fn config() -> ChatConfig {
    ChatConfig {
        model: "m".into(),
        ..ChatConfig::default()
    }
}

/// Scenario: the primary provider returns 503 three times in a row, which
/// opens its breaker; the router keeps serving from the secondary. Once the
/// cooldown elapses, a successful probe closes the primary again.
#[tokio::test]
async fn provider_outage_with_failover_and_recovery() {
    let primary_breaker = CircuitBreaker::new(
        "primary",
        BreakerConfig {
            failure_threshold: 3,
            cooldown: Duration::from_millis(50),
        },
    );

    // Three 503s, then healthy again for the probe and later traffic.
    let mut primary = MockProvider::new();
    for _ in 0..3 {
        primary = primary.with_error(LlmError::Api {
            status: 503,
            message: "service unavailable".into(),
        });
    }
    primary = primary.with_text("primary recovered");

    let secondary = MockProvider::new()
        .with_text("secondary 1")
        .with_text("secondary 2")
        .with_text("secondary 3");

    let router = ProviderRouter::new(
        vec![
            entry("primary", primary, primary_breaker.clone(), 1),
            entry("secondary", secondary, CircuitBreaker::new("secondary", BreakerConfig::default()), 2),
        ],
        RouteStrategy::Preference,
    );

    // Three calls: each fails on primary, succeeds on secondary.
    for i in 1..=3 {
        let (response, provider) = router
            .chat(&[ChatMessage::user("q")], &config(), None, &[])
            .await
            .unwrap();
        assert_eq!(provider, "secondary");
        assert_eq!(response.text(), format!("secondary {i}"));
    }

    // Exactly three consecutive failures opened the primary's breaker.
    assert_eq!(primary_breaker.state().await, CircuitState::Open);

    // After the cooldown, one successful probe closes it.
    tokio::time::sleep(Duration::from_millis(60)).await;
    router.probe_all().await;
    assert_eq!(primary_breaker.state().await, CircuitState::Closed);
}

/// While a breaker is open, calls to that provider fast-fail without
/// touching the network, and the router routes around it.
#[tokio::test]
async fn open_breaker_is_routed_around() {
    let primary_breaker = CircuitBreaker::new(
        "primary",
        BreakerConfig {
            failure_threshold: 1,
            cooldown: Duration::from_secs(60),
        },
    );
    primary_breaker.record_failure().await;

    let primary = MockProvider::new().with_text("should never be reached");
    let secondary = MockProvider::new().with_text("served by secondary");

    let router = ProviderRouter::new(
        vec![
            entry("primary", primary, primary_breaker, 1),
            entry(
                "secondary",
                secondary,
                CircuitBreaker::new("secondary", BreakerConfig::default()),
                2,
            ),
        ],
        RouteStrategy::Preference,
    );

    let (response, provider) = router
        .chat(&[ChatMessage::user("q")], &config(), None, &[])
        .await
        .unwrap();
    assert_eq!(provider, "secondary");
    assert_eq!(response.text(), "served by secondary");
}

/// Auth failures are fatal: the router must not fail over past them.
#[tokio::test]
async fn auth_failure_stops_the_failover_walk() {
    let primary = MockProvider::new().with_error(LlmError::Auth { status: 401 });
    let secondary = MockProvider::new().with_text("never served");

    let router = ProviderRouter::new(
        vec![
            entry(
                "primary",
                primary,
                CircuitBreaker::new("primary", BreakerConfig::default()),
                1,
            ),
            entry(
                "secondary",
                secondary,
                CircuitBreaker::new("secondary", BreakerConfig::default()),
                2,
            ),
        ],
        RouteStrategy::Preference,
    );

    let err = router
        .chat(&[ChatMessage::user("q")], &config(), None, &[])
        .await
        .unwrap_err();
    assert!(matches!(err, LlmError::Auth { .. }));
}
