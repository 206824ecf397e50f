use chrono::Utc;
use futures_util::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use validator::Validate;

use super::metrics::{MetricSample, MetricsStore, PerformanceProfile};
use super::quality::QualityScorer;
use super::registry::ProviderRegistry;
use super::selector::{AdaptiveSelector, SelectionStrategy};
use super::telemetry::{TelemetryRecord, TelemetrySink, TracingTelemetrySink};
use crate::error::Result;
use crate::models::provider::{GenerationRequest, GenerationResponse, ProviderHealth, HEALTH_CHECK_TIMEOUT};
use crate::resilience::CircuitBreakerStats;

#[derive(Debug, Clone, Serialize)]
pub struct ProviderMetricsSnapshot {
    pub provider_name: String,
    pub kind: String,
    pub profile: Option<PerformanceProfile>,
    pub circuit: Option<CircuitBreakerStats>,
}

/// Single entry point: select, invoke, score, record, report.
pub struct OrchestrationService {
    registry: Arc<ProviderRegistry>,
    metrics: Arc<MetricsStore>,
    selector: AdaptiveSelector,
    scorer: QualityScorer,
    telemetry: Arc<dyn TelemetrySink>,
    health_timeout: Duration,
}

impl OrchestrationService {
    pub fn new(registry: Arc<ProviderRegistry>, metrics: Arc<MetricsStore>, strategy: SelectionStrategy) -> Self {
        info!(
            "Creating orchestration service with {} providers, strategy {}",
            registry.len(),
            strategy
        );

        Self {
            selector: AdaptiveSelector::new(registry.clone(), metrics.clone(), strategy),
            registry,
            metrics,
            scorer: QualityScorer::default(),
            telemetry: Arc::new(TracingTelemetrySink),
            health_timeout: HEALTH_CHECK_TIMEOUT,
        }
    }

    pub fn with_quality_scorer(mut self, scorer: QualityScorer) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn with_health_timeout(mut self, timeout: Duration) -> Self {
        self.health_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn selector(&self) -> &AdaptiveSelector {
        &self.selector
    }

    /// The provider chosen up front is charged with the outcome either way.
    pub async fn generate(&self, request: &GenerationRequest, cancel: &CancellationToken) -> Result<GenerationResponse> {
        request.validate()?;

        let provider = self.selector.select_provider(request)?;
        let provider_name = provider.name().to_string();

        let started = Instant::now();
        let outcome = provider.generate(request, cancel).await;
        let elapsed = started.elapsed();

        match outcome {
            Ok(response) => {
                let quality = self.scorer.score(&response);
                self.selector.update_metrics(
                    &provider_name,
                    &MetricSample::success(elapsed, response.usage.cost, quality),
                );

                debug!(
                    "Provider '{}' answered {} in {:?} (quality {:.2})",
                    provider_name, response.correlation_id, elapsed, quality
                );

                self.emit(TelemetryRecord {
                    timestamp: Utc::now(),
                    provider_name,
                    model: request.model.clone(),
                    success: true,
                    duration: elapsed,
                    tokens_used: response.usage.total_tokens,
                    cost: response.usage.cost,
                    error_message: None,
                    user_id: request.user_id.clone(),
                    session_id: request.session_id.clone(),
                    correlation_id: Some(response.correlation_id.clone()),
                });

                Ok(response)
            }
            Err(error) => {
                if error.is_cancelled() {
                    debug!("Request to provider '{}' cancelled by caller", provider_name);
                } else {
                    warn!("Provider '{}' failed after {:?}: {}", provider_name, elapsed, error);
                    self.selector
                        .update_metrics(&provider_name, &MetricSample::failure(elapsed));
                }

                self.emit(TelemetryRecord {
                    timestamp: Utc::now(),
                    provider_name,
                    model: request.model.clone(),
                    success: false,
                    duration: elapsed,
                    tokens_used: 0,
                    cost: rust_decimal::Decimal::ZERO,
                    error_message: Some(error.to_string()),
                    user_id: request.user_id.clone(),
                    session_id: request.session_id.clone(),
                    correlation_id: request.correlation_id.clone(),
                });

                Err(error)
            }
        }
    }

    /// Errors and timeouts come back as unhealthy records.
    pub async fn get_provider_health(&self) -> Vec<ProviderHealth> {
        let timeout = self.health_timeout;

        let checks = self.registry.get_available_providers().iter().map(|provider| {
            let provider = provider.clone();
            async move {
                let started = Instant::now();
                match tokio::time::timeout(timeout, provider.health_check()).await {
                    Ok(Ok(health)) => health,
                    Ok(Err(e)) => ProviderHealth::unhealthy(provider.name(), started.elapsed(), e.to_string()),
                    Err(_) => ProviderHealth::unhealthy(
                        provider.name(),
                        timeout,
                        format!("Health check timed out after {:?}", timeout),
                    ),
                }
            }
        });

        let results = join_all(checks).await;
        let healthy = results.iter().filter(|h| h.is_healthy).count();
        info!("Health check complete: {}/{} providers healthy", healthy, results.len());
        results
    }

    pub async fn validate_providers(&self) -> Vec<(String, bool)> {
        let timeout = self.health_timeout;

        let checks = self.registry.get_available_providers().iter().map(|provider| {
            let provider = provider.clone();
            async move {
                let valid = tokio::time::timeout(timeout, provider.validate_configuration())
                    .await
                    .unwrap_or(false);
                if !valid {
                    warn!("Provider '{}' failed configuration validation", provider.name());
                }
                (provider.name().to_string(), valid)
            }
        });

        join_all(checks).await
    }

    pub fn get_provider_metrics(&self) -> Vec<ProviderMetricsSnapshot> {
        self.registry
            .get_available_providers()
            .iter()
            .map(|provider| ProviderMetricsSnapshot {
                provider_name: provider.name().to_string(),
                kind: provider.kind().to_string(),
                profile: self.metrics.get(provider.name()),
                circuit: provider.circuit_stats(),
            })
            .collect()
    }

    fn emit(&self, record: TelemetryRecord) {
        if let Err(e) = self.telemetry.emit(&record) {
            warn!("Failed to emit telemetry for provider '{}': {}", record.provider_name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::models::provider::{FinishReason, Provider};
    use crate::orchestration::telemetry::InMemoryTelemetrySink;
    use crate::resilience::{CircuitState, PipelineConfig};
    use crate::testing::{Health, ScriptedProvider};

    struct BrokenSink;

    impl TelemetrySink for BrokenSink {
        fn emit(&self, _record: &TelemetryRecord) -> Result<()> {
            Err(Error::transport("telemetry collector unreachable"))
        }
    }

    fn build(
        providers: Vec<Arc<ScriptedProvider>>,
        strategy: SelectionStrategy,
    ) -> (OrchestrationService, Arc<MetricsStore>, Arc<InMemoryTelemetrySink>) {
        let mut registry = ProviderRegistry::new();
        for provider in providers {
            registry.register(provider);
        }
        let metrics = Arc::new(MetricsStore::default());
        let sink = Arc::new(InMemoryTelemetrySink::new(1000));
        let service = OrchestrationService::new(Arc::new(registry), metrics.clone(), strategy)
            .with_telemetry(sink.clone());
        (service, metrics, sink)
    }

    fn request() -> GenerationRequest {
        GenerationRequest::from_prompt("test-model", "Explain circuit breakers")
            .with_user("user-7")
            .with_session("session-3")
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_records_metrics_and_telemetry() {
        let provider = Arc::new(
            ScriptedProvider::new("a")
                .with_latency(Duration::from_millis(120))
                .with_content("short", FinishReason::Truncated),
        );
        let (service, metrics, sink) = build(vec![provider], SelectionStrategy::RoundRobin);

        let response = service.generate(&request(), &CancellationToken::new()).await.unwrap();
        assert_eq!(response.provider, "a");

        let profile = metrics.get("a").unwrap();
        assert_eq!(profile.sample_count, 1);
        assert_eq!(profile.success_rate, 1.0);
        assert!((profile.quality_score - 0.5).abs() < 1e-9);
        assert!((profile.average_latency_ms - 120.0).abs() < 1.0);

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert!(records[0].success);
        assert_eq!(records[0].user_id.as_deref(), Some("user-7"));
        assert_eq!(records[0].session_id.as_deref(), Some("session-3"));
        assert_eq!(records[0].tokens_used, 30);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_is_attributed_to_the_invoked_provider() {
        let bad = Arc::new(ScriptedProvider::new("bad").failing_with(|| Error::protocol(500, "boom")));
        let good = Arc::new(ScriptedProvider::new("good"));
        let (service, metrics, sink) = build(vec![bad, good], SelectionStrategy::RoundRobin);

        let error = service.generate(&request(), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(error, Error::Protocol { status: 500, .. }));

        let profile = metrics.get("bad").unwrap();
        assert_eq!(profile.success_rate, 0.0);
        assert_eq!(profile.quality_score, 0.0);
        assert_eq!(profile.average_cost, rust_decimal::Decimal::ZERO);
        assert!(metrics.get("good").is_none());

        let records = sink.records();
        assert_eq!(records[0].provider_name, "bad");
        assert!(!records[0].success);
        assert!(records[0].error_message.as_deref().unwrap_or_default().contains("500"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_providers_never_calls_out() {
        let disabled = Arc::new(ScriptedProvider::new("off").disabled());
        let (service, metrics, sink) = build(vec![disabled.clone()], SelectionStrategy::BestLatency);

        let error = service.generate(&request(), &CancellationToken::new()).await.unwrap_err();

        assert!(matches!(error, Error::NoProvidersAvailable));
        assert_eq!(disabled.network_calls(), 0);
        assert!(metrics.is_empty());
        assert!(sink.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_request_is_rejected_before_selection() {
        let provider = Arc::new(ScriptedProvider::new("a"));
        let (service, _, _) = build(vec![provider.clone()], SelectionStrategy::RoundRobin);

        let invalid = GenerationRequest::from_prompt("", "hello");
        let error = service.generate(&invalid, &CancellationToken::new()).await.unwrap_err();

        assert!(matches!(error, Error::Validation(_)));
        assert_eq!(provider.network_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_provider_always_selected() {
        let poor = Arc::new(ScriptedProvider::new("only").failing_with(|| Error::timeout("slow")));
        let (service, _, _) = build(vec![poor.clone()], SelectionStrategy::QualityScore);

        for _ in 0..5 {
            let _ = service.generate(&request(), &CancellationToken::new()).await;
        }
        assert_eq!(poor.network_calls(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_best_latency_prefers_faster_provider() {
        let fast = Arc::new(ScriptedProvider::new("A").with_latency(Duration::from_millis(50)));
        let slow = Arc::new(ScriptedProvider::new("B").with_latency(Duration::from_millis(200)));

        let mut registry = ProviderRegistry::new();
        registry.register(fast.clone());
        registry.register(slow.clone());
        let registry = Arc::new(registry);
        let metrics = Arc::new(MetricsStore::default());
        let cancel = CancellationToken::new();

        // Warm both profiles through a rotating service sharing the same store.
        let warmup = OrchestrationService::new(registry.clone(), metrics.clone(), SelectionStrategy::RoundRobin);
        for _ in 0..2 {
            warmup.generate(&request(), &cancel).await.unwrap();
        }
        assert!((metrics.get("A").unwrap().average_latency_ms - 50.0).abs() < 1.0);
        assert!((metrics.get("B").unwrap().average_latency_ms - 200.0).abs() < 1.0);

        let service = OrchestrationService::new(registry, metrics, SelectionStrategy::BestLatency);
        for _ in 0..100 {
            let response = service.generate(&request(), &cancel).await.unwrap();
            assert_eq!(response.provider, "A");
        }

        assert_eq!(fast.network_calls(), 101);
        assert_eq!(slow.network_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timing_out_provider_stops_receiving_calls() {
        let pipeline = PipelineConfig {
            retry_count: 1,
            base_delay: Duration::from_millis(100),
            failure_threshold: 3,
            open_duration: Duration::from_secs(30),
            ..PipelineConfig::provider_default()
        }
        .with_attempt_timeout(Duration::from_millis(500));

        let stuck = Arc::new(ScriptedProvider::new("stuck").hanging().with_pipeline(&pipeline));
        let healthy = Arc::new(ScriptedProvider::new("healthy").with_pipeline(&pipeline));
        let (service, metrics, _) = build(vec![stuck.clone(), healthy.clone()], SelectionStrategy::RoundRobin);
        let cancel = CancellationToken::new();

        let mut circuit_open = 0;
        let mut timeouts = 0;
        let mut served = 0;
        for _ in 0..20 {
            match service.generate(&request(), &cancel).await {
                Ok(response) => {
                    assert_eq!(response.provider, "healthy");
                    served += 1;
                }
                Err(Error::Timeout(_)) => timeouts += 1,
                Err(e) if e.is_circuit_open() => circuit_open += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }

        assert_eq!(served, 10);
        assert_eq!(timeouts, 3);
        assert_eq!(circuit_open, 7);
        // Three sequences of two attempts each, nothing after the breaker opened.
        assert_eq!(stuck.network_calls(), 6);
        assert_eq!(stuck.circuit_stats().unwrap().state, CircuitState::Open);
        assert_eq!(metrics.get("stuck").unwrap().success_rate, 0.0);

        tokio::time::sleep(Duration::from_secs(31)).await;
        let _ = service.generate(&request(), &cancel).await;
        let _ = service.generate(&request(), &cancel).await;
        // One trial sequence went out after the cool-down.
        assert_eq!(stuck.network_calls(), 8);
        assert_eq!(healthy.network_calls(), 11);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_propagates_without_failure_sample() {
        let provider = Arc::new(
            ScriptedProvider::new("slow")
                .with_latency(Duration::from_secs(60))
                .with_pipeline(&PipelineConfig::provider_default()),
        );
        let (service, metrics, _) = build(vec![provider], SelectionStrategy::RoundRobin);

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let error = service.generate(&request(), &cancel).await.unwrap_err();
        assert!(error.is_cancelled());
        assert!(metrics.get("slow").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_broken_telemetry_does_not_mask_outcome() {
        let ok = Arc::new(ScriptedProvider::new("ok"));
        let mut registry = ProviderRegistry::new();
        registry.register(ok);
        let service = OrchestrationService::new(
            Arc::new(registry),
            Arc::new(MetricsStore::default()),
            SelectionStrategy::RoundRobin,
        )
        .with_telemetry(Arc::new(BrokenSink));

        assert!(service.generate(&request(), &CancellationToken::new()).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_returns_one_record_per_provider() {
        let providers = vec![
            Arc::new(ScriptedProvider::new("up")),
            Arc::new(ScriptedProvider::new("degraded").with_health(Health::Unhealthy)),
            Arc::new(ScriptedProvider::new("erroring").with_health(Health::Fails)),
            Arc::new(ScriptedProvider::new("stuck").with_health(Health::Hangs)),
        ];
        let (service, _, _) = build(providers, SelectionStrategy::RoundRobin);
        let service = service.with_health_timeout(Duration::from_secs(2));

        let started = Instant::now();
        let health = service.get_provider_health().await;

        assert!(started.elapsed() <= Duration::from_secs(3));
        assert_eq!(health.len(), 4);
        let names: Vec<_> = health.iter().map(|h| h.provider_name.as_str()).collect();
        assert_eq!(names, vec!["up", "degraded", "erroring", "stuck"]);
        assert!(health[0].is_healthy);
        assert!(health[1..].iter().all(|h| !h.is_healthy));
        assert!(health[3].error_message.as_deref().unwrap_or_default().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_validate_providers() {
        let providers = vec![
            Arc::new(ScriptedProvider::new("up")),
            Arc::new(ScriptedProvider::new("degraded").with_health(Health::Unhealthy)),
            Arc::new(ScriptedProvider::new("erroring").with_health(Health::Fails)),
            Arc::new(ScriptedProvider::new("stuck").with_health(Health::Hangs)),
        ];
        let (service, _, _) = build(providers, SelectionStrategy::RoundRobin);
        let service = service.with_health_timeout(Duration::from_secs(2));

        let results = service.validate_providers().await;
        assert_eq!(
            results,
            vec![
                ("up".to_string(), true),
                ("degraded".to_string(), false),
                ("erroring".to_string(), false),
                ("stuck".to_string(), false),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_provider_metrics_snapshot() {
        let a = Arc::new(ScriptedProvider::new("a"));
        let b = Arc::new(ScriptedProvider::new("b"));
        let (service, _, _) = build(vec![a, b], SelectionStrategy::RoundRobin);

        service.generate(&request(), &CancellationToken::new()).await.unwrap();

        let snapshot = service.get_provider_metrics();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].provider_name, "a");
        assert_eq!(snapshot[0].profile.as_ref().unwrap().sample_count, 1);
        assert!(snapshot[1].profile.is_none());
        assert_eq!(snapshot[1].kind, "scripted");
    }
}
