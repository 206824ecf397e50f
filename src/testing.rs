//! Scripted in-memory providers for exercising selection and orchestration.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::models::provider::{
    correlation_id_for, FinishReason, GenerationRequest, GenerationResponse, Provider, ProviderHealth,
    TokenUsage,
};
use crate::resilience::{CircuitBreakerStats, PipelineConfig, ResiliencePipeline};

#[derive(Debug, Clone, Copy)]
pub enum Health {
    Healthy,
    Unhealthy,
    Fails,
    Hangs,
}

pub struct ScriptedProvider {
    name: String,
    enabled: bool,
    latency: Duration,
    cost: Decimal,
    content: String,
    finish_reason: FinishReason,
    failure: Option<fn() -> Error>,
    hangs: bool,
    health: Health,
    pipeline: Option<ResiliencePipeline>,
    network_calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            enabled: true,
            latency: Duration::from_millis(10),
            cost: Decimal::ZERO,
            content: "A complete and useful answer.".to_string(),
            finish_reason: FinishReason::Completed,
            failure: None,
            hangs: false,
            health: Health::Healthy,
            pipeline: None,
            network_calls: AtomicUsize::new(0),
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_cost(mut self, cost: Decimal) -> Self {
        self.cost = cost;
        self
    }

    pub fn with_content(mut self, content: &str, finish_reason: FinishReason) -> Self {
        self.content = content.to_string();
        self.finish_reason = finish_reason;
        self
    }

    pub fn failing_with(mut self, failure: fn() -> Error) -> Self {
        self.failure = Some(failure);
        self
    }

    /// Every call blocks far longer than any test timeout.
    pub fn hanging(mut self) -> Self {
        self.hangs = true;
        self
    }

    pub fn with_health(mut self, health: Health) -> Self {
        self.health = health;
        self
    }

    pub fn with_pipeline(mut self, config: &PipelineConfig) -> Self {
        self.pipeline = Some(ResiliencePipeline::new(self.name.clone(), config));
        self
    }

    /// Calls that reached the simulated backend.
    pub fn network_calls(&self) -> usize {
        self.network_calls.load(Ordering::SeqCst)
    }

    async fn call_backend(&self) -> Result<()> {
        self.network_calls.fetch_add(1, Ordering::SeqCst);
        if self.hangs {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        } else {
            tokio::time::sleep(self.latency).await;
        }

        match self.failure {
            Some(failure) => Err(failure()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        "scripted"
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    async fn generate(&self, request: &GenerationRequest, cancel: &CancellationToken) -> Result<GenerationResponse> {
        let started = Instant::now();
        match &self.pipeline {
            Some(pipeline) => pipeline.execute(cancel, || self.call_backend()).await?,
            None => self.call_backend().await?,
        }

        Ok(GenerationResponse {
            correlation_id: correlation_id_for(request),
            provider: self.name.clone(),
            model: request.model.clone(),
            content: self.content.clone(),
            finish_reason: self.finish_reason,
            usage: TokenUsage::new(10, 20).with_cost(self.cost),
            duration: started.elapsed(),
            created_at: Utc::now(),
        })
    }

    async fn health_check(&self) -> Result<ProviderHealth> {
        match self.health {
            Health::Healthy => Ok(ProviderHealth::healthy(&self.name, self.latency)),
            Health::Unhealthy => Ok(ProviderHealth::unhealthy(&self.name, self.latency, "HTTP 503")),
            Health::Fails => Err(Error::transport("connection refused")),
            Health::Hangs => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(ProviderHealth::healthy(&self.name, self.latency))
            }
        }
    }

    fn circuit_stats(&self) -> Option<CircuitBreakerStats> {
        self.pipeline.as_ref().map(|p| p.stats())
    }
}
