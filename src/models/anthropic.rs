use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::app::config::ProviderConfig;
use crate::error::{check_status, Error, Result};
use crate::models::provider::{
    ensure_header_value, correlation_id_for, FinishReason, GenerationRequest, GenerationResponse, MessageRole, PriceTable,
    Provider, ProviderHealth, TokenUsage, HEALTH_CHECK_TIMEOUT,
};
use crate::resilience::{CircuitBreakerStats, ResiliencePipeline};

pub const KIND: &str = "anthropic";
pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
pub const DEFAULT_API_VERSION: &str = "2023-06-01";

/// The messages API insists on an explicit output budget.
const DEFAULT_MAX_TOKENS: u32 = 1024;

pub struct AnthropicProvider {
    name: String,
    client: Client,
    api_key: Option<String>,
    base_url: String,
    api_version: String,
    enabled: bool,
    prices: PriceTable,
    pipeline: ResiliencePipeline,
}

fn default_prices() -> PriceTable {
    let price = |value: &str| Decimal::from_str(value).unwrap_or(Decimal::ZERO);
    PriceTable::new(&[
        ("claude-3-opus-20240229", price("0.045")),
        ("claude-3-sonnet-20240229", price("0.009")),
        ("claude-3-5-sonnet-20241022", price("0.009")),
        ("claude-3-haiku-20240307", price("0.00075")),
    ])
}

impl AnthropicProvider {
    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| Error::transport(format!("Failed to create HTTP client: {}", e)))?;

        let api_key = config.resolved_api_key();
        ensure_header_value(&config.name, "API key", api_key.as_deref())?;
        ensure_header_value(&config.name, "API version", config.api_version.as_deref())?;
        let enabled = config.enabled && api_key.is_some();
        if config.enabled && !enabled {
            warn!("Anthropic provider '{}' has no API key configured", config.name);
        }

        Ok(Self {
            name: config.name.clone(),
            client,
            api_key,
            base_url: config
                .endpoint
                .as_deref()
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            api_version: config
                .api_version
                .clone()
                .unwrap_or_else(|| DEFAULT_API_VERSION.to_string()),
            enabled,
            prices: default_prices(),
            pipeline: ResiliencePipeline::new(config.name.clone(), &config.pipeline_config()),
        })
    }

    /// System turns are lifted into the top-level `system` field.
    fn build_request(&self, request: &GenerationRequest) -> AnthropicRequest {
        let mut system_message = request.system_message.clone().unwrap_or_default();
        let mut messages = Vec::new();

        for message in request.conversation() {
            match message.role {
                MessageRole::System => {
                    if !system_message.is_empty() {
                        system_message.push('\n');
                    }
                    system_message.push_str(&message.content);
                }
                MessageRole::User | MessageRole::Assistant => messages.push(AnthropicMessage {
                    role: message.role.as_str().to_string(),
                    content: message.content,
                }),
            }
        }

        AnthropicRequest {
            model: request.model.clone(),
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            messages,
            system: Some(system_message).filter(|s| !s.is_empty()),
            temperature: request.temperature,
            stop_sequences: request.stop.clone(),
        }
    }

    async fn send(&self, payload: &AnthropicRequest) -> Result<String> {
        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", self.api_key.as_deref().unwrap_or_default())
            .header("anthropic-version", &self.api_version)
            .json(payload)
            .send()
            .await?;
        let response = check_status(response).await?;
        Ok(response.text().await?)
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        KIND
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    async fn generate(&self, request: &GenerationRequest, cancel: &CancellationToken) -> Result<GenerationResponse> {
        let correlation_id = correlation_id_for(request);
        let payload = self.build_request(request);

        debug!("Making Anthropic API request to model: {} ({})", request.model, correlation_id);

        let start_time = Instant::now();
        let body = self.pipeline.execute(cancel, || self.send(&payload)).await?;
        let duration = start_time.elapsed();

        let response: AnthropicResponse = serde_json::from_str(&body)
            .map_err(|e| Error::parse(format!("Failed to parse Anthropic response: {}", e)))?;

        let content: String = response
            .content
            .iter()
            .filter(|block| block.content_type == "text")
            .filter_map(|block| block.text.as_deref())
            .collect();

        let usage = TokenUsage::new(response.usage.input_tokens, response.usage.output_tokens);
        let cost = self.prices.calculate_cost(&request.model, usage.total_tokens);

        Ok(GenerationResponse {
            correlation_id,
            provider: self.name.clone(),
            model: response.model.unwrap_or_else(|| request.model.clone()),
            content,
            finish_reason: FinishReason::from_backend(response.stop_reason.as_deref()),
            usage: usage.with_cost(cost),
            duration,
            created_at: Utc::now(),
        })
    }

    async fn health_check(&self) -> Result<ProviderHealth> {
        let start_time = Instant::now();

        let outcome = self
            .client
            .get(format!("{}/models", self.base_url))
            .header("x-api-key", self.api_key.as_deref().unwrap_or_default())
            .header("anthropic-version", &self.api_version)
            .timeout(HEALTH_CHECK_TIMEOUT)
            .send()
            .await;

        let elapsed = start_time.elapsed();
        let health = match outcome {
            Ok(response) if response.status().is_success() => ProviderHealth::healthy(&self.name, elapsed),
            Ok(response) => {
                ProviderHealth::unhealthy(&self.name, elapsed, format!("HTTP {}", response.status().as_u16()))
            }
            Err(e) => ProviderHealth::unhealthy(&self.name, elapsed, Error::from(e).to_string()),
        };

        Ok(health.with_detail("api_version", &self.api_version))
    }

    fn circuit_stats(&self) -> Option<CircuitBreakerStats> {
        Some(self.pipeline.stats())
    }
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop_sequences: Vec<String>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    model: Option<String>,
    content: Vec<AnthropicContent>,
    stop_reason: Option<String>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    #[serde(rename = "type")]
    content_type: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}
