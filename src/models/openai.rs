use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE}};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::app::config::ProviderConfig;
use crate::error::{check_status, Error, Result};
use crate::models::provider::{
    ensure_header_value, correlation_id_for, FinishReason, GenerationRequest, GenerationResponse, Message, PriceTable,
    Provider, ProviderHealth, TokenUsage, HEALTH_CHECK_TIMEOUT,
};
use crate::resilience::{CircuitBreakerStats, ResiliencePipeline};

pub const KIND: &str = "openai";
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAIProvider {
    name: String,
    client: Client,
    api_key: Option<String>,
    base_url: String,
    enabled: bool,
    prices: PriceTable,
    pipeline: ResiliencePipeline,
}

fn price(value: &str) -> Decimal {
    Decimal::from_str(value).unwrap_or(Decimal::ZERO)
}

fn default_prices() -> PriceTable {
    PriceTable::new(&[
        ("gpt-4", price("0.03")),
        ("gpt-4-32k", price("0.06")),
        ("gpt-3.5-turbo", price("0.002")),
        ("gpt-3.5-turbo-16k", price("0.004")),
    ])
}

impl OpenAIProvider {
    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| Error::transport(format!("Failed to create HTTP client: {}", e)))?;

        let api_key = config.resolved_api_key();
        ensure_header_value(&config.name, "API key", api_key.as_deref())?;
        let enabled = config.enabled && api_key.is_some();
        if config.enabled && !enabled {
            warn!("OpenAI provider '{}' has no API key configured", config.name);
        }

        let base_url = config
            .endpoint
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            name: config.name.clone(),
            client,
            api_key,
            base_url,
            enabled,
            prices: default_prices(),
            pipeline: ResiliencePipeline::new(config.name.clone(), &config.pipeline_config()),
        })
    }

    fn create_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();

        let api_key = self.api_key.as_deref().unwrap_or_default();
        let auth_value = HeaderValue::from_str(&format!("Bearer {}", api_key))
            .map_err(|e| Error::validation(format!("Invalid API key format: {}", e)))?;
        headers.insert(AUTHORIZATION, auth_value);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        Ok(headers)
    }

    fn build_request(&self, request: &GenerationRequest) -> OpenAIRequest {
        let mut messages = Vec::new();
        if let Some(system) = &request.system_message {
            messages.push(OpenAIMessage {
                role: "system".to_string(),
                content: system.clone(),
            });
        }
        messages.extend(request.conversation().iter().map(convert_message));

        OpenAIRequest {
            model: request.model.clone(),
            messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stop: request.stop.clone(),
            user: request.user_id.clone(),
        }
    }

    async fn send(&self, headers: HeaderMap, payload: &OpenAIRequest) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self.client.post(&url).headers(headers).json(payload).send().await?;
        let response = check_status(response).await?;
        Ok(response.text().await?)
    }
}

fn convert_message(message: &Message) -> OpenAIMessage {
    OpenAIMessage {
        role: message.role.as_str().to_string(),
        content: message.content.clone(),
    }
}

#[async_trait]
impl Provider for OpenAIProvider {
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
        let headers = self.create_headers()?;
        let payload = self.build_request(request);

        debug!(
            "Sending request to OpenAI: provider={}, model={}, messages={}, correlation_id={}",
            self.name,
            request.model,
            payload.messages.len(),
            correlation_id
        );

        let start_time = Instant::now();
        let body = self
            .pipeline
            .execute(cancel, || self.send(headers.clone(), &payload))
            .await?;
        let duration = start_time.elapsed();

        let response: OpenAIResponse = serde_json::from_str(&body)
            .map_err(|e| Error::parse(format!("Failed to parse OpenAI response: {}", e)))?;
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::parse("No choices in OpenAI response"))?;

        let usage = response
            .usage
            .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens))
            .unwrap_or_else(|| TokenUsage::new(0, 0));
        let cost = self.prices.calculate_cost(&request.model, usage.total_tokens);

        debug!("OpenAI request {} completed in {:?}", correlation_id, duration);

        Ok(GenerationResponse {
            correlation_id,
            provider: self.name.clone(),
            model: response.model.unwrap_or_else(|| request.model.clone()),
            content: choice.message.content.unwrap_or_default(),
            finish_reason: FinishReason::from_backend(choice.finish_reason.as_deref()),
            usage: usage.with_cost(cost),
            duration,
            created_at: Utc::now(),
        })
    }

    async fn health_check(&self) -> Result<ProviderHealth> {
        let start_time = Instant::now();
        let url = format!("{}/models", self.base_url);

        let outcome = match self.create_headers() {
            Ok(headers) => self
                .client
                .get(&url)
                .headers(headers)
                .timeout(HEALTH_CHECK_TIMEOUT)
                .send()
                .await
                .map_err(Error::from),
            Err(e) => Err(e),
        };

        let elapsed = start_time.elapsed();
        let health = match outcome {
            Ok(response) if response.status().is_success() => ProviderHealth::healthy(&self.name, elapsed),
            Ok(response) => {
                ProviderHealth::unhealthy(&self.name, elapsed, format!("HTTP {}", response.status().as_u16()))
            }
            Err(e) => ProviderHealth::unhealthy(&self.name, elapsed, e.to_string()),
        };

        Ok(health
            .with_detail("endpoint", &self.base_url)
            .with_detail("circuit_state", format!("{:?}", self.pipeline.breaker().get_state())))
    }

    fn circuit_stats(&self) -> Option<CircuitBreakerStats> {
        Some(self.pipeline.stats())
    }
}

// OpenAI API request/response structures
#[derive(Debug, Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<String>,
}

#[derive(Debug, Serialize)]
struct OpenAIMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<OpenAIChoice>,
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}
