use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::app::config::ProviderConfig;
use crate::error::{check_status, Error, Result};
use crate::models::provider::{
    ensure_header_value, correlation_id_for, FinishReason, GenerationRequest, GenerationResponse, PriceTable, Provider,
    ProviderHealth, TokenUsage, HEALTH_CHECK_TIMEOUT,
};
use crate::resilience::{CircuitBreakerStats, ResiliencePipeline};

pub const KIND: &str = "azure-openai";
pub const DEFAULT_API_VERSION: &str = "2023-12-01-preview";

/// Azure-hosted OpenAI deployments. Needs both an API key and a resource endpoint.
pub struct AzureOpenAIProvider {
    name: String,
    client: Client,
    api_key: Option<String>,
    endpoint: Option<String>,
    api_version: String,
    deployments: HashMap<String, String>,
    enabled: bool,
    prices: PriceTable,
    pipeline: ResiliencePipeline,
}

fn default_prices() -> PriceTable {
    let price = |value: &str| Decimal::from_str(value).unwrap_or(Decimal::ZERO);
    PriceTable::new(&[
        ("gpt-4", price("0.03")),
        ("gpt-4-32k", price("0.06")),
        ("gpt-35-turbo", price("0.002")),
        ("gpt-35-turbo-16k", price("0.004")),
    ])
}

impl AzureOpenAIProvider {
    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| Error::transport(format!("Failed to create HTTP client: {}", e)))?;

        let api_key = config.resolved_api_key();
        ensure_header_value(&config.name, "API key", api_key.as_deref())?;
        let endpoint = config
            .endpoint
            .as_ref()
            .map(|e| e.trim_end_matches('/').to_string())
            .filter(|e| !e.is_empty());

        let enabled = config.enabled && api_key.is_some() && endpoint.is_some();
        if config.enabled && !enabled {
            warn!("Azure OpenAI provider '{}' needs both an API key and an endpoint", config.name);
        }

        Ok(Self {
            name: config.name.clone(),
            client,
            api_key,
            endpoint,
            api_version: config
                .api_version
                .clone()
                .unwrap_or_else(|| DEFAULT_API_VERSION.to_string()),
            deployments: config.deployments.clone(),
            enabled,
            prices: default_prices(),
            pipeline: ResiliencePipeline::new(config.name.clone(), &config.pipeline_config()),
        })
    }

    /// Deployment serving `model`; the model name itself when no mapping exists.
    pub fn deployment_for<'a>(&'a self, model: &'a str) -> &'a str {
        self.deployments.get(model).map(String::as_str).unwrap_or(model)
    }

    fn endpoint(&self) -> Result<&str> {
        self.endpoint
            .as_deref()
            .ok_or_else(|| Error::validation(format!("Azure OpenAI provider '{}' has no endpoint", self.name)))
    }

    fn completions_url(&self, model: &str) -> Result<String> {
        Ok(format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            self.endpoint()?,
            self.deployment_for(model),
            self.api_version
        ))
    }

    fn build_request(&self, request: &GenerationRequest) -> AzureRequest {
        let mut messages = Vec::new();
        if let Some(system) = &request.system_message {
            messages.push(AzureMessage {
                role: "system".to_string(),
                content: system.clone(),
            });
        }
        messages.extend(request.conversation().into_iter().map(|m| AzureMessage {
            role: m.role.as_str().to_string(),
            content: m.content,
        }));

        AzureRequest {
            messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stop: request.stop.clone(),
            user: request.user_id.clone(),
        }
    }

    async fn send(&self, url: &str, payload: &AzureRequest) -> Result<String> {
        let response = self
            .client
            .post(url)
            .header("api-key", self.api_key.as_deref().unwrap_or_default())
            .json(payload)
            .send()
            .await?;
        let response = check_status(response).await?;
        Ok(response.text().await?)
    }
}

#[async_trait]
impl Provider for AzureOpenAIProvider {
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
        let url = self.completions_url(&request.model)?;
        let payload = self.build_request(request);

        debug!(
            "Sending request to Azure OpenAI: provider={}, deployment={}, correlation_id={}",
            self.name,
            self.deployment_for(&request.model),
            correlation_id
        );

        let start_time = Instant::now();
        let body = self.pipeline.execute(cancel, || self.send(&url, &payload)).await?;
        let duration = start_time.elapsed();

        let response: AzureResponse = serde_json::from_str(&body)
            .map_err(|e| Error::parse(format!("Failed to parse Azure OpenAI response: {}", e)))?;
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::parse("No choices in Azure OpenAI response"))?;

        let usage = response
            .usage
            .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens))
            .unwrap_or_else(|| TokenUsage::new(0, 0));
        let cost = self.prices.calculate_cost(&request.model, usage.total_tokens);

        Ok(GenerationResponse {
            correlation_id,
            provider: self.name.clone(),
            model: request.model.clone(),
            content: choice.message.content.unwrap_or_default(),
            finish_reason: FinishReason::from_backend(choice.finish_reason.as_deref()),
            usage: usage.with_cost(cost),
            duration,
            created_at: Utc::now(),
        })
    }

    async fn health_check(&self) -> Result<ProviderHealth> {
        let start_time = Instant::now();

        let outcome = match self.endpoint() {
            Ok(endpoint) => self
                .client
                .get(format!("{}/openai/deployments?api-version={}", endpoint, self.api_version))
                .header("api-key", self.api_key.as_deref().unwrap_or_default())
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
            .with_detail("api_version", &self.api_version)
            .with_detail("deployments", self.deployments.len().to_string()))
    }

    fn circuit_stats(&self) -> Option<CircuitBreakerStats> {
        Some(self.pipeline.stats())
    }
}

#[derive(Debug, Serialize)]
struct AzureRequest {
    messages: Vec<AzureMessage>,
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
struct AzureMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct AzureResponse {
    choices: Vec<AzureChoice>,
    usage: Option<AzureUsage>,
}

#[derive(Debug, Deserialize)]
struct AzureChoice {
    message: AzureResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AzureResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AzureUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}
