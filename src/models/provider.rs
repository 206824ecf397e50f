use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::HeaderValue;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::error::{Error, Result};
use crate::resilience::CircuitBreakerStats;

/// Fixed budget for health checks, independent of generation timeouts.
pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) fn ensure_header_value(provider_name: &str, field: &str, value: Option<&str>) -> Result<()> {
    match value.map(HeaderValue::from_str) {
        Some(Err(_)) => Err(Error::Config(config::ConfigError::Message(format!(
            "Provider {} has a {} that is not a valid HTTP header value",
            provider_name, field
        )))),
        _ => Ok(()),
    }
}

/// An interchangeable backend able to fulfil a generation request.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> &str;

    /// True only when the required configuration is present.
    fn is_enabled(&self) -> bool;

    async fn generate(&self, request: &GenerationRequest, cancel: &CancellationToken) -> Result<GenerationResponse>;

    async fn health_check(&self) -> Result<ProviderHealth>;

    async fn validate_configuration(&self) -> bool {
        match self.health_check().await {
            Ok(health) => health.is_healthy,
            Err(_) => false,
        }
    }

    fn circuit_stats(&self) -> Option<CircuitBreakerStats> {
        None
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_has_input"))]
pub struct GenerationRequest {
    #[validate(length(min = 1, message = "Model cannot be empty"))]
    pub model: String,
    pub prompt: Option<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
    pub system_message: Option<String>,
    #[validate(range(min = 0.0, max = 2.0, message = "Temperature must be between 0 and 2"))]
    pub temperature: Option<f32>,
    #[validate(range(min = 1, message = "Max tokens must be at least 1"))]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub stop: Vec<String>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub correlation_id: Option<String>,
}

fn validate_has_input(request: &GenerationRequest) -> std::result::Result<(), ValidationError> {
    let has_prompt = request.prompt.as_deref().map_or(false, |p| !p.trim().is_empty());
    if has_prompt || !request.messages.is_empty() {
        Ok(())
    } else {
        let mut error = ValidationError::new("missing_input");
        error.message = Some("Either a prompt or at least one message is required".into());
        Err(error)
    }
}

impl GenerationRequest {
    pub fn from_prompt(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: Some(prompt.into()),
            messages: Vec::new(),
            system_message: None,
            temperature: None,
            max_tokens: None,
            stop: Vec::new(),
            user_id: None,
            session_id: None,
            correlation_id: None,
        }
    }

    pub fn from_messages(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            prompt: None,
            messages,
            ..Self::from_prompt(model, "")
        }
    }

    pub fn with_system_message(mut self, system_message: impl Into<String>) -> Self {
        self.system_message = Some(system_message.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_stop(mut self, stop: Vec<String>) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Conversation turns to send: the explicit message list, or the prompt as a single user turn.
    pub fn conversation(&self) -> Vec<Message> {
        if !self.messages.is_empty() {
            return self.messages.clone();
        }
        self.prompt
            .iter()
            .map(|prompt| Message::user(prompt.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MessageRole {
    #[serde(rename = "user")]
    User,
    #[serde(rename = "assistant")]
    Assistant,
    #[serde(rename = "system")]
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Completed,
    Truncated,
    Other,
}

impl FinishReason {
    pub fn from_backend(reason: Option<&str>) -> Self {
        match reason {
            Some("stop") | Some("end_turn") | Some("stop_sequence") => FinishReason::Completed,
            Some("length") | Some("max_tokens") => FinishReason::Truncated,
            _ => FinishReason::Other,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
    pub cost: Decimal,
}

impl TokenUsage {
    pub fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens.saturating_add(output_tokens),
            cost: Decimal::ZERO,
        }
    }

    pub fn with_cost(mut self, cost: Decimal) -> Self {
        self.cost = cost;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub correlation_id: String,
    pub provider: String,
    pub model: String,
    pub content: String,
    pub finish_reason: FinishReason,
    pub usage: TokenUsage,
    pub duration: Duration,
    pub created_at: DateTime<Utc>,
}

pub fn correlation_id_for(request: &GenerationRequest) -> String {
    request
        .correlation_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// Static per-model price list, in currency units per 1000 tokens.
#[derive(Debug, Clone, Default)]
pub struct PriceTable {
    per_1k_tokens: HashMap<String, Decimal>,
}

impl PriceTable {
    pub fn new(entries: &[(&str, Decimal)]) -> Self {
        Self {
            per_1k_tokens: entries
                .iter()
                .map(|(model, price)| (model.to_string(), *price))
                .collect(),
        }
    }

    pub fn price_for(&self, model: &str) -> Option<Decimal> {
        self.per_1k_tokens.get(model).copied()
    }

    /// Unknown models cost nothing rather than failing the call.
    pub fn calculate_cost(&self, model: &str, total_tokens: u32) -> Decimal {
        self.price_for(model)
            .map(|price| Decimal::from(total_tokens) * price / Decimal::from(1000))
            .unwrap_or(Decimal::ZERO)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub provider_name: String,
    pub is_healthy: bool,
    pub status: String,
    pub response_time: Duration,
    pub last_checked: DateTime<Utc>,
    pub details: HashMap<String, String>,
    pub error_message: Option<String>,
}

impl ProviderHealth {
    pub fn healthy(provider_name: impl Into<String>, response_time: Duration) -> Self {
        Self {
            provider_name: provider_name.into(),
            is_healthy: true,
            status: "Healthy".to_string(),
            response_time,
            last_checked: Utc::now(),
            details: HashMap::new(),
            error_message: None,
        }
    }

    pub fn unhealthy(provider_name: impl Into<String>, response_time: Duration, error: impl Into<String>) -> Self {
        Self {
            provider_name: provider_name.into(),
            is_healthy: false,
            status: "Unhealthy".to_string(),
            response_time,
            last_checked: Utc::now(),
            details: HashMap::new(),
            error_message: Some(error.into()),
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_finish_reason_mapping() {
        assert_eq!(FinishReason::from_backend(Some("stop")), FinishReason::Completed);
        assert_eq!(FinishReason::from_backend(Some("end_turn")), FinishReason::Completed);
        assert_eq!(FinishReason::from_backend(Some("length")), FinishReason::Truncated);
        assert_eq!(FinishReason::from_backend(Some("max_tokens")), FinishReason::Truncated);
        assert_eq!(FinishReason::from_backend(Some("content_filter")), FinishReason::Other);
        assert_eq!(FinishReason::from_backend(None), FinishReason::Other);
    }

    #[test]
    fn test_price_table() {
        let table = PriceTable::new(&[("gpt-4", Decimal::from_str("0.03").unwrap())]);

        assert_eq!(table.calculate_cost("gpt-4", 1500), Decimal::from_str("0.045").unwrap());
        assert_eq!(table.calculate_cost("unknown", 1500), Decimal::ZERO);
    }

    #[test]
    fn test_request_validation() {
        assert!(GenerationRequest::from_prompt("gpt-4", "hello").validate().is_ok());
        assert!(GenerationRequest::from_prompt("", "hello").validate().is_err());
        assert!(GenerationRequest::from_prompt("gpt-4", "   ").validate().is_err());
        assert!(GenerationRequest::from_prompt("gpt-4", "hi").with_temperature(2.5).validate().is_err());
        assert!(GenerationRequest::from_prompt("gpt-4", "hi").with_max_tokens(0).validate().is_err());
        assert!(GenerationRequest::from_messages("gpt-4", vec![Message::user("hi")]).validate().is_ok());
    }

    #[test]
    fn test_conversation_prefers_messages() {
        let request = GenerationRequest::from_prompt("gpt-4", "prompt");
        assert_eq!(request.conversation(), vec![Message::user("prompt")]);

        let request = GenerationRequest::from_messages("gpt-4", vec![Message::assistant("a"), Message::user("b")]);
        assert_eq!(request.conversation().len(), 2);
    }

    #[test]
    fn test_correlation_id_is_preserved_or_generated() {
        let request = GenerationRequest::from_prompt("gpt-4", "hi").with_correlation_id("abc");
        assert_eq!(correlation_id_for(&request), "abc");

        let generated = correlation_id_for(&GenerationRequest::from_prompt("gpt-4", "hi"));
        assert!(Uuid::parse_str(&generated).is_ok());
    }
}
