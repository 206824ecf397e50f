use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

use crate::error::{Error, Result};
use crate::orchestration::quality::QualityConfig;
use crate::orchestration::selector::SelectionStrategy;
use crate::resilience::PipelineConfig;

pub const ENV_PREFIX: &str = "CONDUCTOR";

const REDACTED: &str = "********";

const MAX_DELAY_SECONDS: f64 = 86_400.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Registration order is selection order for round-robin and the metrics fallback.
    pub providers: Vec<ProviderConfig>,
    pub selection: SelectionConfig,
    pub health: HealthConfig,
    pub workflow: WorkflowConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub kind: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Environment variable holding the key; consulted when `api_key` is unset.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub api_version: Option<String>,
    /// Model name → deployment name (Azure).
    #[serde(default)]
    pub deployments: HashMap<String, String>,
    #[serde(default = "default_provider_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "ResilienceConfig::provider_default", deserialize_with = "provider_resilience")]
    pub resilience: ResilienceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub retry_count: u32,
    pub base_delay_seconds: f64,
    pub max_delay_seconds: f64,
    pub jitter: bool,
    pub retryable_statuses: Vec<u16>,
    pub failure_threshold: u32,
    pub open_duration_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    pub strategy: String,
    pub ewma_alpha: f64,
    pub quality: QualityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub enabled: bool,
    pub base_url: String,
    pub service_account_token: Option<String>,
    pub tenant_id: Option<String>,
    pub timeout_seconds: u64,
    #[serde(deserialize_with = "workflow_resilience")]
    pub resilience: ResilienceConfig,
}

// Missing keys fall back to the defaults of whoever owns the table.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ResilienceOverrides {
    retry_count: Option<u32>,
    base_delay_seconds: Option<f64>,
    max_delay_seconds: Option<f64>,
    jitter: Option<bool>,
    retryable_statuses: Option<Vec<u16>>,
    failure_threshold: Option<u32>,
    open_duration_seconds: Option<u64>,
}

impl ResilienceOverrides {
    fn apply(self, base: ResilienceConfig) -> ResilienceConfig {
        ResilienceConfig {
            retry_count: self.retry_count.unwrap_or(base.retry_count),
            base_delay_seconds: self.base_delay_seconds.unwrap_or(base.base_delay_seconds),
            max_delay_seconds: self.max_delay_seconds.unwrap_or(base.max_delay_seconds),
            jitter: self.jitter.unwrap_or(base.jitter),
            retryable_statuses: self.retryable_statuses.unwrap_or(base.retryable_statuses),
            failure_threshold: self.failure_threshold.unwrap_or(base.failure_threshold),
            open_duration_seconds: self.open_duration_seconds.unwrap_or(base.open_duration_seconds),
        }
    }
}

fn provider_resilience<'de, D>(deserializer: D) -> std::result::Result<ResilienceConfig, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(ResilienceOverrides::deserialize(deserializer)?.apply(ResilienceConfig::provider_default()))
}

fn workflow_resilience<'de, D>(deserializer: D) -> std::result::Result<ResilienceConfig, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(ResilienceOverrides::deserialize(deserializer)?.apply(ResilienceConfig::workflow_default()))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Daily rolling log files go here when set.
    pub directory: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_provider_timeout() -> u64 {
    60
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            selection: SelectionConfig::default(),
            health: HealthConfig::default(),
            workflow: WorkflowConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            strategy: SelectionStrategy::RoundRobin.to_string(),
            ewma_alpha: 0.3,
            quality: QualityConfig::default(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self { timeout_seconds: 10 }
    }
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "http://localhost:8080".to_string(),
            service_account_token: None,
            tenant_id: None,
            timeout_seconds: 30,
            resilience: ResilienceConfig::workflow_default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: None,
        }
    }
}

impl ResilienceConfig {
    pub fn workflow_default() -> Self {
        Self::from_pipeline(&PipelineConfig::workflow_default())
    }

    pub fn provider_default() -> Self {
        Self::from_pipeline(&PipelineConfig::provider_default())
    }

    fn from_pipeline(pipeline: &PipelineConfig) -> Self {
        Self {
            retry_count: pipeline.retry_count,
            base_delay_seconds: pipeline.base_delay.as_secs_f64(),
            max_delay_seconds: pipeline.max_delay.as_secs_f64(),
            jitter: pipeline.jitter,
            retryable_statuses: pipeline.retryable_statuses.clone(),
            failure_threshold: pipeline.failure_threshold,
            open_duration_seconds: pipeline.open_duration.as_secs(),
        }
    }

    pub fn to_pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            retry_count: self.retry_count,
            base_delay: clamped_delay(self.base_delay_seconds),
            max_delay: clamped_delay(self.max_delay_seconds),
            jitter: self.jitter,
            retryable_statuses: self.retryable_statuses.clone(),
            failure_threshold: self.failure_threshold,
            open_duration: Duration::from_secs(self.open_duration_seconds),
            attempt_timeout: None,
        }
    }

    fn validate(&self, owner: &str) -> Result<()> {
        if !self.base_delay_seconds.is_finite() || self.base_delay_seconds < 0.0 {
            return Err(Error::validation(format!("{} has an invalid base delay", owner)));
        }
        if self.max_delay_seconds > MAX_DELAY_SECONDS {
            return Err(Error::validation(format!(
                "{} max delay cannot exceed {} seconds",
                owner, MAX_DELAY_SECONDS
            )));
        }
        if !self.max_delay_seconds.is_finite() || self.max_delay_seconds < self.base_delay_seconds {
            return Err(Error::validation(format!("{} max delay must be at least the base delay", owner)));
        }
        if self.failure_threshold == 0 {
            return Err(Error::validation(format!("{} failure threshold must be at least 1", owner)));
        }
        Ok(())
    }
}

fn clamped_delay(seconds: f64) -> Duration {
    Duration::try_from_secs_f64(seconds.clamp(0.0, MAX_DELAY_SECONDS)).unwrap_or(Duration::ZERO)
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self::provider_default()
    }
}

impl ProviderConfig {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            enabled: true,
            api_key: None,
            api_key_env: None,
            endpoint: None,
            api_version: None,
            deployments: HashMap::new(),
            timeout_seconds: default_provider_timeout(),
            resilience: ResilienceConfig::provider_default(),
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_deployment(mut self, model: impl Into<String>, deployment: impl Into<String>) -> Self {
        self.deployments.insert(model.into(), deployment.into());
        self
    }

    pub fn with_resilience(mut self, resilience: ResilienceConfig) -> Self {
        self.resilience = resilience;
        self
    }

    /// Inline key first, then the named environment variable. Blank values count as missing.
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| self.api_key_env.as_ref().and_then(|var| std::env::var(var).ok()))
            .filter(|key| !key.trim().is_empty())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        self.resilience.to_pipeline_config()
    }
}

impl WorkflowConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

impl AppConfig {
    /// Layers the optional TOML file under `CONDUCTOR_*` environment variables
    /// (`__` separates nested keys, e.g. `CONDUCTOR_SELECTION__STRATEGY`).
    pub fn load(config_file: &Path) -> Result<Self> {
        info!("Loading configuration from: {:?}", config_file);

        let settings = Config::builder()
            .add_source(File::from(config_file).format(FileFormat::Toml).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: AppConfig = settings.try_deserialize()?;
        config.validate()?;

        debug!(
            "Configuration loaded: {} providers, strategy '{}'",
            config.providers.len(),
            config.selection.strategy
        );
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()?;

        let config: AppConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for provider in &self.providers {
            if provider.name.trim().is_empty() {
                return Err(Error::validation("Provider name cannot be empty"));
            }
            if provider.kind.trim().is_empty() {
                return Err(Error::validation(format!("Provider {} has empty kind", provider.name)));
            }
            if !names.insert(provider.name.as_str()) {
                return Err(Error::validation(format!("Duplicate provider name: {}", provider.name)));
            }
            if let Some(endpoint) = &provider.endpoint {
                Url::parse(endpoint).map_err(|e| {
                    Error::validation(format!("Provider {} has invalid endpoint '{}': {}", provider.name, endpoint, e))
                })?;
            }
            if provider.timeout_seconds == 0 {
                return Err(Error::validation(format!("Provider {} timeout must be positive", provider.name)));
            }
            provider.resilience.validate(&format!("Provider {}", provider.name))?;
        }

        self.selection_strategy()?;

        let alpha = self.selection.ewma_alpha;
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(Error::validation("EWMA alpha must be in (0, 1]"));
        }

        self.selection.quality.validate()?;

        if self.health.timeout_seconds == 0 {
            return Err(Error::validation("Health check timeout must be positive"));
        }

        Url::parse(&self.workflow.base_url).map_err(|e| {
            Error::validation(format!("Workflow base URL '{}' is invalid: {}", self.workflow.base_url, e))
        })?;
        if self.workflow.timeout_seconds == 0 {
            return Err(Error::validation("Workflow timeout must be positive"));
        }
        self.workflow.resilience.validate("Workflow gateway")?;

        Ok(())
    }

    pub fn selection_strategy(&self) -> Result<SelectionStrategy> {
        self.selection.strategy.parse()
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health.timeout_seconds)
    }

    /// Effective configuration as TOML with every credential masked.
    pub fn to_toml_redacted(&self) -> Result<String> {
        let mut redacted = self.clone();
        for provider in &mut redacted.providers {
            if provider.api_key.is_some() {
                provider.api_key = Some(REDACTED.to_string());
            }
        }
        if redacted.workflow.service_account_token.is_some() {
            redacted.workflow.service_account_token = Some(REDACTED.to_string());
        }

        toml::to_string_pretty(&redacted).map_err(|e| Error::Config(config::ConfigError::Message(e.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::DEFAULT_RETRYABLE_STATUSES;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"
[selection]
strategy = "best-latency"
ewma_alpha = 0.5

[[providers]]
name = "openai"
kind = "openai"
api_key = "sk-test"

[[providers]]
name = "azure"
kind = "azure-openai"
api_key = "az-test"
endpoint = "https://example.openai.azure.com"
deployments = { "gpt-4" = "gpt4-prod" }

[workflow]
base_url = "http://flowable.internal:8080"
service_account_token = "token"
tenant_id = "tenant-a"
"#;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.selection.strategy, "round-robin");
        assert_eq!(config.selection.ewma_alpha, 0.3);
        assert_eq!(config.health.timeout_seconds, 10);
        assert_eq!(config.workflow.base_url, "http://localhost:8080");
        assert_eq!(config.workflow.timeout_seconds, 30);
        assert_eq!(config.workflow.resilience.retry_count, 4);
        assert_eq!(config.workflow.resilience.failure_threshold, 5);
        assert_eq!(config.workflow.resilience.open_duration_seconds, 30);
        assert_eq!(config.workflow.resilience.retryable_statuses, DEFAULT_RETRYABLE_STATUSES.to_vec());
    }

    #[test]
    fn test_parse_toml() {
        let config = AppConfig::from_toml_str(SAMPLE).unwrap();

        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.providers[0].name, "openai");
        assert_eq!(config.providers[0].resilience, ResilienceConfig::provider_default());
        assert!(config.providers[0].resilience.retryable_statuses.contains(&429));
        assert_eq!(config.providers[1].deployments.get("gpt-4").map(String::as_str), Some("gpt4-prod"));
        assert_eq!(config.selection_strategy().unwrap(), SelectionStrategy::BestLatency);
        assert_eq!(config.selection.ewma_alpha, 0.5);
        assert_eq!(config.workflow.tenant_id.as_deref(), Some("tenant-a"));
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();

        config.selection.strategy = "fastest".to_string();
        assert!(config.validate().is_err());

        config.selection.strategy = "cost-bias".to_string();
        config.selection.ewma_alpha = 0.0;
        assert!(config.validate().is_err());

        config.selection.ewma_alpha = 1.0;
        config.providers.push(ProviderConfig::new("a", "openai"));
        config.providers.push(ProviderConfig::new("a", "anthropic"));
        assert!(config.validate().is_err());

        config.providers.pop();
        config.providers[0].endpoint = Some("not a url".to_string());
        assert!(config.validate().is_err());

        config.providers[0].endpoint = Some("https://api.openai.com/v1".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = AppConfig::load(file.path()).unwrap();
        assert_eq!(config.providers.len(), 2);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert!(config.providers.is_empty());
    }

    #[test]
    fn test_resolved_api_key() {
        let provider = ProviderConfig::new("openai", "openai").with_api_key("  ");
        assert_eq!(provider.resolved_api_key(), None);

        let provider = ProviderConfig::new("openai", "openai").with_api_key("sk-1");
        assert_eq!(provider.resolved_api_key().as_deref(), Some("sk-1"));

        let mut provider = ProviderConfig::new("openai", "openai");
        provider.api_key_env = Some("CONDUCTOR_TEST_KEY_THAT_IS_NOT_SET".to_string());
        assert_eq!(provider.resolved_api_key(), None);
    }

    #[test]
    fn test_redacted_toml_masks_credentials() {
        let config = AppConfig::from_toml_str(SAMPLE).unwrap();
        let rendered = config.to_toml_redacted().unwrap();

        assert!(!rendered.contains("sk-test"));
        assert!(!rendered.contains("az-test"));
        assert!(!rendered.contains("\"token\""));
        assert!(rendered.contains(REDACTED));
    }

    #[test]
    fn test_partial_resilience_tables_keep_owner_defaults() {
        let content = r#"
[[providers]]
name = "openai"
kind = "openai"

[providers.resilience]
retry_count = 1

[workflow.resilience]
failure_threshold = 3
"#;
        let config = AppConfig::from_toml_str(content).unwrap();

        let provider = &config.providers[0].resilience;
        assert_eq!(provider.retry_count, 1);
        assert_eq!(provider.base_delay_seconds, 1.0);
        assert!(provider.retryable_statuses.contains(&429));
        assert_eq!(provider.failure_threshold, ResilienceConfig::provider_default().failure_threshold);

        let workflow = &config.workflow.resilience;
        assert_eq!(workflow.failure_threshold, 3);
        assert_eq!(workflow.retry_count, 4);
        assert!(!workflow.retryable_statuses.contains(&429));
    }

    #[test]
    fn test_oversized_delays_rejected() {
        let mut config = AppConfig::default();
        config.workflow.resilience.max_delay_seconds = 1e300;
        assert!(matches!(config.validate(), Err(Error::Validation(_))));

        let resilience = ResilienceConfig {
            base_delay_seconds: 1e300,
            max_delay_seconds: f64::INFINITY,
            ..ResilienceConfig::workflow_default()
        };
        let pipeline = resilience.to_pipeline_config();
        assert_eq!(pipeline.base_delay, Duration::from_secs(86_400));
        assert_eq!(pipeline.max_delay, Duration::from_secs(86_400));
    }

    #[test]
    fn test_resilience_conversion() {
        let pipeline = ResilienceConfig::workflow_default().to_pipeline_config();
        assert_eq!(pipeline, PipelineConfig::workflow_default());
    }
}
