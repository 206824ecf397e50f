use std::sync::Arc;
use tracing::{info, warn};

use crate::app::config::AppConfig;
use crate::error::{Error, Result};
use crate::orchestration::{
    MetricsStore, OrchestrationService, ProviderFactory, ProviderRegistry, QualityScorer,
};
use crate::workflow::WorkflowGateway;

/// Everything the binary needs, wired once from configuration.
pub struct AppState {
    config: AppConfig,
    orchestration: Arc<OrchestrationService>,
    workflow: Option<Arc<WorkflowGateway>>,
}

impl AppState {
    pub fn new(config: AppConfig) -> Result<Self> {
        Self::with_factory(config, &ProviderFactory::with_builtin())
    }

    pub fn with_factory(config: AppConfig, factory: &ProviderFactory) -> Result<Self> {
        info!("Initializing application state");
        config.validate()?;

        let registry = ProviderRegistry::initialize(factory, &config.providers);
        if registry.is_empty() {
            warn!("No providers are available; generation requests will fail");
        }

        let metrics = Arc::new(MetricsStore::new(config.selection.ewma_alpha));
        let orchestration = OrchestrationService::new(Arc::new(registry), metrics, config.selection_strategy()?)
            .with_quality_scorer(QualityScorer::new(config.selection.quality.clone()))
            .with_health_timeout(config.health_timeout());

        let workflow = if config.workflow.enabled {
            Some(Arc::new(WorkflowGateway::from_config(&config.workflow)?))
        } else {
            None
        };

        Ok(Self {
            config,
            orchestration: Arc::new(orchestration),
            workflow,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn orchestration(&self) -> Arc<OrchestrationService> {
        self.orchestration.clone()
    }

    pub fn workflow(&self) -> Result<Arc<WorkflowGateway>> {
        self.workflow
            .clone()
            .ok_or_else(|| Error::workflow("Workflow gateway is disabled (set workflow.enabled = true)"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::config::ProviderConfig;
    use crate::orchestration::SelectionStrategy;
    use crate::testing::ScriptedProvider;

    fn scripted_factory() -> ProviderFactory {
        ProviderFactory::new().register("scripted", |config| Ok(Arc::new(ScriptedProvider::new(&config.name))))
    }

    fn config() -> AppConfig {
        let mut config = AppConfig::default();
        config.selection.strategy = "cost-bias".to_string();
        config.providers = vec![
            ProviderConfig::new("first", "scripted"),
            ProviderConfig::new("second", "scripted"),
            ProviderConfig::new("unknown", "carrier-pigeon"),
        ];
        config
    }

    #[test]
    fn test_wires_registry_and_strategy() {
        let state = AppState::with_factory(config(), &scripted_factory()).unwrap();
        let orchestration = state.orchestration();

        assert_eq!(orchestration.registry().names(), vec!["first", "second"]);
        assert_eq!(orchestration.selector().strategy(), SelectionStrategy::CostBias);
        assert!(matches!(state.workflow(), Err(Error::Workflow(_))));
    }

    #[test]
    fn test_workflow_gateway_when_enabled() {
        let mut config = config();
        config.workflow.enabled = true;

        let state = AppState::with_factory(config, &scripted_factory()).unwrap();
        assert!(state.workflow().is_ok());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = config();
        config.selection.strategy = "coin-flip".to_string();
        assert!(matches!(
            AppState::with_factory(config, &scripted_factory()),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_builtin_factory_skips_providers_without_keys() {
        let mut config = AppConfig::default();
        config.providers = vec![ProviderConfig::new("openai", "openai")];
        let state = AppState::new(config).unwrap();

        assert!(state.orchestration().registry().is_empty());
    }
}
