use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::app::config::ProviderConfig;
use crate::error::{Error, Result};
use crate::models::{anthropic, azure_openai, openai, AnthropicProvider, AzureOpenAIProvider, OpenAIProvider, Provider};

pub type ProviderConstructor = Arc<dyn Fn(&ProviderConfig) -> Result<Arc<dyn Provider>> + Send + Sync>;

/// Constructors keyed by provider kind.
#[derive(Clone, Default)]
pub struct ProviderFactory {
    constructors: HashMap<String, ProviderConstructor>,
}

impl ProviderFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtin() -> Self {
        Self::new()
            .register(openai::KIND, |config| Ok(Arc::new(OpenAIProvider::from_config(config)?)))
            .register(azure_openai::KIND, |config| {
                Ok(Arc::new(AzureOpenAIProvider::from_config(config)?))
            })
            .register(anthropic::KIND, |config| Ok(Arc::new(AnthropicProvider::from_config(config)?)))
    }

    pub fn register<F>(mut self, kind: &str, constructor: F) -> Self
    where
        F: Fn(&ProviderConfig) -> Result<Arc<dyn Provider>> + Send + Sync + 'static,
    {
        self.constructors.insert(kind.to_lowercase(), Arc::new(constructor));
        self
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<_> = self.constructors.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    pub fn create_provider(&self, kind: &str, config: &ProviderConfig) -> Result<Arc<dyn Provider>> {
        let constructor = self
            .constructors
            .get(&kind.to_lowercase())
            .ok_or_else(|| Error::UnsupportedProviderKind(kind.to_string()))?;
        constructor(config)
    }
}

/// Enabled providers in registration order. Read-only after construction.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn Provider>>,
    index: HashMap<String, usize>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds every configured provider. Failures and providers lacking required
    /// configuration are logged and left out; startup continues with the rest.
    pub fn initialize(factory: &ProviderFactory, configs: &[ProviderConfig]) -> Self {
        let mut registry = Self::new();

        for config in configs {
            if !config.enabled {
                info!("Provider '{}' disabled in configuration, skipping", config.name);
                continue;
            }

            match factory.create_provider(&config.kind, config) {
                Ok(provider) if provider.is_enabled() => {
                    info!("Registered provider '{}' ({})", provider.name(), provider.kind());
                    registry.register(provider);
                }
                Ok(provider) => {
                    warn!(
                        "Provider '{}' is missing required configuration and will be unavailable",
                        provider.name()
                    );
                }
                Err(e) => {
                    warn!("Failed to initialize provider '{}' ({}): {}", config.name, config.kind, e);
                }
            }
        }

        info!("{} of {} configured providers available", registry.len(), configs.len());
        registry
    }

    pub fn register(&mut self, provider: Arc<dyn Provider>) -> bool {
        if !provider.is_enabled() {
            return false;
        }
        if self.index.contains_key(provider.name()) {
            warn!("Provider '{}' already registered, ignoring duplicate", provider.name());
            return false;
        }

        self.index.insert(provider.name().to_string(), self.providers.len());
        self.providers.push(provider);
        true
    }

    pub fn get_available_providers(&self) -> &[Arc<dyn Provider>] {
        &self.providers
    }

    pub fn get_provider(&self, name: &str) -> Result<Arc<dyn Provider>> {
        self.index
            .get(name)
            .map(|&i| self.providers[i].clone())
            .ok_or_else(|| Error::ProviderNotFound(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedProvider;

    #[test]
    fn test_builtin_kinds() {
        assert_eq!(
            ProviderFactory::with_builtin().kinds(),
            vec!["anthropic", "azure-openai", "openai"]
        );
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let factory = ProviderFactory::with_builtin();
        let result = factory.create_provider("gemini", &ProviderConfig::new("g", "gemini"));
        assert!(matches!(result, Err(Error::UnsupportedProviderKind(_))));
    }

    #[test]
    fn test_initialize_tolerates_partial_configuration() {
        let configs = vec![
            ProviderConfig::new("openai", "openai").with_api_key("sk-1"),
            ProviderConfig::new("anthropic", "anthropic"),
            ProviderConfig::new("azure", "azure-openai").with_api_key("k"),
            ProviderConfig::new("mystery", "gemini"),
            ProviderConfig {
                enabled: false,
                ..ProviderConfig::new("off", "openai").with_api_key("sk-2")
            },
        ];

        let registry = ProviderRegistry::initialize(&ProviderFactory::with_builtin(), &configs);

        assert_eq!(registry.names(), vec!["openai"]);
        assert!(registry.get_provider("openai").is_ok());
        assert!(matches!(registry.get_provider("anthropic"), Err(Error::ProviderNotFound(_))));
        assert!(matches!(registry.get_provider("off"), Err(Error::ProviderNotFound(_))));
    }

    #[test]
    fn test_registered_constructor_is_used() {
        let factory = ProviderFactory::new().register("scripted", |config| {
            Ok(Arc::new(ScriptedProvider::new(&config.name)) as Arc<dyn Provider>)
        });

        let configs = vec![ProviderConfig::new("b", "Scripted"), ProviderConfig::new("a", "scripted")];
        let registry = ProviderRegistry::initialize(&factory, &configs);

        assert_eq!(registry.names(), vec!["b", "a"]);
    }

    #[test]
    fn test_duplicate_and_disabled_registration() {
        let mut registry = ProviderRegistry::new();
        assert!(registry.register(Arc::new(ScriptedProvider::new("a"))));
        assert!(!registry.register(Arc::new(ScriptedProvider::new("a"))));
        assert!(!registry.register(Arc::new(ScriptedProvider::new("b").disabled())));
        assert_eq!(registry.len(), 1);
    }
}
