use serde::{Deserialize, Serialize};
use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::metrics::{MetricSample, MetricsStore, PerformanceProfile};
use super::registry::ProviderRegistry;
use crate::error::{Error, Result};
use crate::models::provider::{GenerationRequest, Provider};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionStrategy {
    RoundRobin,
    BestLatency,
    CostBias,
    QualityScore,
}

impl SelectionStrategy {
    pub const ALL: [SelectionStrategy; 4] = [
        SelectionStrategy::RoundRobin,
        SelectionStrategy::BestLatency,
        SelectionStrategy::CostBias,
        SelectionStrategy::QualityScore,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionStrategy::RoundRobin => "round-robin",
            SelectionStrategy::BestLatency => "best-latency",
            SelectionStrategy::CostBias => "cost-bias",
            SelectionStrategy::QualityScore => "quality-score",
        }
    }
}

impl fmt::Display for SelectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SelectionStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == normalized)
            .ok_or_else(|| {
                Error::validation(format!(
                    "Unknown selection strategy '{}', expected one of: round-robin, best-latency, cost-bias, quality-score",
                    s
                ))
            })
    }
}

/// Chooses a provider per request from the registry, informed by the metrics store.
pub struct AdaptiveSelector {
    registry: Arc<ProviderRegistry>,
    metrics: Arc<MetricsStore>,
    strategy: SelectionStrategy,
    rotation: AtomicUsize,
}

impl AdaptiveSelector {
    pub fn new(registry: Arc<ProviderRegistry>, metrics: Arc<MetricsStore>, strategy: SelectionStrategy) -> Self {
        Self {
            registry,
            metrics,
            strategy,
            rotation: AtomicUsize::new(0),
        }
    }

    pub fn strategy(&self) -> SelectionStrategy {
        self.strategy
    }

    pub fn select_provider(&self, request: &GenerationRequest) -> Result<Arc<dyn Provider>> {
        let providers = self.registry.get_available_providers();

        let selected = match providers {
            [] => return Err(Error::NoProvidersAvailable),
            [only] => only.clone(),
            _ => match self.strategy {
                SelectionStrategy::RoundRobin => self.round_robin(providers),
                SelectionStrategy::BestLatency => {
                    self.best_by(providers, |a, b| a.average_latency_ms.total_cmp(&b.average_latency_ms))
                }
                SelectionStrategy::CostBias => self.best_by(providers, |a, b| a.average_cost.cmp(&b.average_cost)),
                SelectionStrategy::QualityScore => {
                    self.best_by(providers, |a, b| b.quality_score.total_cmp(&a.quality_score))
                }
            },
        };

        debug!(
            "Selected provider '{}' for model {} using {}",
            selected.name(),
            request.model,
            self.strategy
        );
        Ok(selected)
    }

    pub fn update_metrics(&self, provider_name: &str, sample: &MetricSample) {
        self.metrics.record(provider_name, sample);
    }

    fn round_robin(&self, providers: &[Arc<dyn Provider>]) -> Arc<dyn Provider> {
        let turn = self.rotation.fetch_add(1, Ordering::Relaxed);
        providers[turn % providers.len()].clone()
    }

    /// Minimum under `order` among providers with recorded samples; first provider otherwise.
    /// Ties keep registration order.
    fn best_by<F>(&self, providers: &[Arc<dyn Provider>], order: F) -> Arc<dyn Provider>
    where
        F: Fn(&PerformanceProfile, &PerformanceProfile) -> CmpOrdering,
    {
        let mut best: Option<(&Arc<dyn Provider>, PerformanceProfile)> = None;

        for provider in providers {
            let Some(profile) = self.metrics.get(provider.name()) else {
                continue;
            };
            let better = match &best {
                Some((_, current)) => order(&profile, current) == CmpOrdering::Less,
                None => true,
            };
            if better {
                best = Some((provider, profile));
            }
        }

        best.map(|(provider, _)| provider.clone())
            .unwrap_or_else(|| providers[0].clone())
    }
}
