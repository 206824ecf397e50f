use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_EWMA_ALPHA: f64 = 0.3;

/// Smoothed performance of one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceProfile {
    pub provider_name: String,
    pub average_latency_ms: f64,
    pub average_cost: Decimal,
    pub success_rate: f64,
    pub quality_score: f64,
    pub sample_count: u64,
    pub last_updated: DateTime<Utc>,
}

impl PerformanceProfile {
    fn from_first_sample(provider_name: &str, sample: &MetricSample) -> Self {
        Self {
            provider_name: provider_name.to_string(),
            average_latency_ms: sample.latency_ms(),
            average_cost: sample.cost,
            success_rate: clamp_unit(sample.success),
            quality_score: clamp_unit(sample.quality),
            sample_count: 1,
            last_updated: Utc::now(),
        }
    }

    /// `p + α(s − p)`, which equals `α·s + (1−α)·p` but keeps identical samples exact.
    fn blend(&mut self, sample: &MetricSample, alpha: f64, alpha_decimal: Decimal) {
        self.average_latency_ms += alpha * (sample.latency_ms() - self.average_latency_ms);
        self.average_cost += alpha_decimal * (sample.cost - self.average_cost);
        self.success_rate = clamp_unit(self.success_rate + alpha * (clamp_unit(sample.success) - self.success_rate));
        self.quality_score = clamp_unit(self.quality_score + alpha * (clamp_unit(sample.quality) - self.quality_score));
        self.sample_count += 1;
        self.last_updated = Utc::now();
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub latency: Duration,
    pub cost: Decimal,
    pub success: f64,
    pub quality: f64,
}

impl MetricSample {
    pub fn success(latency: Duration, cost: Decimal, quality: f64) -> Self {
        Self {
            latency,
            cost,
            success: 1.0,
            quality,
        }
    }

    pub fn failure(latency: Duration) -> Self {
        Self {
            latency,
            cost: Decimal::ZERO,
            success: 0.0,
            quality: 0.0,
        }
    }

    fn latency_ms(&self) -> f64 {
        self.latency.as_nanos() as f64 / 1_000_000.0
    }
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Concurrent per-provider EWMA profiles.
#[derive(Debug)]
pub struct MetricsStore {
    profiles: DashMap<String, PerformanceProfile>,
    alpha: f64,
    alpha_decimal: Decimal,
}

impl Default for MetricsStore {
    fn default() -> Self {
        Self::new(DEFAULT_EWMA_ALPHA)
    }
}

impl MetricsStore {
    pub fn new(alpha: f64) -> Self {
        let alpha = if alpha > 0.0 && alpha <= 1.0 {
            alpha
        } else {
            warn!("Invalid EWMA alpha {}, using {}", alpha, DEFAULT_EWMA_ALPHA);
            DEFAULT_EWMA_ALPHA
        };

        Self {
            profiles: DashMap::new(),
            alpha,
            alpha_decimal: Decimal::try_from(alpha).unwrap_or_else(|_| Decimal::new(3, 1)),
        }
    }

    pub fn record(&self, provider_name: &str, sample: &MetricSample) {
        match self.profiles.entry(provider_name.to_string()) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().blend(sample, self.alpha, self.alpha_decimal);
            }
            Entry::Vacant(entry) => {
                entry.insert(PerformanceProfile::from_first_sample(provider_name, sample));
            }
        }

        debug!(
            provider = provider_name,
            latency_ms = sample.latency_ms(),
            success = sample.success,
            quality = sample.quality,
            "Recorded metric sample"
        );
    }

    pub fn get(&self, provider_name: &str) -> Option<PerformanceProfile> {
        self.profiles.get(provider_name).map(|profile| profile.clone())
    }

    pub fn snapshot(&self) -> Vec<PerformanceProfile> {
        let mut profiles: Vec<_> = self.profiles.iter().map(|entry| entry.value().clone()).collect();
        profiles.sort_by(|a, b| a.provider_name.cmp(&b.provider_name));
        profiles
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}
