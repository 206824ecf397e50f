pub mod metrics;
pub mod quality;
pub mod registry;
pub mod selector;
pub mod service;
pub mod telemetry;

pub use metrics::{MetricSample, MetricsStore, PerformanceProfile, DEFAULT_EWMA_ALPHA};
pub use quality::{QualityConfig, QualityScorer};
pub use registry::{ProviderConstructor, ProviderFactory, ProviderRegistry};
pub use selector::{AdaptiveSelector, SelectionStrategy};
pub use service::{OrchestrationService, ProviderMetricsSnapshot};
pub use telemetry::{InMemoryTelemetrySink, TelemetryRecord, TelemetrySink, TracingTelemetrySink};
