use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::info;

use crate::error::Result;

/// Outcome of one orchestrated generation. Side-effect only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub timestamp: DateTime<Utc>,
    pub provider_name: String,
    pub model: String,
    pub success: bool,
    pub duration: Duration,
    pub tokens_used: u32,
    pub cost: Decimal,
    pub error_message: Option<String>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub correlation_id: Option<String>,
}

pub trait TelemetrySink: Send + Sync {
    fn emit(&self, record: &TelemetryRecord) -> Result<()>;
}

/// Writes each record as one structured event on the `conductor::telemetry` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetrySink;

impl TelemetrySink for TracingTelemetrySink {
    fn emit(&self, record: &TelemetryRecord) -> Result<()> {
        info!(
            target: "conductor::telemetry",
            provider = %record.provider_name,
            model = %record.model,
            success = record.success,
            duration_ms = record.duration.as_millis() as u64,
            tokens_used = record.tokens_used,
            cost = %record.cost,
            error = record.error_message.as_deref().unwrap_or(""),
            user_id = record.user_id.as_deref().unwrap_or(""),
            session_id = record.session_id.as_deref().unwrap_or(""),
            correlation_id = record.correlation_id.as_deref().unwrap_or(""),
            "AI request completed"
        );
        Ok(())
    }
}

/// Keeps the most recent records in memory.
#[derive(Debug)]
pub struct InMemoryTelemetrySink {
    records: Mutex<VecDeque<TelemetryRecord>>,
    capacity: usize,
}

impl InMemoryTelemetrySink {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn records(&self) -> Vec<TelemetryRecord> {
        self.records.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl TelemetrySink for InMemoryTelemetrySink {
    fn emit(&self, record: &TelemetryRecord) -> Result<()> {
        let mut records = self.records.lock();
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(provider: &str) -> TelemetryRecord {
        TelemetryRecord {
            timestamp: Utc::now(),
            provider_name: provider.to_string(),
            model: "gpt-4".to_string(),
            success: true,
            duration: Duration::from_millis(42),
            tokens_used: 12,
            cost: Decimal::ZERO,
            error_message: None,
            user_id: Some("u-1".to_string()),
            session_id: None,
            correlation_id: Some("c-1".to_string()),
        }
    }

    #[test]
    fn test_ring_buffer_keeps_latest() {
        let sink = InMemoryTelemetrySink::new(2);
        for name in ["a", "b", "c"] {
            sink.emit(&record(name)).unwrap();
        }

        let names: Vec<_> = sink.records().into_iter().map(|r| r.provider_name).collect();
        assert_eq!(names, vec!["b", "c"]);
    }

    #[test]
    fn test_tracing_sink_never_fails() {
        assert!(TracingTelemetrySink.emit(&record("a")).is_ok());
    }
}
