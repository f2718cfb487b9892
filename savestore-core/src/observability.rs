/*!
Observability infrastructure for savestore.

Structured logging through `tracing`, plus an optional Prometheus registry
(`metrics` feature) counting engine operations.
*/

#[cfg(feature = "metrics")]
use prometheus::{Counter, Encoder, Histogram, HistogramOpts, Registry, TextEncoder};
#[cfg(feature = "metrics")]
use std::sync::OnceLock;
use std::time::Duration;
use tracing::subscriber::set_global_default;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry as TracingRegistry};

use crate::{DataError, Result};

/// Default filter when `RUST_LOG` is unset
pub const DEFAULT_LOG_DIRECTIVES: &str = "savestore_core=info,savestore=info";

/// Kinds of engine activity counted by the metrics registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricEvent {
    Save,
    Load,
    CacheHit,
    CacheMiss,
    StorageError,
    Import,
}

#[cfg(feature = "metrics")]
static METRICS: OnceLock<Option<DataMetrics>> = OnceLock::new();

/// Metrics collection for savestore operations
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct DataMetrics {
    pub saves_total: Counter,
    pub loads_total: Counter,
    pub cache_hits_total: Counter,
    pub cache_misses_total: Counter,
    pub storage_errors_total: Counter,
    pub imports_total: Counter,
    pub operation_latency_seconds: Histogram,

    registry: Registry,
}

#[cfg(feature = "metrics")]
impl DataMetrics {
    fn new() -> Result<Self> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| -> Result<Counter> {
            let counter = Counter::new(name, help)
                .map_err(|e| DataError::storage("metrics", name, format!("Failed to create metric: {e}")))?;
            registry
                .register(Box::new(counter.clone()))
                .map_err(|e| DataError::storage("metrics", name, format!("Failed to register metric: {e}")))?;
            Ok(counter)
        };

        let saves_total = counter("savestore_saves_total", "Records saved through the engine")?;
        let loads_total = counter("savestore_loads_total", "Records loaded through the engine")?;
        let cache_hits_total = counter("savestore_cache_hits_total", "Read cache hits")?;
        let cache_misses_total = counter("savestore_cache_misses_total", "Read cache misses")?;
        let storage_errors_total =
            counter("savestore_storage_errors_total", "Failed storage backend calls")?;
        let imports_total = counter("savestore_imports_total", "Import bundles processed")?;

        let operation_latency_seconds = Histogram::with_opts(HistogramOpts::new(
            "savestore_operation_latency_seconds",
            "Duration of engine operations in seconds",
        ))
        .map_err(|e| {
            DataError::storage("metrics", "savestore_operation_latency_seconds", e.to_string())
        })?;
        registry
            .register(Box::new(operation_latency_seconds.clone()))
            .map_err(|e| {
                DataError::storage("metrics", "savestore_operation_latency_seconds", e.to_string())
            })?;

        Ok(Self {
            saves_total,
            loads_total,
            cache_hits_total,
            cache_misses_total,
            storage_errors_total,
            imports_total,
            operation_latency_seconds,
            registry,
        })
    }

    /// Get or initialize the global metrics instance
    pub fn global() -> Option<&'static DataMetrics> {
        METRICS
            .get_or_init(|| match Self::new() {
                Ok(metrics) => Some(metrics),
                Err(e) => {
                    tracing::error!(error = %e, "metrics registry unavailable");
                    None
                }
            })
            .as_ref()
    }

    pub fn record(&self, event: MetricEvent) {
        let counter = match event {
            MetricEvent::Save => &self.saves_total,
            MetricEvent::Load => &self.loads_total,
            MetricEvent::CacheHit => &self.cache_hits_total,
            MetricEvent::CacheMiss => &self.cache_misses_total,
            MetricEvent::StorageError => &self.storage_errors_total,
            MetricEvent::Import => &self.imports_total,
        };
        counter.inc();
    }

    /// Gather metrics in Prometheus text format
    pub fn gather_metrics(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| DataError::storage("metrics", "registry", format!("Failed to encode metrics: {e}")))?;

        String::from_utf8(buffer)
            .map_err(|e| DataError::storage("metrics", "registry", format!("Metrics are not UTF-8: {e}")))
    }
}

/// Count one engine event; a no-op without the `metrics` feature
pub fn record(event: MetricEvent) {
    #[cfg(feature = "metrics")]
    {
        if let Some(metrics) = DataMetrics::global() {
            metrics.record(event);
        }
    }
    #[cfg(not(feature = "metrics"))]
    let _ = event;
}

/// Observe an operation latency; a no-op without the `metrics` feature
pub fn record_latency(operation: &str, duration: Duration) {
    #[cfg(feature = "metrics")]
    {
        if let Some(metrics) = DataMetrics::global() {
            metrics.operation_latency_seconds.observe(duration.as_secs_f64());
            tracing::trace!(operation, latency_ms = duration.as_millis() as u64, "operation latency");
        }
    }
    #[cfg(not(feature = "metrics"))]
    let _ = (operation, duration);
}

/// Install the global tracing subscriber
///
/// `RUST_LOG` overrides [`DEFAULT_LOG_DIRECTIVES`]. With `json` set, log
/// lines are emitted as JSON objects; otherwise a human-readable format is
/// used.
pub fn init_observability(json: bool) -> Result<()> {
    #[cfg(feature = "metrics")]
    DataMetrics::global();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_DIRECTIVES));

    let installed = if json {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .with_current_span(false);
        set_global_default(TracingRegistry::default().with(filter).with(fmt_layer))
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
        set_global_default(TracingRegistry::default().with(filter).with(fmt_layer))
    };

    installed.map_err(|e| {
        DataError::storage("observability", "subscriber", format!("Failed to set global tracing subscriber: {e}"))
    })?;

    tracing::info!("savestore observability initialized");
    Ok(())
}
