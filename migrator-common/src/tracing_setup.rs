// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::SafeDisplay;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TracingFormat {
    Pretty,
    Json,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OtlpConfig {
    pub enabled: bool,
    pub endpoint: String,
}

impl Default for OtlpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: "http://localhost:4317".to_string(),
        }
    }
}

/// Logging/tracing configuration shared by the binary and every crate's
/// test suite. Grounded on the same shape the rest of the stack exposes:
/// a format switch for local development vs. production, a default
/// `EnvFilter` directive, and optional OTLP trace export.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TracingConfig {
    pub format: TracingFormat,
    pub default_filter: String,
    pub otlp: OtlpConfig,
}

impl SafeDisplay for TracingConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "format: {:?}", self.format);
        let _ = writeln!(&mut result, "default filter: {}", self.default_filter);
        let _ = writeln!(&mut result, "otlp enabled: {}", self.otlp.enabled);
        result
    }
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            format: TracingFormat::Json,
            default_filter: "info".to_string(),
            otlp: OtlpConfig::default(),
        }
    }
}

impl TracingConfig {
    /// The convenience constructor used by the binary's debug entrypoint
    /// and by every crate's test harness: pretty-printed, verbose, no
    /// OTLP export.
    pub fn local_dev(service_name: &str) -> Self {
        Self {
            format: TracingFormat::Pretty,
            default_filter: format!("info,{service_name}=debug"),
            otlp: OtlpConfig::default(),
        }
    }

    /// Installs a global `tracing` subscriber built from this config.
    /// Idempotent-ish: intended to be called once, at process start or at
    /// the top of a `test-r` suite's shared dependency.
    pub fn init(&self, service_name: &str) {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&self.default_filter));

        let fmt_layer = match self.format {
            TracingFormat::Pretty => tracing_subscriber::fmt::layer().pretty().boxed(),
            TracingFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
        };

        let registry = tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer);

        if self.otlp.enabled {
            if let Ok(tracer) = build_otlp_tracer(&self.otlp.endpoint, service_name) {
                registry
                    .with(tracing_opentelemetry::layer().with_tracer(tracer))
                    .try_init()
                    .ok();
                return;
            }
        }

        registry.try_init().ok();
    }
}

fn build_otlp_tracer(
    endpoint: &str,
    service_name: &str,
) -> Result<opentelemetry_sdk::trace::Tracer, opentelemetry::trace::TraceError> {
    use opentelemetry::trace::TracerProvider;
    use opentelemetry_otlp::WithExportConfig;

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|err| opentelemetry::trace::TraceError::from(err.to_string()))?;

    let provider = opentelemetry_sdk::trace::TracerProvider::builder()
        .with_batch_exporter(exporter, opentelemetry_sdk::runtime::Tokio)
        .with_resource(opentelemetry_sdk::Resource::new(vec![
            opentelemetry::KeyValue::new("service.name", service_name.to_string()),
        ]))
        .build();

    Ok(provider.tracer(service_name.to_string()))
}

/// Core Prometheus counters threaded through the coordinator. Registering
/// these is the core's responsibility; exposing them over `/metrics` is
/// the external HTTP surface's job.
pub struct CoreMetrics {
    pub tasks_started: prometheus::IntCounter,
    pub tasks_completed: prometheus::IntCounter,
    pub tasks_failed: prometheus::IntCounter,
    pub objects_copied: prometheus::IntCounter,
    pub bytes_copied: prometheus::IntCounter,
    pub integrity_failures: prometheus::IntCounter,
    pub current_workers: prometheus::IntGauge,
    pub network_quality: prometheus::IntGauge,
}

impl CoreMetrics {
    pub fn register(registry: &prometheus::Registry) -> prometheus::Result<Self> {
        let metrics = Self {
            tasks_started: prometheus::IntCounter::new(
                "migrator_tasks_started_total",
                "Number of migration tasks submitted",
            )?,
            tasks_completed: prometheus::IntCounter::new(
                "migrator_tasks_completed_total",
                "Number of migration tasks that reached a successful terminal state",
            )?,
            tasks_failed: prometheus::IntCounter::new(
                "migrator_tasks_failed_total",
                "Number of migration tasks that reached a failed or cancelled terminal state",
            )?,
            objects_copied: prometheus::IntCounter::new(
                "migrator_objects_copied_total",
                "Number of objects successfully verified at the destination",
            )?,
            bytes_copied: prometheus::IntCounter::new(
                "migrator_bytes_copied_total",
                "Number of bytes successfully verified at the destination",
            )?,
            integrity_failures: prometheus::IntCounter::new(
                "migrator_integrity_failures_total",
                "Number of objects that failed integrity verification",
            )?,
            current_workers: prometheus::IntGauge::new(
                "migrator_current_workers",
                "Current worker pool size as set by the adaptive tuner",
            )?,
            network_quality: prometheus::IntGauge::new(
                "migrator_network_quality",
                "Current network quality label as an ordinal (0=poor .. 3=excellent)",
            )?,
        };

        registry.register(Box::new(metrics.tasks_started.clone()))?;
        registry.register(Box::new(metrics.tasks_completed.clone()))?;
        registry.register(Box::new(metrics.tasks_failed.clone()))?;
        registry.register(Box::new(metrics.objects_copied.clone()))?;
        registry.register(Box::new(metrics.bytes_copied.clone()))?;
        registry.register(Box::new(metrics.integrity_failures.clone()))?;
        registry.register(Box::new(metrics.current_workers.clone()))?;
        registry.register(Box::new(metrics.network_quality.clone()))?;

        Ok(metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    #[test]
    fn local_dev_is_pretty_and_verbose() {
        let config = TracingConfig::local_dev("migrator-core");
        assert_eq!(config.format, TracingFormat::Pretty);
        assert!(config.default_filter.contains("migrator-core=debug"));
    }

    #[test]
    fn metrics_register_without_name_collisions() {
        let registry = prometheus::Registry::new();
        CoreMetrics::register(&registry).expect("metric names must not collide");
    }
}
