//! # Telemetry
//!
//! Logging always goes through `tracing`. On top of that the worker can export
//! OpenTelemetry spans and metrics, selected with cargo features.
//!
//! ## Feature matrix
//!
//! - `otel`: Exports `tracing` spans through OpenTelemetry.
//! - `metrics`: Records OpenTelemetry metrics (counters, histograms).
//! - `stdout`: Installs the stdout exporter for whichever of the above is on.
//!
//! ## Metrics
//!
//! All metric helpers compile to no-ops when `metrics` is disabled, so call
//! sites never need a `cfg`.
//!
//! - `work_items_received` (by kind)
//! - `work_items_ignored`
//! - `work_items_completed` / `work_items_failed` (by kind)
//! - `work_items_inflight` (by kind)
//! - `work_item_duration` in ms (by kind)
//! - `reports_failed`
//! - `reconnects`
//!
//! ## Example usage
//!
//! ```bash
//! RUST_LOG=taskhub_worker=debug cargo run --features otel,metrics,stdout
//! ```

#[cfg(all(feature = "stdout", not(any(feature = "otel", feature = "metrics"))))]
compile_error!("The 'stdout' feature requires at least one of 'otel' or 'metrics' to be enabled.");

use super::tracker::WorkKind;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(any(feature = "metrics", feature = "otel"))]
use opentelemetry::{InstrumentationScope, KeyValue};
#[cfg(any(feature = "metrics", feature = "otel"))]
use opentelemetry_sdk::Resource;
#[cfg(any(feature = "metrics", feature = "otel"))]
use opentelemetry_semantic_conventions as semvcns;

#[cfg(feature = "metrics")]
use opentelemetry::metrics::{Counter, Histogram, Meter, UpDownCounter};
#[cfg(feature = "metrics")]
use opentelemetry_sdk::metrics as sdkmetrics;
#[cfg(feature = "metrics")]
use std::sync::OnceLock;

#[cfg(feature = "otel")]
use opentelemetry::trace::TracerProvider;
#[cfg(feature = "otel")]
use opentelemetry_sdk::propagation::TraceContextPropagator;
#[cfg(feature = "otel")]
use opentelemetry_sdk::trace as sdktrace;

const SERVICE_NAME: &str = "taskhub-worker";

/// Providers that must be flushed and shut down on exit.
pub struct TelemetryProviders {
    #[cfg(feature = "otel")]
    pub tracer_provider: sdktrace::SdkTracerProvider,
    #[cfg(feature = "metrics")]
    pub meter_provider: sdkmetrics::SdkMeterProvider,
}

impl TelemetryProviders {
    /// Flushes and shuts down every enabled provider, reporting failures on
    /// stderr since the subscriber may already be gone.
    pub fn shutdown(self) {
        #[cfg(feature = "otel")]
        {
            if let Err(err) = self.tracer_provider.force_flush() {
                eprintln!("Error flushing traces: {err:#?}");
            }
            if let Err(err) = self.tracer_provider.shutdown() {
                eprintln!("Error shutting down tracer: {err:#?}");
            }
        }

        #[cfg(feature = "metrics")]
        {
            if let Err(err) = self.meter_provider.force_flush() {
                eprintln!("Error flushing metrics: {err:#?}");
            }
            if let Err(err) = self.meter_provider.shutdown() {
                eprintln!("Error shutting down meter: {err:#?}");
            }
        }
    }
}

/// Installs the global `tracing` subscriber and any enabled OpenTelemetry
/// providers.
///
/// The filter comes from `RUST_LOG` and defaults to `info`.
pub fn init_telemetry() -> anyhow::Result<TelemetryProviders> {
    #[cfg(feature = "otel")]
    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

    #[cfg(feature = "otel")]
    let tracer_provider = init_tracer();

    #[cfg(feature = "metrics")]
    let meter_provider = init_metrics();

    #[cfg(any(feature = "metrics", feature = "otel"))]
    let scope = InstrumentationScope::builder(SERVICE_NAME)
        .with_version(env!("CARGO_PKG_VERSION"))
        .with_schema_url(semvcns::SCHEMA_URL)
        .build();

    let registry = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_thread_ids(true)
                .with_line_number(true)
                .with_target(true)
                .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
                .with_file(true)
                .pretty(),
        );

    #[cfg(feature = "otel")]
    let registry = {
        opentelemetry::global::set_tracer_provider(tracer_provider.clone());
        registry.with(
            tracing_opentelemetry::layer()
                .with_tracer(tracer_provider.tracer_with_scope(scope.clone()))
                .with_error_records_to_exceptions(true),
        )
    };

    #[cfg(feature = "metrics")]
    let registry = {
        opentelemetry::global::set_meter_provider(meter_provider.clone());
        let meter = opentelemetry::global::meter_with_scope(scope);
        init_metric_handles(meter);

        registry.with(tracing_opentelemetry::MetricsLayer::new(
            meter_provider.clone(),
        ))
    };

    registry.try_init()?;

    Ok(TelemetryProviders {
        #[cfg(feature = "otel")]
        tracer_provider,
        #[cfg(feature = "metrics")]
        meter_provider,
    })
}

#[cfg(any(feature = "metrics", feature = "otel"))]
fn resource() -> Resource {
    Resource::builder()
        .with_service_name(SERVICE_NAME)
        .with_schema_url(
            [KeyValue::new(
                semvcns::resource::SERVICE_VERSION,
                env!("CARGO_PKG_VERSION"),
            )],
            semvcns::SCHEMA_URL,
        )
        .build()
}

#[cfg(feature = "metrics")]
fn init_metrics() -> sdkmetrics::SdkMeterProvider {
    let builder = sdkmetrics::SdkMeterProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = {
        let reader = sdkmetrics::PeriodicReader::builder(opentelemetry_stdout::MetricExporter::default())
            .with_interval(std::time::Duration::from_secs(5))
            .build();
        builder.with_reader(reader)
    };

    builder.build()
}

#[cfg(feature = "otel")]
fn init_tracer() -> sdktrace::SdkTracerProvider {
    let builder = sdktrace::SdkTracerProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = {
        let batch = sdktrace::BatchSpanProcessor::builder(opentelemetry_stdout::SpanExporter::default())
            .with_batch_config(
                sdktrace::BatchConfigBuilder::default()
                    .with_scheduled_delay(std::time::Duration::from_secs(5))
                    .with_max_queue_size(2048)
                    .build(),
            )
            .build();
        builder.with_span_processor(batch)
    };

    builder.build()
}

#[cfg(feature = "metrics")]
struct MetricHandles {
    received: Counter<u64>,
    ignored: Counter<u64>,
    completed: Counter<u64>,
    failed: Counter<u64>,
    inflight: UpDownCounter<i64>,
    duration_ms: Histogram<f64>,
    reports_failed: Counter<u64>,
    reconnects: Counter<u64>,
}

#[cfg(feature = "metrics")]
static METRICS: OnceLock<MetricHandles> = OnceLock::new();

#[cfg(feature = "metrics")]
fn init_metric_handles(meter: Meter) {
    let _ = METRICS.set(MetricHandles {
        received: meter
            .u64_counter("work_items_received")
            .with_description("Work items read from the stream")
            .build(),
        ignored: meter
            .u64_counter("work_items_ignored")
            .with_description("Work items of a kind this worker does not handle")
            .build(),
        completed: meter
            .u64_counter("work_items_completed")
            .with_description("Work items reported as completed")
            .build(),
        failed: meter
            .u64_counter("work_items_failed")
            .with_description("Work items reported as failed")
            .build(),
        inflight: meter
            .i64_up_down_counter("work_items_inflight")
            .with_description("Dispatched work items still running")
            .build(),
        duration_ms: meter
            .f64_histogram("work_item_duration")
            .with_unit("ms")
            .with_description("Handler execution time")
            .build(),
        reports_failed: meter
            .u64_counter("reports_failed")
            .with_description("Completion RPCs that failed")
            .build(),
        reconnects: meter
            .u64_counter("reconnects")
            .with_description("Work item stream reconnect attempts")
            .build(),
    });
}

#[cfg(feature = "metrics")]
fn kind_attr(kind: WorkKind) -> [KeyValue; 1] {
    [KeyValue::new("kind", kind.to_string())]
}

#[cfg(feature = "metrics")]
pub fn increment_work_items_received(kind: WorkKind) {
    if let Some(m) = METRICS.get() {
        m.received.add(1, &kind_attr(kind));
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_work_items_received(_kind: WorkKind) {}

#[cfg(feature = "metrics")]
pub fn increment_work_items_ignored() {
    if let Some(m) = METRICS.get() {
        m.ignored.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_work_items_ignored() {}

#[cfg(feature = "metrics")]
pub fn increment_work_items_completed(kind: WorkKind) {
    if let Some(m) = METRICS.get() {
        m.completed.add(1, &kind_attr(kind));
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_work_items_completed(_kind: WorkKind) {}

#[cfg(feature = "metrics")]
pub fn increment_work_items_failed(kind: WorkKind) {
    if let Some(m) = METRICS.get() {
        m.failed.add(1, &kind_attr(kind));
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_work_items_failed(_kind: WorkKind) {}

#[cfg(feature = "metrics")]
pub fn increment_work_items_inflight(kind: WorkKind) {
    if let Some(m) = METRICS.get() {
        m.inflight.add(1, &kind_attr(kind));
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_work_items_inflight(_kind: WorkKind) {}

#[cfg(feature = "metrics")]
pub fn decrement_work_items_inflight(kind: WorkKind) {
    if let Some(m) = METRICS.get() {
        m.inflight.add(-1, &kind_attr(kind));
    }
}

#[cfg(not(feature = "metrics"))]
pub fn decrement_work_items_inflight(_kind: WorkKind) {}

#[cfg(feature = "metrics")]
pub fn record_work_item_duration(kind: WorkKind, duration_ms: f64) {
    if let Some(m) = METRICS.get() {
        m.duration_ms.record(duration_ms, &kind_attr(kind));
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_work_item_duration(_kind: WorkKind, _duration_ms: f64) {}

#[cfg(feature = "metrics")]
pub fn increment_reports_failed() {
    if let Some(m) = METRICS.get() {
        m.reports_failed.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_reports_failed() {}

#[cfg(feature = "metrics")]
pub fn increment_reconnects() {
    if let Some(m) = METRICS.get() {
        m.reconnects.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_reconnects() {}
