//! OpenTelemetry tracing export
//!
//! Spans are shipped over OTLP/gRPC when `OTEL_EXPORTER_OTLP_ENDPOINT` is set.
//! The returned layer slots into any `tracing_subscriber` registry.

use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{runtime, trace, Resource};
use tracing::Subscriber;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::registry::LookupSpan;

pub const OTLP_ENDPOINT_ENV: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";
pub const DEFAULT_SERVICE_NAME: &str = "service-lb-controller";

/// Endpoint to export to, if tracing export is enabled
pub fn otlp_endpoint() -> Option<String> {
    std::env::var(OTLP_ENDPOINT_ENV)
        .ok()
        .filter(|endpoint| !endpoint.trim().is_empty())
}

/// Build the OTLP tracing layer for `service_name`
pub fn init_telemetry<S>(
    endpoint: &str,
    service_name: &str,
) -> anyhow::Result<OpenTelemetryLayer<S, trace::Tracer>>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint),
        )
        .with_trace_config(trace::config().with_resource(Resource::new(vec![
            KeyValue::new("service.name", service_name.to_string()),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ])))
        .install_batch(runtime::Tokio)?;

    Ok(tracing_opentelemetry::layer().with_tracer(tracer))
}

/// Flush pending spans
pub fn shutdown_telemetry() {
    opentelemetry::global::shutdown_tracer_provider();
}
