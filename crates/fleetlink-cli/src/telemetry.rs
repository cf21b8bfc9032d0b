//! Tracing subscriber setup for the `fleetlink` binary.
//!
//! | Variable | Effect |
//! |---|---|
//! | `RUST_LOG` | Log filter (default `"info"`). |
//! | `OTEL_EXPORTER_OTLP_ENDPOINT` | When set, spans are also exported over OTLP/HTTP. |
//!
//! The console format comes from the config file's `log_format`.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{Resource, trace::SdkTracerProvider};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LogFormat;

/// Install the global subscriber.  Hold the returned guard until exit.
pub fn init_tracing(service_name: &str, format: LogFormat) -> TracerProviderGuard {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = match format {
        LogFormat::Json => tracing_subscriber::fmt::layer().with_target(true).json().boxed(),
        LogFormat::Compact => tracing_subscriber::fmt::layer().with_target(true).compact().boxed(),
    };

    let provider = build_provider(service_name, std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok());
    let otel_layer = provider
        .as_ref()
        .map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer("fleetlink")));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(otel_layer)
        .with(fmt_layer)
        .init();

    TracerProviderGuard(provider)
}

/// Shuts the OTel provider down on drop, flushing pending spans.
pub struct TracerProviderGuard(Option<SdkTracerProvider>);

impl Drop for TracerProviderGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.0.take()
            && let Err(e) = provider.shutdown()
        {
            eprintln!("[fleetlink] OpenTelemetry provider shutdown error: {e}");
        }
    }
}

/// OTLP/HTTP provider for `endpoint`, or `None` when export is off or the
/// exporter cannot be built.
fn build_provider(service_name: &str, endpoint: Option<String>) -> Option<SdkTracerProvider> {
    let endpoint = endpoint?;

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| eprintln!("[fleetlink] OTLP exporter init failed: {e}"))
        .ok()?;

    let resource = Resource::builder()
        .with_service_name(service_name.to_string())
        .build();

    Some(
        SdkTracerProvider::builder()
            .with_resource(resource)
            // The blocking HTTP client must not run on a Tokio worker, so
            // export happens on the batch processor's own thread.  The
            // guard's `shutdown` flushes it.
            .with_batch_exporter(exporter)
            .build(),
    )
}
