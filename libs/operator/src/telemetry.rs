use crate::error::{Error, Result};

use clap::ValueEnum;
use opentelemetry::trace::TraceContextExt;
use opentelemetry_sdk::trace::Sampler;
use tracing::Span;
use tracing_opentelemetry::OpenTelemetrySpanExt;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// Initialize the global `tracing` subscriber with the requested filter and
/// format, optionally exporting spans over OTLP when `tracing_url` is set.
pub async fn init(
    log_filter: &str,
    log_format: LogFormat,
    tracing_url: Option<&str>,
    sample_ratio: f64,
) -> Result<()> {
    let env_filter = EnvFilter::try_new(log_filter).unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = match log_format {
        LogFormat::Text => tracing_subscriber::fmt::layer().boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer().json().flatten_event(true).boxed(),
    };

    let registry = tracing_subscriber::registry().with(env_filter).with(fmt_layer);

    match tracing_url {
        Some(url) => {
            let exporter = opentelemetry_otlp::SpanExporter::builder()
                .with_tonic()
                .with_endpoint(url)
                .build()
                .map_err(|e| Error::FormattingError(format!("failed to build OTLP exporter: {e}"), std::fmt::Error))?;

            let provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
                .with_batch_exporter(exporter)
                .with_sampler(Sampler::TraceIdRatioBased(sample_ratio))
                .build();
            opentelemetry::global::set_tracer_provider(provider.clone());

            let tracer = provider.tracer("proxmox-operator");
            let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
            registry.with(otel_layer).try_init()
        }
        None => registry.try_init(),
    }
    .map_err(|e| Error::FormattingError(format!("failed to install tracing subscriber: {e}"), std::fmt::Error))?;

    Ok(())
}

/// Return the current span's OpenTelemetry trace ID, formatted as hex, if any.
pub fn get_trace_id() -> opentelemetry::trace::TraceId {
    Span::current().context().span().span_context().trace_id()
}
