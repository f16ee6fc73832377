use anyhow::{Context, Result};
use opentelemetry::propagation::TextMapPropagator;
use opentelemetry::trace::{SpanContext, TraceContextExt, TracerProvider as _};
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::propagation::{BaggagePropagator, TextMapCompositePropagator, TraceContextPropagator};
use opentelemetry_sdk::Resource;
use std::fs::OpenOptions;
use tracing::{info_span, Span};
use tracing_opentelemetry::OpenTelemetrySpanExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::queue::QueueMessage;

pub const DEFAULT_SERVICE_NAME: &str = "shipping-worker";
pub const TRACEPARENT: &str = "traceparent";

/// Owns the process-wide tracer provider.
///
/// Every exporter mode installs a provider, so cycle spans always carry a trace
/// id for log correlation. Spans still buffered in a batch exporter are flushed
/// when the guard is shut down or dropped, whichever happens first.
#[must_use = "dropping the guard shuts the tracer provider down"]
pub struct TelemetryGuard {
    installed: bool,
}

impl TelemetryGuard {
    fn installed() -> Self {
        Self { installed: true }
    }

    pub fn shutdown(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if std::mem::take(&mut self.installed) {
            global::shutdown_tracer_provider();
        }
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        self.release();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    fn from_env() -> Self {
        match std::env::var("LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            _ => LogFormat::Text,
        }
    }
}

pub fn init_telemetry() -> Result<TelemetryGuard> {
    let exporter_type = std::env::var("OTEL_EXPORTER").unwrap_or_else(|_| "stdout".to_string());
    let format = LogFormat::from_env();

    global::set_text_map_propagator(propagator());

    match exporter_type.as_str() {
        "jaeger" => init_jaeger(format),
        "otlp" => init_otlp(format),
        "file" => init_file(),
        "stdout" => init_stdout(format),
        _ => {
            eprintln!("Unknown OTEL_EXPORTER: {}, falling back to stdout", exporter_type);
            init_stdout(format)
        }
    }
}

/// W3C trace context plus baggage.
fn propagator() -> TextMapCompositePropagator {
    TextMapCompositePropagator::new(vec![
        Box::new(TraceContextPropagator::new()),
        Box::new(BaggagePropagator::new()),
    ])
}

/// `RUST_LOG` when set, otherwise `info` so cycle and message spans are enabled.
fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn service_name() -> String {
    std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| DEFAULT_SERVICE_NAME.to_string())
}

fn resource() -> Resource {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());

    Resource::new(vec![
        KeyValue::new("service.name", service_name()),
        KeyValue::new("host.name", host),
    ])
}

/// Tracer for the modes without a span exporter. Spans are still sampled so
/// log records can carry their trace id.
fn local_tracer() -> opentelemetry_sdk::trace::Tracer {
    let provider = opentelemetry_sdk::trace::TracerProvider::builder()
        .with_config(opentelemetry_sdk::trace::config().with_resource(resource()))
        .build();
    let tracer = provider.tracer(DEFAULT_SERVICE_NAME);

    // The sdk tracer only holds a weak reference, the global slot keeps the provider alive.
    global::set_tracer_provider(provider);
    tracer
}

fn init_jaeger(format: LogFormat) -> Result<TelemetryGuard> {
    let tracer = opentelemetry_jaeger::new_agent_pipeline()
        .with_service_name(service_name())
        .with_trace_config(opentelemetry_sdk::trace::config().with_resource(resource()))
        .install_batch(opentelemetry_sdk::runtime::Tokio)
        .context("Failed to install jaeger pipeline")?;

    let telemetry = tracing_opentelemetry::layer().with_tracer(tracer);

    tracing_subscriber::registry()
        .with(telemetry)
        .with((format == LogFormat::Text).then(|| tracing_subscriber::fmt::layer()))
        .with((format == LogFormat::Json).then(|| tracing_subscriber::fmt::layer().json().flatten_event(true)))
        .with(env_filter())
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(TelemetryGuard::installed())
}

fn init_otlp(format: LogFormat) -> Result<TelemetryGuard> {
    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:4317".to_string());

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint),
        )
        .with_trace_config(opentelemetry_sdk::trace::config().with_resource(resource()))
        .install_batch(opentelemetry_sdk::runtime::Tokio)
        .context("Failed to install otlp pipeline")?;

    let telemetry = tracing_opentelemetry::layer().with_tracer(tracer);

    tracing_subscriber::registry()
        .with(telemetry)
        .with((format == LogFormat::Text).then(|| tracing_subscriber::fmt::layer()))
        .with((format == LogFormat::Json).then(|| tracing_subscriber::fmt::layer().json().flatten_event(true)))
        .with(env_filter())
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(TelemetryGuard::installed())
}

fn init_stdout(format: LogFormat) -> Result<TelemetryGuard> {
    let telemetry = tracing_opentelemetry::layer().with_tracer(local_tracer());

    tracing_subscriber::registry()
        .with(telemetry)
        .with((format == LogFormat::Text).then(|| tracing_subscriber::fmt::layer()))
        .with((format == LogFormat::Json).then(|| tracing_subscriber::fmt::layer().json().flatten_event(true)))
        .with(env_filter())
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(TelemetryGuard::installed())
}

fn init_file() -> Result<TelemetryGuard> {
    let log_file_path = std::env::var("LOG_FILE")
        .unwrap_or_else(|_| format!("{}.log", DEFAULT_SERVICE_NAME));

    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_file_path)
        .with_context(|| format!("Failed to open log file {}", log_file_path))?;

    let telemetry = tracing_opentelemetry::layer().with_tracer(local_tracer());

    tracing_subscriber::registry()
        .with(telemetry)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::sync::Arc::new(log_file))
                .with_ansi(false)
        )
        .with(env_filter())
        .try_init()
        .context("Failed to install tracing subscriber")?;

    eprintln!("Logging to file: {}", log_file_path);

    Ok(TelemetryGuard::installed())
}

/// Creates the spans of the consumer loop.
///
/// One `poll_cycle` span per cycle, and one `process_message` span per message
/// whose parent is always the span of the cycle that received it.
#[derive(Debug, Clone)]
pub struct CycleTracer {
    queue: String,
}

impl CycleTracer {
    pub fn new(queue: impl Into<String>) -> Self {
        Self { queue: queue.into() }
    }

    /// Every cycle starts a new trace, even when called inside another span.
    pub fn cycle_span(&self, cycle: u64) -> Span {
        info_span!(
            parent: None,
            "poll_cycle",
            cycle,
            queue = %self.queue,
            messages.received = tracing::field::Empty,
            messages.acknowledged = tracing::field::Empty,
            messages.failed = tracing::field::Empty,
        )
    }

    pub fn message_span(&self, cycle_span: &Span, cycle: u64, message: &QueueMessage) -> Span {
        let span = info_span!(
            parent: cycle_span,
            "process_message",
            cycle,
            message.id = %message.display_id(),
            outcome = tracing::field::Empty,
        );

        // An upstream producer's context is a link, the parent stays the cycle.
        if let Some(upstream) = upstream_context(message) {
            span.add_link(upstream);
        }

        span
    }
}

/// Remote span context carried in a W3C `traceparent` message attribute.
pub fn upstream_context(message: &QueueMessage) -> Option<SpanContext> {
    if !message.attributes.contains_key(TRACEPARENT) {
        return None;
    }

    let cx = TraceContextPropagator::new().extract(&message.attributes);
    let span_context = cx.span().span_context().clone();
    span_context.is_valid().then_some(span_context)
}

/// Hex trace id of `span`, `None` when no OpenTelemetry layer is recording it.
pub fn trace_id(span: &Span) -> Option<String> {
    let cx = span.context();
    let otel_span = cx.span();
    let span_context = otel_span.span_context();

    span_context
        .is_valid()
        .then(|| span_context.trace_id().to_string())
}

pub fn current_trace_id() -> Option<String> {
    trace_id(&Span::current())
}
