//! Observability of the issuer.
//!
//! Prometheus carries issuance, token endpoint failures and refresh token
//! replays next to HTTP and process metrics. Traces and logs are exported
//! over OTLP when an endpoint is configured.
use std::time::{Duration, Instant};

use axum::extract::{MatchedPath, Request};
use axum::middleware::Next;
use axum::response::Response;
use metrics::{Unit, counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use opentelemetry::trace::{Span, Tracer};
use opentelemetry::{KeyValue, global};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{LogExporter, SpanExporter, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::{SdkLogger, SdkLoggerProvider};
use opentelemetry_sdk::trace::SdkTracerProvider;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, RefreshKind, System};

use crate::BoxError;
use crate::error::ServerError;

pub const TOKENS_ISSUED: &str = "tokens_issued_total";
pub const TOKEN_ERRORS: &str = "token_errors_total";
pub const REFRESH_REPLAYS: &str = "refresh_token_replays_total";
const HTTP_REQUESTS: &str = "http_requests_total";
const HTTP_DURATION: &str = "http_requests_duration_seconds";
const PROCESS_CPU: &str = "process_cpu_usage";
const PROCESS_MEMORY: &str = "process_memory_used_bytes";

const PROCESS_REFRESH: Duration = Duration::from_secs(10);

/// A ticket left the token endpoint.
pub fn record_issued(grant_type: &str) {
    counter!(TOKENS_ISSUED, "grant_type" => grant_type.to_owned()).increment(1);
}

/// The token endpoint answered with an error.
pub fn record_token_error(err: &ServerError) {
    let code = match err {
        ServerError::OAuth(err) => err.error_code(),
        _ => "server_error",
    };
    counter!(TOKEN_ERRORS, "error" => code).increment(1);
}

/// A rotated refresh token came back.
pub fn record_refresh_replay() {
    counter!(REFRESH_REPLAYS).increment(1);
}

fn describe() {
    describe_counter!(TOKENS_ISSUED, Unit::Count, "Tickets issued, per grant type.");
    describe_counter!(
        TOKEN_ERRORS,
        Unit::Count,
        "Token endpoint failures, per OAuth error code."
    );
    describe_counter!(
        REFRESH_REPLAYS,
        Unit::Count,
        "Revoked refresh tokens presented again."
    );
    describe_counter!(HTTP_REQUESTS, Unit::Count, "Requests served.");
    describe_histogram!(HTTP_DURATION, Unit::Seconds, "Request latency.");
    describe_gauge!(PROCESS_CPU, Unit::Percent, "CPU usage of the process.");
    describe_gauge!(PROCESS_MEMORY, Unit::Bytes, "Resident memory of the process.");
}

/// Install the Prometheus recorder and start sampling the process.
pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BoxError> {
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(HTTP_DURATION.to_owned()),
            EXPONENTIAL_SECONDS,
        )?
        .install_recorder()?;

    describe();
    tokio::spawn(sample_process());

    Ok(handle)
}

async fn sample_process() {
    let mut system = System::new_with_specifics(RefreshKind::nothing());
    let pid = Pid::from_u32(std::process::id());
    let mut interval = tokio::time::interval(PROCESS_REFRESH);

    loop {
        interval.tick().await;
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing().with_memory().with_cpu(),
        );

        if let Some(process) = system.process(pid) {
            gauge!(PROCESS_MEMORY).set(process.memory() as f64);
            gauge!(PROCESS_CPU).set(f64::from(process.cpu_usage()));
        }
    }
}

/// OTLP trace and log pipelines sharing one collector.
pub struct Otlp {
    tracer: SdkTracerProvider,
    logger: SdkLoggerProvider,
}

impl Otlp {
    /// Build both exporters and register the global tracer provider.
    pub fn new(endpoint: &str) -> Result<Self, BoxError> {
        let resource = Resource::builder()
            .with_service_name(env!("CARGO_PKG_NAME"))
            .build();

        let spans = SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()?;
        let tracer = SdkTracerProvider::builder()
            .with_batch_exporter(spans)
            .with_resource(resource.clone())
            .build();

        let logs = LogExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()?;
        let logger = SdkLoggerProvider::builder()
            .with_batch_exporter(logs)
            .with_resource(resource)
            .build();

        global::set_tracer_provider(tracer.clone());

        Ok(Self { tracer, logger })
    }

    /// `tracing` layer forwarding events as OTLP logs.
    pub fn logging_layer(
        &self,
    ) -> OpenTelemetryTracingBridge<SdkLoggerProvider, SdkLogger> {
        OpenTelemetryTracingBridge::new(&self.logger)
    }

    /// Flush pending batches.
    pub fn shutdown(self) {
        if let Err(err) = self.tracer.shutdown() {
            tracing::warn!(error = ?err, "trace exporter shutdown failed");
        }
        if let Err(err) = self.logger.shutdown() {
            tracing::warn!(error = ?err, "log exporter shutdown failed");
        }
    }
}

/// Count and time requests by route, inside an OpenTelemetry span.
pub async fn track(req: Request, next: Next) -> Response {
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| req.uri().path().to_owned(), |path| path.as_str().to_owned());
    let method = req.method().to_string();
    let protocol = format!("{:?}", req.version());

    let mut span = global::tracer(env!("CARGO_PKG_NAME"))
        .start(format!("{method} {route}"));
    let start = Instant::now();

    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let status = response.status().as_u16();

    span.set_attributes([
        KeyValue::new("http.request.method", method.clone()),
        KeyValue::new("http.route", route.clone()),
        KeyValue::new("http.response.status_code", i64::from(status)),
        KeyValue::new("network.protocol.version", protocol),
    ]);
    span.end();

    let labels = [
        ("method", method),
        ("path", route),
        ("status", status.to_string()),
    ];
    counter!(HTTP_REQUESTS, &labels).increment(1);
    histogram!(HTTP_DURATION, &labels).record(latency);

    response
}
