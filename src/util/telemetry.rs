use std::time::Duration;

use opentelemetry::{KeyValue, global};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{self, Protocol, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing::Subscriber;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

use crate::util::env::Env;

pub type Result<T> = core::result::Result<T, Box<dyn std::error::Error>>;

const DEFAULT_FILTER: &str = "contrib_leaderboard=debug,sqlx=info,redis=info,info";
const EXPORT_TIMEOUT: Duration = Duration::from_secs(5);

/// OTLP exporters, present only when a collector endpoint is configured.
#[derive(Debug, Clone)]
struct Providers {
    logger_provider: SdkLoggerProvider,
    tracer_provider: SdkTracerProvider,
    meter_provider: SdkMeterProvider,
}

#[derive(Debug, Clone)]
pub struct Telemetry {
    pub service_name: String,
    providers: Option<Providers>,
}

impl Telemetry {
    pub fn new(env: &Env) -> Result<Telemetry> {
        let service_name = env.service_name.clone();
        let service_version = env!("CARGO_PKG_VERSION");

        let providers = match env.otel_exporter_otlp_endpoint.as_deref() {
            Some(collector_url) => {
                let base_resource = base_attrs(&service_name, service_version);
                Some(Providers {
                    logger_provider: build_logger_provider(collector_url, base_resource.clone())?,
                    meter_provider: build_meter_provider(collector_url, base_resource.clone())?,
                    tracer_provider: build_tracer_provider(collector_url, base_resource)?,
                })
            }
            None => None,
        };

        Ok(Self {
            service_name,
            providers,
        })
    }

    pub fn register(self) -> Self {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

        match &self.providers {
            Some(providers) => {
                global::set_tracer_provider(providers.tracer_provider.clone());
                let tracer = global::tracer(self.service_name.clone());
                let trace_layer = tracing_opentelemetry::layer().with_tracer(tracer);

                let log_layer = OpenTelemetryTracingBridge::new(&providers.logger_provider);
                let meter_layer =
                    tracing_opentelemetry::MetricsLayer::new(providers.meter_provider.clone());

                tracing_subscriber::registry()
                    .with(trace_layer)
                    .with(log_layer)
                    .with(meter_layer)
                    .with(filter)
                    .with(console_layer())
                    .init();
            }
            None => {
                console_only(filter).init();

                tracing::info!("no OTLP endpoint configured; logging to console only");
            }
        }

        self
    }

    pub fn shutdown(self) {
        let Some(providers) = self.providers else {
            return;
        };

        if let Err(e) = providers.meter_provider.shutdown() {
            eprintln!("error during metering shutdown: {e:?}");
        }

        if let Err(e) = providers.logger_provider.shutdown() {
            eprintln!("error during logging shutdown: {e:?}");
        }

        if let Err(e) = providers.tracer_provider.shutdown() {
            eprintln!("error during tracing shutdown: {e:?}");
        }
    }
}

/// The fmt layer is generic over the subscriber it lands on, so each stack builds its own.
fn console_layer<S>() -> impl Layer<S> + Send + Sync + 'static
where
    S: Subscriber + for<'span> LookupSpan<'span> + 'static,
{
    tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
}

fn console_only(filter: EnvFilter) -> impl Subscriber + Send + Sync + 'static {
    tracing_subscriber::registry().with(filter).with(console_layer())
}

fn build_logger_provider(collector_url: &str, base_resource: Resource) -> Result<SdkLoggerProvider> {
    let exporter = opentelemetry_otlp::LogExporter::builder()
        .with_tonic()
        .with_protocol(Protocol::Grpc)
        .with_endpoint(collector_url)
        .with_timeout(EXPORT_TIMEOUT)
        .build()?;

    Ok(SdkLoggerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(base_resource)
        .build())
}

fn build_tracer_provider(collector_url: &str, base_resource: Resource) -> Result<SdkTracerProvider> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_protocol(Protocol::Grpc)
        .with_endpoint(collector_url)
        .with_timeout(EXPORT_TIMEOUT)
        .build()?;

    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(base_resource)
        .build())
}

fn build_meter_provider(collector_url: &str, base_resource: Resource) -> Result<SdkMeterProvider> {
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_protocol(Protocol::Grpc)
        .with_endpoint(collector_url)
        .with_timeout(EXPORT_TIMEOUT)
        .build()?;

    Ok(SdkMeterProvider::builder()
        .with_periodic_exporter(exporter)
        .with_resource(base_resource)
        .build())
}

fn base_attrs(name: &str, version: &'static str) -> Resource {
    Resource::builder()
        .with_attributes([
            KeyValue::new("service.name", name.to_string()),
            KeyValue::new("service.version", version),
        ])
        .build()
}
