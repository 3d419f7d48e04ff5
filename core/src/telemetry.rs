// Telemetry: tracing subscriber with optional OpenTelemetry export.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Initializes tracing with OTLP trace and metric export.
///
/// Call once from the binary before constructing any component; counters
/// registered earlier would land on a no-op meter.
///
/// # Environment Variables
///
/// - `OTEL_EXPORTER_OTLP_ENDPOINT`: collector endpoint (default: http://localhost:4317)
/// - `OTEL_SERVICE_NAME`: service name (default: trellis-backend)
/// - `RUST_LOG`: tracing filter (default: info)
pub fn init_telemetry() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:4317".to_string());
    let service_name =
        std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| "trellis-backend".to_string());

    let resource = Resource::new(vec![
        KeyValue::new("service.name", service_name),
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
    ]);

    use opentelemetry_sdk::trace::TracerProvider;
    let tracer_provider = TracerProvider::builder()
        .with_config(opentelemetry_sdk::trace::config().with_resource(resource.clone()))
        .with_batch_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(otlp_endpoint.clone())
                .build_span_exporter()?,
            opentelemetry_sdk::runtime::Tokio,
        )
        .build();

    opentelemetry::global::set_tracer_provider(tracer_provider.clone());
    let tracer = tracer_provider.tracer("trellis-core");

    let meter_provider = opentelemetry_otlp::new_pipeline()
        .metrics(opentelemetry_sdk::runtime::Tokio)
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(otlp_endpoint),
        )
        .with_resource(resource)
        .with_period(std::time::Duration::from_secs(10))
        .build()?;
    opentelemetry::global::set_meter_provider(meter_provider);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .try_init()?;

    info!(target: "telemetry", "OpenTelemetry initialized");
    Ok(())
}

/// Flushes pending telemetry; call before exit.
pub fn shutdown_telemetry() {
    opentelemetry::global::shutdown_tracer_provider();
}
