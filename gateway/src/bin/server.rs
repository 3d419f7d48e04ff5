use trellis_core::config::Config;
use trellis_core::telemetry;
use trellis_gateway::Gateway;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // OTLP export is opt-in; without an endpoint configured we stay on the
    // plain fmt subscriber.
    let otel = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok();
    if otel {
        telemetry::init_telemetry()?;
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .compact()
            .init();
    }

    let cfg = Config::from_env();
    let gateway = Gateway::new(cfg).await?;
    gateway.run().await?;

    if otel {
        telemetry::shutdown_telemetry();
    }
    Ok(())
}
