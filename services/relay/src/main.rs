use adaptation_relay::{
    provision_buckets, AmqpBroker, Config, Relay, RelaySettings, RelayState, S3Stager,
};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting adaptation relay"
    );

    // Initialize metrics
    if config.service.metrics_port == 0 {
        info!("Prometheus metrics exporter disabled");
    } else {
        init_metrics(config.service.metrics_port)?;
    }

    if let Err(e) = run(&config).await {
        error!(state = %RelayState::Fatal, error = %format!("{e:#}"), "Relay stopped");
        return Err(e);
    }

    info!("Adaptation relay stopped");

    Ok(())
}

async fn run(config: &Config) -> Result<()> {
    info!(state = %RelayState::Starting, "Relay state changed");

    let prefetch = u16::try_from(config.relay.max_in_flight)
        .context("relay.max_in_flight does not fit the prefetch count")?;
    let broker = Arc::new(
        AmqpBroker::connect(&config.broker, prefetch)
            .await
            .context("Failed to initialize message broker")?,
    );

    let stager = Arc::new(
        S3Stager::new(&config.storage)
            .await
            .context("Failed to initialize object stager")?,
    );
    provision_buckets(stager.as_ref(), &config.buckets())
        .await
        .context("Failed to provision buckets")?;

    info!(
        state = %RelayState::BucketsReady,
        buckets = ?config.buckets(),
        "Relay state changed"
    );

    let deliveries = broker
        .consume()
        .await
        .context("Failed to start consuming")?;

    let relay = Arc::new(Relay::new(
        stager,
        Arc::clone(&broker),
        RelaySettings::from_config(config),
    ));

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    info!(state = %RelayState::Consuming, "Relay state changed");

    let result = relay.run(deliveries, shutdown).await;

    broker.close().await;

    result.context("Relay loop failed")
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal, draining in-flight deliveries");
        }
        _ = terminate => {
            info!("Received SIGTERM signal, draining in-flight deliveries");
        }
    }
}
