use std::net::SocketAddr;
use std::sync::Arc;

use envconfig::Envconfig;
use eyre::{bail, Result, WrapErr};
use health::HealthRegistry;
use metrics_exporter_prometheus::PrometheusBuilder;
use rmq_actors::{
    AmqpConnector, ConnectionEvent, ConnectionManager, HostConfig, MetricsSink,
    RecorderMetricsSink, StopError,
};
use tokio::signal::unix::SignalKind;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const SERVICE_NAME: &str = "rabbitmq-actors";

fn setup_tracing() {
    let log_layer: tracing_subscriber::filter::Filtered<
        tracing_subscriber::fmt::Layer<tracing_subscriber::Registry>,
        EnvFilter,
        tracing_subscriber::Registry,
    > = tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(log_layer).init();
}

async fn wait_for_shutdown_signal() -> Result<&'static str> {
    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())
        .wrap_err("failed to install SIGTERM handler")?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.wrap_err("failed to listen for SIGINT")?;
            Ok("SIGINT")
        }
        _ = sigterm.recv() => Ok("SIGTERM"),
    }
}

/// Resolves once the manager gave up reconnecting, never otherwise.
async fn wait_for_exhaustion(events: &mut broadcast::Receiver<ConnectionEvent>) -> u32 {
    loop {
        match events.recv().await {
            Ok(ConnectionEvent::ReconnectExhausted { attempts }) => return attempts,
            Ok(event) => info!(?event, "connection event"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "missed connection events");
            }
            Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();
    info!("Starting up...");

    let config = HostConfig::init_from_env().wrap_err("failed to load configuration")?;
    config.rmq.validate()?;

    if let Some(port) = config.metrics_port {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .wrap_err("failed to install prometheus exporter")?;
        info!("Metrics server listening on {}", addr);
    }

    let metrics: Arc<dyn MetricsSink> = Arc::new(RecorderMetricsSink::new(SERVICE_NAME));
    let manager = ConnectionManager::builder(AmqpConnector::new())
        .metrics_sink(metrics)
        .build();

    let liveness = HealthRegistry::new("liveness");
    liveness.register(SERVICE_NAME, manager.health_check())?;

    let mut events = manager.subscribe();
    manager
        .start(&config.rmq)
        .await
        .wrap_err("failed to connect to the broker")?;

    let probe_interval = config.health_probe_interval();
    let probe_registry = liveness.clone();
    let health_probe = tokio::spawn(async move {
        let mut interval = tokio::time::interval(probe_interval);
        loop {
            interval.tick().await;
            probe_registry.get_status();
        }
    });

    let exhausted = tokio::select! {
        signal = wait_for_shutdown_signal() => {
            let signal = signal?;
            info!(trigger_reason = signal, "shutdown initiated");
            None
        }
        attempts = wait_for_exhaustion(&mut events) => {
            error!(attempts, "shutdown initiated, broker unreachable");
            Some(attempts)
        }
    };

    health_probe.abort();
    match manager.stop().await {
        Ok(()) => info!("shutdown complete"),
        Err(StopError::Shutdown(e)) => {
            error!("shutdown finished with failures: {}", e);
            return Err(e.into());
        }
        Err(e) => return Err(e.into()),
    }

    if let Some(attempts) = exhausted {
        bail!("gave up on the broker after {attempts} reconnect attempts");
    }
    Ok(())
}
