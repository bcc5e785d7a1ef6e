use std::net::SocketAddr;

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub use crate::config::{
    DeliveryGuarantee, ExhaustedStrategy, ForwarderConfig, HeaderPolicy, HttpSinkConfig,
    KafkaConfig, Settings, TerminalStrategy,
};
pub use crate::error::{Error, Result};
pub use crate::retry::BackoffPolicy;

use crate::deadletter::KafkaDeadLetter;
use crate::sink::http::HttpSink;
use crate::source::kafka::new_kafka_source;
use crate::supervisor::Supervisor;

mod config;
mod deadletter;
mod error;
mod message;
mod metrics;
mod retry;
mod sink;
mod source;

/// Per-partition loop of poll, deliver, commit.
mod forwarder;

/// Starts and stops partition forwarders as the consumer group rebalances.
mod supervisor;

/// Forwards records until SIGINT/SIGTERM or a fatal error. Returns the fatal error, if any.
pub async fn run(settings: Settings) -> Result<()> {
    let cln_token = CancellationToken::new();
    let shutdown_cln_token = cln_token.clone();

    // wait for SIG{INT,TERM} and invoke cancellation token.
    let shutdown_handle = tokio::spawn(async move {
        shutdown_signal().await;
        shutdown_cln_token.cancel();
    });

    let result = start_bridge(settings, cln_token.clone()).await;
    if let Err(e) = &result {
        error!(?e, "Bridge stopped with a fatal error");
    }

    cln_token.cancel();
    if !shutdown_handle.is_finished() {
        shutdown_handle.abort();
    }
    info!("Gracefully Exiting...");
    result
}

/// Builds the bridge from `settings` and runs it until `cln_token` is cancelled.
pub async fn start_bridge(settings: Settings, cln_token: CancellationToken) -> Result<()> {
    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], settings.metrics_port));
    let metrics_token = cln_token.clone();
    let metrics_server = tokio::spawn(async move {
        if let Err(e) = metrics::start_metrics_server(metrics_addr, metrics_token).await {
            error!(?e, "Metrics server stopped");
        }
    });

    let sink = HttpSink::new(&settings.http)?;
    let dead_letter = settings
        .dead_letter
        .clone()
        .map(KafkaDeadLetter::new)
        .transpose()?;
    let (source, events) =
        new_kafka_source(settings.kafka_source_config(), settings.forwarder.batch_size).await?;

    info!(
        topic = %settings.kafka.topic,
        group_id = %settings.kafka.group_id,
        endpoint = %settings.http.endpoint,
        guarantee = %settings.forwarder.guarantee,
        retry_budget = settings.forwarder.retry_budget,
        on_retries_exhausted = %settings.forwarder.on_retries_exhausted,
        on_terminal_failure = %settings.forwarder.on_terminal_failure,
        dead_letter_topic = settings.dead_letter.as_ref().map(|d| d.topic.as_str()),
        "Starting bridge"
    );
    if settings.forwarder.guarantee == DeliveryGuarantee::None {
        warn!("Offsets are never committed, a restart replays the topic from the reset policy");
    }

    let result = Supervisor::new(
        source,
        sink,
        dead_letter,
        settings.forwarder.clone(),
        settings.http.header_policy,
        events,
        cln_token.clone(),
    )
    .run()
    .await;

    cln_token.cancel();
    if let Err(e) = metrics_server.await {
        warn!(?e, "Metrics server task failed");
    }
    result
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C signal"),
            Err(e) => {
                error!(?e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received terminate signal");
            }
            Err(e) => {
                error!(?e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
