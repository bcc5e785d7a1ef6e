use std::net::SocketAddr;
use std::sync::OnceLock;

use axum::Router;
use axum::body::Body;
use axum::http::{Response, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use parking_lot::Mutex;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{Error, Result};

const REGISTRY_PREFIX: &str = "bridge";
const PARTITION_LABEL: &str = "partition";
const RETRYABLE_LABEL: &str = "retryable";

pub(crate) type Labels = Vec<(String, String)>;

struct GlobalRegistry {
    registry: Mutex<Registry>,
}

static GLOBAL_REGISTRY: OnceLock<GlobalRegistry> = OnceLock::new();

fn global_registry() -> &'static GlobalRegistry {
    GLOBAL_REGISTRY.get_or_init(|| GlobalRegistry {
        registry: Mutex::new(Registry::default()),
    })
}

/// Counters and timings of the forwarding pipeline, labelled by partition.
pub(crate) struct BridgeMetrics {
    pub(crate) read_total: Family<Labels, Counter>,
    pub(crate) read_bytes_total: Family<Labels, Counter>,
    pub(crate) delivered_total: Family<Labels, Counter>,
    pub(crate) delivery_attempts_total: Family<Labels, Counter>,
    pub(crate) delivery_failures_total: Family<Labels, Counter>,
    pub(crate) dead_lettered_total: Family<Labels, Counter>,
    pub(crate) dropped_total: Family<Labels, Counter>,
    pub(crate) commit_total: Family<Labels, Counter>,
    pub(crate) blocked_partitions: Family<Labels, Gauge>,
    /// Duration of a single delivery attempt, in microseconds.
    pub(crate) delivery_time: Family<Labels, Histogram>,
}

static BRIDGE_METRICS: OnceLock<BridgeMetrics> = OnceLock::new();

pub(crate) fn bridge_metrics() -> &'static BridgeMetrics {
    BRIDGE_METRICS.get_or_init(|| {
        let metrics = BridgeMetrics {
            read_total: Family::default(),
            read_bytes_total: Family::default(),
            delivered_total: Family::default(),
            delivery_attempts_total: Family::default(),
            delivery_failures_total: Family::default(),
            dead_lettered_total: Family::default(),
            dropped_total: Family::default(),
            commit_total: Family::default(),
            blocked_partitions: Family::default(),
            delivery_time: Family::new_with_constructor(|| {
                Histogram::new(exponential_buckets(100.0, 4.0, 10))
            }),
        };

        let mut registry = global_registry().registry.lock();
        let registry = registry.sub_registry_with_prefix(REGISTRY_PREFIX);
        registry.register(
            "read",
            "Total number of records read from Kafka",
            metrics.read_total.clone(),
        );
        registry.register(
            "read_bytes",
            "Total number of payload bytes read from Kafka",
            metrics.read_bytes_total.clone(),
        );
        registry.register(
            "delivered",
            "Total number of records delivered to the endpoint",
            metrics.delivered_total.clone(),
        );
        registry.register(
            "delivery_attempts",
            "Total number of HTTP requests sent to the endpoint",
            metrics.delivery_attempts_total.clone(),
        );
        registry.register(
            "delivery_failures",
            "Total number of failed delivery attempts",
            metrics.delivery_failures_total.clone(),
        );
        registry.register(
            "dead_lettered",
            "Total number of records routed to the dead-letter topic",
            metrics.dead_lettered_total.clone(),
        );
        registry.register(
            "dropped",
            "Total number of undeliverable records dropped",
            metrics.dropped_total.clone(),
        );
        registry.register(
            "commit",
            "Total number of offset commits",
            metrics.commit_total.clone(),
        );
        registry.register(
            "blocked_partitions",
            "Partitions stopped because a record exhausted its retries",
            metrics.blocked_partitions.clone(),
        );
        registry.register(
            "delivery_time",
            "Duration of a delivery attempt in microseconds",
            metrics.delivery_time.clone(),
        );
        metrics
    })
}

pub(crate) fn partition_labels(partition: i32) -> Labels {
    vec![(PARTITION_LABEL.to_string(), partition.to_string())]
}

pub(crate) fn failure_labels(partition: i32, retryable: bool) -> Labels {
    vec![
        (PARTITION_LABEL.to_string(), partition.to_string()),
        (RETRYABLE_LABEL.to_string(), retryable.to_string()),
    ]
}

pub(crate) async fn metrics_handler() -> impl IntoResponse {
    let mut buffer = String::new();
    let encoded = {
        let registry = global_registry().registry.lock();
        encode(&mut buffer, &registry)
    };
    if let Err(e) = encoded {
        error!(?e, "Failed to encode metrics");
        return (StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics").into_response();
    }
    debug!("Exposing metrics: {:?}", buffer);
    (
        [(
            axum::http::header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        Body::from(buffer),
    )
        .into_response()
}

async fn livez() -> Response<Body> {
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .body(Body::empty())
        .unwrap_or_default()
}

pub(crate) fn metrics_router() -> Router {
    // Registering on first use would leave /metrics empty until the first record arrives.
    let _ = bridge_metrics();
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/livez", get(livez))
}

/// Serves `/metrics` and `/livez` until the token is cancelled.
pub(crate) async fn start_metrics_server(
    addr: SocketAddr,
    cln_token: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Metrics(format!("Binding metrics server to {addr}: {e}")))?;
    info!(?addr, "Starting metrics server");
    axum::serve(listener, metrics_router())
        .with_graceful_shutdown(cln_token.cancelled_owned())
        .await
        .map_err(|e| Error::Metrics(format!("Metrics server: {e}")))
}
