//! Prometheus metrics for the feed bus and a `/metrics` HTTP endpoint.

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, Gauge, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::error::{FeedBusError, Result};

/// Central registry for feed-bus metrics.
#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Arc<Registry>,
    pub quotes_total: IntCounterVec,
    pub bars_written_total: IntCounterVec,
    pub reconnects_total: IntCounterVec,
    pub active_writers: IntGauge,
    pub active_subscribers: IntGaugeVec,
    pub errors_total: IntCounterVec,
    pub subscriber_lag_events_total: IntCounter,
    pub ring_fill_ratio: Gauge,
}

impl MetricsRegistry {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());
        let map_err = |e: prometheus::Error| FeedBusError::Transport(e.to_string());

        let quotes_total = IntCounterVec::new(
            Opts::new("quotes_total", "Total quotes received from adapters").namespace("feedbus"),
            &["broker", "symbol"],
        )
        .map_err(map_err)?;
        registry.register(Box::new(quotes_total.clone())).map_err(map_err)?;

        let bars_written_total = IntCounterVec::new(
            Opts::new("bars_written_total", "Total OHLC bars written to shared rings").namespace("feedbus"),
            &["broker", "symbol"],
        )
        .map_err(map_err)?;
        registry
            .register(Box::new(bars_written_total.clone()))
            .map_err(map_err)?;

        let reconnects_total = IntCounterVec::new(
            Opts::new("reconnects_total", "Total adapter reconnection attempts").namespace("feedbus"),
            &["broker", "symbol"],
        )
        .map_err(map_err)?;
        registry
            .register(Box::new(reconnects_total.clone()))
            .map_err(map_err)?;

        let active_writers = IntGauge::new("feedbus_active_writers", "Currently active feed writers")
            .map_err(map_err)?;
        registry.register(Box::new(active_writers.clone())).map_err(map_err)?;

        let active_subscribers = IntGaugeVec::new(
            Opts::new("active_subscribers", "Currently attached subscribers per symbol").namespace("feedbus"),
            &["broker", "symbol"],
        )
        .map_err(map_err)?;
        registry
            .register(Box::new(active_subscribers.clone()))
            .map_err(map_err)?;

        let errors_total = IntCounterVec::new(
            Opts::new("errors_total", "Total feed bus errors").namespace("feedbus"),
            &["kind"],
        )
        .map_err(map_err)?;
        registry.register(Box::new(errors_total.clone())).map_err(map_err)?;

        let subscriber_lag_events_total = IntCounter::new(
            "feedbus_subscriber_lag_events_total",
            "Total times a subscriber lagged and dropped quotes",
        )
        .map_err(map_err)?;
        registry
            .register(Box::new(subscriber_lag_events_total.clone()))
            .map_err(map_err)?;

        let ring_fill_ratio = Gauge::new("feedbus_ring_fill_ratio", "Average ring occupancy fraction")
            .map_err(map_err)?;
        registry.register(Box::new(ring_fill_ratio.clone())).map_err(map_err)?;

        info!("feed bus metrics registry initialized");

        Ok(Self {
            registry,
            quotes_total,
            bars_written_total,
            reconnects_total,
            active_writers,
            active_subscribers,
            errors_total,
            subscriber_lag_events_total,
            ring_fill_ratio,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new().unwrap_or_else(|e| {
            tracing::error!("FATAL: failed to create metrics registry: {}", e);
            panic!("cannot create metrics registry")
        })
    }
}

#[derive(Debug, Clone)]
pub struct MetricsServerConfig {
    pub listen_addr: SocketAddr,
    pub metrics_path: String,
}

impl Default for MetricsServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:9091".parse().unwrap(),
            metrics_path: "/metrics".to_string(),
        }
    }
}

pub struct MetricsServer {
    config: MetricsServerConfig,
    registry: Arc<MetricsRegistry>,
}

impl MetricsServer {
    pub fn new(config: MetricsServerConfig, registry: Arc<MetricsRegistry>) -> Self {
        Self { config, registry }
    }

    pub async fn serve(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        info!(
            "feed bus metrics server listening on http://{}{}",
            self.config.listen_addr, self.config.metrics_path
        );

        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!("failed to accept metrics connection: {}", e);
                    continue;
                }
            };

            let registry = self.registry.clone();
            let metrics_path = self.config.metrics_path.clone();

            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                    let registry = registry.clone();
                    let metrics_path = metrics_path.clone();
                    async move { handle_request(req, registry, metrics_path).await }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    debug!("metrics connection error from {}: {}", remote_addr, err);
                }
            });
        }
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    registry: Arc<MetricsRegistry>,
    metrics_path: String,
) -> std::result::Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path();

    if path == "/health" || path == "/healthz" {
        return Ok(Response::builder()
            .status(StatusCode::OK)
            .body(Full::new(Bytes::from("OK")))
            .unwrap());
    }

    if path == metrics_path {
        return Ok(match encode_metrics(&registry) {
            Ok(body) => Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain; version=0.0.4")
                .body(Full::new(Bytes::from(body)))
                .unwrap(),
            Err(e) => {
                error!("failed to encode metrics: {}", e);
                Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Full::new(Bytes::from(format!("error: {e}"))))
                    .unwrap()
            }
        });
    }

    warn!("unknown metrics endpoint requested: {}", path);
    Ok(Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(Full::new(Bytes::from("Not Found")))
        .unwrap())
}

fn encode_metrics(registry: &MetricsRegistry) -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = registry.registry().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}
