//! Prometheus metrics for the EMS session (§2.1): per-broker active
//! dark-order counts and triggers fired, exported over the same
//! `hyper` + `prometheus` HTTP shape as the feed bus's registry.

use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::error::{EmsError, Result};

/// Central registry for EMS-session metrics.
#[derive(Clone)]
pub struct EmsMetrics {
    registry: Arc<Registry>,
    pub dark_orders_active: IntGaugeVec,
    pub dark_triggers_fired_total: IntCounterVec,
    pub broker_events_total: IntCounterVec,
    pub client_errors_total: IntCounterVec,
}

impl EmsMetrics {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());
        let map_err = |e: prometheus::Error| EmsError::Config(e.to_string());

        let dark_orders_active = IntGaugeVec::new(
            Opts::new("dark_orders_active", "Currently resting dark/alert entries").namespace("ems"),
            &["broker", "symbol"],
        )
        .map_err(map_err)?;
        registry.register(Box::new(dark_orders_active.clone())).map_err(map_err)?;

        let dark_triggers_fired_total = IntCounterVec::new(
            Opts::new("dark_triggers_fired_total", "Total dark/alert entries that fired").namespace("ems"),
            &["broker", "symbol"],
        )
        .map_err(map_err)?;
        registry
            .register(Box::new(dark_triggers_fired_total.clone()))
            .map_err(map_err)?;

        let broker_events_total = IntCounterVec::new(
            Opts::new("broker_events_total", "Total brokerd events translated").namespace("ems"),
            &["broker", "kind"],
        )
        .map_err(map_err)?;
        registry.register(Box::new(broker_events_total.clone())).map_err(map_err)?;

        let client_errors_total = IntCounterVec::new(
            Opts::new("client_errors_total", "Total error responses sent to clients").namespace("ems"),
            &["broker"],
        )
        .map_err(map_err)?;
        registry.register(Box::new(client_errors_total.clone())).map_err(map_err)?;

        info!("ems metrics registry initialized");

        Ok(Self { registry, dark_orders_active, dark_triggers_fired_total, broker_events_total, client_errors_total })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl Default for EmsMetrics {
    fn default() -> Self {
        Self::new().unwrap_or_else(|e| {
            tracing::error!("FATAL: failed to create ems metrics registry: {}", e);
            panic!("cannot create ems metrics registry")
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
        Self { listen_addr: "127.0.0.1:9092".parse().unwrap(), metrics_path: "/metrics".to_string() }
    }
}

pub struct MetricsServer {
    config: MetricsServerConfig,
    registry: Arc<EmsMetrics>,
}

impl MetricsServer {
    pub fn new(config: MetricsServerConfig, registry: Arc<EmsMetrics>) -> Self {
        Self { config, registry }
    }

    pub async fn serve(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        info!("ems metrics server listening on http://{}{}", self.config.listen_addr, self.config.metrics_path);

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
    registry: Arc<EmsMetrics>,
    metrics_path: String,
) -> std::result::Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path();

    if path == "/health" || path == "/healthz" {
        return Ok(Response::builder().status(StatusCode::OK).body(Full::new(Bytes::from("OK"))).unwrap());
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
    Ok(Response::builder().status(StatusCode::NOT_FOUND).body(Full::new(Bytes::from("Not Found"))).unwrap())
}

fn encode_metrics(registry: &EmsMetrics) -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = registry.registry().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_creation_and_gather() {
        let registry = EmsMetrics::new().unwrap();
        registry.dark_orders_active.with_label_values(&["ib", "aapl"]).set(1);
        let families = registry.registry().gather();
        assert!(!families.is_empty());
    }

    #[test]
    fn metrics_server_config_default() {
        let config = MetricsServerConfig::default();
        assert_eq!(config.metrics_path, "/metrics");
        assert_eq!(config.listen_addr.port(), 9092);
    }
}
