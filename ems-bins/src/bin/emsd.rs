//! The EMS daemon: loads a runtime TOML config, opens the configured
//! `(broker, symbol)` sessions against synthetic feeds and the
//! paper-clearing adapter, serves a `/metrics` endpoint for each of
//! `feed-bus` and `ems-core`, and relays one client connection's orders
//! and statuses over a Unix domain socket until `SIGINT`/`SIGTERM`.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use ems_bins::common::{init_logging, install_panic_handler, CommonArgs};
use ems_core::config::EmsConfig;
use ems_core::message::{BrokerdCancel, BrokerdEvent, BrokerdOrder, Order};
use ems_core::metrics::{EmsMetrics, MetricsServer as EmsMetricsServer, MetricsServerConfig as EmsMetricsServerConfig};
use ems_core::mock_adapter::MockAdapter;
use ems_core::paper::run_paper_engine;
use ems_core::session::{spawn_session, SessionConfig, SessionHandle};
use feed_bus::bus::FeedBus;
use feed_bus::metrics::{MetricsRegistry, MetricsServer as FeedMetricsServer, MetricsServerConfig as FeedMetricsServerConfig};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::sync::Notify;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let args = CommonArgs::parse();
    let config = EmsConfig::load(&args.config)
        .with_context(|| format!("loading config from {}", args.config))?;

    init_logging(args.log_level.as_deref().unwrap_or(&config.log_level))?;
    install_panic_handler();

    info!(config = %args.config, "emsd starting");

    let shutdown = Arc::new(Notify::new());
    let shutdown_ctrlc = shutdown.clone();
    ctrlc::set_handler(move || {
        warn!("received shutdown signal, draining sessions");
        shutdown_ctrlc.notify_waiters();
    })?;

    let feed_bus = Arc::new(FeedBus::new(Path::new(&config.feed.shm_dir).to_path_buf()));
    let feed_metrics = Arc::new(MetricsRegistry::new().context("building feed-bus metrics registry")?);
    let ems_metrics = Arc::new(EmsMetrics::new().context("building ems metrics registry")?);

    tokio::spawn(
        FeedMetricsServer::new(
            FeedMetricsServerConfig { listen_addr: config.metrics.listen_addr, metrics_path: config.metrics.path.clone() },
            feed_metrics,
        )
        .serve(),
    );
    tokio::spawn(
        EmsMetricsServer::new(EmsMetricsServerConfig::default(), ems_metrics.clone()).serve(),
    );

    let mut sessions = Vec::new();
    for entry in &config.symbols {
        let adapter = Arc::new(MockAdapter::new(entry.broker.clone()));
        seed_demo_quotes(&adapter, &entry.symbol);

        let (order_tx, order_rx) = tokio::sync::mpsc::channel::<BrokerdOrder>(64);
        let (cancel_tx, cancel_rx) = tokio::sync::mpsc::channel::<BrokerdCancel>(64);
        let (event_tx, event_rx) = tokio::sync::mpsc::channel::<BrokerdEvent>(64);
        tokio::spawn(run_paper_engine(order_rx, cancel_rx, event_tx));

        let handle = spawn_session(
            SessionConfig {
                broker: entry.broker.clone(),
                symbol: entry.symbol.clone(),
                min_tick: entry.min_tick,
                rate_hz: config.feed.rate_hz,
                initial_positions: Vec::new(),
                metrics: Some(ems_metrics.clone()),
            },
            feed_bus.clone(),
            adapter,
            order_tx,
            cancel_tx,
            event_rx,
        )
        .await
        .with_context(|| format!("opening session for {}.{}", entry.broker, entry.symbol))?;

        info!(broker = %entry.broker, symbol = %entry.symbol, "session ready");
        sessions.push(handle);
    }

    let listener = UnixListener::bind(&config.listen.socket_path)
        .with_context(|| format!("binding unix socket at {}", config.listen.socket_path))?;
    info!(path = %config.listen.socket_path, "listening for client connections");

    // One connection at a time, relayed to the first configured session --
    // a full multi-client router is out of scope for this demo daemon.
    let Some(session) = sessions.into_iter().next() else {
        anyhow::bail!("no sessions configured");
    };

    tokio::select! {
        result = serve_one_client(listener, session) => result?,
        _ = shutdown.notified() => info!("shutdown complete"),
    }

    Ok(())
}

async fn serve_one_client(listener: UnixListener, mut session: SessionHandle) -> Result<()> {
    let (stream, _addr) = listener.accept().await.context("accepting client connection")?;
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    for position in &session.positions {
        let line = serde_json::to_string(position)?;
        write_half.write_all(line.as_bytes()).await?;
        write_half.write_all(b"\n").await?;
    }

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match serde_json::from_str::<Order>(&line) {
                    Ok(order) => {
                        if session.client_cmd_tx.send(order).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "malformed client order, ignoring"),
                }
            }
            status = session.status_rx.recv() => {
                let Some(status) = status else { break };
                let line = serde_json::to_string(&status)?;
                write_half.write_all(line.as_bytes()).await?;
                write_half.write_all(b"\n").await?;
            }
        }
    }

    Ok(())
}

/// Without a real venue wired up, emsd seeds each session's feed with a
/// short synthetic walk so the demo has something to trigger against.
fn seed_demo_quotes(adapter: &Arc<MockAdapter>, symbol: &str) {
    use feed_bus::adapter::{Quote, TickType};
    use rand::Rng;

    let mut rng = rand::thread_rng();
    let mut last = 100.0;
    let mut quotes = Vec::with_capacity(64);
    for i in 0..64 {
        last += rng.gen_range(-0.25..0.25);
        quotes.push(Quote {
            symbol: symbol.to_string(),
            time_ns: i * 1_000_000_000,
            bid: last - 0.01,
            bid_size: 10.0,
            ask: last + 0.01,
            ask_size: 10.0,
            last,
            last_size: 10.0,
            ticks: vec![TickType::Last { price: last }],
        });
    }
    adapter.push_quotes(quotes);
}
