//! Replays a scripted quote/event file to stdout in the same newline-JSON
//! shape the EMS session's wire transport uses, for manual end-to-end
//! testing without a real venue (§6.1).
//!
//! Script format: one JSON object per line, each tagged `{"kind":"quote",
//! ...}` or `{"kind":"event", ...}` wrapping a [`Quote`] / [`BrokerdEvent`].

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use ems_bins::common::{init_logging, install_panic_handler};
use ems_core::message::BrokerdEvent;
use feed_bus::adapter::Quote;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Replays a scripted quote/event file as newline-delimited JSON")]
struct Args {
    /// Path to the script file (one JSON frame per line).
    #[arg(short, long)]
    script: PathBuf,

    /// Frames per second; omit to replay as fast as the reader can keep up.
    #[arg(long)]
    rate_hz: Option<f64>,

    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum ScriptFrame {
    Quote(Quote),
    Event(BrokerdEvent),
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level)?;
    install_panic_handler();

    let file = tokio::fs::File::open(&args.script)
        .await
        .with_context(|| format!("opening script file {}", args.script.display()))?;
    let mut lines = BufReader::new(file).lines();
    let mut stdout = tokio::io::stdout();

    let pacing = args.rate_hz.map(|hz| Duration::from_secs_f64(1.0 / hz));
    let mut frame_count = 0usize;

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ScriptFrame>(&line) {
            Ok(frame) => {
                let out = serde_json::to_string(&frame)?;
                stdout.write_all(out.as_bytes()).await?;
                stdout.write_all(b"\n").await?;
                frame_count += 1;
            }
            Err(e) => warn!(error = %e, %line, "skipping malformed script line"),
        }
        if let Some(delay) = pacing {
            tokio::time::sleep(delay).await;
        }
    }

    info!(frame_count, "script replay complete");
    Ok(())
}
