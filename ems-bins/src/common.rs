//! Common utilities shared by both binaries: CLI parsing, logging setup,
//! and the panic hook, adapted from the teacher's `bog-bins::common`
//! (dropping the CPU-pinning/real-time-priority bits, which make no
//! sense for a channel-bound async service).

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Common CLI arguments for `emsd` and `mock-brokerd`.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct CommonArgs {
    /// Path to the runtime TOML config.
    #[arg(short, long, default_value = "config/ems.toml")]
    pub config: String,

    /// Overrides the config file's `log_level`.
    #[arg(short, long)]
    pub log_level: Option<String>,
}

/// Initializes `tracing`, honoring `RUST_LOG` over the configured level.
pub fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    Ok(())
}

/// Installs a panic hook that logs the panic location/message through
/// `tracing` before the process exits, so a crash shows up in the same
/// log stream as everything else.
pub fn install_panic_handler() {
    let default_hook = std::panic::take_hook();

    std::panic::set_hook(Box::new(move |panic_info| {
        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()))
            .unwrap_or_else(|| "<unknown location>".to_string());
        let message = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "<no message>".to_string()
        };

        tracing::error!(%location, %message, "PANIC: ems process crashed");
        default_hook(panic_info);
        std::process::exit(1);
    }));
}
