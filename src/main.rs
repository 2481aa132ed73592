//! formpost-mailer - durable email-dispatch worker.
//!
//! One binary, two personalities: the primary mailer consumes fresh form
//! submissions from the `messages` stream; `--retrier` consumes the
//! `retry_queue` stream with per-entry delays. See the library docs for the
//! full data flow.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use formpost_mailer::{consumer, context, Config, Mode};

#[derive(Debug, Parser)]
#[command(name = "formpost-mailer", version, about = "Durable email-dispatch worker for form submissions")]
struct Cli {
    /// Consume the retry queue instead of the primary message stream
    #[arg(long)]
    retrier: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize structured JSON logging; DEBUG=true lowers the default
    // filter, RUST_LOG still wins when set.
    let default_filter = match std::env::var("DEBUG").as_deref() {
        Ok("true") | Ok("1") | Ok("yes") => "debug",
        _ => "info",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    let mode = Mode::from_flag(cli.retrier);
    info!(mode = mode.label(), "worker_starting");

    let config = Config::from_env().context("configuration error")?;
    info!(
        stream = mode.stream(),
        batch_size = config.batch_size,
        block_secs = config.block_secs,
        retry_interval_min = config.retry_interval_min,
        max_retries = config.max_retries,
        smtp_pool = config.smtp.pool,
        "config_loaded"
    );

    let (ctx, reader) = context::bootstrap(config, mode).await?;

    let result = consumer::run(ctx.clone(), mode, reader).await;

    context::shutdown(&ctx).await;

    result
}
