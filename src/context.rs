//! Process lifecycle: bootstrap and graceful shutdown.
//!
//! Backing-store clients are initialized once here and handed to the
//! consumer loop and executor as a context value, never as ambient state.
//! The side-state layer gets two connections: one dedicated to blocking
//! stream reads, one for commands issued while a read is outstanding.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::info;

use crate::config::Config;
use crate::forms::FormsClient;
use crate::mail::Mailer;
use crate::mode::Mode;
use crate::objects::ObjectStore;
use crate::queue::store::SideState;

/// Shared handles over every backing service. Cheap to clone; every client
/// inside is internally safe for concurrent use.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<Config>,
    pub state: SideState,
    pub forms: FormsClient,
    pub objects: ObjectStore,
    pub mailer: Mailer,
}

/// Connect to every backing service, verify the target stream exists, and
/// return the context plus the dedicated stream-read connection.
///
/// Any failure here is fatal; the process must not consume entries it
/// cannot terminate properly.
pub async fn bootstrap(
    config: Config,
    mode: Mode,
) -> Result<(AppContext, MultiplexedConnection)> {
    let config = Arc::new(config);

    // Side-state store first: one connection for blocking reads, one for
    // commands issued while a read is outstanding.
    let redis_client =
        redis::Client::open(config.redis_url.as_str()).context("invalid REDIS_URL")?;

    let reader = redis_client
        .get_multiplexed_async_connection()
        .await
        .context("failed to connect to Redis (reader)")?;
    let commands = redis_client
        .get_multiplexed_async_connection()
        .await
        .context("failed to connect to Redis (commands)")?;
    info!("redis_connected");

    // The stream must already exist; this worker never creates it.
    let mut probe = commands.clone();
    let stream_exists: bool = probe
        .exists(mode.stream())
        .await
        .context("failed to probe target stream")?;
    if !stream_exists {
        bail!("target stream {:?} does not exist", mode.stream());
    }
    info!(stream = mode.stream(), "stream_verified");

    let http = reqwest::Client::builder()
        .build()
        .context("failed to create HTTP client")?;

    let forms = FormsClient::new(
        http.clone(),
        &config.pocketbase_url,
        &config.pocketbase_email,
        &config.pocketbase_pass,
    );
    forms.authenticate().await?;

    let objects = ObjectStore::connect(&config.minio);
    objects.healthcheck().await?;

    let mailer = Mailer::connect(&config.smtp, &http).await?;
    mailer.healthcheck().await?;

    let state = SideState::new(commands, mode.group());

    info!(mode = mode.label(), "bootstrap_complete");

    Ok((
        AppContext {
            config,
            state,
            forms,
            objects,
            mailer,
        },
        reader,
    ))
}

/// Graceful teardown: close the SMTP transport, drop the PocketBase auth
/// token, then let the Redis connections drop with the context.
pub async fn shutdown(ctx: &AppContext) {
    ctx.mailer.close().await;
    ctx.forms.clear_auth().await;
    info!("shutdown_complete");
}
