//! Stream consumer loop.
//!
//! This module owns the durable consumption protocol: idempotent consumer
//! group creation, startup reclamation of stalled entries, the blocking
//! read loop, and dispatch into the executor.
//!
//! ## Protocol
//!
//! 1. `XGROUP CREATE <stream> <group> 0` (BUSYGROUP tolerated)
//! 2. `XAUTOCLAIM` sweep from `0-0` with the mode's idle threshold,
//!    processing reclaimed entries before any new read
//! 3. `XREADGROUP GROUP <group> <consumer> COUNT n BLOCK ms STREAMS <stream> >`
//!    until shutdown
//!
//! Primary mode processes a batch strictly in order, one entry at a time.
//! Retry mode spawns a task per entry; each task sleeps its scheduled
//! delay, then runs the executor. Tasks are not tracked across shutdown;
//! unfinished ones are redelivered through the reclamation path.

use std::collections::HashMap;

use anyhow::{Context, Result};
use redis::aio::MultiplexedConnection;
use redis::streams::{
    StreamAutoClaimOptions, StreamAutoClaimReply, StreamId, StreamReadOptions, StreamReadReply,
};
use redis::AsyncCommands;
use tokio::signal;
use tracing::{error, info, warn};

use crate::attachments;
use crate::context::AppContext;
use crate::executor;
use crate::mode::Mode;
use crate::queue::codec::{self, Message};
use crate::queue::store::FailedRecord;
use crate::retry;

/// A stream entry before decoding: the engine-assigned id plus the flat
/// string pairs.
struct RawEntry {
    id: String,
    map: HashMap<String, String>,
}

/// Run the consumer loop until shutdown. Stream-read and connection errors
/// are fatal; everything per-entry is absorbed downstream.
pub async fn run(ctx: AppContext, mode: Mode, mut reader: MultiplexedConnection) -> Result<()> {
    let stream = mode.stream();
    let group = mode.group();
    let consumer = mode.consumer_name();

    create_group(&mut reader, stream, group).await?;
    reclaim_stalled(&ctx, mode, &mut reader, &consumer).await?;

    let batch_size = ctx.config.batch_size;
    let block_ms = ctx.config.block_secs * 1000;

    // Shutdown on SIGINT / SIGTERM
    let shutdown = async {
        let ctrl_c = async {
            signal::ctrl_c()
                .await
                .expect("Failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("Failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT"),
            _ = terminate => info!("Received SIGTERM"),
        }
    };

    tokio::pin!(shutdown);

    info!(
        stream = stream,
        group = group,
        consumer = %consumer,
        batch_size = batch_size,
        block_ms = block_ms,
        "consumer_ready"
    );

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("consumer_stopping");
                break;
            }
            batch = read_batch(&mut reader, stream, group, &consumer, batch_size, block_ms) => {
                // A read failure is a side-state disconnect: fatal.
                let entries = batch.context("stream read failed")?;
                for entry in entries {
                    dispatch(&ctx, mode, entry).await;
                }
            }
        }
    }

    info!("consumer_shutdown_complete");
    Ok(())
}

/// Create the consumer group anchored at the start of the stream. Racing
/// another process is fine; BUSYGROUP means it already exists.
async fn create_group(
    conn: &mut MultiplexedConnection,
    stream: &str,
    group: &str,
) -> Result<()> {
    let created: redis::RedisResult<String> = conn.xgroup_create(stream, group, "0").await;
    match created {
        Ok(_) => {
            info!(stream = stream, group = group, "consumer_group_created");
            Ok(())
        }
        Err(e) if e.code() == Some("BUSYGROUP") => {
            info!(stream = stream, group = group, "consumer_group_exists");
            Ok(())
        }
        Err(e) => Err(e).context("failed to create consumer group"),
    }
}

/// Startup-only sweep over the group's pending entries. Anything idle
/// longer than the mode's threshold is reassigned to this consumer and
/// processed before new reads.
async fn reclaim_stalled(
    ctx: &AppContext,
    mode: Mode,
    reader: &mut MultiplexedConnection,
    consumer: &str,
) -> Result<()> {
    let stream = mode.stream();
    let group = mode.group();
    let min_idle = mode.min_idle_ms();

    let mut cursor = "0-0".to_string();
    let mut reclaimed = 0usize;

    loop {
        let options = StreamAutoClaimOptions::default().count(ctx.config.batch_size);
        let reply: StreamAutoClaimReply = reader
            .xautoclaim_options(stream, group, consumer, min_idle as usize, &cursor, options)
            .await
            .context("XAUTOCLAIM failed")?;

        if reply.claimed.is_empty() && reply.next_stream_id == "0-0" {
            break;
        }

        for stream_id in reply.claimed {
            reclaimed += 1;
            dispatch(ctx, mode, raw_entry(stream_id)).await;
        }

        if reply.next_stream_id == "0-0" {
            break;
        }
        cursor = reply.next_stream_id;
    }

    info!(
        stream = stream,
        min_idle_ms = min_idle,
        reclaimed = reclaimed,
        "stalled_entries_reclaimed"
    );
    Ok(())
}

/// Long-poll for entries never delivered to this group.
async fn read_batch(
    conn: &mut MultiplexedConnection,
    stream: &str,
    group: &str,
    consumer: &str,
    count: usize,
    block_ms: u64,
) -> Result<Vec<RawEntry>> {
    let options = StreamReadOptions::default()
        .group(group, consumer)
        .count(count)
        .block(block_ms as usize);

    let reply: Option<StreamReadReply> = conn
        .xread_options(&[stream], &[">"], &options)
        .await
        .context("XREADGROUP failed")?;

    let mut entries = Vec::new();
    if let Some(reply) = reply {
        for key in reply.keys {
            for stream_id in key.ids {
                entries.push(raw_entry(stream_id));
            }
        }
    }
    Ok(entries)
}

/// Flatten a stream reply entry into string pairs. Non-string values are
/// skipped; the codec treats their keys as absent.
fn raw_entry(stream_id: StreamId) -> RawEntry {
    let mut map = HashMap::with_capacity(stream_id.map.len());
    for (key, value) in stream_id.map {
        if let Ok(text) = redis::from_redis_value::<String>(&value) {
            map.insert(key, text);
        }
    }
    RawEntry {
        id: stream_id.id,
        map,
    }
}

/// Route one raw entry: decode, then execute. Primary mode runs the
/// executor inline; retry mode spawns a delayed task per entry.
async fn dispatch(ctx: &AppContext, mode: Mode, entry: RawEntry) {
    let msg = match Message::decode(&entry.id, &entry.map) {
        Ok(msg) => msg,
        Err(decode_error) => {
            handle_malformed(ctx, mode, entry, &decode_error.to_string()).await;
            return;
        }
    };

    info!(
        entry_id = %msg.id,
        hex = %msg.hex,
        fail_count = msg.fail_count,
        "stream_entry_received"
    );

    if mode.is_retry() {
        let delay = retry::delay_for(msg.fail_count, ctx.config.retry_interval_min);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                info!(
                    entry_id = %msg.id,
                    hex = %msg.hex,
                    delay_secs = delay.as_secs(),
                    "retry_delay_start"
                );
                tokio::time::sleep(delay).await;
            }
            executor::execute(&ctx, mode, msg).await;
        });
    } else {
        executor::execute(ctx, mode, msg).await;
    }
}

/// A malformed entry never reaches the executor, but it still has to be
/// terminated: attachments reaped, dedup key dropped, raw payload
/// dead-lettered, entry acknowledged.
async fn handle_malformed(ctx: &AppContext, mode: Mode, entry: RawEntry, reason: &str) {
    error!(entry_id = %entry.id, error = reason, "stream_entry_malformed");

    let hex = codec::salvage_hex(&entry.map);
    let attachment_count = codec::salvage_attachment_count(&entry.map);

    if let Some(hex) = hex {
        attachments::reap(&ctx.state, &ctx.objects, hex).await;
        if let Err(error) = ctx.state.delete_dedup(hex).await {
            warn!(hex = hex, error = %error, "dedup_delete_failed");
        }
    }

    let record = FailedRecord {
        hex: hex.unwrap_or("").to_string(),
        form_id: entry.map.get("form_id").cloned().unwrap_or_default(),
        fields: entry.map.get("fields").cloned().unwrap_or_else(|| "[]".into()),
        origin: entry.map.get("origin").cloned().unwrap_or_default(),
        attachment_count,
        error: reason.to_string(),
    };
    if let Err(error) = ctx.state.append_failed(&record).await {
        warn!(entry_id = %entry.id, error = %error, "dead_letter_append_failed");
    }

    if let Err(error) = ctx.state.ack_and_remove(mode.stream(), &entry.id).await {
        warn!(entry_id = %entry.id, error = %error, "ack_failed");
    }
}
