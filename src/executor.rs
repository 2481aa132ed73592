//! Attempt executor: render, send, classify, clean up.
//!
//! One call here is one delivery attempt for one decoded message. Every
//! error is absorbed at this boundary so a single bad entry never takes
//! down the consumer loop. Cleanup failures (dedup key, manifest, ack) are
//! logged and swallowed; at-least-once semantics cover anything a crash
//! leaves behind.

use tracing::{info, warn};

use crate::attachments;
use crate::context::AppContext;
use crate::forms::FormRecord;
use crate::mail::{self, SendOutcome};
use crate::mode::Mode;
use crate::queue::codec::{Message, OTP_SENTINEL};
use crate::queue::store::FailedRecord;
use crate::retry;

/// How an attempt terminated, for cleanup purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Termination {
    /// Delivered; the manifest stays intact for downstream consumers.
    Success,
    /// Terminal failure; attachments are reaped.
    Failed,
    /// Re-enqueued; attachments stay for the retry consumer.
    RetryEnqueued,
}

/// Execute one delivery attempt. Never returns an error; every outcome is
/// terminal for this delivery of the entry, or intentionally leaves the
/// entry pending for redelivery.
pub async fn execute(ctx: &AppContext, mode: Mode, msg: Message) {
    info!(
        entry_id = %msg.id,
        hex = %msg.hex,
        form_id = %msg.form_id,
        origin = %msg.origin,
        fail_count = msg.fail_count,
        mode = mode.label(),
        "message_processing"
    );

    // Form lookup. Absence is terminal; infrastructure trouble is not: the
    // entry stays pending and the reclamation path redelivers it.
    let form = match ctx.forms.form(&msg.form_id).await {
        Ok(Some(form)) => form,
        Ok(None) => {
            info!(hex = %msg.hex, form_id = %msg.form_id, "form_not_found");
            dead_letter(ctx, &msg, "form not found").await;
            finish(ctx, mode, &msg, false, Termination::Failed).await;
            return;
        }
        Err(error) => {
            warn!(hex = %msg.hex, form_id = %msg.form_id, error = %error, "form_lookup_failed");
            return;
        }
    };

    // Render; the OTP sentinel bypasses the template entirely.
    let rendered = if msg.hex == OTP_SENTINEL {
        let code = msg.fields.first().map(|f| f.value.as_str()).unwrap_or("");
        mail::render_otp(&form, code)
    } else {
        let attachment_url = attachment_url(ctx, &msg);
        mail::render(&form, &msg.fields, &msg.origin, attachment_url.as_deref())
    };

    let rendered = match rendered {
        Ok(rendered) => rendered,
        Err(error) => {
            warn!(hex = %msg.hex, form_id = %msg.form_id, error = %error, "render_failed");
            finish(ctx, mode, &msg, form.allow_duplicates, Termination::Failed).await;
            return;
        }
    };

    let gateway = form.handler.as_ref().and_then(|h| h.gateway.as_ref());
    let outcome = ctx.mailer.send(&rendered, &msg.hex, gateway).await;

    match outcome {
        SendOutcome::Delivered => {
            finish(ctx, mode, &msg, form.allow_duplicates, Termination::Success).await;
        }
        SendOutcome::Permanent => {
            finish(ctx, mode, &msg, form.allow_duplicates, Termination::Failed).await;
        }
        SendOutcome::Transient => {
            transient(ctx, mode, &msg, &form).await;
        }
    }
}

/// Transient send failure: enqueue a retry envelope, or dead-letter once
/// the retry cap is hit.
async fn transient(ctx: &AppContext, mode: Mode, msg: &Message, form: &FormRecord) {
    if mode.is_retry() && retry::retries_exhausted(msg.fail_count, ctx.config.max_retries) {
        info!(
            hex = %msg.hex,
            fail_count = msg.fail_count,
            max_retries = ctx.config.max_retries,
            "retries_exhausted"
        );
        dead_letter(ctx, msg, "max retries reached").await;
        finish(ctx, mode, msg, form.allow_duplicates, Termination::Failed).await;
        return;
    }

    let next_fail_count = if mode.is_retry() { msg.fail_count + 1 } else { 1 };

    match ctx.state.enqueue_retry(msg, next_fail_count).await {
        Ok(_) => {
            finish(ctx, mode, msg, form.allow_duplicates, Termination::RetryEnqueued).await;
        }
        Err(error) => {
            // Without the envelope the message would be lost on ack. Leave
            // the entry pending; reclamation redelivers it.
            warn!(hex = %msg.hex, error = %error, "retry_enqueue_failed");
        }
    }
}

/// Terminal cleanup. Dedup key goes whenever the form disallows duplicates
/// (retry enqueue included); the stream entry is always acknowledged and
/// removed; attachments are reaped only on failure so a retry consumer
/// still finds them.
async fn finish(
    ctx: &AppContext,
    mode: Mode,
    msg: &Message,
    allow_duplicates: bool,
    termination: Termination,
) {
    if !allow_duplicates {
        if let Err(error) = ctx.state.delete_dedup(&msg.hex).await {
            warn!(hex = %msg.hex, error = %error, "dedup_delete_failed");
        }
    }

    if let Err(error) = ctx.state.ack_and_remove(mode.stream(), &msg.id).await {
        warn!(entry_id = %msg.id, error = %error, "ack_failed");
    }

    if termination == Termination::Failed && msg.hex != OTP_SENTINEL {
        attachments::reap(&ctx.state, &ctx.objects, &msg.hex).await;
    }

    info!(
        entry_id = %msg.id,
        hex = %msg.hex,
        termination = ?termination,
        "message_terminated"
    );
}

async fn dead_letter(ctx: &AppContext, msg: &Message, reason: &str) {
    let record = FailedRecord::from_message(msg, reason);
    if let Err(error) = ctx.state.append_failed(&record).await {
        warn!(hex = %msg.hex, error = %error, "dead_letter_append_failed");
    }
}

/// Download link for the submission's attachment bundle; only when the
/// entry actually carries attachments.
fn attachment_url(ctx: &AppContext, msg: &Message) -> Option<String> {
    if msg.attachment_count == 0 {
        return None;
    }
    match &ctx.config.api_url {
        Some(base) => Some(format!("{base}/attachments/{}", msg.hex)),
        None => {
            warn!(hex = %msg.hex, "attachments present but API_URL is not configured");
            None
        }
    }
}
