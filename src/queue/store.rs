//! Side-band state store.
//!
//! Everything that lives next to the streams in Redis: dedup presence
//! markers, attachment manifests, the dead-letter list, and the stream
//! bookkeeping commands (ack/remove, retry enqueue). Every operation is a
//! single round-trip on the shared command connection; no cross-key
//! transactions are assumed.
//!
//! ## Keys
//!
//! ```text
//! streams:<hex>      dedup presence marker
//! attachments:<hex>  hash, field `files` = JSON [{name, key, filename}]
//! failed             append-only dead-letter list
//! messages           primary stream
//! retry_queue        retry stream
//! ```

use anyhow::{Context, Result};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::mode::RETRY_STREAM;
use crate::queue::codec::Message;

/// One attachment blob referenced by a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub name: String,
    /// Object-store key of the blob
    pub key: String,
    pub filename: String,
}

/// Terminal-failure record appended to the dead-letter list. Carries the
/// minimal set needed for offline inspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedRecord {
    pub hex: String,
    pub form_id: String,
    /// Serialized JSON array of submitted fields
    pub fields: String,
    pub origin: String,
    pub attachment_count: u32,
    pub error: String,
}

impl FailedRecord {
    /// Build a dead-letter record from a decoded message.
    pub fn from_message(msg: &Message, error: impl Into<String>) -> Self {
        FailedRecord {
            hex: msg.hex.clone(),
            form_id: msg.form_id.clone(),
            fields: msg.fields_json(),
            origin: msg.origin.clone(),
            attachment_count: msg.attachment_count,
            error: error.into(),
        }
    }
}

/// Handle over the Redis command connection, bound to this process's
/// consumer group.
#[derive(Clone)]
pub struct SideState {
    conn: MultiplexedConnection,
    group: String,
}

impl SideState {
    pub fn new(conn: MultiplexedConnection, group: impl Into<String>) -> Self {
        SideState {
            conn,
            group: group.into(),
        }
    }

    /// Drop the upstream dedup marker for this correlation id.
    pub async fn delete_dedup(&self, hex: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .del(format!("streams:{hex}"))
            .await
            .context("DEL dedup key failed")?;
        Ok(())
    }

    /// Load the attachment manifest for this correlation id, if one exists.
    pub async fn load_attachments(&self, hex: &str) -> Result<Option<Vec<AttachmentRef>>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .hget(format!("attachments:{hex}"), "files")
            .await
            .context("HGET attachment manifest failed")?;

        match raw {
            None => Ok(None),
            Some(json) => {
                let files: Vec<AttachmentRef> =
                    serde_json::from_str(&json).context("attachment manifest is not valid JSON")?;
                Ok(Some(files))
            }
        }
    }

    /// Remove the attachment manifest entry. The blobs themselves are the
    /// reaper's problem.
    pub async fn delete_attachments_entry(&self, hex: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .del(format!("attachments:{hex}"))
            .await
            .context("DEL attachment manifest failed")?;
        Ok(())
    }

    /// Append a terminal failure to the dead-letter list.
    pub async fn append_failed(&self, record: &FailedRecord) -> Result<()> {
        let payload = serde_json::to_string(record).context("failed to serialize dead-letter record")?;
        let mut conn = self.conn.clone();
        let len: i64 = conn
            .rpush("failed", payload)
            .await
            .context("RPUSH to dead-letter list failed")?;

        info!(
            hex = %record.hex,
            form_id = %record.form_id,
            error = %record.error,
            dead_letter_length = len,
            "dead_letter_appended"
        );
        Ok(())
    }

    /// Acknowledge an entry to the consumer group and remove it from the
    /// stream. Two round-trips; an entry acked but not yet deleted is
    /// harmless (it is no longer pending for any consumer).
    pub async fn ack_and_remove(&self, stream: &str, entry_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .xack(stream, &self.group, &[entry_id])
            .await
            .context("XACK failed")?;
        let _: i64 = conn.xdel(stream, &[entry_id]).await.context("XDEL failed")?;
        Ok(())
    }

    /// Append a retry envelope for this message. The stream assigns a fresh
    /// entry id; the original id travels in the `source_id` payload field.
    pub async fn enqueue_retry(&self, msg: &Message, next_fail_count: u32) -> Result<String> {
        let pairs = msg.retry_pairs(next_fail_count);
        let mut conn = self.conn.clone();
        let id: String = conn
            .xadd(RETRY_STREAM, "*", &pairs)
            .await
            .context("XADD to retry stream failed")?;

        info!(
            hex = %msg.hex,
            source_id = %msg.id,
            retry_id = %id,
            fail_count = next_fail_count,
            "retry_enqueued"
        );
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::codec::Field;

    #[test]
    fn test_failed_record_from_message() {
        let msg = Message {
            id: "1-0".into(),
            hex: "abcd".into(),
            form_id: "frm_9".into(),
            origin: "web".into(),
            fields: vec![Field {
                name: "email".into(),
                value: "x@y.example".into(),
            }],
            attachment_count: 2,
            fail_count: 0,
        };

        let record = FailedRecord::from_message(&msg, "form not found");
        assert_eq!(record.hex, "abcd");
        assert_eq!(record.attachment_count, 2);
        assert_eq!(record.error, "form not found");
        assert!(record.fields.contains("x@y.example"));
    }

    #[test]
    fn test_failed_record_serialization() {
        let record = FailedRecord {
            hex: "abcd".into(),
            form_id: "frm_9".into(),
            fields: "[]".into(),
            origin: "web".into(),
            attachment_count: 0,
            error: "max retries reached".into(),
        };

        let json = serde_json::to_string(&record).unwrap();
        let parsed: FailedRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.error, "max retries reached");
        assert_eq!(parsed.form_id, "frm_9");
    }

    #[test]
    fn test_attachment_ref_manifest_parse() {
        let json = r#"[
            {"name":"resume","key":"abcd/resume.pdf","filename":"resume.pdf"},
            {"name":"photo","key":"abcd/photo.png","filename":"photo.png"}
        ]"#;
        let files: Vec<AttachmentRef> = serde_json::from_str(json).unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].key, "abcd/resume.pdf");
        assert_eq!(files[1].filename, "photo.png");
    }
}
