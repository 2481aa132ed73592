//! Attachment reaper.
//!
//! Deletes a message's attachment manifest and the blobs it references.
//! Object-store and manifest failures are logged and swallowed: a failed
//! reap never blocks termination of the message, and leftovers are upstream
//! garbage collection's problem, never retried in-band.

use tracing::{info, warn};

use crate::objects::ObjectStore;
use crate::queue::store::SideState;

/// Reap the attachments for a correlation id: delete the blobs, then the
/// manifest entry. A missing manifest is a no-op.
pub async fn reap(state: &SideState, objects: &ObjectStore, hex: &str) {
    let files = match state.load_attachments(hex).await {
        Ok(Some(files)) => files,
        Ok(None) => return,
        Err(error) => {
            warn!(hex = hex, error = %error, "attachment_manifest_load_failed");
            return;
        }
    };

    if !files.is_empty() {
        let keys: Vec<String> = files.iter().map(|f| f.key.clone()).collect();
        match objects.delete_all(&keys).await {
            Ok(count) => info!(hex = hex, blobs = count, "attachments_deleted"),
            Err(error) => {
                warn!(hex = hex, error = %error, "attachment_blob_delete_failed");
            }
        }
    }

    if let Err(error) = state.delete_attachments_entry(hex).await {
        warn!(hex = hex, error = %error, "attachment_manifest_delete_failed");
    }
}
