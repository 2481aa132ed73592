//! Stream-entry codec and side-band state store.
//!
//! ## Architecture
//!
//! ```text
//! messages / retry_queue  →  codec  →  Message  →  executor
//!                                          │
//!          streams:<hex> / attachments:<hex> / failed  (store)
//! ```

pub mod codec;
pub mod store;

pub use codec::{salvage_attachment_count, salvage_hex, DecodeError, Field, Message, OTP_SENTINEL};
pub use store::{AttachmentRef, FailedRecord, SideState};
