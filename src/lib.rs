//! formpost-mailer - durable email-dispatch worker for form submissions.
//!
//! Consumes form-submission events from Redis Streams, renders them through
//! per-form templates into SMTP messages, and delivers them with a staged
//! retry pipeline and a terminal dead-letter sink.
//!
//! ## Architecture
//!
//! ```text
//! messages → consumer → codec → executor → render → smtp
//!                                   │
//!             transient failures → retry_queue → consumer (--retrier)
//!
//! side state: streams:<hex>  attachments:<hex>  failed
//! ```
//!
//! The same binary runs both personalities; `--retrier` flips the stream,
//! the consumer group, the reclamation threshold, and the dispatch policy.

pub mod attachments;
pub mod config;
pub mod consumer;
pub mod context;
pub mod executor;
pub mod forms;
pub mod mail;
pub mod mode;
pub mod objects;
pub mod queue;
pub mod retry;

// Re-export commonly used types
pub use config::Config;
pub use context::AppContext;
pub use forms::{FormRecord, Handler};
pub use mail::{Mailer, RenderedMail, SendOutcome};
pub use mode::Mode;
pub use queue::{Field, Message, SideState};
