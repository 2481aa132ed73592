//! Mail rendering and SMTP delivery.

pub mod render;
pub mod smtp;

pub use render::{render, render_otp, RenderError, RenderedMail};
pub use smtp::{Mailer, SendOutcome};
