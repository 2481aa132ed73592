//! Operating-mode selection.
//!
//! The worker runs one of two personalities out of the same binary: the
//! primary mailer consuming fresh submissions, or the retrier consuming the
//! retry queue. The mode fixes the stream, consumer-group identity, the
//! idle threshold for stalled-entry reclamation, and whether dispatch is
//! delayed and concurrent.

/// Which stream this process consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Fresh submissions from the `messages` stream, processed sequentially.
    Primary,
    /// Previously failed sends from the `retry_queue` stream, each processed
    /// in its own delayed task.
    Retry,
}

/// Stream consumed by the primary mailer.
pub const PRIMARY_STREAM: &str = "messages";

/// Stream consumed by the retrier.
pub const RETRY_STREAM: &str = "retry_queue";

impl Mode {
    pub fn from_flag(retrier: bool) -> Self {
        if retrier {
            Mode::Retry
        } else {
            Mode::Primary
        }
    }

    pub fn stream(self) -> &'static str {
        match self {
            Mode::Primary => PRIMARY_STREAM,
            Mode::Retry => RETRY_STREAM,
        }
    }

    pub fn group(self) -> &'static str {
        match self {
            Mode::Primary => "mailer-group",
            Mode::Retry => "retrier-group",
        }
    }

    /// Consumer name within the group, unique per process.
    pub fn consumer_name(self) -> String {
        let pid = std::process::id();
        match self {
            Mode::Primary => format!("mailer-{pid}"),
            Mode::Retry => format!("retrier-{pid}"),
        }
    }

    /// Minimum idle time before a pending entry is reclaimed from another
    /// consumer. Retry entries sit in their scheduled delay for up to
    /// `MAILER_RETRIES * RETRY_INTERVAL` minutes, so the retrier threshold
    /// is much longer than the primary one.
    pub fn min_idle_ms(self) -> u64 {
        match self {
            Mode::Primary => 300_000,
            Mode::Retry => 5_400_000,
        }
    }

    pub fn is_retry(self) -> bool {
        matches!(self, Mode::Retry)
    }

    pub fn label(self) -> &'static str {
        match self {
            Mode::Primary => "mailer",
            Mode::Retry => "retrier",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_from_flag() {
        assert_eq!(Mode::from_flag(false), Mode::Primary);
        assert_eq!(Mode::from_flag(true), Mode::Retry);
    }

    #[test]
    fn test_primary_bindings() {
        let mode = Mode::Primary;
        assert_eq!(mode.stream(), "messages");
        assert_eq!(mode.group(), "mailer-group");
        assert!(mode.consumer_name().starts_with("mailer-"));
        assert_eq!(mode.min_idle_ms(), 300_000);
        assert!(!mode.is_retry());
    }

    #[test]
    fn test_retry_bindings() {
        let mode = Mode::Retry;
        assert_eq!(mode.stream(), "retry_queue");
        assert_eq!(mode.group(), "retrier-group");
        assert!(mode.consumer_name().starts_with("retrier-"));
        assert_eq!(mode.min_idle_ms(), 5_400_000);
        assert!(mode.is_retry());
    }
}
