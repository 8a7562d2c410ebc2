//! Per-item outcome classification for store responses.

/// Error type the store reports when its write queues are saturated.
pub const OVERLOAD_ERROR_TYPE: &str = "es_rejected_execution_exception";

/// Status the store uses for "too many requests".
pub const TOO_MANY_REQUESTS: u16 = 429;

/// Status returned when a `create` hits an existing document id.
pub const CONFLICT: u16 = 409;

/// What the caller must do with one event after the store answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetryDecision {
    /// Stored. Remove from the failure set.
    Accepted,
    /// Store overloaded or failing. Hand back to the caller for redelivery.
    Retryable,
    /// The payload itself is unacceptable. Drop and log.
    Permanent,
}

impl RetryDecision {
    pub const fn is_retryable(self) -> bool {
        matches!(self, RetryDecision::Retryable)
    }
}

/// Classify one item status.
///
/// `overload` marks an explicit saturation signal from the store, which turns
/// an otherwise permanent 4xx into a retry.
pub const fn classify(status: u16, overload: bool) -> RetryDecision {
    if status < 300 {
        RetryDecision::Accepted
    } else if status >= 500 || status == TOO_MANY_REQUESTS || overload {
        RetryDecision::Retryable
    } else {
        RetryDecision::Permanent
    }
}

/// Classify an item whose status may have been unreadable.
pub fn classify_item(status: Option<u16>, error_type: Option<&str>) -> RetryDecision {
    match status {
        Some(status) => classify(status, error_type == Some(OVERLOAD_ERROR_TYPE)),
        None => RetryDecision::Retryable,
    }
}
