//! Delivery policy: how hard `send_to` tries before giving up.
//!
//! The TCP send path is best-effort by design – there is no queue and no
//! acknowledgment. What *is* configurable is the number of
//! reconnect-and-retry rounds after a write fails on a pooled connection.
//! The shipped default is exactly one retry; a stronger policy
//! (queue + backoff) can be substituted by implementing this trait without
//! touching the pool or protocol code.

/// Retry behaviour for a failed send.
pub trait DeliveryPolicy: Send + Sync {
    /// Number of reconnect-and-resend rounds attempted after the first write
    /// on a pooled connection fails.
    fn reconnect_attempts(&self) -> u32;
}

/// The default policy: evict the broken connection, reconnect once, resend
/// once, then give up.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleRetry;

impl DeliveryPolicy for SingleRetry {
    fn reconnect_attempts(&self) -> u32 {
        1
    }
}

/// Fail immediately on the first write error. Used in tests and useful for
/// callers that layer their own retry on top.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl DeliveryPolicy for NoRetry {
    fn reconnect_attempts(&self) -> u32 {
        0
    }
}
