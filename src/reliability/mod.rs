//! Redelivery policy for events the store could not take yet.

pub mod retry;

pub use retry::{Backoff, RetryConfig, RetryError, RetryStrategy};
