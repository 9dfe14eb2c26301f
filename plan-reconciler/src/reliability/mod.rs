//! Reliability patterns for reconciliation.
//!
//! Provides bounded retry with exponential backoff for storage and
//! notification calls.

mod retry;

pub use retry::{Backoff, RetryPolicy, is_retryable, retry_with_backoff};
