//! HTTP transport with retry and remote-failure classification.

mod client;
mod retry;

pub use client::{HttpClient, HttpRequest};
pub use retry::{MAX_RETRIES, NonRetryableError, is_retryable, publish_error, service_message};
