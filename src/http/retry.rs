//! Error classification for requests to the layer service and blob store.
//!
//! Two separate questions are answered here:
//!
//! - may an idempotent request be sent again? ([`is_retryable`])
//! - could a failed request have taken effect remotely? ([`publish_error`])

use reqwest::StatusCode;

use crate::error::LayerError;

/// Maximum number of attempts for idempotent requests.
pub const MAX_RETRIES: usize = 3;

/// Delay between retry attempts in milliseconds.
pub const RETRY_DELAY_MS: u64 = 1000;

/// Responses that will not succeed when repeated.
#[derive(Debug)]
pub enum NonRetryableError {
    /// HTTP 401 or 403
    AuthenticationFailed(String),
    /// HTTP 404
    NotFound(String),
    /// Other 4xx except 408 and 429
    ClientError(String),
}

impl std::fmt::Display for NonRetryableError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NonRetryableError::AuthenticationFailed(msg) => {
                write!(
                    f,
                    "Authentication failed: {}. Check AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY and AWS_SESSION_TOKEN.",
                    msg
                )
            }
            NonRetryableError::NotFound(msg) => {
                write!(f, "Not found: {}", msg)
            }
            NonRetryableError::ClientError(msg) => {
                write!(f, "Request rejected: {}", msg)
            }
        }
    }
}

impl std::error::Error for NonRetryableError {}

/// A server-side or throttling response. Worth retrying when the request is
/// idempotent.
#[derive(Debug)]
pub struct ServerError {
    pub status: u16,
    pub message: String,
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HTTP {}: {}", self.status, self.message)
    }
}

impl std::error::Error for ServerError {}

/// Classifies a non-success status together with the service's message.
pub fn classify_status(status: StatusCode, message: String) -> anyhow::Error {
    let detail = format!("HTTP {}: {}", status.as_u16(), message);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            NonRetryableError::AuthenticationFailed(detail).into()
        }
        StatusCode::NOT_FOUND => NonRetryableError::NotFound(detail).into(),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => ServerError {
            status: status.as_u16(),
            message,
        }
        .into(),
        s if s.is_client_error() => NonRetryableError::ClientError(detail).into(),
        s => ServerError {
            status: s.as_u16(),
            message,
        }
        .into(),
    }
}

fn find<T: std::error::Error + 'static>(err: &anyhow::Error) -> Option<&T> {
    err.chain().find_map(|cause| cause.downcast_ref::<T>())
}

/// Whether an idempotent request that failed with `err` should be sent again.
pub fn is_retryable(err: &anyhow::Error) -> bool {
    if find::<NonRetryableError>(err).is_some() {
        return false;
    }
    // Builder errors (bad URL, bad header) fail identically every time
    !matches!(find::<reqwest::Error>(err), Some(e) if e.is_builder())
}

/// Whether the request behind `err` can be known not to have been processed.
fn definitely_not_processed(err: &anyhow::Error) -> bool {
    if find::<NonRetryableError>(err).is_some() {
        return true;
    }
    if let Some(server) = find::<ServerError>(err) {
        return server.status == StatusCode::TOO_MANY_REQUESTS.as_u16();
    }
    matches!(
        find::<reqwest::Error>(err),
        Some(e) if e.is_connect() || e.is_builder()
    )
}

/// Converts a transport failure into a publish error, flagging it ambiguous
/// when the service may have acted on the request.
pub fn publish_error(err: anyhow::Error) -> anyhow::Error {
    if crate::error::layer_error(&err).is_some() {
        return err;
    }
    let ambiguous = !definitely_not_processed(&err);
    LayerError::publish(format!("{:#}", err), ambiguous).into()
}

/// Pulls a human-readable message out of an AWS error body.
///
/// JSON services use `message` or `Message`; S3 uses `<Message>` in XML.
pub fn service_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        let message = value
            .get("message")
            .or_else(|| value.get("Message"))
            .and_then(|m| m.as_str());
        let kind = value
            .get("__type")
            .or_else(|| value.get("Type"))
            .and_then(|t| t.as_str());
        match (kind, message) {
            (Some(kind), Some(message)) => return format!("{}: {}", kind, message),
            (None, Some(message)) => return message.to_string(),
            _ => {}
        }
    }

    if let (Some(start), Some(end)) = (body.find("<Message>"), body.find("</Message>"))
        && start < end
    {
        return body[start + "<Message>".len()..end].to_string();
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        "no response body".to_string()
    } else {
        trimmed.chars().take(200).collect()
    }
}
