//! Error kinds surfaced by the packaging pipeline.
//!
//! Stages return `anyhow::Error` values; the kind that decides the process
//! exit code travels inside them as a [`LayerError`] and is recovered with
//! `downcast_ref`, so `.context(...)` can be layered freely on top.

use std::fmt;

/// Terminal error kinds of a packaging run.
#[derive(Debug)]
pub enum LayerError {
    /// A manifest line is not a package declaration
    InvalidManifest {
        source: String,
        line: usize,
        reason: String,
    },
    /// A declared package could not be located or installed
    Resolution(String),
    /// The archive could not be written or read
    Archive(String),
    /// The remote service failed or rejected the request.
    /// `ambiguous` is set when the request may have reached the service.
    Publish { message: String, ambiguous: bool },
    /// Input rejected before any network call
    Validation(String),
    /// The run was interrupted by the caller
    Cancelled,
}

impl LayerError {
    pub fn publish(message: impl Into<String>, ambiguous: bool) -> Self {
        LayerError::Publish {
            message: message.into(),
            ambiguous,
        }
    }

    /// Process exit code for this kind.
    pub fn exit_code(&self) -> u8 {
        match self {
            LayerError::InvalidManifest { .. } => 3,
            LayerError::Resolution(_) => 4,
            LayerError::Archive(_) => 5,
            LayerError::Publish { .. } => 6,
            LayerError::Validation(_) => 7,
            LayerError::Cancelled => 130,
        }
    }
}

impl fmt::Display for LayerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayerError::InvalidManifest {
                source,
                line: 0,
                reason,
            } => write!(f, "Invalid manifest {}: {}", source, reason),
            LayerError::InvalidManifest {
                source,
                line,
                reason,
            } => write!(f, "Invalid manifest {}:{}: {}", source, line, reason),
            LayerError::Resolution(msg) => write!(f, "Failed to resolve packages: {}", msg),
            LayerError::Archive(msg) => write!(f, "Failed to build archive: {}", msg),
            LayerError::Publish { message, ambiguous } => {
                if *ambiguous {
                    write!(
                        f,
                        "Publish failed: {}. The layer version may have been created; verify before retrying.",
                        message
                    )
                } else {
                    write!(f, "Publish failed: {}", message)
                }
            }
            LayerError::Validation(msg) => write!(f, "Invalid input: {}", msg),
            LayerError::Cancelled => write!(f, "Operation cancelled"),
        }
    }
}

impl std::error::Error for LayerError {}

/// Finds the [`LayerError`] carried by an error chain, if any.
pub fn layer_error(err: &anyhow::Error) -> Option<&LayerError> {
    err.chain().find_map(|cause| cause.downcast_ref::<LayerError>())
}

/// Exit code for an arbitrary error: the kind's code, or 1.
pub fn exit_code(err: &anyhow::Error) -> u8 {
    layer_error(err).map(LayerError::exit_code).unwrap_or(1)
}

/// Keeps an existing [`LayerError`] or wraps the failure into the kind
/// produced by `kind`. Used at stage boundaries so I/O errors take the
/// stage's kind.
pub fn classify(err: anyhow::Error, kind: impl FnOnce(String) -> LayerError) -> anyhow::Error {
    if layer_error(&err).is_some() {
        err
    } else {
        let message = format!("{:#}", err);
        anyhow::Error::from(kind(message))
    }
}
