//! Chooses how an archive reaches the layer service.

use anyhow::Result;
use serde::Serialize;
use std::fmt;

use crate::error::LayerError;

/// Largest archive the layer service accepts inline in a publish request:
/// 50 MiB.
pub const DEFAULT_DIRECT_UPLOAD_LIMIT: u64 = 50 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Route {
    /// Archive bytes go inline in the publish request
    Direct,
    /// Archive is uploaded to the blob store first and published by reference
    Staged,
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::Direct => write!(f, "direct"),
            Route::Staged => write!(f, "staged"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeRouter {
    threshold: u64,
}

impl Default for SizeRouter {
    fn default() -> Self {
        Self::new(DEFAULT_DIRECT_UPLOAD_LIMIT)
    }
}

impl SizeRouter {
    pub fn new(threshold: u64) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    /// Archives up to and including the threshold go direct.
    pub fn route(&self, size: u64) -> Route {
        if size <= self.threshold {
            Route::Direct
        } else {
            Route::Staged
        }
    }
}

/// Parses a byte count such as `52428800`, `50MiB`, `50MB` or `512k`.
///
/// Both decimal-looking and binary suffixes are read as powers of 1024,
/// matching how the service documents its limit.
pub fn parse_size(input: &str) -> Result<u64> {
    let text = input.trim();
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (digits, unit) = text.split_at(split);

    let invalid = || LayerError::Validation(format!("invalid size '{}'", input));
    let value: u64 = digits.parse().map_err(|_| invalid())?;

    let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" | "kib" => 1024,
        "m" | "mb" | "mib" => 1024 * 1024,
        "g" | "gb" | "gib" => 1024 * 1024 * 1024,
        _ => return Err(invalid().into()),
    };

    value
        .checked_mul(multiplier)
        .ok_or_else(|| invalid().into())
}
