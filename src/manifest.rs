//! Package manifest reader.
//!
//! A manifest is requirements-style UTF-8 text: one package declaration per
//! line, `#` comments, blank lines ignored. Declarations look like
//! `name[extra,...] <constraint>` where the constraint is a comma-separated
//! list of version clauses optionally followed by a `; marker`.

use anyhow::Result;
use log::{debug, warn};
use std::fmt;
use std::path::Path;

use crate::error::LayerError;
use crate::runtime::Runtime;

/// Version comparison operators, longest first so `===` wins over `==`.
const OPERATORS: [&str; 8] = ["===", "==", "~=", "!=", "<=", ">=", "<", ">"];

/// Origin label used for packages passed on the command line.
pub const INLINE_ORIGIN: &str = "<command line>";

/// One declared package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    /// Name as declared (case preserved)
    pub name: String,
    pub extras: Vec<String>,
    /// Version clauses and/or marker, e.g. `>=1.26,<2` or `; python_version < "3.12"`
    pub constraint: Option<String>,
}

impl Requirement {
    /// Parses a single declaration. Returns a human-readable reason on failure.
    pub fn parse(text: &str) -> std::result::Result<Self, String> {
        let text = text.trim();
        if text.starts_with('-') {
            return Err(format!(
                "pip options are not supported in a layer manifest: '{}'",
                text
            ));
        }

        let name_len = text
            .char_indices()
            .find(|(_, c)| !is_name_char(*c))
            .map(|(i, _)| i)
            .unwrap_or(text.len());
        let name = &text[..name_len];
        if !is_valid_name(name) {
            return Err(format!("'{}' is not a package declaration", text));
        }

        let mut rest = text[name_len..].trim_start();
        let mut extras = Vec::new();
        if let Some(after_bracket) = rest.strip_prefix('[') {
            let close = after_bracket
                .find(']')
                .ok_or_else(|| format!("unterminated extras in '{}'", text))?;
            for extra in after_bracket[..close].split(',') {
                let extra = extra.trim();
                if !is_valid_name(extra) {
                    return Err(format!("invalid extra '{}' in '{}'", extra, text));
                }
                extras.push(extra.to_string());
            }
            rest = after_bracket[close + 1..].trim_start();
        }

        let constraint = if rest.is_empty() {
            None
        } else {
            validate_constraint(rest).map_err(|reason| format!("{} in '{}'", reason, text))?;
            Some(rest.to_string())
        };

        Ok(Requirement {
            name: name.to_string(),
            extras,
            constraint,
        })
    }

    /// PEP 503 normalized name: lowercase, runs of `-`, `_`, `.` become `-`.
    pub fn normalized_name(&self) -> String {
        normalize_name(&self.name)
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if !self.extras.is_empty() {
            write!(f, "[{}]", self.extras.join(","))?;
        }
        match &self.constraint {
            Some(c) if c.starts_with(';') => write!(f, " {}", c),
            Some(c) => write!(f, "{}", c),
            None => Ok(()),
        }
    }
}

pub fn normalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_separator = false;
    for c in name.chars() {
        if matches!(c, '-' | '_' | '.') {
            pending_separator = true;
        } else {
            if pending_separator && !out.is_empty() {
                out.push('-');
            }
            pending_separator = false;
            out.push(c.to_ascii_lowercase());
        }
    }
    out
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')
}

fn is_valid_name(name: &str) -> bool {
    let first_ok = name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric());
    let last_ok = name.chars().last().is_some_and(|c| c.is_ascii_alphanumeric());
    first_ok && last_ok && name.chars().all(is_name_char)
}

fn validate_constraint(constraint: &str) -> std::result::Result<(), String> {
    let (versions, marker) = match constraint.split_once(';') {
        Some((v, m)) => (v.trim(), Some(m.trim())),
        None => (constraint.trim(), None),
    };

    if let Some(marker) = marker
        && marker.is_empty()
    {
        return Err("empty environment marker".to_string());
    }

    if versions.is_empty() {
        return if marker.is_some() {
            Ok(())
        } else {
            Err("empty constraint".to_string())
        };
    }

    for clause in versions.split(',') {
        let clause = clause.trim();
        let op = OPERATORS
            .iter()
            .find(|op| clause.starts_with(**op))
            .ok_or_else(|| format!("unexpected '{}' after package name", clause))?;
        let version = clause[op.len()..].trim();
        if version.is_empty() || version.contains(char::is_whitespace) {
            return Err(format!("invalid version in clause '{}'", clause));
        }
    }
    Ok(())
}

/// Removes a `#` comment that starts the line or follows whitespace.
fn strip_comment(line: &str) -> &str {
    let mut prev_whitespace = true;
    for (i, c) in line.char_indices() {
        if c == '#' && prev_whitespace {
            return &line[..i];
        }
        prev_whitespace = c.is_whitespace();
    }
    line
}

/// Raw manifest text plus a label naming where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestSource {
    pub origin: String,
    pub text: String,
}

impl ManifestSource {
    pub fn new(origin: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            text: text.into(),
        }
    }

    /// Reads a manifest file. Unreadable or non-UTF-8 files are manifest errors.
    #[tracing::instrument(skip(runtime))]
    pub fn from_file<R: Runtime>(runtime: &R, path: &Path) -> Result<Self> {
        let origin = path.display().to_string();
        let text = runtime.read_to_string(path).map_err(|e| {
            anyhow::Error::from(LayerError::InvalidManifest {
                source: origin.clone(),
                line: 0,
                reason: format!("cannot read manifest: {:#}", e),
            })
        })?;
        Ok(Self::new(origin, text))
    }

    /// Packages given directly on the command line, one per argument.
    pub fn inline(packages: &[String]) -> Self {
        Self::new(INLINE_ORIGIN, packages.join("\n"))
    }
}

/// Ordered, name-unique set of requirements. Immutable once read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageManifest {
    requirements: Vec<Requirement>,
}

impl PackageManifest {
    pub fn parse(origin: &str, text: &str) -> Result<Self> {
        Self::from_sources(&[ManifestSource::new(origin, text)])
    }

    /// Reads all sources in order. A name declared again, in the same or a
    /// later source, replaces the earlier declaration in place.
    pub fn from_sources(sources: &[ManifestSource]) -> Result<Self> {
        let mut requirements: Vec<Requirement> = Vec::new();

        for source in sources {
            let text = source.text.strip_prefix('\u{feff}').unwrap_or(&source.text);
            for (index, raw_line) in text.lines().enumerate() {
                let line = strip_comment(raw_line).trim();
                if line.is_empty() {
                    continue;
                }

                let requirement =
                    Requirement::parse(line).map_err(|reason| LayerError::InvalidManifest {
                        source: source.origin.clone(),
                        line: index + 1,
                        reason,
                    })?;

                let key = requirement.normalized_name();
                match requirements
                    .iter_mut()
                    .find(|r| r.normalized_name() == key)
                {
                    Some(existing) => {
                        warn!(
                            "Package '{}' declared more than once; using '{}' from {}:{} instead of '{}'",
                            requirement.name,
                            requirement,
                            source.origin,
                            index + 1,
                            existing
                        );
                        *existing = requirement;
                    }
                    None => {
                        debug!("Declared {}", requirement);
                        requirements.push(requirement);
                    }
                }
            }
        }

        if requirements.is_empty() {
            let origin = sources
                .iter()
                .map(|s| s.origin.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(LayerError::InvalidManifest {
                source: if origin.is_empty() {
                    INLINE_ORIGIN.to_string()
                } else {
                    origin
                },
                line: 0,
                reason: "no packages declared".to_string(),
            }
            .into());
        }

        Ok(Self { requirements })
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    pub fn len(&self) -> usize {
        self.requirements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    /// Declarations formatted for the installer command line.
    pub fn specifiers(&self) -> Vec<String> {
        self.requirements.iter().map(ToString::to_string).collect()
    }
}
