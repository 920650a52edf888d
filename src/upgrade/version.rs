//! Dotted-integer release versions.
//!
//! Release tags are compared as integer tuples, so `1.10.0` is newer than
//! `1.2.0`. Comparison is lexicographic over the components, which means a
//! shorter version that is a prefix of a longer one sorts first
//! (`1.2 < 1.2.0`).

use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// An ordered sequence of non-negative integers, e.g. `v1.2.3` → `(1, 2, 3)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    parts: Vec<u64>,
}

impl Version {
    /// Build a version from its components.
    ///
    /// # Errors
    ///
    /// Returns an error if `parts` is empty.
    pub fn from_parts(parts: Vec<u64>) -> Result<Self> {
        if parts.is_empty() {
            return Err(Error::Parse("version has no components".to_string()));
        }
        Ok(Self { parts })
    }

    /// Parse a dotted version string with an optional `v`/`V` prefix.
    ///
    /// Surrounding whitespace is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Parse`] for empty input, empty components, or
    /// components that are not non-negative integers.
    pub fn parse(input: &str) -> Result<Self> {
        let digits = strip_tag_prefix(input);

        if digits.is_empty() {
            return Err(Error::Parse(format!("empty version string: {input:?}")));
        }

        let parts = digits
            .split('.')
            .map(|part| {
                if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(Error::Parse(format!(
                        "invalid version component {part:?} in {input:?}"
                    )));
                }
                part.parse::<u64>()
                    .map_err(|e| Error::Parse(format!("invalid version {input:?}: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { parts })
    }

    /// The integer components.
    #[must_use]
    pub fn parts(&self) -> &[u64] {
        &self.parts
    }

    /// Version of the running build.
    ///
    /// Used when no version marker exists on disk yet.
    #[must_use]
    pub fn build() -> Self {
        Self::parse(env!("CARGO_PKG_VERSION")).unwrap_or_else(|_| Self { parts: vec![0] })
    }
}

/// The version text of a release tag: surrounding whitespace and one
/// leading `v`/`V` removed, digits left as published (`v1.02.3` → `1.02.3`).
#[must_use]
pub fn strip_tag_prefix(tag: &str) -> &str {
    let trimmed = tag.trim();
    trimmed
        .strip_prefix('v')
        .or_else(|| trimmed.strip_prefix('V'))
        .unwrap_or(trimmed)
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for part in &self.parts {
            if !first {
                f.write_str(".")?;
            }
            write!(f, "{part}")?;
            first = false;
        }
        Ok(())
    }
}
