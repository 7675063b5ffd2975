//! Validated SQL identifiers.
//!
//! Schema, table, column and index names are spliced into DDL text because
//! Postgres cannot bind identifiers as parameters. Every name that reaches a
//! statement therefore goes through [`Ident::new`] first and is always
//! rendered double-quoted.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Postgres silently truncates identifiers longer than this many bytes.
pub const PG_IDENT_MAX: usize = 63;

/// Reasons an identifier is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentError {
    #[error("identifier is empty")]
    Empty,

    #[error("identifier '{ident}' is {len} bytes, limit is {PG_IDENT_MAX}")]
    TooLong { ident: String, len: usize },

    #[error("identifier '{ident}' must start with a letter or underscore")]
    InvalidStart { ident: String },

    #[error("identifier '{ident}' contains invalid character {ch:?}")]
    InvalidChar { ident: String, ch: char },
}

/// A SQL identifier restricted to `[A-Za-z_][A-Za-z0-9_]*`, at most 63 bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ident(String);

impl Ident {
    /// Validate `raw` as an identifier.
    ///
    /// # Errors
    /// Returns [`IdentError`] when the name is empty, too long, or contains
    /// characters outside the allow-list.
    pub fn new(raw: impl Into<String>) -> Result<Self, IdentError> {
        let raw = raw.into();
        let mut chars = raw.chars();
        let Some(first) = chars.next() else {
            return Err(IdentError::Empty);
        };
        if raw.len() > PG_IDENT_MAX {
            return Err(IdentError::TooLong {
                len: raw.len(),
                ident: raw,
            });
        }
        if !(first.is_ascii_alphabetic() || first == '_') {
            return Err(IdentError::InvalidStart { ident: raw });
        }
        if let Some(ch) = chars.find(|c| !(c.is_ascii_alphanumeric() || *c == '_')) {
            return Err(IdentError::InvalidChar { ident: raw, ch });
        }
        Ok(Self(raw))
    }

    /// Wrap a name known to be valid at compile time.
    pub(crate) fn trusted(raw: &str) -> Self {
        debug_assert!(Self::new(raw).is_ok(), "invalid built-in identifier {raw}");
        Self(raw.to_owned())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The identifier wrapped in double quotes, ready for SQL text.
    #[must_use]
    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.0)
    }

    /// `"schema"."name"`
    #[must_use]
    pub fn qualify(&self, name: &Ident) -> String {
        format!("{}.{}", self.quoted(), name.quoted())
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Ident {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for Ident {
    type Err = IdentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Ident {
    type Error = IdentError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for Ident {
    type Error = IdentError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Ident> for String {
    fn from(value: Ident) -> Self {
        value.0
    }
}
