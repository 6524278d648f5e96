//! Shapes shared between the repository and its callers.
//!
//! Keep these focused on what queries take and return; interpretation of the
//! values belongs to higher layers.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

static IDENT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

/// A table or column name that is safe to splice into SQL text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlIdent(String);

impl SqlIdent {
    pub fn parse(raw: &str) -> Option<Self> {
        IDENT_RE.is_match(raw).then(|| Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SqlIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier column value as stored: SQLite storage class plus text form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawIdentifier {
    pub kind: String,
    pub raw: String,
}

/// Optional fields written alongside an upsert.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserChanges {
    pub expiry_date: Option<DateTime<Utc>>,
    pub interval_time: Option<i64>,
}
