//! Change detection against the hash store

use sha2::{Digest, Sha256};
use std::path::Path;

use crate::store::HashMapping;

/// How a resolved secret compares to what was last applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    /// Never applied before
    New,
    /// Content differs from the last applied digest
    Changed,
    /// Same content; metadata and symlinks are still re-asserted
    Unchanged,
}

impl Change {
    pub fn as_str(&self) -> &'static str {
        match self {
            Change::New => "new",
            Change::Changed => "changed",
            Change::Unchanged => "unchanged",
        }
    }

    /// Whether the content has to be written
    pub fn needs_write(&self) -> bool {
        !matches!(self, Change::Unchanged)
    }
}

/// SHA-256 of secret content, hex encoded
pub fn content_digest(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

/// Classify a secret by comparing its digest with the stored record
///
/// A matching digest whose destination file has gone missing counts as
/// changed, so the file is written again.
pub fn classify(stored: &HashMapping, name: &str, digest: &str, destination: &Path) -> Change {
    match stored.get(name) {
        None => Change::New,
        Some(record) if record.hash != digest => Change::Changed,
        Some(_) if !destination.is_file() => Change::Changed,
        Some(_) => Change::Unchanged,
    }
}
