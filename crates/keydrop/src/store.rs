//! Hash store - last-applied content digests
//!
//! One JSON file mapping secret name to the digest of the content that was
//! last written and when. It is loaded once at the start of a run and
//! replaced atomically, at most once, at the end.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, Permissions};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::error::StoreError;

/// Digest and time of the last successful write of a secret
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HashRecord {
    pub hash: String,
    pub applied_at: DateTime<Utc>,
}

impl HashRecord {
    pub fn new(hash: impl Into<String>) -> Self {
        Self {
            hash: hash.into(),
            applied_at: Utc::now(),
        }
    }
}

/// Secret name -> record, ordered for stable output
pub type HashMapping = BTreeMap<String, HashRecord>;

/// The persisted hash store file
#[derive(Debug, Clone)]
pub struct HashStore {
    path: PathBuf,
}

impl HashStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the mapping; a missing file is an empty store
    pub fn load(&self) -> Result<HashMapping, StoreError> {
        let content = match fs::read(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMapping::new()),
            Err(source) => {
                return Err(StoreError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        serde_json::from_slice(&content).map_err(|source| StoreError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    /// Replace the persisted mapping with a same-directory temp file and rename
    pub fn commit(&self, mapping: &HashMapping) -> Result<(), StoreError> {
        let write_err = |source| StoreError::Write {
            path: self.path.clone(),
            source,
        };

        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent).map_err(write_err)?;

        let content = serde_json::to_vec_pretty(mapping)
            .map_err(|e| write_err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;

        let mut tmp = tempfile::Builder::new()
            .prefix(".hashes.")
            .suffix(".tmp")
            .tempfile_in(parent)
            .map_err(write_err)?;
        tmp.write_all(&content).map_err(write_err)?;
        tmp.as_file()
            .set_permissions(Permissions::from_mode(0o600))
            .map_err(write_err)?;
        tmp.as_file().sync_all().map_err(write_err)?;
        tmp.persist(&self.path).map_err(|e| write_err(e.error))?;

        // The rename is only durable once the directory entry is flushed
        fs::File::open(parent)
            .and_then(|dir| dir.sync_all())
            .map_err(write_err)?;

        Ok(())
    }
}
