//! Content-addressed storage for partial artifacts.
//!
//! Each unit's compiled output is stored at
//! `<cache_dir>/<module>/partials/<key>.part`, where the key is the hex
//! fingerprint of the payload. Every file starts with a bincode header
//! carrying magic bytes, format version, tool version and a payload
//! checksum; anything that fails validation reads back as a miss.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use kiln_common::Fingerprint;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::CacheError;
use crate::fs::write_atomic;

/// Magic bytes identifying a kiln partial artifact.
const PARTIAL_MAGIC: [u8; 4] = *b"KILN";

/// Current partial artifact format version.
const PARTIAL_FORMAT_VERSION: u32 = 1;

const PARTIALS_DIR: &str = "partials";
const PARTIAL_EXT: &str = "part";

/// Header prepended to every partial artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialHeader {
    /// Magic bytes: must be `b"KILN"`.
    pub magic: [u8; 4],
    /// Partial artifact format version.
    pub format_version: u32,
    /// Tool version that produced the artifact.
    pub tool_version: String,
    /// Fingerprint of the payload.
    pub checksum: Fingerprint,
}

/// Partial artifact storage for one module.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
    tool_version: String,
}

impl ArtifactStore {
    /// Creates a store rooted at a module's cache directory.
    pub fn new(module_dir: &Path, tool_version: impl Into<String>) -> Self {
        Self {
            dir: module_dir.join(PARTIALS_DIR),
            tool_version: tool_version.into(),
        }
    }

    /// Returns the content-addressed key for a payload.
    pub fn key_for(data: &[u8]) -> String {
        Fingerprint::from_bytes(data).to_string()
    }

    /// Returns the file path for the artifact with the given key.
    pub fn artifact_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.{PARTIAL_EXT}"))
    }

    /// Writes a partial artifact and returns its key.
    ///
    /// A file that already exists under the key and reads back valid is left
    /// untouched; otherwise the artifact is (re)written atomically.
    pub fn write_artifact(&self, data: &[u8]) -> Result<String, CacheError> {
        let key = Self::key_for(data);
        if self.read_artifact(&key).is_some() {
            return Ok(key);
        }

        let header = PartialHeader {
            magic: PARTIAL_MAGIC,
            format_version: PARTIAL_FORMAT_VERSION,
            tool_version: self.tool_version.clone(),
            checksum: Fingerprint::from_bytes(data),
        };
        let header_bytes = bincode::serde::encode_to_vec(&header, bincode::config::standard())
            .map_err(|e| CacheError::Serialization {
                reason: e.to_string(),
            })?;

        // 4-byte header length (little-endian) + header + payload
        let header_len = header_bytes.len() as u32;
        let mut output = Vec::with_capacity(4 + header_bytes.len() + data.len());
        output.extend_from_slice(&header_len.to_le_bytes());
        output.extend_from_slice(&header_bytes);
        output.extend_from_slice(data);

        write_atomic(&self.artifact_path(&key), &output)?;
        Ok(key)
    }

    /// Reads and validates a partial artifact.
    ///
    /// Returns `None` if the file is missing, truncated, carries the wrong
    /// magic, format or tool version, or fails its checksum.
    pub fn read_artifact(&self, key: &str) -> Option<Vec<u8>> {
        let raw = std::fs::read(self.artifact_path(key)).ok()?;
        if raw.len() < 4 {
            return None;
        }

        let header_len = u32::from_le_bytes(raw[..4].try_into().ok()?) as usize;
        if raw.len() < 4 + header_len {
            return None;
        }

        let (header, _): (PartialHeader, usize) =
            bincode::serde::decode_from_slice(&raw[4..4 + header_len], bincode::config::standard())
                .ok()?;

        if header.magic != PARTIAL_MAGIC
            || header.format_version != PARTIAL_FORMAT_VERSION
            || header.tool_version != self.tool_version
        {
            return None;
        }

        let payload = &raw[4 + header_len..];
        if Fingerprint::from_bytes(payload) != header.checksum {
            return None;
        }
        Some(payload.to_vec())
    }

    /// Deletes every partial whose key is not in `live_keys`.
    ///
    /// Returns the number of files removed. A partial that cannot be removed
    /// is logged and left in place; only an unreadable directory is an error.
    pub fn gc(&self, live_keys: &BTreeSet<&str>) -> Result<usize, CacheError> {
        if !self.dir.exists() {
            return Ok(0);
        }

        let mut removed = 0;
        let entries = std::fs::read_dir(&self.dir).map_err(|e| CacheError::io(&self.dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| CacheError::io(&self.dir, e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(PARTIAL_EXT) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if !live_keys.contains(stem) {
                    match std::fs::remove_file(&path) {
                        Ok(()) => removed += 1,
                        Err(e) => {
                            warn!(path = %path.display(), error = %e, "cannot remove stale partial")
                        }
                    }
                }
            }
        }
        Ok(removed)
    }
}
