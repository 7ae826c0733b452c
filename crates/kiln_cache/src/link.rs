//! The linked multi-module output.
//!
//! Layout: magic `KLNK`, a little-endian `u32` format version, then the
//! bincode encoding of every module artifact in dependency order. Each module
//! lists its unit partials in source order, so an unchanged project always
//! links to the same bytes.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::CacheError;
use crate::fs::write_atomic;
use crate::graph::UnitId;

const LINK_MAGIC: [u8; 4] = *b"KLNK";
const LINK_FORMAT_VERSION: u32 = 1;

/// The compiled output of one unit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialArtifact {
    /// Unit identity.
    pub unit: UnitId,
    /// Partial artifact bytes.
    pub bytes: Vec<u8>,
}

/// The merged output of one module.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleArtifact {
    /// Module name.
    pub module: String,
    /// Unit partials in source order.
    pub partials: Vec<PartialArtifact>,
}

/// All module artifacts stitched into one output.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkedArtifact {
    /// Module artifacts in dependency order, ties by name.
    pub modules: Vec<ModuleArtifact>,
}

impl LinkedArtifact {
    /// Links module artifacts that are already in dependency order.
    pub fn link(modules: Vec<ModuleArtifact>) -> Self {
        Self { modules }
    }

    /// Looks up a module artifact by name.
    pub fn module(&self, name: &str) -> Option<&ModuleArtifact> {
        self.modules.iter().find(|m| m.module == name)
    }

    /// Encodes the artifact.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CacheError> {
        let payload = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| CacheError::Serialization {
                reason: e.to_string(),
            })?;
        let mut out = Vec::with_capacity(8 + payload.len());
        out.extend_from_slice(&LINK_MAGIC);
        out.extend_from_slice(&LINK_FORMAT_VERSION.to_le_bytes());
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// Decodes an artifact produced by [`to_bytes`](Self::to_bytes).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CacheError> {
        let invalid = |reason: &str| CacheError::InvalidArtifact {
            reason: reason.to_string(),
        };
        if bytes.len() < 8 || bytes[..4] != LINK_MAGIC {
            return Err(invalid("missing KLNK magic bytes"));
        }
        let mut version = [0u8; 4];
        version.copy_from_slice(&bytes[4..8]);
        if u32::from_le_bytes(version) != LINK_FORMAT_VERSION {
            return Err(invalid("unsupported linked artifact format version"));
        }
        let (artifact, read) =
            bincode::serde::decode_from_slice(&bytes[8..], bincode::config::standard()).map_err(
                |e| CacheError::Serialization {
                    reason: e.to_string(),
                },
            )?;
        if 8 + read != bytes.len() {
            return Err(invalid("trailing bytes after linked artifact"));
        }
        Ok(artifact)
    }

    /// Writes the encoded artifact to `path` atomically.
    pub fn write_to(&self, path: &Path) -> Result<(), CacheError> {
        write_atomic(path, &self.to_bytes()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> LinkedArtifact {
        LinkedArtifact::link(vec![
            ModuleArtifact {
                module: "lib".into(),
                partials: vec![PartialArtifact {
                    unit: UnitId::new("lib/g.kl"),
                    bytes: b"fn g".to_vec(),
                }],
            },
            ModuleArtifact {
                module: "app".into(),
                partials: vec![],
            },
        ])
    }

    #[test]
    fn header_and_decode() {
        let bytes = sample().to_bytes().unwrap();
        assert_eq!(&bytes[..4], b"KLNK");
        assert_eq!(LinkedArtifact::from_bytes(&bytes).unwrap(), sample());
        assert_eq!(bytes, sample().to_bytes().unwrap());
    }

    #[test]
    fn rejects_bad_input() {
        assert!(matches!(
            LinkedArtifact::from_bytes(b"NOPE\x01\0\0\0"),
            Err(CacheError::InvalidArtifact { .. })
        ));
        let mut bytes = sample().to_bytes().unwrap();
        bytes[4] = 9;
        assert!(LinkedArtifact::from_bytes(&bytes).is_err());
        let mut bytes = sample().to_bytes().unwrap();
        bytes.push(0);
        assert!(LinkedArtifact::from_bytes(&bytes).is_err());
    }

    #[test]
    fn write_to_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("build").join("demo.klnk");
        sample().write_to(&path).unwrap();
        let read = std::fs::read(&path).unwrap();
        assert_eq!(LinkedArtifact::from_bytes(&read).unwrap().module("lib"), sample().module("lib"));
    }
}
