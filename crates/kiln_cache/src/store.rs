//! The per-module cache store.
//!
//! Persisted as `<cache_dir>/<module>/store.json`. It maps each unit's
//! identity to the fingerprint it was last compiled at, the declarations and
//! references that compile produced, and the key of its partial artifact.
//! It also remembers the export tables of the module's dependencies as they
//! were when the module last built successfully.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use kiln_common::Fingerprint;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::compiler::{declaration_table, DeclarationRecord, DeclarationTable, ExportTable, Reference};
use crate::error::CacheError;
use crate::fs::write_atomic;
use crate::graph::UnitId;
use crate::report::StoreOrigin;

/// Name of the store file within a module's cache directory.
const STORE_FILE: &str = "store.json";

/// Current store format version. Stores with any other version are ignored.
pub const STORE_FORMAT_VERSION: u32 = 1;

/// Cached state for one source unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitEntry {
    /// Content fingerprint of the unit when it was compiled.
    pub fingerprint: Fingerprint,
    /// Declarations the unit defined.
    pub declarations: Vec<DeclarationRecord>,
    /// Declarations the unit referenced.
    pub references: Vec<Reference>,
    /// Key of the unit's partial artifact.
    pub artifact_key: String,
}

/// Persisted cache state of one module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStore {
    format_version: u32,
    tool_version: String,
    module: String,
    config_fingerprint: Fingerprint,
    units: BTreeMap<UnitId, UnitEntry>,
    dependency_snapshots: BTreeMap<String, ExportTable>,
}

impl CacheStore {
    /// Creates an empty store.
    pub fn new(module: &str, tool_version: &str, config_fingerprint: Fingerprint) -> Self {
        Self {
            format_version: STORE_FORMAT_VERSION,
            tool_version: tool_version.to_string(),
            module: module.to_string(),
            config_fingerprint,
            units: BTreeMap::new(),
            dependency_snapshots: BTreeMap::new(),
        }
    }

    /// Returns the store file path inside a module cache directory.
    pub fn path(module_dir: &Path) -> PathBuf {
        module_dir.join(STORE_FILE)
    }

    /// Reads the store from a module cache directory.
    ///
    /// Returns `Ok(None)` if no store exists and
    /// [`CacheError::CorruptCache`] if the file cannot be parsed.
    pub fn load(module_dir: &Path) -> Result<Option<Self>, CacheError> {
        let path = Self::path(module_dir);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CacheError::io(path, e)),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| CacheError::CorruptCache {
                path,
                reason: e.to_string(),
            })
    }

    /// Loads the store, or starts an empty one when it is missing, unreadable
    /// or was written for a different format, tool version or configuration.
    ///
    /// Never fails: every problem degrades to a full rebuild of the module.
    pub fn load_or_create(
        module_dir: &Path,
        module: &str,
        tool_version: &str,
        config_fingerprint: Fingerprint,
    ) -> (Self, StoreOrigin) {
        let fresh = || Self::new(module, tool_version, config_fingerprint);
        match Self::load(module_dir) {
            Ok(Some(store)) if store.is_compatible(module, tool_version, config_fingerprint) => {
                (store, StoreOrigin::Loaded)
            }
            Ok(Some(_)) => (fresh(), StoreOrigin::Stale),
            Ok(None) => (fresh(), StoreOrigin::Missing),
            Err(e) => {
                warn!(module, error = %e, "discarding unreadable cache store");
                (
                    fresh(),
                    StoreOrigin::Corrupt {
                        reason: e.to_string(),
                    },
                )
            }
        }
    }

    /// Writes the store atomically.
    pub fn save(&self, module_dir: &Path) -> Result<(), CacheError> {
        let json = serde_json::to_string_pretty(self).map_err(|e| CacheError::Serialization {
            reason: e.to_string(),
        })?;
        write_atomic(&Self::path(module_dir), json.as_bytes())
    }

    /// Returns `true` if the store can be reused for this module, tool
    /// version and configuration.
    pub fn is_compatible(
        &self,
        module: &str,
        tool_version: &str,
        config_fingerprint: Fingerprint,
    ) -> bool {
        self.format_version == STORE_FORMAT_VERSION
            && self.module == module
            && self.tool_version == tool_version
            && self.config_fingerprint == config_fingerprint
    }

    /// Looks up the cached entry for a unit.
    pub fn lookup(&self, unit: &UnitId) -> Option<&UnitEntry> {
        self.units.get(unit)
    }

    /// Inserts or replaces the entry for a unit.
    pub fn update(&mut self, unit: UnitId, entry: UnitEntry) {
        self.units.insert(unit, entry);
    }

    /// Removes the entry for a unit.
    pub fn remove(&mut self, unit: &UnitId) -> Option<UnitEntry> {
        self.units.remove(unit)
    }

    /// Iterates over cached units in identity order.
    pub fn units(&self) -> impl Iterator<Item = (&UnitId, &UnitEntry)> {
        self.units.iter()
    }

    /// Returns the number of cached units.
    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// Returns `true` if no unit is cached.
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// The module this store belongs to.
    pub fn module(&self) -> &str {
        &self.module
    }

    /// The export table of `dependency` the module last built against.
    pub fn dependency_snapshot(&self, dependency: &str) -> Option<&ExportTable> {
        self.dependency_snapshots.get(dependency)
    }

    /// Replaces all dependency snapshots.
    pub fn set_dependency_snapshots(&mut self, snapshots: BTreeMap<String, ExportTable>) {
        self.dependency_snapshots = snapshots;
    }

    /// Collects every cached declaration of the module.
    pub fn declaration_table(&self) -> DeclarationTable {
        declaration_table(self.units.values().flat_map(|e| &e.declarations))
    }

    /// Keys of every partial artifact the store references.
    pub fn artifact_keys(&self) -> impl Iterator<Item = &str> {
        self.units.values().map(|e| e.artifact_key.as_str())
    }
}
