//! Incremental build cache for a multi-module compiler backend.
//!
//! Each module keeps a persisted [`CacheStore`] mapping its source units to
//! the fingerprints, declarations and references of their last compile. A
//! build classifies every unit against that store, propagates dirtiness along
//! recorded references (within the module and across module boundaries),
//! recompiles only what is dirty, and links cached and fresh partial
//! artifacts into one [`LinkedArtifact`].
//!
//! The single-file compile is consumed through the [`UnitCompiler`] trait;
//! [`rebuild_all`] is the entry point.

#![warn(missing_docs)]

pub mod artifact;
pub mod cancel;
pub mod classify;
pub mod compiler;
pub mod error;
pub mod fingerprint;
mod fs;
pub mod graph;
pub mod link;
pub mod orchestrator;
pub mod propagate;
pub mod report;
pub mod state;
pub mod store;

pub use artifact::ArtifactStore;
pub use cancel::CancellationToken;
pub use classify::{classify, Classification, DirtyFileState, UnitInput};
pub use compiler::{
    declaration_table, export_table, CompileError, CompiledUnit, DeclarationRecord,
    DeclarationTable, ExportTable, ExportedDeclaration, ModuleContext, Reference, UnitCompiler,
    Visibility,
};
pub use error::{BuildError, CacheError, GraphError};
pub use fingerprint::{
    fingerprint_bytes, fingerprint_dir, fingerprint_file, module_config_fingerprint,
    DeclarationKind, DeclarationShape,
};
pub use graph::{Module, ModuleGraph, SourceUnit, UnitId};
pub use link::{LinkedArtifact, ModuleArtifact, PartialArtifact};
pub use orchestrator::{rebuild_all, BuildSettings, Orchestrator, RebuildOutput};
pub use propagate::{changed_declarations, CrossModuleReference, DeclarationChanges, Propagation};
pub use report::{BuildReport, ModuleFailure, ModuleReport, StoreOrigin, UnitFailure, UnitReport};
pub use state::ModuleState;
pub use store::{CacheStore, UnitEntry};

/// Version of this crate; recorded in every store and partial artifact.
pub const TOOL_VERSION: &str = env!("CARGO_PKG_VERSION");
