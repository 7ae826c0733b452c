//! The consumed "compile one file" interface and the data it exchanges.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use kiln_common::Fingerprint;
use serde::{Deserialize, Serialize};

use crate::graph::SourceUnit;

/// Who may reference a declaration from outside its unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    /// Visible to every dependent module.
    Public,
    /// Visible to dependent modules that list the owner as a friend.
    Internal,
    /// Visible only inside the owning module.
    Private,
}

impl Visibility {
    /// Returns `true` if dependents can ever see the declaration.
    pub fn is_exported(self) -> bool {
        !matches!(self, Visibility::Private)
    }
}

/// A declaration produced by compiling a unit, identified by name and
/// summarized by its declaration fingerprint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclarationRecord {
    /// Linkable name, unique within the module.
    pub name: String,
    /// Fingerprint of the declaration's shape (never its body).
    pub fingerprint: Fingerprint,
    /// Visibility to other modules.
    pub visibility: Visibility,
}

/// The fingerprint and visibility of one named declaration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedDeclaration {
    /// Declaration fingerprint.
    pub fingerprint: Fingerprint,
    /// Visibility (never [`Visibility::Private`] in an export table).
    pub visibility: Visibility,
}

/// Every declaration of one module, private ones included, keyed by name.
pub type DeclarationTable = BTreeMap<String, ExportedDeclaration>;

/// Exported declarations of one module, keyed by declaration name.
pub type ExportTable = BTreeMap<String, ExportedDeclaration>;

/// Builds a declaration table from declaration records.
pub fn declaration_table<'a>(
    records: impl IntoIterator<Item = &'a DeclarationRecord>,
) -> DeclarationTable {
    records
        .into_iter()
        .map(|r| {
            (
                r.name.clone(),
                ExportedDeclaration {
                    fingerprint: r.fingerprint,
                    visibility: r.visibility,
                },
            )
        })
        .collect()
}

/// Keeps only the declarations dependents can see.
pub fn export_table(table: &DeclarationTable) -> ExportTable {
    table
        .iter()
        .filter(|(_, d)| d.visibility.is_exported())
        .map(|(name, d)| (name.clone(), *d))
        .collect()
}

/// A reference from a unit to a named declaration of some module
/// (possibly the unit's own module).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Reference {
    /// Module that owns the referenced declaration.
    pub module: String,
    /// Referenced declaration name.
    pub declaration: String,
}

impl Reference {
    /// Creates a reference to `module::declaration`.
    pub fn new(module: impl Into<String>, declaration: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            declaration: declaration.into(),
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.module, self.declaration)
    }
}

/// The output of compiling one unit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompiledUnit {
    /// The partial artifact, merged into the module artifact at link time.
    pub artifact: Vec<u8>,
    /// Declarations defined by the unit.
    pub declarations: Vec<DeclarationRecord>,
    /// Declarations the unit references, in its own and other modules.
    pub references: Vec<Reference>,
}

/// A unit-level compile failure.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileError {
    /// Human-readable description.
    pub message: String,
    /// 1-based source line, when known.
    pub line: Option<usize>,
}

impl CompileError {
    /// Creates an error without a source location.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            line: None,
        }
    }

    /// Creates an error at a 1-based source line.
    pub fn at_line(line: usize, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            line: Some(line),
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "line {line}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for CompileError {}

/// Everything a unit compile may depend on besides the unit's own bytes.
///
/// Dependency export tables are the *finalized* tables of this build: a
/// module is only compiled after all of its dependencies have succeeded.
#[derive(Clone, Debug, Default)]
pub struct ModuleContext {
    /// Name of the module being compiled.
    pub module: String,
    /// Resolved compiler options.
    pub options: BTreeMap<String, String>,
    /// Dependencies whose internal declarations are visible.
    pub friends: BTreeSet<String>,
    /// Export tables of direct dependencies, keyed by module name.
    pub dependencies: BTreeMap<String, Arc<ExportTable>>,
}

impl ModuleContext {
    /// Looks up an exported declaration of a direct dependency.
    pub fn lookup(&self, module: &str, declaration: &str) -> Option<&ExportedDeclaration> {
        self.dependencies.get(module)?.get(declaration)
    }

    /// Returns `true` if `module` is a direct dependency.
    pub fn depends_on(&self, module: &str) -> bool {
        self.dependencies.contains_key(module)
    }

    /// Returns `true` if `module`'s internal declarations are visible here.
    pub fn is_friend(&self, module: &str) -> bool {
        self.friends.contains(module)
    }
}

/// The external single-file compile operation.
///
/// Implementations must be referentially transparent given `source` and
/// `ctx`: the cache reuses outputs whenever both are unchanged, and compiles
/// independent units concurrently.
pub trait UnitCompiler: Send + Sync {
    /// Compiles one unit.
    fn compile_unit(
        &self,
        unit: &SourceUnit,
        source: &[u8],
        ctx: &ModuleContext,
    ) -> Result<CompiledUnit, CompileError>;
}

impl<T: UnitCompiler + ?Sized> UnitCompiler for &T {
    fn compile_unit(
        &self,
        unit: &SourceUnit,
        source: &[u8],
        ctx: &ModuleContext,
    ) -> Result<CompiledUnit, CompileError> {
        (**self).compile_unit(unit, source, ctx)
    }
}

impl<T: UnitCompiler + ?Sized> UnitCompiler for Arc<T> {
    fn compile_unit(
        &self,
        unit: &SourceUnit,
        source: &[u8],
        ctx: &ModuleContext,
    ) -> Result<CompiledUnit, CompileError> {
        (**self).compile_unit(unit, source, ctx)
    }
}
