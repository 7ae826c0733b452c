//! Dirty-state classification of a module's units.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use kiln_common::Fingerprint;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::artifact::ArtifactStore;
use crate::cancel::CancellationToken;
use crate::compiler::{declaration_table, CompileError, CompiledUnit, ModuleContext, Reference, UnitCompiler};
use crate::fingerprint::fingerprint_bytes;
use crate::graph::{SourceUnit, UnitId};
use crate::store::CacheStore;

/// Why a unit is, or is not, recompiled this build.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DirtyFileState {
    /// Content unchanged and the cached partial is valid.
    Unmodified,
    /// No prior cache entry.
    Added,
    /// Cached, but the file no longer exists.
    Removed,
    /// Content changed; declarations unchanged.
    ModifiedBody,
    /// Content changed and the declaration table changed with it.
    ModifiedSignature,
    /// Content unchanged, but a declaration it references changed or vanished.
    Invalidated {
        /// The changed declarations the unit references.
        causes: Vec<Reference>,
    },
    /// Content unchanged, but the cached partial is missing or invalid.
    Evicted,
}

impl DirtyFileState {
    /// Returns `true` if the unit is compiled this build.
    pub fn needs_compile(&self) -> bool {
        !matches!(self, DirtyFileState::Unmodified | DirtyFileState::Removed)
    }

    /// Returns `true` for every state but `Unmodified`.
    pub fn is_dirty(&self) -> bool {
        !matches!(self, DirtyFileState::Unmodified)
    }

    /// Short lowercase name of the state.
    pub fn label(&self) -> &'static str {
        match self {
            DirtyFileState::Unmodified => "unmodified",
            DirtyFileState::Added => "added",
            DirtyFileState::Removed => "removed",
            DirtyFileState::ModifiedBody => "modified-body",
            DirtyFileState::ModifiedSignature => "modified-signature",
            DirtyFileState::Invalidated { .. } => "invalidated",
            DirtyFileState::Evicted => "evicted",
        }
    }
}

impl fmt::Display for DirtyFileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DirtyFileState::Invalidated { causes } => {
                f.write_str("invalidated by ")?;
                for (i, cause) in causes.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{cause}")?;
                }
                Ok(())
            }
            other => f.write_str(other.label()),
        }
    }
}

/// A unit that exists on disk this build, with its content loaded.
#[derive(Debug, Clone)]
pub struct UnitInput {
    /// The unit.
    pub unit: SourceUnit,
    /// Raw source bytes.
    pub source: Vec<u8>,
    /// Fingerprint of `source`.
    pub fingerprint: Fingerprint,
}

impl UnitInput {
    /// Wraps loaded source bytes.
    pub fn new(unit: SourceUnit, source: Vec<u8>) -> Self {
        let fingerprint = fingerprint_bytes(&source);
        Self {
            unit,
            source,
            fingerprint,
        }
    }
}

/// Result of compiling one unit inside a batch.
#[derive(Debug)]
pub(crate) enum CompileOutcome {
    Compiled(CompiledUnit),
    Failed(CompileError),
    Cancelled,
}

/// Compiles `units` in parallel on the current rayon pool.
///
/// Units not yet started when `cancel` is raised come back as
/// [`CompileOutcome::Cancelled`]. Results keep the input order.
pub(crate) fn compile_batch<C: UnitCompiler>(
    compiler: &C,
    ctx: &ModuleContext,
    cancel: &CancellationToken,
    units: &[&UnitInput],
) -> Vec<(UnitId, CompileOutcome)> {
    units
        .par_iter()
        .map(|input| {
            let id = input.unit.id.clone();
            if cancel.is_cancelled() {
                return (id, CompileOutcome::Cancelled);
            }
            debug!(module = %ctx.module, unit = %id, "compiling");
            let outcome = match compiler.compile_unit(&input.unit, &input.source, ctx) {
                Ok(compiled) => CompileOutcome::Compiled(compiled),
                Err(e) => CompileOutcome::Failed(e),
            };
            (id, outcome)
        })
        .collect()
}

/// The classifier's verdict for one module.
#[derive(Debug, Default)]
pub struct Classification {
    /// State of every current or previously cached unit.
    pub states: BTreeMap<UnitId, DirtyFileState>,
    /// Compile results produced while telling body edits from signature edits.
    pub compiled: BTreeMap<UnitId, CompiledUnit>,
    /// Compile failures of modified units.
    pub failures: Vec<(UnitId, CompileError)>,
    /// Validated cached partials of unmodified units.
    pub retained: BTreeMap<UnitId, Vec<u8>>,
    /// Set if a compile was abandoned because the build was cancelled.
    pub cancelled: bool,
}

impl Classification {
    /// Units with the given state predicate, in identity order.
    pub fn units_where(&self, pred: impl Fn(&DirtyFileState) -> bool) -> Vec<&UnitId> {
        self.states
            .iter()
            .filter(|(_, s)| pred(s))
            .map(|(id, _)| id)
            .collect()
    }
}

/// Labels every unit of a module against its cache store.
///
/// Units whose content changed are compiled here, in parallel, so their
/// declaration tables can be compared with the stored ones; the results are
/// kept and never recompiled.
pub fn classify<C: UnitCompiler>(
    compiler: &C,
    ctx: &ModuleContext,
    store: &CacheStore,
    artifacts: &ArtifactStore,
    inputs: &[UnitInput],
    cancel: &CancellationToken,
) -> Classification {
    let mut result = Classification::default();
    let mut modified = Vec::new();

    for input in inputs {
        let id = &input.unit.id;
        let state = match store.lookup(id) {
            None => DirtyFileState::Added,
            Some(entry) if entry.fingerprint == input.fingerprint => {
                match artifacts.read_artifact(&entry.artifact_key) {
                    Some(bytes) => {
                        result.retained.insert(id.clone(), bytes);
                        DirtyFileState::Unmodified
                    }
                    None => DirtyFileState::Evicted,
                }
            }
            Some(_) => {
                modified.push(input);
                continue;
            }
        };
        debug!(module = %ctx.module, unit = %id, state = state.label(), "classified");
        result.states.insert(id.clone(), state);
    }

    let current: BTreeSet<&UnitId> = inputs.iter().map(|i| &i.unit.id).collect();
    for (id, _) in store.units() {
        if !current.contains(id) {
            debug!(module = %ctx.module, unit = %id, "classified as removed");
            result.states.insert(id.clone(), DirtyFileState::Removed);
        }
    }

    for (id, outcome) in compile_batch(compiler, ctx, cancel, &modified) {
        let state = match outcome {
            CompileOutcome::Compiled(compiled) => {
                let previous = store
                    .lookup(&id)
                    .map(|e| declaration_table(&e.declarations))
                    .unwrap_or_default();
                let state = if declaration_table(&compiled.declarations) == previous {
                    DirtyFileState::ModifiedBody
                } else {
                    DirtyFileState::ModifiedSignature
                };
                result.compiled.insert(id.clone(), compiled);
                state
            }
            CompileOutcome::Failed(error) => {
                result.failures.push((id.clone(), error));
                DirtyFileState::ModifiedSignature
            }
            CompileOutcome::Cancelled => {
                result.cancelled = true;
                DirtyFileState::ModifiedSignature
            }
        };
        debug!(module = %ctx.module, unit = %id, state = state.label(), "classified");
        result.states.insert(id, state);
    }

    result
}
