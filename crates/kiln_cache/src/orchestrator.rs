//! The rebuild orchestrator.
//!
//! Modules run on a bounded rayon pool as soon as their last dependency
//! succeeds. Each module goes through classification, propagation and
//! recompilation, then merges its partials and persists its store. A failing
//! module is never persisted, and every transitive dependent is reported as
//! skipped without being touched.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use kiln_common::{InternalError, KilnResult};
use tracing::{debug, info, warn};

use crate::artifact::ArtifactStore;
use crate::cancel::CancellationToken;
use crate::classify::{classify, compile_batch, CompileOutcome, DirtyFileState, UnitInput};
use crate::compiler::{
    declaration_table, export_table, CompileError, CompiledUnit, DeclarationTable, ExportTable,
    ModuleContext, Reference, UnitCompiler,
};
use crate::error::{BuildError, CacheError};
use crate::fingerprint::module_config_fingerprint;
use crate::graph::{Module, ModuleGraph, UnitId};
use crate::link::{LinkedArtifact, ModuleArtifact, PartialArtifact};
use crate::propagate::{changed_declarations, DeclarationChanges, Propagation};
use crate::report::{BuildReport, ModuleFailure, ModuleReport, StoreOrigin, UnitFailure, UnitReport};
use crate::state::ModuleState;
use crate::store::{CacheStore, UnitEntry};
use crate::TOOL_VERSION;

/// Settings shared by every module of a build.
#[derive(Debug, Clone)]
pub struct BuildSettings {
    /// Root of the per-module cache directories.
    pub cache_dir: PathBuf,
    /// Worker threads; `0` uses every available core.
    pub jobs: usize,
    /// Tool version recorded in stores and partial headers.
    pub tool_version: String,
    /// Cancellation flag observed between compiles.
    pub cancellation: CancellationToken,
}

impl BuildSettings {
    /// Creates settings with default parallelism and the crate version.
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            jobs: 0,
            tool_version: TOOL_VERSION.to_string(),
            cancellation: CancellationToken::new(),
        }
    }

    /// Sets the number of worker threads.
    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs;
        self
    }

    /// Overrides the tool version.
    pub fn with_tool_version(mut self, version: impl Into<String>) -> Self {
        self.tool_version = version.into();
        self
    }

    /// Uses an externally owned cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }
}

/// The result of a successful build.
#[derive(Debug)]
pub struct RebuildOutput {
    /// All module artifacts, linked.
    pub artifact: LinkedArtifact,
    /// Modules that compiled or dropped at least one unit, in dependency order.
    pub rebuilt_modules: Vec<String>,
    /// Per-module and per-unit details.
    pub report: BuildReport,
}

/// Drives incremental builds of a module graph.
pub struct Orchestrator<C> {
    compiler: C,
    settings: BuildSettings,
}

/// Builds every module of `graph` incrementally.
pub fn rebuild_all<C: UnitCompiler>(
    compiler: C,
    graph: &ModuleGraph,
    settings: BuildSettings,
) -> Result<RebuildOutput, BuildError> {
    Orchestrator::new(compiler, settings).rebuild_all(graph)
}

struct ModuleOutcome {
    report: ModuleReport,
    artifact: Option<ModuleArtifact>,
    exports: Option<Arc<ExportTable>>,
    rebuilt: bool,
}

impl ModuleOutcome {
    fn failed(report: ModuleReport) -> Self {
        Self {
            report,
            artifact: None,
            exports: None,
            rebuilt: false,
        }
    }
}

/// Scheduler state shared by the module tasks.
struct Schedule {
    waiting: Vec<usize>,
    upstream_failures: Vec<BTreeSet<String>>,
    outcomes: Vec<Option<ModuleOutcome>>,
    internal: Option<InternalError>,
}

impl Schedule {
    fn new(graph: &ModuleGraph) -> Self {
        Self {
            waiting: (0..graph.len()).map(|i| distinct_dependencies(graph, i)).collect(),
            upstream_failures: vec![BTreeSet::new(); graph.len()],
            outcomes: (0..graph.len()).map(|_| None).collect(),
            internal: None,
        }
    }
}

fn distinct_dependencies(graph: &ModuleGraph, idx: usize) -> usize {
    graph.dependencies(idx).into_iter().collect::<BTreeSet<_>>().len()
}

fn lock(shared: &Mutex<Schedule>) -> MutexGuard<'_, Schedule> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<C: UnitCompiler> Orchestrator<C> {
    /// Creates an orchestrator.
    pub fn new(compiler: C, settings: BuildSettings) -> Self {
        Self { compiler, settings }
    }

    /// Returns the build settings.
    pub fn settings(&self) -> &BuildSettings {
        &self.settings
    }

    /// Builds every module of `graph`.
    ///
    /// Returns [`BuildError::Failed`] with the full report if any module
    /// failed or was skipped, and [`BuildError::Cancelled`] if the build was
    /// cancelled before every module succeeded.
    pub fn rebuild_all(&self, graph: &ModuleGraph) -> Result<RebuildOutput, BuildError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.settings.jobs)
            .thread_name(|i| format!("kiln-worker-{i}"))
            .build()
            .map_err(|e| BuildError::ThreadPool(e.to_string()))?;

        info!(
            modules = graph.len(),
            threads = pool.current_num_threads(),
            "starting build"
        );

        let shared = Mutex::new(Schedule::new(graph));
        pool.scope(|scope| {
            for &idx in graph.order() {
                if distinct_dependencies(graph, idx) == 0 {
                    self.spawn_module(scope, graph, idx, &shared);
                }
            }
        });

        let schedule = shared.into_inner().unwrap_or_else(PoisonError::into_inner);
        if let Some(err) = schedule.internal {
            return Err(err.into());
        }

        let mut outcomes = schedule.outcomes;
        let mut artifacts = Vec::with_capacity(graph.len());
        let mut reports = Vec::with_capacity(graph.len());
        let mut rebuilt_modules = Vec::new();
        for &idx in graph.order() {
            let outcome = outcomes[idx].take().ok_or_else(|| {
                InternalError::new(format!(
                    "module '{}' finished the build without an outcome",
                    graph.modules()[idx].name
                ))
            })?;
            if outcome.rebuilt {
                rebuilt_modules.push(outcome.report.name.clone());
            }
            artifacts.extend(outcome.artifact);
            reports.push(outcome.report);
        }

        let report = BuildReport { modules: reports };
        if !report.is_success() {
            if self.settings.cancellation.is_cancelled() {
                return Err(BuildError::Cancelled(Box::new(report)));
            }
            return Err(BuildError::Failed(Box::new(report)));
        }

        info!(
            rebuilt = rebuilt_modules.len(),
            compiled = report.compiled_count(),
            "build finished"
        );
        Ok(RebuildOutput {
            artifact: LinkedArtifact::link(artifacts),
            rebuilt_modules,
            report,
        })
    }

    fn spawn_module<'s>(
        &'s self,
        scope: &rayon::Scope<'s>,
        graph: &'s ModuleGraph,
        idx: usize,
        shared: &'s Mutex<Schedule>,
    ) {
        scope.spawn(move |scope| {
            let outcome = self.run_module(graph, idx, shared);
            for next in finish(graph, idx, outcome, shared) {
                self.spawn_module(scope, graph, next, shared);
            }
        });
    }

    fn run_module(&self, graph: &ModuleGraph, idx: usize, shared: &Mutex<Schedule>) -> ModuleOutcome {
        let module = &graph.modules()[idx];
        if self.settings.cancellation.is_cancelled() {
            return ModuleOutcome::failed(ModuleReport::failed(
                &module.name,
                None,
                ModuleFailure::Cancelled,
            ));
        }

        let dependencies: BTreeMap<String, Arc<ExportTable>> = {
            let schedule = lock(shared);
            graph
                .dependencies(idx)
                .into_iter()
                .filter_map(|dep| {
                    let exports = schedule.outcomes[dep].as_ref()?.exports.clone()?;
                    Some((graph.modules()[dep].name.clone(), exports))
                })
                .collect()
        };

        match self.build_module(module, dependencies) {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(module = %module.name, error = %err, "internal error");
                let message = err.to_string();
                lock(shared).internal.get_or_insert(err);
                ModuleOutcome::failed(ModuleReport::failed(
                    &module.name,
                    None,
                    ModuleFailure::Cache { message },
                ))
            }
        }
    }

    fn build_module(
        &self,
        module: &Module,
        dependencies: BTreeMap<String, Arc<ExportTable>>,
    ) -> KilnResult<ModuleOutcome> {
        let settings = &self.settings;
        let cancel = &settings.cancellation;
        let mut run = ModuleRun::new(module);
        run.advance(ModuleState::Classifying)?;
        info!(module = %module.name, units = module.units.len(), "building module");

        let expected: BTreeSet<&String> = module.dependencies.iter().collect();
        if expected.len() != dependencies.len() {
            return Err(InternalError::new(format!(
                "module '{}' started before all of its dependencies succeeded",
                module.name
            )));
        }

        let module_dir = settings.cache_dir.join(&module.name);
        let config = match module_config_fingerprint(module, &settings.tool_version) {
            Ok(fp) => fp,
            Err(e) => {
                return run.fail(
                    ModuleFailure::Cache {
                        message: e.to_string(),
                    },
                    Vec::new(),
                )
            }
        };
        let (mut store, origin) =
            CacheStore::load_or_create(&module_dir, &module.name, &settings.tool_version, config);
        if origin != StoreOrigin::Loaded {
            info!(module = %module.name, origin = ?origin, "starting from an empty cache store");
        }
        run.origin = Some(origin);
        let artifacts = ArtifactStore::new(&module_dir, settings.tool_version.clone());

        let ctx = ModuleContext {
            module: module.name.clone(),
            options: module.options.clone(),
            friends: module.friends.iter().cloned().collect(),
            dependencies,
        };

        let (inputs, mut failures) = read_units(module);
        if !failures.is_empty() {
            return run.fail(ModuleFailure::Compile { units: failures }, Vec::new());
        }

        let classification = classify(&self.compiler, &ctx, &store, &artifacts, &inputs, cancel);
        let mut states = classification.states;
        let mut fresh = classification.compiled;
        let mut retained = classification.retained;
        failures.extend(
            classification
                .failures
                .into_iter()
                .map(|(unit, error)| UnitFailure { unit, error }),
        );
        if classification.cancelled {
            let units = unit_reports(&inputs, &states, &fresh);
            return run.fail(ModuleFailure::Cancelled, units);
        }
        if !failures.is_empty() {
            let units = unit_reports(&inputs, &states, &fresh);
            return run.fail(ModuleFailure::Compile { units: failures }, units);
        }

        run.advance(ModuleState::Propagating)?;
        let mut propagation = Propagation::new(&module.name, inputs.len());
        for input in &inputs {
            let id = &input.unit.id;
            match states.get(id) {
                Some(DirtyFileState::Unmodified) => {
                    if let Some(entry) = store.lookup(id) {
                        propagation.track(id, &entry.references);
                    }
                }
                Some(DirtyFileState::ModifiedBody | DirtyFileState::ModifiedSignature) => {
                    propagation.mark_compiled(id);
                }
                _ => {
                    propagation.schedule(id);
                }
            }
        }

        for (dep, current) in &ctx.dependencies {
            let changes = match store.dependency_snapshot(dep) {
                Some(previous) => DeclarationChanges::Names(changed_declarations(previous, current)),
                None => DeclarationChanges::All,
            };
            let hits = propagation.invalidate(dep, &changes);
            mark_invalidated(&module.name, hits, &mut states, &mut retained);
        }

        run.advance(ModuleState::Recompiling)?;
        let previous = store.declaration_table();
        let by_id: BTreeMap<&UnitId, &UnitInput> =
            inputs.iter().map(|i| (&i.unit.id, i)).collect();
        loop {
            let batch = propagation.take_pending()?;
            let units: Vec<&UnitInput> = batch.iter().filter_map(|id| by_id.get(id).copied()).collect();
            let mut cancelled = cancel.is_cancelled();
            if !cancelled {
                for (id, outcome) in compile_batch(&self.compiler, &ctx, cancel, &units) {
                    match outcome {
                        CompileOutcome::Compiled(compiled) => {
                            fresh.insert(id, compiled);
                        }
                        CompileOutcome::Failed(error) => failures.push(UnitFailure { unit: id, error }),
                        CompileOutcome::Cancelled => cancelled = true,
                    }
                }
            }
            if cancelled {
                let units = unit_reports(&inputs, &states, &fresh);
                return run.fail(ModuleFailure::Cancelled, units);
            }
            if !failures.is_empty() {
                let units = unit_reports(&inputs, &states, &fresh);
                return run.fail(ModuleFailure::Compile { units: failures }, units);
            }

            let current = current_declarations(&inputs, &fresh, &store);
            let changed = changed_declarations(&previous, &current);
            let hits = propagation.invalidate(&module.name, &DeclarationChanges::Names(changed));
            mark_invalidated(&module.name, hits, &mut states, &mut retained);
            if !propagation.has_pending() {
                break;
            }
        }

        let mut failures = duplicate_declarations(&inputs, &fresh, &store);
        let current = current_declarations(&inputs, &fresh, &store);
        failures.extend(dangling_references(&module.name, &inputs, &fresh, &store, &current));
        if !failures.is_empty() {
            let units = unit_reports(&inputs, &states, &fresh);
            return run.fail(ModuleFailure::Compile { units: failures }, units);
        }

        let mut partials = Vec::with_capacity(inputs.len());
        for input in &inputs {
            let id = &input.unit.id;
            let bytes = match (fresh.get(id), retained.remove(id)) {
                (Some(compiled), _) => compiled.artifact.clone(),
                (None, Some(bytes)) => bytes,
                (None, None) => {
                    return Err(InternalError::new(format!(
                        "unit '{id}' of module '{}' has no partial artifact",
                        module.name
                    )))
                }
            };
            partials.push(PartialArtifact {
                unit: id.clone(),
                bytes,
            });
        }

        let exports = export_table(&current);
        let changed_exports: Vec<String> =
            changed_declarations(&export_table(&previous), &exports).into_iter().collect();
        let removed: Vec<UnitId> = states
            .iter()
            .filter(|(_, s)| **s == DirtyFileState::Removed)
            .map(|(id, _)| id.clone())
            .collect();

        if let Err(e) = persist(&mut store, &module_dir, &artifacts, &inputs, &fresh, &removed, &ctx) {
            let units = unit_reports(&inputs, &states, &fresh);
            return run.fail(
                ModuleFailure::Cache {
                    message: e.to_string(),
                },
                units,
            );
        }

        run.advance(ModuleState::Succeeded)?;
        info!(
            module = %module.name,
            compiled = fresh.len(),
            reused = inputs.len() - fresh.len(),
            removed = removed.len(),
            changed_exports = changed_exports.len(),
            "module built"
        );

        let rebuilt = !fresh.is_empty() || !removed.is_empty();
        Ok(ModuleOutcome {
            report: ModuleReport {
                name: module.name.clone(),
                state: run.state,
                store: run.origin,
                units: unit_reports(&inputs, &states, &fresh),
                changed_exports,
                failure: None,
            },
            artifact: Some(ModuleArtifact {
                module: module.name.clone(),
                partials,
            }),
            exports: Some(Arc::new(exports)),
            rebuilt,
        })
    }
}

/// Records a finished module and returns the dependents that became ready.
///
/// Dependents of a failed module are recorded as skipped, transitively,
/// once all of their dependencies have finished.
fn finish(
    graph: &ModuleGraph,
    idx: usize,
    outcome: ModuleOutcome,
    shared: &Mutex<Schedule>,
) -> Vec<usize> {
    let mut schedule = lock(shared);
    let mut ready = Vec::new();
    let mut work = vec![(idx, outcome)];

    while let Some((idx, outcome)) = work.pop() {
        let roots: BTreeSet<String> = match &outcome.report.failure {
            None => BTreeSet::new(),
            Some(ModuleFailure::Skipped { upstream }) => upstream.iter().cloned().collect(),
            Some(_) => BTreeSet::from([outcome.report.name.clone()]),
        };
        schedule.outcomes[idx] = Some(outcome);

        for dependent in graph.dependents(idx) {
            schedule.upstream_failures[dependent].extend(roots.iter().cloned());
            schedule.waiting[dependent] -= 1;
            if schedule.waiting[dependent] > 0 {
                continue;
            }
            if schedule.upstream_failures[dependent].is_empty() {
                ready.push(dependent);
                continue;
            }
            let name = &graph.modules()[dependent].name;
            let upstream: Vec<String> = schedule.upstream_failures[dependent].iter().cloned().collect();
            warn!(module = %name, upstream = ?upstream, "skipping module, upstream failed");
            work.push((
                dependent,
                ModuleOutcome::failed(ModuleReport::failed(
                    name,
                    None,
                    ModuleFailure::Skipped { upstream },
                )),
            ));
        }
    }
    ready
}

/// A module's progress through its state machine.
struct ModuleRun<'a> {
    module: &'a Module,
    state: ModuleState,
    origin: Option<StoreOrigin>,
}

impl<'a> ModuleRun<'a> {
    fn new(module: &'a Module) -> Self {
        Self {
            module,
            state: ModuleState::Pending,
            origin: None,
        }
    }

    fn advance(&mut self, next: ModuleState) -> KilnResult<()> {
        self.state = self.state.transition(next)?;
        Ok(())
    }

    fn fail(
        &mut self,
        failure: ModuleFailure,
        units: Vec<UnitReport>,
    ) -> KilnResult<ModuleOutcome> {
        let from = self.state;
        self.advance(ModuleState::Failed)?;
        warn!(module = %self.module.name, during = %from, failure = ?failure, "module failed");
        let mut report = ModuleReport::failed(&self.module.name, self.origin.take(), failure);
        report.units = units;
        Ok(ModuleOutcome::failed(report))
    }
}

/// Reads every unit of `module`. A missing file means the unit is gone.
fn read_units(module: &Module) -> (Vec<UnitInput>, Vec<UnitFailure>) {
    let mut inputs = Vec::with_capacity(module.units.len());
    let mut failures = Vec::new();
    for unit in &module.units {
        match std::fs::read(&unit.path) {
            Ok(source) => inputs.push(UnitInput::new(unit.clone(), source)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(module = %module.name, unit = %unit.id, "source file missing");
            }
            Err(e) => failures.push(UnitFailure {
                unit: unit.id.clone(),
                error: CompileError::new(format!("cannot read {}: {e}", unit.path.display())),
            }),
        }
    }
    (inputs, failures)
}

fn mark_invalidated(
    module: &str,
    hits: Vec<(UnitId, Vec<Reference>)>,
    states: &mut BTreeMap<UnitId, DirtyFileState>,
    retained: &mut BTreeMap<UnitId, Vec<u8>>,
) {
    for (unit, causes) in hits {
        debug!(module, unit = %unit, causes = causes.len(), "invalidated");
        retained.remove(&unit);
        states.insert(unit, DirtyFileState::Invalidated { causes });
    }
}

/// Declarations of the current units: fresh results where compiled, cached
/// ones elsewhere.
fn current_declarations(
    inputs: &[UnitInput],
    fresh: &BTreeMap<UnitId, CompiledUnit>,
    store: &CacheStore,
) -> DeclarationTable {
    declaration_table(inputs.iter().flat_map(|input| {
        let id = &input.unit.id;
        match fresh.get(id) {
            Some(compiled) => compiled.declarations.as_slice(),
            None => store.lookup(id).map_or(&[][..], |e| e.declarations.as_slice()),
        }
    }))
}

fn duplicate_declarations(
    inputs: &[UnitInput],
    fresh: &BTreeMap<UnitId, CompiledUnit>,
    store: &CacheStore,
) -> Vec<UnitFailure> {
    let mut owners: BTreeMap<&str, &UnitId> = BTreeMap::new();
    let mut failures = Vec::new();
    for input in inputs {
        let id = &input.unit.id;
        let declarations = match fresh.get(id) {
            Some(compiled) => compiled.declarations.as_slice(),
            None => store.lookup(id).map_or(&[][..], |e| e.declarations.as_slice()),
        };
        for decl in declarations {
            match owners.entry(decl.name.as_str()) {
                Entry::Vacant(slot) => {
                    slot.insert(id);
                }
                Entry::Occupied(owner) => failures.push(UnitFailure {
                    unit: id.clone(),
                    error: CompileError::new(format!(
                        "duplicate declaration '{}', already defined in {}",
                        decl.name,
                        owner.get()
                    )),
                }),
            }
        }
    }
    failures
}

/// Own-module references whose target no longer exists anywhere in the
/// module. Cross-module references are resolved by the compiler against the
/// dependency export tables.
fn dangling_references(
    module: &str,
    inputs: &[UnitInput],
    fresh: &BTreeMap<UnitId, CompiledUnit>,
    store: &CacheStore,
    current: &DeclarationTable,
) -> Vec<UnitFailure> {
    let mut failures = Vec::new();
    for input in inputs {
        let id = &input.unit.id;
        let references = match fresh.get(id) {
            Some(compiled) => compiled.references.as_slice(),
            None => store.lookup(id).map_or(&[][..], |e| e.references.as_slice()),
        };
        let missing: BTreeSet<&Reference> = references
            .iter()
            .filter(|r| r.module == module && !current.contains_key(&r.declaration))
            .collect();
        failures.extend(missing.into_iter().map(|reference| UnitFailure {
            unit: id.clone(),
            error: CompileError::new(format!("unresolved reference '{reference}'")),
        }));
    }
    failures
}

fn unit_reports(
    inputs: &[UnitInput],
    states: &BTreeMap<UnitId, DirtyFileState>,
    fresh: &BTreeMap<UnitId, CompiledUnit>,
) -> Vec<UnitReport> {
    let current: BTreeSet<&UnitId> = inputs.iter().map(|i| &i.unit.id).collect();
    let ordered = inputs
        .iter()
        .map(|i| &i.unit.id)
        .chain(states.keys().filter(|id| !current.contains(id)));
    ordered
        .filter_map(|id| {
            states.get(id).map(|state| UnitReport {
                unit: id.clone(),
                state: state.clone(),
                compiled: fresh.contains_key(id),
            })
        })
        .collect()
}

/// Writes fresh partials, updates and saves the store, then sweeps partials
/// nothing references any more.
fn persist(
    store: &mut CacheStore,
    module_dir: &Path,
    artifacts: &ArtifactStore,
    inputs: &[UnitInput],
    fresh: &BTreeMap<UnitId, CompiledUnit>,
    removed: &[UnitId],
    ctx: &ModuleContext,
) -> Result<(), CacheError> {
    for input in inputs {
        if let Some(compiled) = fresh.get(&input.unit.id) {
            let key = artifacts.write_artifact(&compiled.artifact)?;
            store.update(
                input.unit.id.clone(),
                UnitEntry {
                    fingerprint: input.fingerprint,
                    declarations: compiled.declarations.clone(),
                    references: compiled.references.clone(),
                    artifact_key: key,
                },
            );
        }
    }
    for id in removed {
        store.remove(id);
    }
    store.set_dependency_snapshots(
        ctx.dependencies
            .iter()
            .map(|(name, table)| (name.clone(), table.as_ref().clone()))
            .collect(),
    );
    store.save(module_dir)?;

    // Runs after the store is committed and never fails the module.
    let live: BTreeSet<&str> = store.artifact_keys().collect();
    match artifacts.gc(&live) {
        Ok(0) => {}
        Ok(swept) => debug!(module = %ctx.module, swept, "removed unreferenced partials"),
        Err(e) => warn!(module = %ctx.module, error = %e, "cannot sweep partials"),
    }
    Ok(())
}
