//! Dirtiness propagation across declaration references.
//!
//! References are kept as an edge list from referenced declaration to the
//! units that consume it. Invalidation walks that list with a work list and a
//! visited set; every unit is handed out for compilation at most once.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use kiln_common::{InternalError, KilnResult};

use crate::compiler::Reference;
use crate::graph::UnitId;

/// A reference edge: `unit` of `module` consumes `declaration` of
/// `target_module`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct CrossModuleReference {
    /// Consuming module.
    pub module: String,
    /// Consuming unit.
    pub unit: UnitId,
    /// Module that owns the referenced declaration.
    pub target_module: String,
    /// Referenced declaration.
    pub declaration: String,
}

impl fmt::Display for CrossModuleReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}::{}",
            self.module, self.unit, self.target_module, self.declaration
        )
    }
}

/// Names that were added, removed, or whose value differs between two tables.
pub fn changed_declarations<V: PartialEq>(
    old: &BTreeMap<String, V>,
    new: &BTreeMap<String, V>,
) -> BTreeSet<String> {
    let mut changed: BTreeSet<String> = old
        .iter()
        .filter(|(name, value)| new.get(*name) != Some(*value))
        .map(|(name, _)| name.clone())
        .collect();
    changed.extend(
        new.keys()
            .filter(|name| !old.contains_key(*name))
            .cloned(),
    );
    changed
}

/// The declarations of one module that changed this build.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeclarationChanges {
    /// Nothing is known about the previous table; every reference counts.
    All,
    /// Exactly these names changed.
    Names(BTreeSet<String>),
}

impl DeclarationChanges {
    fn contains(&self, name: &str) -> bool {
        match self {
            DeclarationChanges::All => true,
            DeclarationChanges::Names(names) => names.contains(name),
        }
    }

    /// Returns `true` if nothing changed.
    pub fn is_empty(&self) -> bool {
        matches!(self, DeclarationChanges::Names(names) if names.is_empty())
    }
}

/// Work list of units to compile within one module build.
#[derive(Debug)]
pub struct Propagation {
    module: String,
    edges: Vec<CrossModuleReference>,
    visited: BTreeSet<UnitId>,
    pending: BTreeSet<UnitId>,
    compiled: usize,
    limit: usize,
}

impl Propagation {
    /// Creates a work list for `module` that may hand out at most `limit`
    /// compiles in total.
    pub fn new(module: impl Into<String>, limit: usize) -> Self {
        Self {
            module: module.into(),
            edges: Vec::new(),
            visited: BTreeSet::new(),
            pending: BTreeSet::new(),
            compiled: 0,
            limit,
        }
    }

    /// Records the references of a clean unit, making it a candidate for
    /// invalidation.
    pub fn track(&mut self, unit: &UnitId, references: &[Reference]) {
        self.edges.extend(references.iter().map(|r| CrossModuleReference {
            module: self.module.clone(),
            unit: unit.clone(),
            target_module: r.module.clone(),
            declaration: r.declaration.clone(),
        }));
    }

    /// Records a unit compiled outside the work list (during classification).
    pub fn mark_compiled(&mut self, unit: &UnitId) {
        if self.visited.insert(unit.clone()) {
            self.compiled += 1;
        }
    }

    /// Queues a unit for compilation. Returns `false` if it was already
    /// queued or compiled.
    pub fn schedule(&mut self, unit: &UnitId) -> bool {
        if !self.visited.insert(unit.clone()) {
            return false;
        }
        self.pending.insert(unit.clone());
        true
    }

    /// Queues every tracked unit that references a changed declaration of
    /// `target_module`.
    ///
    /// Returns the newly queued units with the references that caused them,
    /// in unit order.
    pub fn invalidate(
        &mut self,
        target_module: &str,
        changes: &DeclarationChanges,
    ) -> Vec<(UnitId, Vec<Reference>)> {
        if changes.is_empty() {
            return Vec::new();
        }

        let mut hits: BTreeMap<UnitId, BTreeSet<Reference>> = BTreeMap::new();
        for edge in &self.edges {
            if edge.target_module == target_module
                && changes.contains(&edge.declaration)
                && !self.visited.contains(&edge.unit)
            {
                hits.entry(edge.unit.clone())
                    .or_default()
                    .insert(Reference::new(&edge.target_module, &edge.declaration));
            }
        }

        let mut invalidated = Vec::with_capacity(hits.len());
        for (unit, causes) in hits {
            if self.schedule(&unit) {
                invalidated.push((unit, causes.into_iter().collect()));
            }
        }
        invalidated
    }

    /// Returns `true` if units are waiting to be compiled.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Hands out every queued unit.
    ///
    /// Fails with a `PropagationNonTermination` internal error if the total
    /// number of compiles would exceed the bound.
    pub fn take_pending(&mut self) -> KilnResult<Vec<UnitId>> {
        let batch: Vec<UnitId> = std::mem::take(&mut self.pending).into_iter().collect();
        self.compiled += batch.len();
        if self.compiled > self.limit {
            return Err(InternalError::PropagationNonTermination {
                module: self.module.clone(),
                compiles: self.compiled,
                units: self.limit,
            });
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(entries: &[(&str, u64)]) -> BTreeMap<String, u64> {
        entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn names(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn diff_reports_added_removed_and_changed() {
        let old = table(&[("f", 1), ("g", 2), ("h", 3)]);
        let new = table(&[("f", 1), ("g", 20), ("k", 4)]);
        assert_eq!(changed_declarations(&old, &new), names(&["g", "h", "k"]));
        assert!(changed_declarations(&old, &old).is_empty());
    }

    #[test]
    fn only_referencing_units_are_invalidated() {
        let mut p = Propagation::new("app", 10);
        p.track(&UnitId::new("a.kl"), &[Reference::new("lib", "g")]);
        p.track(&UnitId::new("b.kl"), &[Reference::new("lib", "h")]);
        p.track(&UnitId::new("c.kl"), &[Reference::new("other", "g")]);

        let hit = p.invalidate("lib", &DeclarationChanges::Names(names(&["g"])));
        assert_eq!(hit, vec![(UnitId::new("a.kl"), vec![Reference::new("lib", "g")])]);
        assert_eq!(p.take_pending().unwrap(), vec![UnitId::new("a.kl")]);
    }

    #[test]
    fn unknown_previous_table_invalidates_every_reference() {
        let mut p = Propagation::new("app", 10);
        p.track(&UnitId::new("a.kl"), &[Reference::new("lib", "g")]);
        p.track(&UnitId::new("b.kl"), &[Reference::new("lib", "h")]);
        p.track(&UnitId::new("c.kl"), &[]);
        let hit = p.invalidate("lib", &DeclarationChanges::All);
        assert_eq!(hit.len(), 2);
    }

    #[test]
    fn units_are_never_queued_twice() {
        let mut p = Propagation::new("app", 10);
        let a = UnitId::new("a.kl");
        p.track(&a, &[Reference::new("app", "f"), Reference::new("app", "g")]);
        assert_eq!(p.invalidate("app", &DeclarationChanges::Names(names(&["f"]))).len(), 1);
        assert!(p.invalidate("app", &DeclarationChanges::Names(names(&["g"]))).is_empty());
        assert!(!p.schedule(&a));
    }

    #[test]
    fn compiled_units_are_not_invalidated() {
        let mut p = Propagation::new("app", 10);
        let a = UnitId::new("a.kl");
        p.track(&a, &[Reference::new("lib", "g")]);
        p.mark_compiled(&a);
        assert!(p.invalidate("lib", &DeclarationChanges::All).is_empty());
        assert!(!p.has_pending());
    }

    #[test]
    fn causes_are_collected_per_unit() {
        let mut p = Propagation::new("app", 10);
        p.track(
            &UnitId::new("a.kl"),
            &[Reference::new("lib", "h"), Reference::new("lib", "g")],
        );
        let hit = p.invalidate("lib", &DeclarationChanges::Names(names(&["g", "h"])));
        assert_eq!(
            hit[0].1,
            vec![Reference::new("lib", "g"), Reference::new("lib", "h")]
        );
    }

    #[test]
    fn exceeding_the_bound_is_an_internal_error() {
        let mut p = Propagation::new("app", 1);
        p.mark_compiled(&UnitId::new("a.kl"));
        p.schedule(&UnitId::new("b.kl"));
        let err = p.take_pending().unwrap_err();
        assert!(matches!(
            err,
            InternalError::PropagationNonTermination {
                compiles: 2,
                units: 1,
                ..
            }
        ));
    }

    #[test]
    fn edge_display() {
        let edge = CrossModuleReference {
            module: "app".into(),
            unit: UnitId::new("main.kl"),
            target_module: "lib".into(),
            declaration: "g".into(),
        };
        assert_eq!(edge.to_string(), "app:main.kl -> lib::g");
    }
}
