//! Build introspection: what happened to every module and unit.

use serde::Serialize;

use crate::classify::DirtyFileState;
use crate::compiler::CompileError;
use crate::graph::UnitId;
use crate::state::ModuleState;

/// How a module's cache store was obtained at the start of its build.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreOrigin {
    /// Loaded and compatible.
    Loaded,
    /// No store on disk (first build).
    Missing,
    /// The store could not be read; started empty.
    Corrupt {
        /// Why the store was rejected.
        reason: String,
    },
    /// Written by another tool version or for another configuration.
    Stale,
}

/// Final state of one unit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UnitReport {
    /// Unit identity.
    pub unit: UnitId,
    /// Why the unit was or was not recompiled.
    #[serde(flatten)]
    pub state: DirtyFileState,
    /// Whether the unit was compiled this build.
    pub compiled: bool,
}

/// One unit that failed to compile.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UnitFailure {
    /// Unit identity.
    pub unit: UnitId,
    /// The compile error.
    pub error: CompileError,
}

/// Why a module did not succeed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModuleFailure {
    /// One or more of its own units failed to compile.
    Compile {
        /// The failing units.
        units: Vec<UnitFailure>,
    },
    /// Not processed because an upstream module failed.
    Skipped {
        /// The failing upstream modules at the root of the cascade.
        upstream: Vec<String>,
    },
    /// The build was cancelled before the module finished.
    Cancelled,
    /// Cache I/O failed while finishing the module.
    Cache {
        /// Description of the cache error.
        message: String,
    },
}

/// What happened to one module.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ModuleReport {
    /// Module name.
    pub name: String,
    /// Final state: `Succeeded` or `Failed`.
    pub state: ModuleState,
    /// How the store was obtained; absent for skipped modules.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<StoreOrigin>,
    /// Every unit, current units in source order followed by removed ones.
    pub units: Vec<UnitReport>,
    /// Exported declarations added, removed or changed by this build.
    pub changed_exports: Vec<String>,
    /// Set when the module did not succeed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<ModuleFailure>,
}

impl ModuleReport {
    pub(crate) fn failed(name: &str, store: Option<StoreOrigin>, failure: ModuleFailure) -> Self {
        Self {
            name: name.to_string(),
            state: ModuleState::Failed,
            store,
            units: Vec::new(),
            changed_exports: Vec::new(),
            failure: Some(failure),
        }
    }

    /// Returns `true` if the module built.
    pub fn succeeded(&self) -> bool {
        self.state == ModuleState::Succeeded
    }

    /// Returns `true` if the module was skipped for an upstream failure.
    pub fn is_skipped(&self) -> bool {
        matches!(self.failure, Some(ModuleFailure::Skipped { .. }))
    }

    /// Units compiled this build, in report order.
    pub fn compiled_units(&self) -> impl Iterator<Item = &UnitId> {
        self.units.iter().filter(|u| u.compiled).map(|u| &u.unit)
    }

    /// Looks up the report of one unit.
    pub fn unit(&self, id: &str) -> Option<&UnitReport> {
        self.units.iter().find(|u| u.unit.as_str() == id)
    }
}

/// Per-module outcome of a whole build, in dependency order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BuildReport {
    /// Module reports in dependency order, ties by name.
    pub modules: Vec<ModuleReport>,
}

impl BuildReport {
    /// Looks up a module report by name.
    pub fn module(&self, name: &str) -> Option<&ModuleReport> {
        self.modules.iter().find(|m| m.name == name)
    }

    /// State of one unit, if the module processed it.
    pub fn unit_state(&self, module: &str, unit: &str) -> Option<&DirtyFileState> {
        self.module(module)?.unit(unit).map(|u| &u.state)
    }

    /// Every unit compile failure, tagged with its module.
    pub fn failed_units(&self) -> Vec<(&str, &UnitFailure)> {
        self.modules
            .iter()
            .filter_map(|m| match &m.failure {
                Some(ModuleFailure::Compile { units }) => Some((m.name.as_str(), units)),
                _ => None,
            })
            .flat_map(|(name, units)| units.iter().map(move |u| (name, u)))
            .collect()
    }

    /// Modules skipped because something upstream failed.
    pub fn skipped_modules(&self) -> Vec<&ModuleReport> {
        self.modules.iter().filter(|m| m.is_skipped()).collect()
    }

    /// Total number of units compiled this build.
    pub fn compiled_count(&self) -> usize {
        self.modules.iter().map(|m| m.compiled_units().count()).sum()
    }

    /// Returns `true` if every module succeeded.
    pub fn is_success(&self) -> bool {
        self.modules.iter().all(ModuleReport::succeeded)
    }

    /// Renders the report as pretty JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn succeeded(name: &str, units: Vec<UnitReport>) -> ModuleReport {
        ModuleReport {
            name: name.into(),
            state: ModuleState::Succeeded,
            store: Some(StoreOrigin::Loaded),
            units,
            changed_exports: vec![],
            failure: None,
        }
    }

    fn sample() -> BuildReport {
        BuildReport {
            modules: vec![
                succeeded(
                    "util",
                    vec![
                        UnitReport {
                            unit: UnitId::new("util/a.kl"),
                            state: DirtyFileState::ModifiedBody,
                            compiled: true,
                        },
                        UnitReport {
                            unit: UnitId::new("util/b.kl"),
                            state: DirtyFileState::Unmodified,
                            compiled: false,
                        },
                    ],
                ),
                ModuleReport::failed(
                    "lib",
                    Some(StoreOrigin::Missing),
                    ModuleFailure::Compile {
                        units: vec![UnitFailure {
                            unit: UnitId::new("lib/g.kl"),
                            error: CompileError::at_line(2, "expected '{'"),
                        }],
                    },
                ),
                ModuleReport::failed(
                    "app",
                    None,
                    ModuleFailure::Skipped {
                        upstream: vec!["lib".into()],
                    },
                ),
            ],
        }
    }

    #[test]
    fn queries() {
        let report = sample();
        assert!(!report.is_success());
        assert_eq!(report.compiled_count(), 1);
        assert_eq!(
            report.unit_state("util", "util/b.kl"),
            Some(&DirtyFileState::Unmodified)
        );
        assert!(report.unit_state("app", "app/main.kl").is_none());

        let failed = report.failed_units();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0, "lib");

        let skipped = report.skipped_modules();
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].name, "app");
        assert!(!report.module("lib").unwrap().is_skipped());
    }

    #[test]
    fn json_shape() {
        let json: serde_json::Value =
            serde_json::from_str(&sample().to_json().unwrap()).unwrap();
        let util = &json["modules"][0];
        assert_eq!(util["state"], "succeeded");
        assert_eq!(util["store"]["kind"], "loaded");
        assert_eq!(util["units"][0]["state"], "modified_body");
        assert_eq!(util["units"][0]["unit"], "util/a.kl");
        let app = &json["modules"][2];
        assert_eq!(app["failure"]["kind"], "skipped");
        assert_eq!(app["failure"]["upstream"][0], "lib");
        assert!(app.get("store").is_none());
    }
}
