//! Failure isolation, retries and cache recovery.
//!
//! These tests damage or invalidate the cache (corrupt stores, evicted
//! partials, configuration and tool-version changes) and break sources, then
//! check that the next build recovers with exactly the expected rebuilds.

use std::fs;

use kiln_cache::{DirtyFileState, GraphError, ModuleFailure, Reference, StoreOrigin};
use kiln_conformance::{Project, LIB_APP_CONFIG};
use kiln_lang::ProjectError;

const LIB_G: &str = "pub fn g(x: Int) -> Int { x + 1 }\n";
const LIB_H: &str = "pub fn h() -> Int { 7 }\n";
const APP_MAIN: &str = "pub fn main() -> Int { lib::g(1) }\n";

fn demo() -> Project {
    Project::lib_app(&[
        ("lib/g.kl", LIB_G),
        ("lib/h.kl", LIB_H),
        ("app/main.kl", APP_MAIN),
    ])
}

fn store_origin<'a>(run: &'a kiln_conformance::BuildRun, module: &str) -> &'a StoreOrigin {
    run.report()
        .module(module)
        .and_then(|m| m.store.as_ref())
        .unwrap()
}

// ===========================================================================
// Failure isolation
// ===========================================================================

const FOUR_MODULES: &str = r#"
[project]
name = "wide"
version = "0.1.0"

[modules.lib]
sources = ["lib"]

[modules.app]
sources = ["app"]
dependencies = ["lib"]

[modules.tool]
sources = ["tool"]
dependencies = ["app"]

[modules.util]
sources = ["util"]
"#;

#[test]
fn failure_skips_dependents_but_not_unrelated_modules() {
    let project = Project::new(FOUR_MODULES);
    project.write("lib/g.kl", LIB_G);
    project.write("lib/bad.kl", "pub fn broken( -> Int { 1 }\n");
    project.write("app/main.kl", APP_MAIN);
    project.write("tool/t.kl", "fn t() -> Int { app::main() }\n");
    project.write("util/u.kl", "pub fn u() -> Int { 3 }\n");

    let run = project.build();
    assert!(!run.succeeded());
    let report = run.report();

    let failures = report.failed_units();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, "lib");
    assert_eq!(failures[0].1.unit.as_str(), "lib/bad.kl");
    assert_eq!(failures[0].1.error.line, Some(1));

    for skipped in ["app", "tool"] {
        assert_eq!(
            report.module(skipped).unwrap().failure,
            Some(ModuleFailure::Skipped {
                upstream: vec!["lib".to_string()]
            })
        );
    }
    assert!(report.module("util").unwrap().succeeded());
    assert!(!project.store_path("lib").exists());
    assert!(!project.store_path("app").exists());
    assert!(project.store_path("util").exists());
}

#[test]
fn failed_module_is_retried_against_its_last_good_snapshot() {
    let project = demo();
    project.build();

    // The signature change is absorbed by a build that fails.
    project.write("lib/g.kl", "pub fn g(x: Long) -> Int { x + 1 }\n");
    project.write("lib/h.kl", "pub fn h() -> Int { 7 \n");
    let failed = project.build();
    assert!(!failed.succeeded());
    assert!(failed.report().module("app").unwrap().is_skipped());

    project.write("lib/h.kl", LIB_H);
    let run = project.build();

    assert!(run.succeeded());
    assert_eq!(run.state("lib", "lib/g.kl"), &DirtyFileState::ModifiedSignature);
    assert_eq!(run.state("lib", "lib/h.kl"), &DirtyFileState::Unmodified);
    assert_eq!(
        run.state("app", "app/main.kl"),
        &DirtyFileState::Invalidated {
            causes: vec![Reference::new("lib", "g")]
        }
    );
}

// ===========================================================================
// Cache damage
// ===========================================================================

#[test]
fn corrupt_store_rebuilds_only_that_module() {
    let project = demo();
    let first = project.build();

    fs::write(project.store_path("lib"), "{ not json").unwrap();
    let run = project.build();

    assert!(run.succeeded());
    assert!(matches!(store_origin(&run, "lib"), StoreOrigin::Corrupt { .. }));
    assert_eq!(run.compiled("lib"), vec!["lib/g.kl", "lib/h.kl"]);
    assert_eq!(run.state("lib", "lib/g.kl"), &DirtyFileState::Added);
    assert!(run.compiled("app").is_empty());
    assert_eq!(first.artifact_bytes(), run.artifact_bytes());

    let third = project.build();
    assert_eq!(third.compiled_count(), 0);
    assert_eq!(store_origin(&third, "lib"), &StoreOrigin::Loaded);
}

#[test]
fn evicted_partial_is_recompiled() {
    let project = demo();
    let first = project.build();

    let partials = project.partial_files("lib");
    assert_eq!(partials.len(), 2);
    for partial in &partials {
        fs::remove_file(partial).unwrap();
    }
    let run = project.build();

    assert!(run.succeeded());
    assert_eq!(run.state("lib", "lib/g.kl"), &DirtyFileState::Evicted);
    assert_eq!(run.state("lib", "lib/h.kl"), &DirtyFileState::Evicted);
    assert_eq!(run.compiled("lib").len(), 2);
    assert!(run.compiled("app").is_empty());
    assert_eq!(first.artifact_bytes(), run.artifact_bytes());
    assert_eq!(project.partial_files("lib").len(), 2);
}

#[test]
fn truncated_partial_is_recompiled() {
    let project = demo();
    project.build();

    let partials = project.partial_files("app");
    fs::write(&partials[0], b"KI").unwrap();
    let run = project.build();

    assert_eq!(run.state("app", "app/main.kl"), &DirtyFileState::Evicted);
    assert_eq!(run.compiled("app"), vec!["app/main.kl"]);
}

#[test]
fn unremovable_stale_partial_does_not_fail_the_build() {
    let project = demo();
    project.build();
    let junk = project.cache_dir().join("lib").join("partials").join("junk.part");
    fs::create_dir(&junk).unwrap();

    project.write("lib/g.kl", "pub fn g(x: Int) -> Int { x + 2 }\n");
    let run = project.build();
    assert!(run.succeeded());
    assert_eq!(run.compiled("lib"), vec!["lib/g.kl"]);
    assert_eq!(project.partial_files("lib").len(), 3);

    let next = project.build();
    assert!(next.succeeded());
    assert_eq!(next.compiled_count(), 0);
}

// ===========================================================================
// Configuration and tool changes
// ===========================================================================

#[test]
fn option_change_rebuilds_the_affected_module() {
    let project = demo();
    project.build();

    project.write(
        "kiln.toml",
        &format!("{LIB_APP_CONFIG}\n[modules.app.options]\ndebug = true\n"),
    );
    let run = project.build();

    assert!(run.succeeded());
    assert_eq!(store_origin(&run, "app"), &StoreOrigin::Stale);
    assert_eq!(store_origin(&run, "lib"), &StoreOrigin::Loaded);
    assert_eq!(run.compiled("app"), vec!["app/main.kl"]);
    assert!(run.compiled("lib").is_empty());
}

#[test]
fn library_content_is_part_of_the_configuration() {
    let project = Project::new(
        r#"
[project]
name = "vendored"
version = "0.1.0"

[modules.lib]
sources = ["lib"]
libraries = ["vendor"]
"#,
    );
    project.write("lib/g.kl", LIB_G);
    project.write("vendor/runtime.bin", "v1");
    project.build();

    assert_eq!(project.build().compiled_count(), 0);

    project.write("vendor/runtime.bin", "v2");
    let run = project.build();
    assert_eq!(store_origin(&run, "lib"), &StoreOrigin::Stale);
    assert_eq!(run.compiled("lib"), vec!["lib/g.kl"]);
}

#[test]
fn tool_version_change_rebuilds_everything() {
    let mut project = demo();
    project.build();

    project.set_tool_version("999.0.0");
    let run = project.build();

    assert!(run.succeeded());
    assert_eq!(run.compiled_count(), 3);
    assert_eq!(store_origin(&run, "lib"), &StoreOrigin::Stale);
    assert_eq!(store_origin(&run, "app"), &StoreOrigin::Stale);
}

// ===========================================================================
// Graph validation
// ===========================================================================

#[test]
fn cyclic_modules_are_rejected_before_any_cache_work() {
    let project = Project::new(
        r#"
[project]
name = "cycle"
version = "0.1.0"

[modules.a]
sources = ["a"]
dependencies = ["b"]

[modules.b]
sources = ["b"]
dependencies = ["a"]
"#,
    );
    project.write("a/x.kl", "fn x() -> Int { 1 }\n");

    match project.graph() {
        Err(ProjectError::Graph(GraphError::CyclicModuleDependency { cycle })) => {
            assert!(cycle.contains(&"a".to_string()));
            assert!(cycle.contains(&"b".to_string()));
        }
        other => panic!("expected a cycle error, got {other:?}"),
    }
    assert!(!project.cache_dir().exists());
}
