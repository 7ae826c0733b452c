//! Conformance test helpers for the Kiln incremental build cache.
//!
//! Provides an on-disk project fixture and a build runner that drives the
//! whole stack (`kiln.toml` → module graph → incremental rebuild → linked
//! artifact) the way the `kiln build` command does, returning structured
//! results for assertion in integration tests.

#![warn(missing_docs)]

use std::fs;
use std::path::{Path, PathBuf};

use kiln_cache::{
    BuildError, BuildReport, BuildSettings, DirtyFileState, ModuleGraph, RebuildOutput,
    TOOL_VERSION,
};
use kiln_config::ProjectConfig;
use kiln_lang::{KilnCompiler, ProjectError};
use tempfile::TempDir;

/// Configuration of the two-module `lib`/`app` project used by most scenarios.
pub const LIB_APP_CONFIG: &str = r#"
[project]
name = "demo"
version = "0.1.0"

[modules.lib]
sources = ["lib"]

[modules.app]
sources = ["app"]
dependencies = ["lib"]
"#;

/// A kiln project in a temporary directory.
pub struct Project {
    dir: TempDir,
    tool_version: String,
}

/// Result of one build of a [`Project`].
pub struct BuildRun {
    /// The outcome of the rebuild.
    pub result: Result<RebuildOutput, BuildError>,
}

impl BuildRun {
    /// The build report, whether or not the build succeeded.
    ///
    /// Panics if the build stopped before producing a report.
    pub fn report(&self) -> &BuildReport {
        match &self.result {
            Ok(output) => &output.report,
            Err(err) => err
                .report()
                .unwrap_or_else(|| panic!("build produced no report: {err}")),
        }
    }

    /// The successful output. Panics if the build failed.
    pub fn output(&self) -> &RebuildOutput {
        match &self.result {
            Ok(output) => output,
            Err(err) => panic!("build failed: {err}"),
        }
    }

    /// Returns `true` if every module built.
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }

    /// State of `unit` in `module`. Panics if the module did not report it.
    pub fn state(&self, module: &str, unit: &str) -> &DirtyFileState {
        self.report()
            .unit_state(module, unit)
            .unwrap_or_else(|| panic!("no state for {module}:{unit}"))
    }

    /// Units compiled in `module`, as strings.
    pub fn compiled(&self, module: &str) -> Vec<String> {
        self.report()
            .module(module)
            .map(|m| m.compiled_units().map(|u| u.to_string()).collect())
            .unwrap_or_default()
    }

    /// Total number of units compiled.
    pub fn compiled_count(&self) -> usize {
        self.report().compiled_count()
    }

    /// The linked artifact bytes. Panics if the build failed.
    pub fn artifact_bytes(&self) -> Vec<u8> {
        self.output()
            .artifact
            .to_bytes()
            .unwrap_or_else(|e| panic!("cannot encode linked artifact: {e}"))
    }
}

impl Project {
    /// Creates a project with the given `kiln.toml` content.
    pub fn new(config: &str) -> Self {
        let dir = TempDir::new().unwrap_or_else(|e| panic!("cannot create temp dir: {e}"));
        let project = Self {
            dir,
            tool_version: TOOL_VERSION.to_string(),
        };
        project.write(kiln_config::CONFIG_FILE, config);
        project
    }

    /// Creates a `lib`/`app` project from `(path, content)` source files.
    pub fn lib_app(files: &[(&str, &str)]) -> Self {
        let project = Self::new(LIB_APP_CONFIG);
        for (path, content) in files {
            project.write(path, content);
        }
        project
    }

    /// The project root.
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// The absolute path of a project-relative file.
    pub fn path(&self, relative: &str) -> PathBuf {
        self.root().join(relative)
    }

    /// Writes a project-relative file, creating parent directories.
    pub fn write(&self, relative: &str, content: &str) {
        let path = self.path(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap_or_else(|e| panic!("cannot create {parent:?}: {e}"));
        }
        fs::write(&path, content).unwrap_or_else(|e| panic!("cannot write {path:?}: {e}"));
    }

    /// Deletes a project-relative file.
    pub fn remove(&self, relative: &str) {
        let path = self.path(relative);
        fs::remove_file(&path).unwrap_or_else(|e| panic!("cannot remove {path:?}: {e}"));
    }

    /// Uses a different tool version for subsequent builds.
    pub fn set_tool_version(&mut self, version: &str) {
        self.tool_version = version.to_string();
    }

    /// Loads `kiln.toml`.
    pub fn config(&self) -> ProjectConfig {
        kiln_config::load_config(self.root()).unwrap_or_else(|e| panic!("bad kiln.toml: {e}"))
    }

    /// The cache directory of the project.
    pub fn cache_dir(&self) -> PathBuf {
        self.config().cache_dir(self.root())
    }

    /// The store file of `module`.
    pub fn store_path(&self, module: &str) -> PathBuf {
        kiln_cache::CacheStore::path(&self.cache_dir().join(module))
    }

    /// The partial artifact files currently cached for `module`.
    pub fn partial_files(&self, module: &str) -> Vec<PathBuf> {
        let dir = self.cache_dir().join(module).join("partials");
        let mut files: Vec<PathBuf> = match fs::read_dir(&dir) {
            Ok(entries) => entries.flatten().map(|e| e.path()).collect(),
            Err(_) => Vec::new(),
        };
        files.sort();
        files
    }

    /// Builds the module graph of the project.
    pub fn graph(&self) -> Result<ModuleGraph, ProjectError> {
        kiln_lang::module_graph(&self.config(), self.root())
    }

    /// Runs one incremental build and, on success, writes the linked output.
    ///
    /// Panics if the project itself cannot be loaded.
    pub fn build(&self) -> BuildRun {
        let config = self.config();
        let graph = self
            .graph()
            .unwrap_or_else(|e| panic!("cannot load project: {e}"));
        let settings = BuildSettings::new(config.cache_dir(self.root()))
            .with_jobs(2)
            .with_tool_version(self.tool_version.clone());
        let result = kiln_cache::rebuild_all(KilnCompiler::new(), &graph, settings);
        if let Ok(output) = &result {
            output
                .artifact
                .write_to(&config.output_path(self.root()))
                .unwrap_or_else(|e| panic!("cannot write linked artifact: {e}"));
        }
        BuildRun { result }
    }
}
