//! Turning a `kiln.toml` project on disk into a [`ModuleGraph`].
//!
//! Each module's `sources` entries are directories (searched recursively for
//! `*.kl` files) or individual files. Units are identified by their path
//! relative to the project root and ordered by that identity.

use std::path::{Path, PathBuf};

use kiln_cache::{GraphError, Module, ModuleGraph, SourceUnit};
use kiln_config::{resolve_modules, ConfigError, ProjectConfig, ResolvedModule};
use tracing::debug;

use crate::SOURCE_EXTENSION;

/// Errors raised while loading a project.
#[derive(Debug, thiserror::Error)]
pub enum ProjectError {
    /// The configuration is missing or invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A source location could not be listed.
    #[error("failed to read sources of module '{module}' at {}: {source}", .path.display())]
    Sources {
        /// Module whose sources were being listed.
        module: String,
        /// The unreadable path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The module graph is invalid.
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Builds the module graph of the project rooted at `project_dir`.
pub fn module_graph(
    config: &ProjectConfig,
    project_dir: &Path,
) -> Result<ModuleGraph, ProjectError> {
    let modules = resolve_modules(config, project_dir)?
        .into_iter()
        .map(|resolved| to_module(resolved, project_dir))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ModuleGraph::new(modules)?)
}

fn to_module(resolved: ResolvedModule, project_dir: &Path) -> Result<Module, ProjectError> {
    let mut files = Vec::new();
    for source in &resolved.sources {
        collect_sources(source, &mut files).map_err(|e| ProjectError::Sources {
            module: resolved.name.clone(),
            path: source.clone(),
            source: e,
        })?;
    }
    let mut units: Vec<SourceUnit> = files
        .into_iter()
        .map(|path| SourceUnit::relative_to(project_dir, path))
        .collect();
    units.sort_by(|a, b| a.id.cmp(&b.id));
    units.dedup_by(|a, b| a.id == b.id);
    debug!(module = %resolved.name, units = units.len(), "discovered sources");

    Ok(Module {
        name: resolved.name,
        units,
        dependencies: resolved.dependencies,
        friends: resolved.friends,
        options: resolved.options,
        libraries: resolved.libraries,
    })
}

/// Collects `*.kl` files under `path`. A missing source directory contributes
/// no units, so deleting a module's last file reads as removals.
fn collect_sources(path: &Path, files: &mut Vec<PathBuf>) -> std::io::Result<()> {
    if path.is_file() {
        files.push(path.to_path_buf());
        return Ok(());
    }
    if !path.exists() {
        return Ok(());
    }
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let child = entry.path();
        if entry.file_type()?.is_dir() {
            collect_sources(&child, files)?;
        } else if is_source(&child) {
            files.push(child);
        }
    }
    Ok(())
}

/// Returns `true` for `*.kl` files.
pub fn is_source(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| ext == SOURCE_EXTENSION)
}
