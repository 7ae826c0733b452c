//! Module resolution: merging global and module-specific configuration.

use crate::error::ConfigError;
use crate::types::ProjectConfig;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// A fully resolved module definition with project-relative paths anchored
/// at the project root and options merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModule {
    /// The module name.
    pub name: String,
    /// Source directories or files, joined onto the project root.
    pub sources: Vec<PathBuf>,
    /// Names of modules this module depends on, in declaration order.
    pub dependencies: Vec<String>,
    /// Friend modules (a subset of `dependencies`).
    pub friends: Vec<String>,
    /// Extra input directories, joined onto the project root.
    pub libraries: Vec<PathBuf>,
    /// Merged compiler options (global base + module overlay).
    pub options: BTreeMap<String, String>,
}

/// Resolves a named module by merging global options with module overrides.
pub fn resolve_module(
    config: &ProjectConfig,
    project_dir: &Path,
    module_name: &str,
) -> Result<ResolvedModule, ConfigError> {
    let module = config
        .modules
        .get(module_name)
        .ok_or_else(|| ConfigError::UnknownModule(module_name.to_string()))?;

    let mut options = config.options.clone();
    for (key, value) in &module.options {
        options.insert(key.clone(), value.clone());
    }

    Ok(ResolvedModule {
        name: module_name.to_string(),
        sources: module.sources.iter().map(|s| project_dir.join(s)).collect(),
        dependencies: module.dependencies.clone(),
        friends: module.friends.clone(),
        libraries: module.libraries.iter().map(|l| project_dir.join(l)).collect(),
        options,
    })
}

/// Resolves every module in the configuration, ordered by module name.
pub fn resolve_modules(
    config: &ProjectConfig,
    project_dir: &Path,
) -> Result<Vec<ResolvedModule>, ConfigError> {
    config
        .modules
        .keys()
        .map(|name| resolve_module(config, project_dir, name))
        .collect()
}

impl ProjectConfig {
    /// Returns the absolute cache directory for a project rooted at `project_dir`.
    pub fn cache_dir(&self, project_dir: &Path) -> PathBuf {
        project_dir.join(&self.build.cache_dir)
    }

    /// Returns the absolute linked-output path for a project rooted at `project_dir`.
    pub fn output_path(&self, project_dir: &Path) -> PathBuf {
        match &self.build.output {
            Some(output) => project_dir.join(output),
            None => project_dir
                .join("build")
                .join(format!("{}.klnk", self.project.name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::load_config_from_str;

    const CONFIG: &str = r#"
[project]
name = "demo"
version = "0.1.0"

[options]
opt-level = "2"
debug = false

[modules.lib]
sources = ["lib"]
libraries = ["vendor"]

[modules.app]
sources = ["app"]
dependencies = ["lib"]

[modules.app.options]
debug = true
"#;

    #[test]
    fn module_options_overlay_global() {
        let config = load_config_from_str(CONFIG).unwrap();
        let app = resolve_module(&config, Path::new("/proj"), "app").unwrap();
        assert_eq!(app.options["opt-level"], "2");
        assert_eq!(app.options["debug"], "true");
        assert_eq!(app.dependencies, vec!["lib"]);
    }

    #[test]
    fn paths_are_anchored_at_project_root() {
        let config = load_config_from_str(CONFIG).unwrap();
        let lib = resolve_module(&config, Path::new("/proj"), "lib").unwrap();
        assert_eq!(lib.sources, vec![PathBuf::from("/proj/lib")]);
        assert_eq!(lib.libraries, vec![PathBuf::from("/proj/vendor")]);
        assert_eq!(lib.options["debug"], "false");
    }

    #[test]
    fn unknown_module_errors() {
        let config = load_config_from_str(CONFIG).unwrap();
        let err = resolve_module(&config, Path::new("/proj"), "nope").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownModule(_)));
    }

    #[test]
    fn resolve_all_sorted_by_name() {
        let config = load_config_from_str(CONFIG).unwrap();
        let modules = resolve_modules(&config, Path::new("/proj")).unwrap();
        let names: Vec<_> = modules.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["app", "lib"]);
    }

    #[test]
    fn default_output_path_uses_project_name() {
        let config = load_config_from_str(CONFIG).unwrap();
        assert_eq!(
            config.output_path(Path::new("/proj")),
            PathBuf::from("/proj/build/demo.klnk")
        );
        assert_eq!(
            config.cache_dir(Path::new("/proj")),
            PathBuf::from("/proj/.kiln-cache")
        );
    }
}
