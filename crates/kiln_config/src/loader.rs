//! Configuration file loading and validation.

use crate::error::ConfigError;
use crate::types::ProjectConfig;
use std::collections::BTreeSet;
use std::path::Path;

/// Name of the project configuration file.
pub const CONFIG_FILE: &str = "kiln.toml";

/// Loads and validates a `kiln.toml` configuration from a project directory.
///
/// Reads `<project_dir>/kiln.toml`, parses it, and validates module references.
pub fn load_config(project_dir: &Path) -> Result<ProjectConfig, ConfigError> {
    let config_path = project_dir.join(CONFIG_FILE);
    let content = std::fs::read_to_string(&config_path).map_err(|source| ConfigError::Read {
        path: config_path.clone(),
        source,
    })?;
    load_config_from_str(&content)
}

/// Parses and validates a `kiln.toml` configuration from a string.
///
/// Useful for testing without filesystem dependencies.
pub fn load_config_from_str(content: &str) -> Result<ProjectConfig, ConfigError> {
    let config: ProjectConfig =
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_config(&config)?;
    Ok(config)
}

/// Validates required fields and cross-references between modules.
///
/// Cycles are not checked here; the module graph rejects them before any
/// cache work begins.
fn validate_config(config: &ProjectConfig) -> Result<(), ConfigError> {
    if config.project.name.is_empty() {
        return Err(ConfigError::MissingField("project.name".to_string()));
    }
    if config.modules.is_empty() {
        return Err(ConfigError::MissingField("modules".to_string()));
    }

    for (name, module) in &config.modules {
        if !is_valid_module_name(name) {
            return Err(ConfigError::InvalidModuleName(name.clone()));
        }
        if module.sources.is_empty() {
            return Err(ConfigError::MissingField(format!("modules.{name}.sources")));
        }

        let mut seen = BTreeSet::new();
        for dep in &module.dependencies {
            if dep == name {
                return Err(ConfigError::SelfDependency(name.clone()));
            }
            if !config.modules.contains_key(dep) {
                return Err(ConfigError::UnknownDependency {
                    module: name.clone(),
                    dependency: dep.clone(),
                });
            }
            if !seen.insert(dep.as_str()) {
                return Err(ConfigError::DuplicateDependency {
                    module: name.clone(),
                    dependency: dep.clone(),
                });
            }
        }

        for friend in &module.friends {
            if !seen.contains(friend.as_str()) {
                return Err(ConfigError::FriendNotDependency {
                    module: name.clone(),
                    friend: friend.clone(),
                });
            }
        }
    }
    Ok(())
}

fn is_valid_module_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_config() {
        let toml = r#"
[project]
name = "demo"
version = "0.1.0"

[modules.lib]
sources = ["lib"]
"#;
        let config = load_config_from_str(toml).unwrap();
        assert_eq!(config.project.name, "demo");
        assert_eq!(config.project.version, "0.1.0");
        assert_eq!(config.modules.len(), 1);
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
[project]
name = "demo"
version = "0.1.0"
description = "two modules"

[build]
cache_dir = "target/kiln"
output = "out/demo.klnk"
jobs = 4

[options]
opt-level = "2"

[modules.lib]
sources = ["lib"]
libraries = ["vendor/runtime"]

[modules.app]
sources = ["app", "extra/main.kl"]
dependencies = ["lib"]
friends = ["lib"]

[modules.app.options]
opt-level = "0"
"#;
        let config = load_config_from_str(toml).unwrap();
        assert_eq!(config.build.cache_dir, "target/kiln");
        assert_eq!(config.build.output.as_deref(), Some("out/demo.klnk"));
        assert_eq!(config.build.jobs, 4);
        let app = &config.modules["app"];
        assert_eq!(app.sources.len(), 2);
        assert_eq!(app.dependencies, vec!["lib"]);
        assert_eq!(app.friends, vec!["lib"]);
        assert_eq!(app.options["opt-level"], "0");
        assert_eq!(config.modules["lib"].libraries, vec!["vendor/runtime"]);
    }

    #[test]
    fn missing_name_errors() {
        let toml = r#"
[project]
name = ""
version = "0.1.0"

[modules.lib]
sources = ["lib"]
"#;
        let err = load_config_from_str(toml).unwrap_err();
        assert!(matches!(err, ConfigError::MissingField(_)));
    }

    #[test]
    fn no_modules_errors() {
        let toml = r#"
[project]
name = "demo"
version = "0.1.0"
"#;
        let err = load_config_from_str(toml).unwrap_err();
        assert!(matches!(err, ConfigError::MissingField(ref f) if f == "modules"));
    }

    #[test]
    fn empty_sources_errors() {
        let toml = r#"
[project]
name = "demo"
version = "0.1.0"

[modules.lib]
sources = []
"#;
        let err = load_config_from_str(toml).unwrap_err();
        assert!(matches!(err, ConfigError::MissingField(_)));
    }

    #[test]
    fn unknown_dependency_errors() {
        let toml = r#"
[project]
name = "demo"
version = "0.1.0"

[modules.app]
sources = ["app"]
dependencies = ["missing"]
"#;
        let err = load_config_from_str(toml).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::UnknownDependency { ref module, ref dependency }
                if module == "app" && dependency == "missing"
        ));
    }

    #[test]
    fn self_dependency_errors() {
        let toml = r#"
[project]
name = "demo"
version = "0.1.0"

[modules.app]
sources = ["app"]
dependencies = ["app"]
"#;
        let err = load_config_from_str(toml).unwrap_err();
        assert!(matches!(err, ConfigError::SelfDependency(ref m) if m == "app"));
    }

    #[test]
    fn repeated_dependency_errors() {
        let toml = r#"
[project]
name = "demo"
version = "0.1.0"

[modules.lib]
sources = ["lib"]

[modules.app]
sources = ["app"]
dependencies = ["lib", "lib"]
"#;
        let err = load_config_from_str(toml).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateDependency { .. }));
    }

    #[test]
    fn friend_must_be_dependency() {
        let toml = r#"
[project]
name = "demo"
version = "0.1.0"

[modules.lib]
sources = ["lib"]

[modules.app]
sources = ["app"]
friends = ["lib"]
"#;
        let err = load_config_from_str(toml).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::FriendNotDependency { ref friend, .. } if friend == "lib"
        ));
    }

    #[test]
    fn invalid_module_name_errors() {
        let toml = r#"
[project]
name = "demo"
version = "0.1.0"

[modules."my-lib"]
sources = ["lib"]
"#;
        let err = load_config_from_str(toml).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidModuleName(ref m) if m == "my-lib"));
    }

    #[test]
    fn invalid_toml_errors() {
        let err = load_config_from_str("this is not valid toml {{{}}}").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn io_error_from_nonexistent_dir() {
        let err = load_config(Path::new("/nonexistent/dir")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { ref path, .. } if path.ends_with(CONFIG_FILE)));
    }
}
