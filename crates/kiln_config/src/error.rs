//! Errors raised while reading and validating `kiln.toml`.

use std::path::PathBuf;

/// A `kiln.toml` that cannot be read or does not describe a valid module set.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("cannot read {}: {source}", .path.display())]
    Read {
        /// Path of the configuration file.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML or does not match the schema.
    #[error("invalid kiln.toml: {0}")]
    Parse(String),

    /// A required key is absent or empty, e.g. `modules.<name>.sources`.
    #[error("kiln.toml is missing '{0}'")]
    MissingField(String),

    /// A module name is not an identifier, so it cannot qualify references.
    #[error("module name '{0}' must be an identifier (letters, digits, '_')")]
    InvalidModuleName(String),

    /// A dependency names a module that is not configured.
    #[error("module '{module}' depends on unknown module '{dependency}'")]
    UnknownDependency {
        /// Module declaring the dependency.
        module: String,
        /// The missing dependency.
        dependency: String,
    },

    /// A module lists itself as a dependency.
    #[error("module '{0}' depends on itself")]
    SelfDependency(String),

    /// A dependency is listed twice.
    #[error("module '{module}' lists dependency '{dependency}' more than once")]
    DuplicateDependency {
        /// Module declaring the dependency.
        module: String,
        /// The repeated dependency.
        dependency: String,
    },

    /// Friends see internal declarations, which only dependencies can reach.
    #[error("module '{module}' names '{friend}' as a friend but does not depend on it")]
    FriendNotDependency {
        /// Module declaring the friend.
        module: String,
        /// The friend that is not a dependency.
        friend: String,
    },

    /// A lookup named a module the configuration does not define.
    #[error("no module named '{0}' in kiln.toml")]
    UnknownModule(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_error_names_the_file() {
        let err = ConfigError::Read {
            path: PathBuf::from("/proj/kiln.toml"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
        };
        assert_eq!(err.to_string(), "cannot read /proj/kiln.toml: no such file");
    }

    #[test]
    fn dependency_errors_name_both_modules() {
        let err = ConfigError::UnknownDependency {
            module: "app".into(),
            dependency: "lbi".into(),
        };
        assert_eq!(err.to_string(), "module 'app' depends on unknown module 'lbi'");

        let err = ConfigError::FriendNotDependency {
            module: "app".into(),
            friend: "util".into(),
        };
        assert_eq!(
            err.to_string(),
            "module 'app' names 'util' as a friend but does not depend on it"
        );
    }

    #[test]
    fn missing_field_quotes_the_key() {
        let err = ConfigError::MissingField("modules.lib.sources".into());
        assert_eq!(err.to_string(), "kiln.toml is missing 'modules.lib.sources'");
    }
}
