//! Error types for cache, graph and build operations.

use std::fmt;
use std::path::PathBuf;

use kiln_common::InternalError;

use crate::report::BuildReport;

/// Errors that can occur during cache operations.
///
/// Most cache reads are fail-safe: a [`CorruptCache`](Self::CorruptCache)
/// store or an unreadable artifact degrades to a cache miss rather than a
/// failed build.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// An I/O error occurred while reading or writing cache files.
    #[error("cache I/O error at {path}: {source}")]
    Io {
        /// The path that caused the error.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// A persisted cache store exists but cannot be parsed.
    #[error("corrupt cache store at {path}: {reason}")]
    CorruptCache {
        /// The store file path.
        path: PathBuf,
        /// Description of the parse failure.
        reason: String,
    },

    /// An artifact has an invalid header or payload.
    #[error("invalid artifact: {reason}")]
    InvalidArtifact {
        /// Description of the problem.
        reason: String,
    },

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {reason}")]
    Serialization {
        /// Description of the serialization failure.
        reason: String,
    },
}

impl CacheError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CacheError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors in the module graph, raised before any cache work begins.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    /// The module dependency graph contains a cycle.
    #[error("cyclic module dependency: {}", CyclePath(.cycle))]
    CyclicModuleDependency {
        /// Module names along the cycle, starting and ending with the same module.
        cycle: Vec<String>,
    },

    /// A module depends on a module that is not part of the graph.
    #[error("module '{module}' depends on unknown module '{dependency}'")]
    UnknownDependency {
        /// The depending module.
        module: String,
        /// The missing dependency.
        dependency: String,
    },

    /// A module names a friend it does not depend on.
    #[error("module '{module}' names '{friend}' as a friend but does not depend on it")]
    FriendNotDependency {
        /// The module declaring the friend.
        module: String,
        /// The friend module name.
        friend: String,
    },

    /// Two modules share the same name.
    #[error("duplicate module '{0}'")]
    DuplicateModule(String),

    /// Two units of the same module share the same identity.
    #[error("duplicate source unit '{unit}' in module '{module}'")]
    DuplicateUnit {
        /// The module containing the duplicate.
        module: String,
        /// The duplicated unit identity.
        unit: String,
    },
}

struct CyclePath<'a>(&'a [String]);

impl fmt::Display for CyclePath<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(" -> "))
    }
}

/// Errors returned by [`rebuild_all`](crate::rebuild_all).
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// The module graph is invalid.
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// An internal invariant was violated.
    #[error(transparent)]
    Internal(#[from] InternalError),

    /// One or more modules failed to build or were skipped.
    #[error("build failed: {}", FailureSummary(.0))]
    Failed(Box<BuildReport>),

    /// The build was cancelled before every module finished.
    #[error("build cancelled")]
    Cancelled(Box<BuildReport>),

    /// Writing the linked output failed.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// The worker pool could not be created.
    #[error("failed to start worker pool: {0}")]
    ThreadPool(String),
}

impl BuildError {
    /// Returns the build report, if the build got far enough to produce one.
    pub fn report(&self) -> Option<&BuildReport> {
        match self {
            BuildError::Failed(report) | BuildError::Cancelled(report) => Some(report),
            _ => None,
        }
    }
}

struct FailureSummary<'a>(&'a BuildReport);

impl fmt::Display for FailureSummary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let failed = self.0.failed_units().len();
        let skipped = self.0.skipped_modules().len();
        write!(
            f,
            "{failed} unit(s) failed to compile, {skipped} module(s) skipped"
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_display() {
        let err = CacheError::io(
            "/tmp/cache/lib/store.json",
            std::io::Error::new(std::io::ErrorKind::NotFound, "file not found"),
        );
        let msg = err.to_string();
        assert!(msg.contains("cache I/O error"));
        assert!(msg.contains("store.json"));
    }

    #[test]
    fn corrupt_cache_display() {
        let err = CacheError::CorruptCache {
            path: PathBuf::from("lib/store.json"),
            reason: "unexpected EOF".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("corrupt cache store"));
        assert!(msg.contains("unexpected EOF"));
    }

    #[test]
    fn invalid_artifact_display() {
        let err = CacheError::InvalidArtifact {
            reason: "missing magic bytes".to_string(),
        };
        assert!(err.to_string().contains("missing magic bytes"));
    }

    #[test]
    fn cycle_display() {
        let err = GraphError::CyclicModuleDependency {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "cyclic module dependency: a -> b -> a");
    }

    #[test]
    fn unknown_dependency_display() {
        let err = GraphError::UnknownDependency {
            module: "app".into(),
            dependency: "lib".into(),
        };
        assert_eq!(
            err.to_string(),
            "module 'app' depends on unknown module 'lib'"
        );
    }

    #[test]
    fn internal_error_is_transparent() {
        let err: BuildError = InternalError::new("unit without artifact").into();
        assert_eq!(
            err.to_string(),
            "build cache invariant violated: unit without artifact"
        );
        assert!(err.report().is_none());
    }
}
