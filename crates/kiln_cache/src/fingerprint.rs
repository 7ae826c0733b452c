//! Fingerprint engine: structural digests of files, directory trees,
//! declarations and module configuration.
//!
//! Only byte content, structural shape and logical configuration values
//! participate. Timestamps and absolute paths never do, so a cache stays
//! valid across machines and checkouts.

use std::fs::Metadata;
use std::path::Path;

use kiln_common::{Fingerprint, FingerprintHasher};
use serde::{Deserialize, Serialize};

use crate::compiler::Visibility;
use crate::error::CacheError;
use crate::graph::Module;

/// Computes the fingerprint of a source unit's bytes.
pub fn fingerprint_bytes(source: &[u8]) -> Fingerprint {
    Fingerprint::from_bytes(source)
}

/// Reads a file and fingerprints its content.
pub fn fingerprint_file(path: &Path) -> Result<Fingerprint, CacheError> {
    let content = std::fs::read(path).map_err(|e| CacheError::io(path, e))?;
    Ok(fingerprint_bytes(&content))
}

/// Fingerprints a directory tree.
///
/// Children are visited sorted by file name. Each child contributes its
/// path relative to `root` before its content, so renaming or moving a file
/// changes the result while directory-listing order does not. A plain file
/// fingerprints as its content.
///
/// `root` itself may be a symlink. Symlinks below it are not followed: they
/// contribute their target path instead, so a link cycle cannot recurse.
pub fn fingerprint_dir(root: &Path) -> Result<Fingerprint, CacheError> {
    let meta = std::fs::metadata(root).map_err(|e| CacheError::io(root, e))?;
    let mut hasher = FingerprintHasher::new();
    hash_tree(root, &meta, "", &mut hasher)?;
    Ok(hasher.finish())
}

fn hash_tree(
    path: &Path,
    meta: &Metadata,
    prefix: &str,
    hasher: &mut FingerprintHasher,
) -> Result<(), CacheError> {
    if meta.file_type().is_symlink() {
        let target = std::fs::read_link(path).map_err(|e| CacheError::io(path, e))?;
        hasher.update_str("symlink").update_str(&target.to_string_lossy());
        return Ok(());
    }
    if !meta.is_dir() {
        let content = std::fs::read(path).map_err(|e| CacheError::io(path, e))?;
        hasher.update_bytes(&content);
        return Ok(());
    }

    let mut children = Vec::new();
    for entry in std::fs::read_dir(path).map_err(|e| CacheError::io(path, e))? {
        let entry = entry.map_err(|e| CacheError::io(path, e))?;
        children.push((entry.file_name().to_string_lossy().into_owned(), entry.path()));
    }
    children.sort_by(|a, b| a.0.cmp(&b.0));

    for (name, child) in children {
        let relative = format!("{prefix}{name}");
        hasher.update_str(&relative);
        let child_meta =
            std::fs::symlink_metadata(&child).map_err(|e| CacheError::io(&child, e))?;
        hash_tree(&child, &child_meta, &format!("{relative}/"), hasher)?;
    }
    Ok(())
}

/// The kind of a linkable declaration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeclarationKind {
    /// A function.
    Function,
    /// A compile-time constant; its value is part of its shape.
    Constant,
    /// A type declaration.
    Type,
}

impl DeclarationKind {
    fn tag(self) -> &'static str {
        match self {
            DeclarationKind::Function => "fn",
            DeclarationKind::Constant => "const",
            DeclarationKind::Type => "type",
        }
    }
}

/// The structural shape of a declaration, as seen by its callers.
///
/// The body is deliberately absent: a body edit that leaves the shape alone
/// keeps the fingerprint, and therefore never invalidates dependents.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeclarationShape {
    /// Declaration kind.
    pub kind: DeclarationKind,
    /// Declaration name.
    pub name: String,
    /// Visibility.
    pub visibility: Visibility,
    /// Rendered signature (parameter and result types).
    pub signature: String,
    /// Annotation names; order is not significant.
    pub annotations: Vec<String>,
    /// For each parameter, whether it declares a default value.
    pub parameter_defaults: Vec<bool>,
    /// Evaluated value of a compile-time constant.
    pub constant_value: Option<String>,
}

impl DeclarationShape {
    /// Computes the declaration fingerprint.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut annotations: Vec<&str> = self.annotations.iter().map(String::as_str).collect();
        annotations.sort_unstable();

        let mut hasher = FingerprintHasher::new();
        hasher
            .update_str(self.kind.tag())
            .update_str(&self.name)
            .update_str(visibility_tag(self.visibility))
            .update_str(&self.signature)
            .update_each(annotations, |h, a| {
                h.update_str(a);
            })
            .update_each(&self.parameter_defaults, |h, d| {
                h.update_bool(*d);
            });
        match &self.constant_value {
            Some(value) => hasher.update_bool(true).update_str(value),
            None => hasher.update_bool(false),
        };
        hasher.finish()
    }
}

fn visibility_tag(visibility: Visibility) -> &'static str {
    match visibility {
        Visibility::Public => "public",
        Visibility::Internal => "internal",
        Visibility::Private => "private",
    }
}

/// Fingerprints a module's configuration.
///
/// Covers the module name, the tool version, resolved options, dependency and
/// friend names, and the content of every library directory. A change to any
/// of these invalidates the module's whole cache store.
pub fn module_config_fingerprint(
    module: &Module,
    tool_version: &str,
) -> Result<Fingerprint, CacheError> {
    let mut dependencies: Vec<&str> = module.dependencies.iter().map(String::as_str).collect();
    dependencies.sort_unstable();
    let mut friends: Vec<&str> = module.friends.iter().map(String::as_str).collect();
    friends.sort_unstable();

    let mut libraries = Vec::with_capacity(module.libraries.len());
    for dir in &module.libraries {
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        libraries.push((name, fingerprint_dir(dir)?));
    }
    libraries.sort();

    let mut hasher = FingerprintHasher::new();
    hasher
        .update_str(&module.name)
        .update_str(tool_version)
        .update_each(&module.options, |h, (key, value)| {
            h.update_str(key).update_str(value);
        })
        .update_each(dependencies, |h, d| {
            h.update_str(d);
        })
        .update_each(friends, |h, f| {
            h.update_str(f);
        })
        .update_each(libraries, |h, (name, fp)| {
            h.update_str(&name).update_fingerprint(fp);
        });
    Ok(hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape(signature: &str) -> DeclarationShape {
        DeclarationShape {
            kind: DeclarationKind::Function,
            name: "g".into(),
            visibility: Visibility::Public,
            signature: signature.into(),
            annotations: vec![],
            parameter_defaults: vec![false],
            constant_value: None,
        }
    }

    #[test]
    fn file_fingerprint_ignores_location() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.kl");
        let nested = dir.path().join("Nested").join("COPY.KL");
        std::fs::create_dir_all(nested.parent().unwrap()).unwrap();
        std::fs::write(&a, "pub fn g(x: Int) -> Int { x }").unwrap();
        std::fs::copy(&a, &nested).unwrap();
        assert_eq!(fingerprint_file(&a).unwrap(), fingerprint_file(&nested).unwrap());
    }

    #[test]
    fn file_fingerprint_missing_errors() {
        assert!(fingerprint_file(Path::new("/nonexistent/file.kl")).is_err());
    }

    #[test]
    fn dir_fingerprint_stable_across_copies() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        for root in [a.path(), b.path()] {
            std::fs::create_dir_all(root.join("sub")).unwrap();
            std::fs::write(root.join("one.txt"), "1").unwrap();
            std::fs::write(root.join("sub").join("two.txt"), "2").unwrap();
        }
        assert_eq!(fingerprint_dir(a.path()).unwrap(), fingerprint_dir(b.path()).unwrap());
    }

    #[test]
    fn dir_fingerprint_detects_rename() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("one.txt"), "1").unwrap();
        let before = fingerprint_dir(dir.path()).unwrap();
        std::fs::rename(dir.path().join("one.txt"), dir.path().join("uno.txt")).unwrap();
        assert_ne!(before, fingerprint_dir(dir.path()).unwrap());
    }

    #[test]
    fn dir_fingerprint_detects_move_between_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a")).unwrap();
        std::fs::create_dir_all(dir.path().join("b")).unwrap();
        std::fs::write(dir.path().join("a").join("f.txt"), "x").unwrap();
        let before = fingerprint_dir(dir.path()).unwrap();
        std::fs::rename(dir.path().join("a").join("f.txt"), dir.path().join("b").join("f.txt"))
            .unwrap();
        assert_ne!(before, fingerprint_dir(dir.path()).unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn dir_fingerprint_does_not_follow_symlink_cycles() {
        use std::os::unix::fs::symlink;

        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub").join("f.txt"), "x").unwrap();
        symlink(dir.path(), dir.path().join("sub").join("loop")).unwrap();
        let before = fingerprint_dir(dir.path()).unwrap();

        std::fs::remove_file(dir.path().join("sub").join("loop")).unwrap();
        symlink(dir.path().join("sub"), dir.path().join("sub").join("loop")).unwrap();
        assert_ne!(before, fingerprint_dir(dir.path()).unwrap());
    }

    #[test]
    fn signature_change_changes_fingerprint() {
        assert_ne!(shape("(Int) -> Int").fingerprint(), shape("(Long) -> Int").fingerprint());
    }

    #[test]
    fn default_presence_participates() {
        let mut with_default = shape("(Int) -> Int");
        with_default.parameter_defaults = vec![true];
        assert_ne!(shape("(Int) -> Int").fingerprint(), with_default.fingerprint());
    }

    #[test]
    fn annotation_order_is_irrelevant() {
        let mut a = shape("()");
        a.annotations = vec!["inline".into(), "pure".into()];
        let mut b = shape("()");
        b.annotations = vec!["pure".into(), "inline".into()];
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn constant_value_participates() {
        let constant = |v: &str| DeclarationShape {
            kind: DeclarationKind::Constant,
            name: "LIMIT".into(),
            visibility: Visibility::Public,
            signature: "Int".into(),
            annotations: vec![],
            parameter_defaults: vec![],
            constant_value: Some(v.into()),
        };
        assert_ne!(constant("10").fingerprint(), constant("11").fingerprint());
    }

    #[test]
    fn visibility_participates() {
        let mut internal = shape("()");
        internal.visibility = Visibility::Internal;
        assert_ne!(shape("()").fingerprint(), internal.fingerprint());
    }

    #[test]
    fn config_fingerprint_ignores_dependency_order() {
        let a = Module::new("app").with_dependency("x").with_dependency("y");
        let b = Module::new("app").with_dependency("y").with_dependency("x");
        assert_eq!(
            module_config_fingerprint(&a, "0.1.0").unwrap(),
            module_config_fingerprint(&b, "0.1.0").unwrap()
        );
    }

    #[test]
    fn config_fingerprint_tracks_options_and_version() {
        let base = Module::new("app").with_option("opt-level", "2");
        let changed = Module::new("app").with_option("opt-level", "3");
        let fp = module_config_fingerprint(&base, "0.1.0").unwrap();
        assert_ne!(fp, module_config_fingerprint(&changed, "0.1.0").unwrap());
        assert_ne!(fp, module_config_fingerprint(&base, "0.2.0").unwrap());
    }

    #[test]
    fn config_fingerprint_tracks_library_content() {
        let dir = tempfile::tempdir().unwrap();
        let lib = dir.path().join("runtime");
        std::fs::create_dir_all(&lib).unwrap();
        std::fs::write(lib.join("rt.bin"), "v1").unwrap();
        let module = Module::new("app").with_library(&lib);
        let before = module_config_fingerprint(&module, "0.1.0").unwrap();
        std::fs::write(lib.join("rt.bin"), "v2").unwrap();
        assert_ne!(before, module_config_fingerprint(&module, "0.1.0").unwrap());
    }
}
