//! Configuration types deserialized from `kiln.toml`.

use serde::de::{self, MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;

/// Default cache directory, relative to the project root.
pub const DEFAULT_CACHE_DIR: &str = ".kiln-cache";

/// The top-level project configuration parsed from `kiln.toml`.
#[derive(Debug, Deserialize)]
pub struct ProjectConfig {
    /// Core project metadata.
    pub project: ProjectMeta,
    /// Build settings (cache location, output path, worker count).
    #[serde(default)]
    pub build: BuildConfig,
    /// Global compiler options applied to every module.
    #[serde(default, deserialize_with = "deserialize_option_map")]
    pub options: BTreeMap<String, String>,
    /// Module definitions keyed by module name.
    #[serde(default)]
    pub modules: BTreeMap<String, ModuleDef>,
}

/// Core project metadata required in every `kiln.toml`.
#[derive(Debug, Deserialize)]
pub struct ProjectMeta {
    /// The project name.
    pub name: String,
    /// The project version string.
    pub version: String,
    /// A brief description of the project.
    #[serde(default)]
    pub description: String,
}

/// Build configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BuildConfig {
    /// Cache directory, relative to the project root.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,
    /// Linked output path, relative to the project root.
    ///
    /// Defaults to `build/<project name>.klnk` when absent.
    #[serde(default)]
    pub output: Option<String>,
    /// Number of worker threads. `0` uses all available cores.
    #[serde(default)]
    pub jobs: usize,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            output: None,
            jobs: 0,
        }
    }
}

fn default_cache_dir() -> String {
    DEFAULT_CACHE_DIR.to_string()
}

/// Definition of one separately linkable module.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModuleDef {
    /// Source directories (searched recursively) or individual files.
    ///
    /// Accepts either a single string or a list of strings.
    #[serde(default, deserialize_with = "deserialize_string_or_vec")]
    pub sources: Vec<String>,
    /// Names of modules this module depends on.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Dependencies whose `internal` declarations this module may see.
    #[serde(default)]
    pub friends: Vec<String>,
    /// Extra input directories whose content participates in the module fingerprint.
    #[serde(default)]
    pub libraries: Vec<String>,
    /// Per-module compiler option overrides.
    #[serde(default, deserialize_with = "deserialize_option_map")]
    pub options: BTreeMap<String, String>,
}

/// Deserializes a field that can be either a single string or a list of strings.
///
/// Allows `sources = "lib"` as shorthand for `sources = ["lib"]`.
fn deserialize_string_or_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    struct StringOrVec;

    impl<'de> Visitor<'de> for StringOrVec {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            formatter.write_str("a string or a list of strings")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
            Ok(vec![v.to_string()])
        }

        fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
            let mut vec = Vec::new();
            while let Some(val) = seq.next_element::<String>()? {
                vec.push(val);
            }
            Ok(vec)
        }
    }

    deserializer.deserialize_any(StringOrVec)
}

/// Deserializes an option table whose values may be strings, integers,
/// floats or booleans, normalizing every value to its string form.
///
/// Options feed the module fingerprint as `(key, value)` strings, so
/// `opt-level = 2` and `opt-level = "2"` are the same configuration.
fn deserialize_option_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    struct ScalarString(String);

    impl<'de> Deserialize<'de> for ScalarString {
        fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            struct ScalarVisitor;

            impl<'de> Visitor<'de> for ScalarVisitor {
                type Value = ScalarString;

                fn expecting(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                    formatter.write_str("a string, integer, float or boolean")
                }

                fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                    Ok(ScalarString(v.to_string()))
                }

                fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                    Ok(ScalarString(v.to_string()))
                }

                fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                    Ok(ScalarString(v.to_string()))
                }

                fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
                    Ok(ScalarString(v.to_string()))
                }

                fn visit_bool<E: de::Error>(self, v: bool) -> Result<Self::Value, E> {
                    Ok(ScalarString(v.to_string()))
                }
            }

            deserializer.deserialize_any(ScalarVisitor)
        }
    }

    struct OptionMap;

    impl<'de> Visitor<'de> for OptionMap {
        type Value = BTreeMap<String, String>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            formatter.write_str("a table of scalar option values")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
            let mut options = BTreeMap::new();
            while let Some((key, ScalarString(value))) = map.next_entry::<String, ScalarString>()? {
                options.insert(key, value);
            }
            Ok(options)
        }
    }

    deserializer.deserialize_map(OptionMap)
}
