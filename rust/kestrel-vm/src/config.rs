//! Interpreter settings, loadable from `kestrel.toml`.
//!
//! The file is searched in the current directory and then its ancestors.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const CONFIG_FILE: &str = "kestrel.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid toml in '{path}': {source}")]
    Toml {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// How `obj(args)` is resolved when the object offers both a default member
/// and positional indexing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DefaultMemberPolicy {
    /// Route through the default member; positional indexing is the fallback.
    #[default]
    DefaultMember,
    /// Positional indexing first; the default member is the fallback.
    Indexed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Instructions executed between calls to the host yield hook.
    pub yield_interval: u32,
    pub max_gosub_depth: usize,
    /// Maximum number of nested procedure activations.
    pub max_call_depth: usize,
    /// Largest element count a single `DIM` or `REDIM` may allocate.
    pub max_array_elements: usize,
    pub default_member_policy: DefaultMemberPolicy,
    /// Case-insensitive string comparison regardless of the image setting.
    pub compare_text: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            yield_interval: 1000,
            max_gosub_depth: 500,
            max_call_depth: 256,
            max_array_elements: 16 * 1024 * 1024,
            default_member_policy: DefaultMemberPolicy::default(),
            compare_text: false,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    vm: VmConfig,
}

impl VmConfig {
    /// Parse the `[vm]` table of a config file.
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        let file: ConfigFile = toml::from_str(s)?;
        Ok(file.vm)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content).map_err(|source| ConfigError::Toml {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Find `kestrel.toml` in `start` or an ancestor.
    pub fn discover(start: &Path) -> Option<PathBuf> {
        let mut dir = start.to_path_buf();
        loop {
            let candidate = dir.join(CONFIG_FILE);
            if candidate.is_file() {
                return Some(candidate);
            }
            if !dir.pop() {
                return None;
            }
        }
    }

    /// Load the nearest config file, or defaults when there is none.
    pub fn load() -> Result<(Option<PathBuf>, Self), ConfigError> {
        let Ok(cwd) = std::env::current_dir() else {
            return Ok((None, Self::default()));
        };
        match Self::discover(&cwd) {
            Some(path) => {
                let cfg = Self::load_from(&path)?;
                Ok((Some(path), cfg))
            }
            None => Ok((None, Self::default())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_take_defaults() {
        let cfg = VmConfig::from_toml("[vm]\nmax_gosub_depth = 10\n").unwrap();
        assert_eq!(cfg.max_gosub_depth, 10);
        assert_eq!(cfg.yield_interval, 1000);
        assert_eq!(cfg.max_array_elements, VmConfig::default().max_array_elements);
        assert_eq!(VmConfig::from_toml("").unwrap(), VmConfig::default());
    }

    #[test]
    fn policy_is_kebab_case() {
        let cfg = VmConfig::from_toml("[vm]\ndefault_member_policy = \"indexed\"\n").unwrap();
        assert_eq!(cfg.default_member_policy, DefaultMemberPolicy::Indexed);
        assert!(VmConfig::from_toml("[vm]\ndefault_member_policy = \"sometimes\"\n").is_err());
    }

    #[test]
    fn discover_walks_ancestors() {
        let root = std::env::temp_dir().join(format!("kestrel-cfg-{}", std::process::id()));
        let nested = root.join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(root.join(CONFIG_FILE), "[vm]\ncompare_text = true\n").unwrap();
        let found = VmConfig::discover(&nested).unwrap();
        assert_eq!(found, root.join(CONFIG_FILE));
        assert!(VmConfig::load_from(&found).unwrap().compare_text);
        std::fs::remove_dir_all(&root).unwrap();
    }
}
