//! Tunable configuration, loaded from a TOML file with compiled-in defaults.
//!
//! Section and option names mirror the upstream reference implementation's `nix.conf`
//! (`shell.*`, `store.*`, `deps.*`, `profiles.*`), just with a `[section]` table per group
//! instead of dotted keys.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

fn default_store_path() -> PathBuf {
    PathBuf::from("/data/nix/store")
}

fn default_profiles_path() -> PathBuf {
    PathBuf::from("/data/nix/profiles")
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

fn default_mode() -> u32 {
    0o555
}

fn default_max_depth() -> u32 {
    10
}

fn default_scanner() -> String {
    "ldd".to_string()
}

fn default_extra_lib_paths() -> Vec<String> {
    vec!["/proc/boot".to_string(), "/system/lib".to_string()]
}

fn default_boot_ramdisk() -> String {
    "/proc/boot".to_string()
}

fn default_allowed_system_paths() -> Vec<String> {
    vec![
        "/system/bin".to_string(),
        "/bin".to_string(),
        "/sbin".to_string(),
        "/proc/boot".to_string(),
    ]
}

fn default_preserved_env_vars() -> Vec<String> {
    vec![
        "HOME".to_string(),
        "USER".to_string(),
        "TERM".to_string(),
        "DISPLAY".to_string(),
        "PWD".to_string(),
    ]
}

fn default_profile_name() -> String {
    "default".to_string()
}

fn default_max_generations() -> u32 {
    10
}

fn default_max_hash_files() -> usize {
    1024
}

fn default_shell_bin() -> String {
    "sh".to_string()
}

/// Shell-isolation tunables, consulted by [`crate::profile::Profile::enter_shell`] and by
/// wrapper-script generation.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ShellConfig {
    pub allow_system_binaries: bool,
    pub allowed_system_paths: Vec<String>,
    pub preserved_env_vars: Vec<String>,
    pub debug_wrappers: bool,
    /// Absolute path, inside the store, of the shell binary wrapper scripts exec through.
    pub shell_path: String,
}

impl Default for ShellConfig {
    fn default() -> Self {
        ShellConfig {
            allow_system_binaries: default_false(),
            allowed_system_paths: default_allowed_system_paths(),
            preserved_env_vars: default_preserved_env_vars(),
            debug_wrappers: default_false(),
            shell_path: default_shell_bin(),
        }
    }
}

/// Store-layout tunables.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
    #[serde(default = "default_profiles_path")]
    pub profiles_path: PathBuf,
    #[serde(default = "default_true")]
    pub enforce_readonly: bool,
    #[serde(default = "default_mode")]
    pub store_path_permissions: u32,
    #[serde(default = "default_max_hash_files")]
    pub max_hash_files: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            store_path: default_store_path(),
            profiles_path: default_profiles_path(),
            enforce_readonly: default_true(),
            store_path_permissions: default_mode(),
            max_hash_files: default_max_hash_files(),
        }
    }
}

/// Dependency-scanning tunables.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct DepsConfig {
    pub auto_scan: bool,
    pub max_depth: u32,
    pub extra_lib_paths: Vec<String>,
    pub scanner: String,
    pub boot_ramdisk_path: String,
}

impl Default for DepsConfig {
    fn default() -> Self {
        DepsConfig {
            auto_scan: default_true(),
            max_depth: default_max_depth(),
            extra_lib_paths: default_extra_lib_paths(),
            scanner: default_scanner(),
            boot_ramdisk_path: default_boot_ramdisk(),
        }
    }
}

/// Profile/generation tunables.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProfilesConfig {
    pub default_profile: String,
    pub max_generations: u32,
}

impl Default for ProfilesConfig {
    fn default() -> Self {
        ProfilesConfig {
            default_profile: default_profile_name(),
            max_generations: default_max_generations(),
        }
    }
}

/// Top-level configuration, one field per `[section]`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub shell: ShellConfig,
    pub store: StoreConfig,
    pub deps: DepsConfig,
    pub profiles: ProfilesConfig,
}

impl Config {
    /// Loads configuration from `path`. If the file does not exist, returns the compiled-in
    /// defaults without creating anything on disk — callers that want a bootstrap file should
    /// call [`Config::write_default`] explicitly (mirrors `init` deciding when to touch disk,
    /// rather than `config_load` doing it implicitly as a side effect of reading).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Config::default());
        }

        let text = fs::read_to_string(path).map_err(|e| StoreError::io(path, e))?;
        toml::from_str(&text)
            .map_err(|e| StoreError::invalid(format!("malformed config `{}`: {e}", path.display())))
    }

    /// Serializes the default configuration to `path`, refusing to overwrite an existing file.
    pub fn write_default(path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if path.exists() {
            return Ok(());
        }

        let text = toml::to_string_pretty(&Config::default())
            .map_err(|e| StoreError::invalid(format!("failed to serialize default config: {e}")))?;
        fs::write(path, text).map_err(|e| StoreError::io(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_upstream_reference() {
        let cfg = Config::default();
        assert_eq!(cfg.store.store_path, PathBuf::from("/data/nix/store"));
        assert!(cfg.store.enforce_readonly);
        assert_eq!(cfg.deps.scanner, "ldd");
        assert_eq!(cfg.profiles.max_generations, 10);
        assert_eq!(cfg.profiles.default_profile, "default");
        assert!(!cfg.shell.allow_system_binaries);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = Config::load("/nonexistent/path/to/nix.conf").unwrap();
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn round_trips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nix.conf");
        Config::write_default(&path).unwrap();
        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, Config::default());
    }

    #[test]
    fn partial_override_keeps_remaining_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nix.conf");
        fs::write(&path, "[profiles]\nmax_generations = 3\n").unwrap();
        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.profiles.max_generations, 3);
        assert_eq!(cfg.store.store_path, PathBuf::from("/data/nix/store"));
    }
}
