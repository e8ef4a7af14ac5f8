//! Content-addressed package store modeled on a Nix-style store: immutable, hash-identified
//! object directories; a persistent reference registry; profile/generation management; and
//! mark-and-sweep garbage collection.

pub mod config;
pub mod error;
pub mod gc;
pub mod hash;
pub mod importer;
pub mod objectpath;
pub mod profile;
pub mod registry;
pub mod scanner;
mod util;

pub use config::Config;
pub use error::{Result, StoreError};
pub use gc::GcReport;
pub use objectpath::{ObjectId, ObjectName};
pub use registry::{Entry, Registry};

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

/// A handle onto one store root: its registry and the configuration governing it.
///
/// This is a thin facade over the free functions in [`importer`], [`scanner`], [`gc`], and
/// [`profile`] — it exists so callers (the CLI, tests) don't have to thread `store_root`,
/// `registry`, and `config` through every call individually.
#[derive(Debug)]
pub struct Store {
    root: PathBuf,
    config: Config,
    registry: Registry,
}

impl Store {
    /// Creates the store root and its registry subdirectory if they don't already exist, then
    /// opens the store.
    pub fn init(root: impl Into<PathBuf>, config: Config) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| StoreError::io(&root, e))?;
        let registry = Registry::init(&root)?;
        Ok(Store { root, config, registry })
    }

    /// Opens an existing store root, tolerating a missing registry (treated as empty).
    pub fn open(root: impl Into<PathBuf>, config: Config) -> Result<Self> {
        let root = root.into();
        let registry = Registry::open(&root)?;
        Ok(Store { root, config, registry })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Imports `source` under `name` with no recorded dependencies.
    pub fn add(&mut self, source: &Path, name: &str) -> Result<ObjectId> {
        importer::import(&self.root, &mut self.registry, &self.config, source, name, &BTreeSet::new())
    }

    /// Imports `source` after first scanning it for dynamic-library dependencies, recording
    /// whatever the scanner resolves as references of the new object.
    pub fn add_with_deps(&mut self, source: &Path, name: &str) -> Result<ObjectId> {
        let deps = scanner::scan_dependencies(&self.root, &mut self.registry, &self.config, source)?;
        let deps: BTreeSet<ObjectId> = deps.into_iter().collect();
        importer::import(&self.root, &mut self.registry, &self.config, source, name, &deps)
    }

    /// Imports `source` with an explicit, caller-supplied dependency set.
    pub fn add_with_explicit_deps(
        &mut self,
        source: &Path,
        name: &str,
        deps: &BTreeSet<ObjectId>,
    ) -> Result<ObjectId> {
        importer::import(&self.root, &mut self.registry, &self.config, source, name, deps)
    }

    /// Bulk-imports every shared library under the configured boot-ramdisk library directory.
    pub fn add_boot_libs(&mut self) -> Result<Vec<ObjectId>> {
        scanner::import_boot_libraries(&self.root, &mut self.registry, &self.config)
    }

    /// Scans `executable` for its dynamic-library dependencies without importing anything new
    /// beyond what resolution requires.
    pub fn scan_dependencies(&mut self, executable: &Path) -> Result<Vec<ObjectId>> {
        scanner::scan_dependencies(&self.root, &mut self.registry, &self.config, executable)
    }

    /// Returns the direct references recorded for `object`.
    pub fn query_references(&self, object: &ObjectId) -> Vec<PathBuf> {
        self.registry.get_refs(&object.to_path(&self.root))
    }

    /// Recomputes and compares `object`'s content hash against what's recorded.
    pub fn verify(&self, object: &ObjectId) -> Result<bool> {
        self.registry
            .verify_hash(&object.to_path(&self.root), self.config.store.max_hash_files)
    }

    pub fn add_root(&mut self, object: &ObjectId) -> Result<()> {
        self.registry.add_root(&object.to_path(&self.root))
    }

    pub fn remove_root(&mut self, object: &ObjectId) -> Result<()> {
        self.registry.remove_root(&object.to_path(&self.root))
    }

    /// Runs one mark-and-sweep garbage collection pass.
    pub fn collect_garbage(&mut self) -> Result<GcReport> {
        gc::collect(&self.root, &mut self.registry, &self.config)
    }

    pub fn create_profile(&mut self, name: &str) -> Result<PathBuf> {
        profile::create(&self.root, &mut self.registry, &self.config, name)
    }

    pub fn install(&mut self, object: &ObjectId, profile_name: &str) -> Result<()> {
        let object_path = object.to_path(&self.root);
        profile::install(&mut self.registry, &self.config, &object_path, profile_name)
    }

    pub fn switch_profile(&self, profile_name: &str) -> Result<()> {
        profile::switch(&self.config, profile_name)
    }

    pub fn rollback(&self, profile_name: &str) -> Result<()> {
        profile::rollback(&self.config, profile_name)
    }

    pub fn switch_generation(&self, profile_name: &str, epoch: u64) -> Result<()> {
        profile::switch_generation(&self.config, profile_name, epoch)
    }

    pub fn list_profiles(&self) -> Result<Vec<String>> {
        profile::list_profiles(&self.config)
    }

    pub fn list_generations(&self, profile_name: &str) -> Result<Vec<u64>> {
        profile::list_generations(&self.config, profile_name)
    }

    pub fn enter_shell(&self, profile_name: &str) -> Result<std::process::ExitStatus> {
        profile::enter_shell(&self.registry, &self.config, profile_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_then_open_sees_the_same_registry_state() {
        let dir = tempfile::tempdir().unwrap();
        let store_root = dir.path().join("store");

        let mut config = Config::default();
        config.store.store_path = store_root.clone();

        let id = {
            let mut store = Store::init(&store_root, config.clone()).unwrap();
            let src = dir.path().join("hello");
            fs::write(&src, b"x").unwrap();
            store.add(&src, "hello").unwrap()
        };

        let reopened = Store::open(&store_root, config).unwrap();
        assert!(reopened.registry().exists(&id.to_path(&store_root)));
    }

    #[test]
    fn install_then_gc_keeps_rooted_object() {
        let dir = tempfile::tempdir().unwrap();
        let store_root = dir.path().join("store");
        let mut config = Config::default();
        config.store.store_path = store_root.clone();
        config.store.profiles_path = dir.path().join("profiles");

        let mut store = Store::init(&store_root, config).unwrap();
        let src = dir.path().join("hello");
        fs::write(&src, b"x").unwrap();
        let id = store.add(&src, "hello").unwrap();

        store.install(&id, "default").unwrap();
        let report = store.collect_garbage().unwrap();

        assert!(report.marked.contains(&id.to_path(&store_root)));
    }
}
