//! Persistent registry of store objects: their references, hashes, and GC roots.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::hash;

const DB_SUBDIR: &str = ".nix-db";
const DB_FILE: &str = "db";
const ROOTS_FILE: &str = "roots";

/// A single registry entry, as described in `SPEC_FULL.md` §3.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Entry {
    pub path: PathBuf,
    pub references: BTreeSet<PathBuf>,
    pub creation_time: u64,
    pub content_hash: Option<String>,
}

/// The persistent object registry. Backed by a single JSON document of entries
/// (`<store>/.nix-db/db`) and a newline-delimited roots file (`<store>/.nix-db/roots`).
#[derive(Debug)]
pub struct Registry {
    db_path: PathBuf,
    roots_path: PathBuf,
    entries: BTreeMap<PathBuf, Entry>,
    roots: BTreeSet<PathBuf>,
}

impl Registry {
    /// Opens (or implicitly creates in memory) the registry rooted at `store_root`. Tolerates
    /// the backing files being entirely absent, treating that as an empty registry.
    pub fn open(store_root: &Path) -> Result<Self> {
        let db_dir = store_root.join(DB_SUBDIR);
        let db_path = db_dir.join(DB_FILE);
        let roots_path = db_dir.join(ROOTS_FILE);

        let entries = if db_path.exists() {
            let text = fs::read_to_string(&db_path).map_err(|e| StoreError::io(&db_path, e))?;
            if text.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&text)
                    .map_err(|e| StoreError::registry(format!("corrupt registry db: {e}")))?
            }
        } else {
            BTreeMap::new()
        };

        let roots = if roots_path.exists() {
            let text =
                fs::read_to_string(&roots_path).map_err(|e| StoreError::io(&roots_path, e))?;
            text.lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(PathBuf::from)
                .collect()
        } else {
            BTreeSet::new()
        };

        Ok(Registry {
            db_path,
            roots_path,
            entries,
            roots,
        })
    }

    /// Creates the `.nix-db` directory (idempotent) without requiring any entries to exist yet.
    pub fn init(store_root: &Path) -> Result<Self> {
        let db_dir = store_root.join(DB_SUBDIR);
        fs::create_dir_all(&db_dir).map_err(|e| StoreError::io(&db_dir, e))?;
        Registry::open(store_root)
    }

    fn persist_entries(&self) -> Result<()> {
        let dir = self
            .db_path
            .parent()
            .expect("db path always has a parent directory");
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| StoreError::io(dir, e))?;
        let text = serde_json::to_string_pretty(&self.entries)
            .map_err(|e| StoreError::registry(format!("failed to serialize registry: {e}")))?;
        tmp.write_all(text.as_bytes())
            .map_err(|e| StoreError::io(&self.db_path, e))?;
        tmp.flush().map_err(|e| StoreError::io(&self.db_path, e))?;
        tmp.persist(&self.db_path)
            .map_err(|e| StoreError::io(&self.db_path, e.error))?;
        Ok(())
    }

    fn persist_roots_full(&self) -> Result<()> {
        let dir = self
            .roots_path
            .parent()
            .expect("roots path always has a parent directory");
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| StoreError::io(dir, e))?;
        for root in &self.roots {
            writeln!(tmp, "{}", root.display()).map_err(|e| StoreError::io(&self.roots_path, e))?;
        }
        tmp.flush().map_err(|e| StoreError::io(&self.roots_path, e))?;
        tmp.persist(&self.roots_path)
            .map_err(|e| StoreError::io(&self.roots_path, e.error))?;
        Ok(())
    }

    fn append_root_line(&self, root: &Path) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.roots_path)
            .map_err(|e| StoreError::io(&self.roots_path, e))?;
        writeln!(file, "{}", root.display()).map_err(|e| StoreError::io(&self.roots_path, e))?;
        file.flush().map_err(|e| StoreError::io(&self.roots_path, e))?;
        Ok(())
    }

    /// Registers `path` with reference set `refs`. Idempotent: if `path` is already present and
    /// `refs` is non-empty, replaces its reference set; if `refs` is empty, leaves the existing
    /// references untouched. Either way, the call succeeds.
    pub fn register(&mut self, path: &Path, refs: &BTreeSet<PathBuf>) -> Result<()> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        match self.entries.get_mut(path) {
            Some(entry) => {
                if !refs.is_empty() {
                    entry.references = refs.clone();
                }
            }
            None => {
                self.entries.insert(
                    path.to_path_buf(),
                    Entry {
                        path: path.to_path_buf(),
                        references: refs.clone(),
                        creation_time: now,
                        content_hash: None,
                    },
                );
            }
        }

        self.persist_entries()
    }

    pub fn exists(&self, path: &Path) -> bool {
        self.entries.contains_key(path)
    }

    pub fn get_refs(&self, path: &Path) -> Vec<PathBuf> {
        self.entries
            .get(path)
            .map(|e| e.references.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Removes the entry for `path`, if present, and drops it from the roots set as well.
    pub fn remove(&mut self, path: &Path) -> Result<()> {
        let had_entry = self.entries.remove(path).is_some();
        let had_root = self.roots.remove(path);

        if had_entry {
            self.persist_entries()?;
        }
        if had_root {
            self.persist_roots_full()?;
        }

        Ok(())
    }

    /// Records the content hash of an existing entry. Fails if no such entry exists.
    pub fn store_hash(&mut self, path: &Path, hex: &str) -> Result<()> {
        let entry = self
            .entries
            .get_mut(path)
            .ok_or_else(|| StoreError::registry(format!("no such object: {}", path.display())))?;
        entry.content_hash = Some(hex.to_string());
        self.persist_entries()
    }

    /// Returns the recorded content hash, if any.
    pub fn get_hash(&self, path: &Path) -> Option<&str> {
        self.entries
            .get(path)
            .and_then(|e| e.content_hash.as_deref())
    }

    /// Recomputes the object's content hash from disk and compares it against the recorded
    /// value. Returns `Ok(true)` if they match, `Ok(false)` if they differ or nothing is
    /// recorded, and `Err` if the object is not a registry entry at all or hashing failed.
    pub fn verify_hash(&self, path: &Path, max_files: usize) -> Result<bool> {
        let recorded = self
            .entries
            .get(path)
            .ok_or_else(|| StoreError::registry(format!("no such object: {}", path.display())))?
            .content_hash
            .clone();

        let recorded = match recorded {
            Some(hex) => hex,
            None => return Ok(false),
        };

        let actual = hash::hash_dir(path, max_files)?;
        Ok(actual == recorded)
    }

    /// Adds `path` as a GC root. The entry must already exist.
    pub fn add_root(&mut self, path: &Path) -> Result<()> {
        if !self.exists(path) {
            return Err(StoreError::registry(format!(
                "cannot root nonexistent object: {}",
                path.display()
            )));
        }

        if self.roots.insert(path.to_path_buf()) {
            self.append_root_line(path)?;
        }

        Ok(())
    }

    /// Removes `path` from the roots set. Not being a root already is success.
    pub fn remove_root(&mut self, path: &Path) -> Result<()> {
        if self.roots.remove(path) {
            self.persist_roots_full()?;
        }
        Ok(())
    }

    pub fn roots(&self) -> impl Iterator<Item = &Path> {
        self.roots.iter().map(PathBuf::as_path)
    }

    pub fn is_root(&self, path: &Path) -> bool {
        self.roots.contains(path)
    }

    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.entries.values()
    }

    pub fn entry_paths(&self) -> impl Iterator<Item = &Path> {
        self.entries.keys().map(PathBuf::as_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &Path) -> Registry {
        Registry::init(dir).unwrap()
    }

    #[test]
    fn register_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = store(dir.path());
        let obj = dir.path().join("aaaa-hello");

        reg.register(&obj, &BTreeSet::new()).unwrap();
        reg.register(&obj, &BTreeSet::new()).unwrap();

        assert!(reg.exists(&obj));
        assert_eq!(reg.get_refs(&obj), Vec::<PathBuf>::new());
    }

    #[test]
    fn register_replaces_refs_when_nonempty() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = store(dir.path());
        let obj = dir.path().join("aaaa-hello");
        let dep = dir.path().join("bbbb-libc");

        reg.register(&obj, &BTreeSet::new()).unwrap();
        let mut refs = BTreeSet::new();
        refs.insert(dep.clone());
        reg.register(&obj, &refs).unwrap();

        assert_eq!(reg.get_refs(&obj), vec![dep]);
    }

    #[test]
    fn add_root_requires_existing_entry() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = store(dir.path());
        let missing = dir.path().join("aaaa-missing");

        assert!(reg.add_root(&missing).is_err());
        assert_eq!(reg.roots().count(), 0);
    }

    #[test]
    fn remove_root_on_absent_root_is_success() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = store(dir.path());
        let obj = dir.path().join("aaaa-hello");
        assert!(reg.remove_root(&obj).is_ok());
    }

    #[test]
    fn store_hash_requires_existing_entry() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = store(dir.path());
        let missing = dir.path().join("aaaa-missing");
        assert!(reg.store_hash(&missing, "deadbeef").is_err());
    }

    #[test]
    fn remove_drops_entry_and_root() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = store(dir.path());
        let obj_dir = dir.path().join("aaaa-hello");
        fs::create_dir_all(&obj_dir).unwrap();

        reg.register(&obj_dir, &BTreeSet::new()).unwrap();
        reg.add_root(&obj_dir).unwrap();
        assert!(reg.is_root(&obj_dir));

        reg.remove(&obj_dir).unwrap();
        assert!(!reg.exists(&obj_dir));
        assert!(!reg.is_root(&obj_dir));
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let obj = dir.path().join("aaaa-hello");
        {
            let mut reg = store(dir.path());
            reg.register(&obj, &BTreeSet::new()).unwrap();
            reg.add_root(&obj).unwrap();
        }

        let reg2 = Registry::open(dir.path()).unwrap();
        assert!(reg2.exists(&obj));
        assert!(reg2.is_root(&obj));
    }

    #[test]
    fn open_on_missing_files_is_empty_registry() {
        let dir = tempfile::tempdir().unwrap();
        let reg = Registry::open(dir.path()).unwrap();
        assert_eq!(reg.entries().count(), 0);
        assert_eq!(reg.roots().count(), 0);
    }
}
