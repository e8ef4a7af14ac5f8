//! Mark-and-sweep garbage collection over the object store.

use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, instrument, warn};
use walkdir::WalkDir;

use crate::config::Config;
use crate::error::{Result, StoreError};
use crate::registry::Registry;

/// Summary of one collection pass.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct GcReport {
    pub marked: BTreeSet<PathBuf>,
    pub swept: BTreeSet<PathBuf>,
    pub sweep_failures: BTreeSet<PathBuf>,
}

/// Returns the object directories that are live: the registry's roots, plus every object reached
/// by a symlink under the profiles root, per `SPEC_FULL.md` §4.6's seed-set definition.
fn seed_roots(store_root: &Path, profiles_root: &Path, registry: &Registry) -> BTreeSet<PathBuf> {
    let mut roots: BTreeSet<PathBuf> = registry.roots().map(Path::to_path_buf).collect();

    if !profiles_root.is_dir() {
        return roots;
    }

    for entry in WalkDir::new(profiles_root).follow_links(false) {
        let Ok(entry) = entry else { continue };
        if !entry.file_type().is_symlink() {
            continue;
        }

        let Ok(target) = fs::read_link(entry.path()) else {
            continue;
        };
        let target = if target.is_absolute() {
            target
        } else {
            entry
                .path()
                .parent()
                .map(|p| p.join(&target))
                .unwrap_or(target)
        };

        if let Some(object) = enclosing_object(store_root, &target) {
            roots.insert(object);
        }
    }

    roots
}

fn enclosing_object(store_root: &Path, path: &Path) -> Option<PathBuf> {
    let rel = path.strip_prefix(store_root).ok()?;
    let first = rel.components().next()?;
    Some(store_root.join(first.as_os_str()))
}

/// Depth-first marks `root` and everything it transitively references, recording visited nodes
/// in `marked` to avoid revisiting shared dependencies.
fn mark(registry: &Registry, root: &Path, marked: &mut BTreeSet<PathBuf>, live_objects: &HashSet<&PathBuf>) {
    if !live_objects.contains(&root.to_path_buf()) {
        return;
    }
    if !marked.insert(root.to_path_buf()) {
        return;
    }

    for reference in registry.get_refs(root) {
        mark(registry, &reference, marked, live_objects);
    }
}

/// Runs one mark-and-sweep pass: objects not reachable from a root are removed from disk and the
/// registry. A directory-removal failure leaves the registry entry intact so a later pass can
/// retry it, per the sweep-failure policy in `SPEC_FULL.md` §4.6.
#[instrument(skip(registry, config))]
pub fn collect(store_root: &Path, registry: &mut Registry, config: &Config) -> Result<GcReport> {
    let object_set: BTreeSet<PathBuf> = fs::read_dir(store_root)
        .map_err(|e| StoreError::io(store_root, e))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .map(|entry| entry.path())
        .filter(|p| p.file_name().map(|n| n != ".nix-db").unwrap_or(true))
        .collect();

    let roots = seed_roots(store_root, &config.store.profiles_path, registry);
    let live_objects: HashSet<&PathBuf> = object_set.iter().collect();

    let mut marked = BTreeSet::new();
    for root in &roots {
        mark(registry, root, &mut marked, &live_objects);
    }

    let mut report = GcReport::default();
    report.marked = marked.clone();

    for object in &object_set {
        if marked.contains(object) {
            continue;
        }

        match fs::remove_dir_all(object) {
            Ok(()) => {
                registry.remove(object)?;
                report.swept.insert(object.clone());
                info!(object = %object.display(), "swept unreachable object");
            }
            Err(e) => {
                warn!(object = %object.display(), error = %e, "failed to remove object, will retry next gc");
                report.sweep_failures.insert(object.clone());
            }
        }
    }

    Ok(report)
}
