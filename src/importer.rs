//! Copies a source path into the store, records its dependencies, and seals it read-only.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use crate::config::Config;
use crate::error::{Result, StoreError};
use crate::hash;
use crate::objectpath::{self, ObjectId, ObjectName};
use crate::registry::Registry;
use crate::util;

/// Imports `source` into the store under `name`, recording `deps` as its references.
///
/// Implements the steps in `SPEC_FULL.md` §4.3: compute the candidate path, short-circuit if the
/// object already exists (merely recording dependency edges and backfilling the hash if
/// missing), otherwise materialize, seal, hash, and atomically record the new object.
#[instrument(skip(registry, config), fields(name = %name))]
pub fn import(
    store_root: &Path,
    registry: &mut Registry,
    config: &Config,
    source: &Path,
    name: &str,
    deps: &BTreeSet<ObjectId>,
) -> Result<ObjectId> {
    if !source.exists() {
        return Err(StoreError::invalid(format!(
            "source does not exist: {}",
            source.display()
        )));
    }

    for dep in deps {
        let dep_path = dep.to_path(store_root);
        if !registry.exists(&dep_path) {
            return Err(StoreError::invalid(format!(
                "dependency is not a registered object: {}",
                dep_path.display()
            )));
        }
        if !dep_path.starts_with(store_root) {
            return Err(StoreError::invalid(format!(
                "dependency path escapes the store root: {}",
                dep_path.display()
            )));
        }
    }

    let object_name = ObjectName::parse(name)?;
    let id = objectpath::compute_identifier(store_root, None, &object_name, deps)?;
    let object_path = id.to_path(store_root);

    let dep_paths: BTreeSet<PathBuf> = deps.iter().map(|d| d.to_path(store_root)).collect();

    if object_path.exists() {
        debug!(path = %object_path.display(), "object already present, recording refs only");
        registry.register(&object_path, &dep_paths)?;
        if registry.get_hash(&object_path).is_none() {
            let hex = hash::hash_dir(&object_path, config.store.max_hash_files)?;
            registry.store_hash(&object_path, &hex)?;
        }
        return Ok(id);
    }

    let staging = tempfile::tempdir_in(store_root).map_err(|e| StoreError::io(store_root, e))?;
    let staged_path = staging.path().join(
        object_path
            .file_name()
            .expect("object path always has a file name"),
    );

    materialize(source, &staged_path, config)?;
    seal(&staged_path, config)?;

    fs::rename(&staged_path, &object_path).map_err(|e| StoreError::io(&object_path, e))?;

    let hex = match hash::hash_dir(&object_path, config.store.max_hash_files) {
        Ok(hex) => hex,
        Err(e) => {
            // Materialization succeeded but hashing failed: remove the orphan directory so we
            // don't leave an unsealed-looking, unregistered object lying around.
            let _ = fs::remove_dir_all(&object_path);
            return Err(e);
        }
    };

    registry.register(&object_path, &dep_paths)?;
    registry.store_hash(&object_path, &hex)?;

    info!(path = %object_path.display(), hash = %hex, "imported object");
    Ok(id)
}

/// Copies `source` into `dest`, choosing the directory-tree or single-file strategy.
fn materialize(source: &Path, dest: &Path, config: &Config) -> Result<()> {
    let metadata = fs::symlink_metadata(source).map_err(|e| StoreError::io(source, e))?;

    if metadata.is_dir() {
        copy_dir_recursive(source, dest)
    } else {
        let bin_dir = dest.join("bin");
        fs::create_dir_all(&bin_dir).map_err(|e| StoreError::io(&bin_dir, e))?;
        let basename = source
            .file_name()
            .ok_or_else(|| StoreError::invalid("source file has no basename"))?;
        let dest_file = bin_dir.join(basename);

        let is_boot_ramdisk = source.starts_with(&config.deps.boot_ramdisk_path);
        if is_boot_ramdisk {
            block_copy(source, &dest_file)?;
        } else {
            fs::copy(source, &dest_file).map_err(|e| StoreError::io(&dest_file, e))?;
        }

        let mut perms = fs::metadata(&dest_file)
            .map_err(|e| StoreError::io(&dest_file, e))?
            .permissions();
        perms.set_mode(perms.mode() | 0o111);
        fs::set_permissions(&dest_file, perms).map_err(|e| StoreError::io(&dest_file, e))?;

        Ok(())
    }
}

/// Recursively copies `src` into `dst`, preserving symlinks (never following them) rather than
/// shelling out to `cp -rP`, per the redesign guidance in `SPEC_FULL.md` §9.
fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst).map_err(|e| StoreError::io(dst, e))?;

    for entry in WalkDir::new(src).follow_links(false).min_depth(1) {
        let entry = entry.map_err(|e| {
            StoreError::io(src, std::io::Error::new(std::io::ErrorKind::Other, e))
        })?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .expect("walkdir yields paths under src");
        let target = dst.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target).map_err(|e| StoreError::io(&target, e))?;
        } else if file_type.is_symlink() {
            let link_target = fs::read_link(entry.path()).map_err(|e| StoreError::io(entry.path(), e))?;
            std::os::unix::fs::symlink(&link_target, &target)
                .map_err(|e| StoreError::io(&target, e))?;
        } else {
            fs::copy(entry.path(), &target).map_err(|e| StoreError::io(&target, e))?;
        }
    }

    Ok(())
}

/// Block-level copy for sources that may be pseudo-files (the boot ramdisk), which may not
/// support `stat`-based size hints or `seek`.
fn block_copy(src: &Path, dst: &Path) -> Result<()> {
    let mut reader = File::open(src).map_err(|e| StoreError::io(src, e))?;
    let mut writer = File::create(dst).map_err(|e| StoreError::io(dst, e))?;
    util::copy_wide(&mut reader, &mut writer).map_err(|e| StoreError::io(dst, e))?;
    writer.flush().map_err(|e| StoreError::io(dst, e))?;
    Ok(())
}

/// Recursively strips write bits from every entry under `path`, preserving execute bits and
/// read access, per the sealing invariant in `SPEC_FULL.md` §3.
pub fn seal(path: &Path, config: &Config) -> Result<()> {
    if !config.store.enforce_readonly {
        return Ok(());
    }

    for entry in WalkDir::new(path).follow_links(false).contents_first(true) {
        let entry = entry.map_err(|e| {
            StoreError::io(path, std::io::Error::new(std::io::ErrorKind::Other, e))
        })?;

        if entry.file_type().is_symlink() {
            continue;
        }

        let meta = fs::symlink_metadata(entry.path()).map_err(|e| StoreError::io(entry.path(), e))?;
        let mode = meta.mode();
        let sealed_mode = (mode & !0o222) | 0o444;
        fs::set_permissions(entry.path(), fs::Permissions::from_mode(sealed_mode))
            .map_err(|e| StoreError::io(entry.path(), e))?;
    }

    Ok(())
}

#[allow(dead_code)]
fn read_all(mut r: impl Read) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    r.read_to_end(&mut buf)?;
    Ok(buf)
}
