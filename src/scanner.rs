//! Dependency discovery: runs an external dynamic-linker inspection tool and resolves its
//! output into store object identifiers.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use nom::bytes::complete::{tag, take_till1, take_until};
use nom::character::complete::space0;
use nom::IResult;
use tracing::{instrument, warn};
use walkdir::WalkDir;

use crate::config::Config;
use crate::error::{Result, StoreError};
use crate::importer;
use crate::objectpath::ObjectId;
use crate::registry::Registry;

/// Parses one line of `name => path (address)`-formatted linker output, returning the resolved
/// path if the line names one.
///
/// Grounded in the line format used by the upstream reference tool: find the first `=>`, skip the
/// whitespace after it, and take everything up to the next whitespace or `(` as the path.
fn parse_resolved_path(line: &str) -> Option<PathBuf> {
    fn arrow_path(input: &str) -> IResult<&str, &str> {
        let (input, _) = take_until("=>")(input)?;
        let (input, _) = tag("=>")(input)?;
        let (input, _) = space0(input)?;
        take_till1(|c: char| c.is_whitespace() || c == '(')(input)
    }

    let (_, path) = arrow_path(line).ok()?;
    if path.starts_with('/') {
        Some(PathBuf::from(path))
    } else {
        None
    }
}

/// Returns the object directory a store-internal library path belongs to, i.e. `store_root`
/// joined with the first path segment after it.
fn enclosing_object(store_root: &Path, lib_path: &Path) -> Option<PathBuf> {
    let rel = lib_path.strip_prefix(store_root).ok()?;
    let first = rel.components().next()?;
    Some(store_root.join(first.as_os_str()))
}

/// Finds a registered object whose identifier ends in `-<basename>` and which actually contains
/// `lib_path`'s basename under `bin/` or `lib/`.
fn find_object_by_basename(registry: &Registry, basename: &str) -> Option<PathBuf> {
    registry.entry_paths().find_map(|path| {
        let matches_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.ends_with(&format!("-{basename}")))
            .unwrap_or(false);

        if !matches_name {
            return None;
        }

        let has_lib = path.join("lib").join(basename).is_file() || path.join("bin").join(basename).is_file();
        has_lib.then(|| path.to_path_buf())
    })
}

fn is_foreign_origin(config: &Config, lib_path: &Path) -> bool {
    config
        .deps
        .extra_lib_paths
        .iter()
        .any(|origin| lib_path.starts_with(origin))
}

/// Runs the configured dependency scanner against `executable` and resolves each reported library
/// into a store object path, per `SPEC_FULL.md` §4.4.
///
/// Store-internal libraries resolve directly. Foreign-origin libraries (boot ramdisk, system
/// library directories) are matched against an existing object by basename, or imported fresh if
/// no match exists. Anything else is assumed to resolve at runtime on the host and is skipped.
///
/// A nonzero exit status from the scanner tool is logged as a warning, not a fatal error; whatever
/// was parsed from its output before exiting is still returned.
#[instrument(skip(registry, config), fields(executable = %executable.display()))]
pub fn scan_dependencies(
    store_root: &Path,
    registry: &mut Registry,
    config: &Config,
    executable: &Path,
) -> Result<Vec<ObjectId>> {
    let output = Command::new(&config.deps.scanner)
        .arg(executable)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .map_err(|e| StoreError::tool(&config.deps.scanner, e.to_string()))?;

    if !output.status.success() {
        warn!(
            tool = %config.deps.scanner,
            status = %output.status,
            "dependency scanner exited nonzero, using partial output"
        );
    }

    let text = String::from_utf8_lossy(&output.stdout);

    let mut seen = BTreeSet::new();
    let mut ordered = Vec::new();

    for line in text.lines() {
        let Some(lib_path) = parse_resolved_path(line) else {
            continue;
        };

        let object_path = if lib_path.starts_with(store_root) {
            enclosing_object(store_root, &lib_path)
        } else if is_foreign_origin(config, &lib_path) {
            let basename = match lib_path.file_name().and_then(|n| n.to_str()) {
                Some(b) => b,
                None => continue,
            };

            match find_object_by_basename(registry, basename) {
                Some(existing) => Some(existing),
                None => {
                    let deps = BTreeSet::new();
                    let id = importer::import(store_root, registry, config, &lib_path, basename, &deps)?;
                    Some(id.to_path(store_root))
                }
            }
        } else {
            None
        };

        let Some(object_path) = object_path else {
            continue;
        };

        if seen.insert(object_path.clone()) {
            let id = object_path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|s| s.parse::<ObjectId>().ok());
            if let Some(id) = id {
                ordered.push(id);
            }
        }
    }

    Ok(ordered)
}

/// Bulk-imports every shared library under the configured boot-ramdisk library directory.
///
/// Supplements the lazy, per-executable `scan_dependencies` with a proactive sweep, grounded in
/// the upstream reference tool's `add_boot_libraries` operation: useful for seeding the store with
/// the libraries every boot-ramdisk binary is going to need anyway.
#[instrument(skip(registry, config))]
pub fn import_boot_libraries(
    store_root: &Path,
    registry: &mut Registry,
    config: &Config,
) -> Result<Vec<ObjectId>> {
    let lib_dir = Path::new(&config.deps.boot_ramdisk_path).join("lib");
    if !lib_dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut imported = Vec::new();

    for entry in WalkDir::new(&lib_dir).follow_links(false).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| {
            StoreError::io(&lib_dir, std::io::Error::new(std::io::ErrorKind::Other, e))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let is_shared_object = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.contains(".so"))
            .unwrap_or(false);
        if !is_shared_object {
            continue;
        }

        let basename = path.file_name().and_then(|n| n.to_str()).expect("checked above");
        let deps = BTreeSet::new();
        let id = importer::import(store_root, registry, config, path, basename, &deps)?;
        imported.push(id);
    }

    Ok(imported)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_absolute_resolved_path() {
        let line = "        libc.so.6 => /system/lib/libc.so.6 (0x00007f0000000000)";
        assert_eq!(
            parse_resolved_path(line),
            Some(PathBuf::from("/system/lib/libc.so.6"))
        );
    }

    #[test]
    fn ignores_lines_without_arrow() {
        let line = "        linux-vdso.so.1 (0x00007ffee6bfe000)";
        assert_eq!(parse_resolved_path(line), None);
    }

    #[test]
    fn ignores_unresolved_relative_targets() {
        let line = "        notfound.so => not found";
        assert_eq!(parse_resolved_path(line), None);
    }

    #[test]
    fn enclosing_object_takes_first_segment_after_root() {
        let root = Path::new("/data/nix/store");
        let lib = root.join("aaaa-libc").join("lib").join("libc.so.6");
        assert_eq!(
            enclosing_object(root, &lib),
            Some(root.join("aaaa-libc"))
        );
    }

    #[test]
    fn is_foreign_origin_matches_configured_paths() {
        let config = Config::default();
        assert!(is_foreign_origin(&config, Path::new("/proc/boot/libc.so")));
        assert!(!is_foreign_origin(&config, Path::new("/usr/lib/libc.so")));
    }
}
