//! Profile and generation management: mutable entry points into immutable store objects.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{info, instrument, warn};

use crate::config::Config;
use crate::error::{Result, StoreError};
use crate::hash;
use crate::objectpath::{self, ObjectId, ObjectName};
use crate::registry::Registry;
use crate::util;

const SUBDIRS: &[&str] = &["bin", "lib", "share", "etc", "include"];
const ESSENTIAL_UTILITIES: &[&str] = &["sh", "ls", "cat", "cp", "mv", "rm", "mkdir"];

fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn current_marker(profiles_root: &Path, name: &str) -> PathBuf {
    profiles_root.join(format!(".{name}.current"))
}

/// Returns an epoch strictly greater than `min_epoch`, bumping past the wall clock if the clock
/// hasn't advanced since `min_epoch` was recorded. `install`'s pre-change and post-change
/// snapshots both call `now_epoch()` and can otherwise land in the same second, collapsing two
/// generations into one.
fn epoch_after(min_epoch: u64) -> u64 {
    let now = now_epoch();
    if now > min_epoch {
        now
    } else {
        min_epoch + 1
    }
}

fn generation_prefix(name: &str) -> String {
    format!("{name}-")
}

/// True if `entry_name` looks like `<profile>-<epoch>`, i.e. a generation directory rather than a
/// plain profile directory.
fn is_generation_dir_name(entry_name: &str) -> Option<(&str, u64)> {
    let (base, suffix) = entry_name.rsplit_once('-')?;
    let epoch: u64 = suffix.parse().ok()?;
    Some((base, epoch))
}

fn find_object_by_exact_name(registry: &Registry, name: &str) -> Option<PathBuf> {
    registry.entry_paths().find_map(|path| {
        let id: ObjectId = path.file_name()?.to_str()?.parse().ok()?;
        (id.name() == name).then(|| path.to_path_buf())
    })
}

/// Creates a fresh profile: a dedicated store object, registered and rooted, symlinked in as the
/// profile's directory, pre-populated with wrapper scripts for a handful of essential utilities.
#[instrument(skip(registry, config))]
pub fn create(store_root: &Path, registry: &mut Registry, config: &Config, name: &str) -> Result<PathBuf> {
    let object_name = ObjectName::parse(name)?;
    let id = objectpath::compute_identifier(store_root, None, &object_name, std::iter::empty())?;
    let object_path = id.to_path(store_root);

    if !object_path.exists() {
        for subdir in SUBDIRS {
            fs::create_dir_all(object_path.join(subdir)).map_err(|e| StoreError::io(&object_path, e))?;
        }
        registry.register(&object_path, &Default::default())?;
        let hex = hash::hash_dir(&object_path, config.store.max_hash_files)?;
        registry.store_hash(&object_path, &hex)?;
    } else {
        registry.register(&object_path, &Default::default())?;
    }
    registry.add_root(&object_path)?;

    fs::create_dir_all(&config.store.profiles_path).map_err(|e| StoreError::io(&config.store.profiles_path, e))?;
    let profile_link = config.store.profiles_path.join(name);
    if profile_link.exists() || fs::symlink_metadata(&profile_link).is_ok() {
        fs::remove_file(&profile_link).ok();
    }
    std::os::unix::fs::symlink(&object_path, &profile_link).map_err(|e| StoreError::io(&profile_link, e))?;

    for util_name in ESSENTIAL_UTILITIES {
        if let Some(src_obj) = find_object_by_exact_name(registry, util_name) {
            let src = src_obj.join("bin").join(util_name);
            if src.is_file() {
                let dest = object_path.join("bin").join(util_name);
                if let Err(e) = std::os::unix::fs::symlink(&src, &dest) {
                    warn!(util = %util_name, error = %e, "failed to pre-populate essential utility");
                }
            }
        }
    }

    info!(profile = %name, object = %object_path.display(), "created profile");
    Ok(object_path)
}

/// Copies `src`'s contents into a fresh generation directory `<profiles_root>/<name>-<epoch>`.
fn snapshot_generation(profiles_root: &Path, name: &str, src: &Path, epoch: u64) -> Result<PathBuf> {
    let dest = profiles_root.join(format!("{name}-{epoch}"));
    util::copy_tree(src, &dest).map_err(|e| StoreError::io(&dest, e))?;
    Ok(dest)
}

fn ensure_subdirs(profile_path: &Path) -> Result<()> {
    for subdir in SUBDIRS {
        fs::create_dir_all(profile_path.join(subdir)).map_err(|e| StoreError::io(profile_path, e))?;
    }
    Ok(())
}

/// Places library symlinks in `profile_lib_dir` for every shared-object file in `object_path`'s
/// own `bin/`/`lib/` and in each of its references' `bin/`/`lib/`. Later entries overwrite earlier
/// ones, with a warning, as the upstream reference implementation does.
fn create_library_symlinks(
    registry: &Registry,
    object_path: &Path,
    profile_lib_dir: &Path,
) -> Result<()> {
    let mut sources: Vec<PathBuf> = vec![object_path.to_path_buf()];
    sources.extend(registry.get_refs(object_path));

    for source in &sources {
        for dir_type in ["lib", "bin"] {
            let search_dir = source.join(dir_type);
            let Ok(entries) = fs::read_dir(&search_dir) else {
                continue;
            };

            for entry in entries.filter_map(|e| e.ok()) {
                let file_name = entry.file_name();
                let Some(name) = file_name.to_str() else { continue };
                if !name.contains(".so") {
                    continue;
                }

                let dest = profile_lib_dir.join(name);
                if dest.exists() || fs::symlink_metadata(&dest).is_ok() {
                    warn!(lib = %name, "overwriting existing library symlink");
                    fs::remove_file(&dest).ok();
                }
                std::os::unix::fs::symlink(entry.path(), &dest).map_err(|e| StoreError::io(&dest, e))?;
            }
        }
    }

    Ok(())
}

/// Resolves the shebang target for wrapper scripts: the `bin/<shell>` entry of whatever store
/// object is registered under the configured shell name, falling back to a bare `/bin/<shell>` if
/// none is registered (useful in tests, harmless in a real store where the shell is imported).
fn resolve_shell_path(registry: &Registry, config: &Config) -> PathBuf {
    match find_object_by_exact_name(registry, &config.shell.shell_path) {
        Some(obj) => obj.join("bin").join(&config.shell.shell_path),
        None => Path::new("/bin").join(&config.shell.shell_path),
    }
}

/// Writes a wrapper script at `script_path` that execs `target` with `PATH`/`LD_LIBRARY_PATH` set
/// for a pure environment, per `SPEC_FULL.md` §4.5.
fn create_wrapper_script(
    registry: &Registry,
    config: &Config,
    script_path: &Path,
    target: &Path,
    profile_bin: &Path,
    library_dirs: &[PathBuf],
) -> Result<()> {
    let shebang = resolve_shell_path(registry, config);
    let ld_path = library_dirs
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(":");

    let mut script = format!(
        "#!{}\n# Wrapper for '{}'\n\nexport PATH=\"{}\"\nexport LD_LIBRARY_PATH=\"{}\"\n",
        shebang.display(),
        target.display(),
        profile_bin.display(),
        ld_path,
    );
    if config.shell.debug_wrappers {
        script.push_str("set -x\n");
    }
    script.push_str(&format!("exec \"{}\" \"$@\"\n", target.display()));

    fs::write(script_path, script).map_err(|e| StoreError::io(script_path, e))?;
    let mut perms = fs::metadata(script_path).map_err(|e| StoreError::io(script_path, e))?.permissions();
    perms.set_mode(0o755);
    fs::set_permissions(script_path, perms).map_err(|e| StoreError::io(script_path, e))?;
    Ok(())
}

/// Installs `object_path` into profile `profile_name`: snapshots the prior state, materializes
/// library symlinks and wrapper scripts, snapshots the new state, applies generation retention,
/// and roots the installed object, per `SPEC_FULL.md` §4.5's transactional shape.
#[instrument(skip(registry, config))]
pub fn install(
    registry: &mut Registry,
    config: &Config,
    object_path: &Path,
    profile_name: &str,
) -> Result<()> {
    if !registry.exists(object_path) {
        return Err(StoreError::invalid(format!(
            "not a registered object: {}",
            object_path.display()
        )));
    }

    let profiles_root = &config.store.profiles_path;
    fs::create_dir_all(profiles_root).map_err(|e| StoreError::io(profiles_root, e))?;
    let profile_path = profiles_root.join(profile_name);

    let pre_epoch = if profile_path.is_dir() {
        let epoch = now_epoch();
        snapshot_generation(profiles_root, profile_name, &profile_path, epoch)?;
        Some(epoch)
    } else {
        fs::create_dir_all(&profile_path).map_err(|e| StoreError::io(&profile_path, e))?;
        None
    };

    ensure_subdirs(&profile_path)?;

    let profile_lib = profile_path.join("lib");
    create_library_symlinks(registry, object_path, &profile_lib)?;

    let mut library_dirs = vec![profile_lib.clone()];
    for dep in registry.get_refs(object_path) {
        library_dirs.push(dep.join("lib"));
    }
    library_dirs.push(object_path.join("lib"));

    let source_bin = object_path.join("bin");
    if let Ok(entries) = fs::read_dir(&source_bin) {
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name();
            let dest = profile_path.join("bin").join(&name);
            fs::remove_file(&dest).ok();
            create_wrapper_script(
                registry,
                config,
                &dest,
                &entry.path(),
                &profile_path.join("bin"),
                &library_dirs,
            )?;
        }
    }

    for subdir in ["share", "etc", "include"] {
        let source_dir = object_path.join(subdir);
        let Ok(entries) = fs::read_dir(&source_dir) else {
            continue;
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name();
            let dest = profile_path.join(subdir).join(&name);
            fs::remove_file(&dest).ok();
            std::os::unix::fs::symlink(entry.path(), &dest).map_err(|e| StoreError::io(&dest, e))?;
        }
    }

    let post_epoch = match pre_epoch {
        Some(pre) => epoch_after(pre),
        None => now_epoch(),
    };
    snapshot_generation(profiles_root, profile_name, &profile_path, post_epoch)?;

    let marker = current_marker(profiles_root, profile_name);
    fs::write(&marker, post_epoch.to_string()).map_err(|e| StoreError::io(&marker, e))?;

    if config.profiles.max_generations > 0 {
        cleanup_old_generations(config, profile_name)?;
    }

    registry.add_root(object_path)?;

    info!(profile = %profile_name, object = %object_path.display(), "installed object into profile");
    Ok(())
}

/// Atomically repoints the `current` profile symlink.
#[instrument(skip(config))]
pub fn switch(config: &Config, profile_name: &str) -> Result<()> {
    let profile_path = config.store.profiles_path.join(profile_name);
    if !profile_path.is_dir() {
        return Err(StoreError::invalid(format!(
            "profile `{profile_name}` does not exist"
        )));
    }

    let current = config.store.profiles_path.join("current");
    fs::remove_file(&current).ok();
    std::os::unix::fs::symlink(&profile_path, &current).map_err(|e| StoreError::io(&current, e))?;
    Ok(())
}

fn list_generation_epochs(config: &Config, profile_name: &str) -> Result<Vec<u64>> {
    let profiles_root = &config.store.profiles_path;
    let mut epochs = Vec::new();

    let entries = match fs::read_dir(profiles_root) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(epochs),
        Err(e) => return Err(StoreError::io(profiles_root, e)),
    };

    let prefix = generation_prefix(profile_name);
    for entry in entries.filter_map(|e| e.ok()) {
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if let Some(rest) = name.strip_prefix(&prefix) {
            if let Ok(epoch) = rest.parse::<u64>() {
                epochs.push(epoch);
            }
        }
    }

    epochs.sort_unstable_by(|a, b| b.cmp(a));
    Ok(epochs)
}

/// Deletes generations beyond `Config::profiles.max_generations`, newest first kept.
#[instrument(skip(config))]
pub fn cleanup_old_generations(config: &Config, profile_name: &str) -> Result<()> {
    let max = config.profiles.max_generations as usize;
    if max == 0 {
        return Ok(());
    }

    let epochs = list_generation_epochs(config, profile_name)?;
    for epoch in epochs.into_iter().skip(max) {
        let gen_path = config.store.profiles_path.join(format!("{profile_name}-{epoch}"));
        if let Err(e) = util::remove_dir_all_if_exists(&gen_path) {
            warn!(generation = %gen_path.display(), error = %e, "failed to remove old generation");
        }
    }

    Ok(())
}

/// Replaces a profile's live contents with a given generation's contents, copying in place rather
/// than repointing a symlink, per the Open Question resolution in `SPEC_FULL.md` §9.
fn replace_profile_contents(profile_path: &Path, generation_path: &Path) -> Result<()> {
    util::remove_dir_all_if_exists(profile_path).map_err(|e| StoreError::io(profile_path, e))?;
    util::copy_tree(generation_path, profile_path).map_err(|e| StoreError::io(profile_path, e))
}

/// Rolls `profile_name` back to the newest generation strictly older than the current one.
#[instrument(skip(config))]
pub fn rollback(config: &Config, profile_name: &str) -> Result<()> {
    let profile_path = config.store.profiles_path.join(profile_name);
    if !profile_path.exists() {
        return Err(StoreError::invalid(format!(
            "profile `{profile_name}` does not exist"
        )));
    }

    let epochs = list_generation_epochs(config, profile_name)?;
    let marker = current_marker(&config.store.profiles_path, profile_name);
    let current_generation = match fs::read_to_string(&marker).ok().and_then(|s| s.trim().parse::<u64>().ok()) {
        Some(epoch) => epoch,
        None => {
            // No state file: treat the latest existing generation older than now as current, then
            // roll back to the next-older one, same as the original does.
            let now = now_epoch();
            epochs.iter().copied().find(|&e| e < now).ok_or_else(|| {
                StoreError::invalid(format!(
                    "profile `{profile_name}` has no generations to roll back from"
                ))
            })?
        }
    };

    let target = epochs.into_iter().find(|&e| e < current_generation);

    let Some(target_epoch) = target else {
        return Err(StoreError::invalid(format!(
            "no generation older than {current_generation} for profile `{profile_name}`"
        )));
    };

    let gen_path = config
        .store
        .profiles_path
        .join(format!("{profile_name}-{target_epoch}"));
    replace_profile_contents(&profile_path, &gen_path)?;
    fs::write(&marker, target_epoch.to_string()).map_err(|e| StoreError::io(&marker, e))?;

    info!(profile = %profile_name, generation = target_epoch, "rolled back profile");
    Ok(())
}

/// Switches `profile_name` to an explicit generation epoch, snapshotting current state first and
/// attempting to restore it if the switch fails partway.
#[instrument(skip(config))]
pub fn switch_generation(config: &Config, profile_name: &str, epoch: u64) -> Result<()> {
    let profiles_root = &config.store.profiles_path;
    let profile_path = profiles_root.join(profile_name);
    let gen_path = profiles_root.join(format!("{profile_name}-{epoch}"));

    if !gen_path.exists() {
        return Err(StoreError::invalid(format!(
            "generation {epoch} does not exist for profile `{profile_name}`"
        )));
    }

    let backup_epoch = now_epoch();
    let backup_path = profiles_root.join(format!("{profile_name}-{backup_epoch}"));
    let had_backup = profile_path.exists();
    if had_backup {
        util::copy_tree(&profile_path, &backup_path).map_err(|e| StoreError::io(&backup_path, e))?;
    }

    if let Err(e) = replace_profile_contents(&profile_path, &gen_path) {
        if had_backup {
            warn!(profile = %profile_name, "switch failed, restoring backup");
            replace_profile_contents(&profile_path, &backup_path)?;
        }
        return Err(e);
    }

    Ok(())
}

/// Lists direct subdirectories of the profiles root that are profiles rather than generations.
pub fn list_profiles(config: &Config) -> Result<Vec<String>> {
    let profiles_root = &config.store.profiles_path;
    let entries = match fs::read_dir(profiles_root) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::io(profiles_root, e)),
    };

    let mut names = Vec::new();
    for entry in entries.filter_map(|e| e.ok()) {
        // Profiles created by `create` are symlinks to their backing object directory, so this
        // must follow symlinks (`fs::metadata`) rather than use `DirEntry::file_type`, which
        // reports a symlink's own type and would exclude every real profile.
        if !fs::metadata(entry.path()).map(|m| m.is_dir()).unwrap_or(false) {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if name == "current" || name.starts_with('.') {
            continue;
        }
        if is_generation_dir_name(&name).is_some() {
            continue;
        }
        names.push(name);
    }

    names.sort();
    Ok(names)
}

/// Lists generation epochs for `profile_name`, newest first.
pub fn list_generations(config: &Config, profile_name: &str) -> Result<Vec<u64>> {
    list_generation_epochs(config, profile_name)
}

/// Filtered environment for an isolated shell session: `Config::shell.preserved_env_vars` plus
/// the handful of variables the shell itself needs.
fn filtered_shell_env(config: &Config, profile_name: &str, profile_path: &Path) -> Vec<(String, String)> {
    let mut env = Vec::new();

    for (key, value) in std::env::vars() {
        if config.shell.preserved_env_vars.iter().any(|k| k == &key) {
            env.push((key, value));
        }
    }

    env.push(("PATH".to_string(), profile_path.join("bin").display().to_string()));
    env.push((
        "LD_LIBRARY_PATH".to_string(),
        profile_path.join("lib").display().to_string(),
    ));
    env.push(("NIX_PROFILE".to_string(), profile_name.to_string()));
    if !env.iter().any(|(k, _)| k == "HOME") {
        if let Ok(home) = std::env::var("HOME") {
            env.push(("HOME".to_string(), home));
        }
    }
    if !env.iter().any(|(k, _)| k == "PS1") {
        env.push(("PS1".to_string(), format!("({profile_name}) $ ")));
    }

    env
}

/// Launches an interactive shell with an environment restricted to the given profile, per the
/// isolation rules in `SPEC_FULL.md` §4.5. Blocks until the shell exits.
#[instrument(skip(registry, config))]
pub fn enter_shell(
    registry: &Registry,
    config: &Config,
    profile_name: &str,
) -> Result<std::process::ExitStatus> {
    let profile_path = config.store.profiles_path.join(profile_name);
    if !profile_path.is_dir() {
        return Err(StoreError::invalid(format!(
            "profile `{profile_name}` does not exist"
        )));
    }

    let shell = resolve_shell_path(registry, config);
    let env = filtered_shell_env(config, profile_name, &profile_path);

    let mut cmd = std::process::Command::new(&shell);
    cmd.env_clear();
    for (key, value) in &env {
        cmd.env(key, value);
    }
    if config.shell.allow_system_binaries {
        let extra_path = config.shell.allowed_system_paths.join(":");
        let combined = format!("{}:{extra_path}", profile_path.join("bin").display());
        cmd.env("PATH", combined);
    }

    info!(profile = %profile_name, shell = %shell.display(), "entering isolated shell");
    cmd.status().map_err(|e| StoreError::tool(shell.display().to_string(), e.to_string()))
}
