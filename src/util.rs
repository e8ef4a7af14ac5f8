//! Common utilities for I/O and recursive filesystem operations.
//!
//! Recursive copy/remove are implemented natively rather than shelling out to `cp -rP`/`rm -rf`,
//! per the redesign guidance in `SPEC_FULL.md` §9 — losing shell-quoting bugs and vague error
//! detail in exchange for a subprocess call is not worth it when `std::fs` and `walkdir` do the
//! job directly.

use std::io::{self, Read, Write};
use std::path::Path;

use walkdir::WalkDir;

/// A faster implementation of `std::io::copy()` which uses a larger 64K buffer instead of 8K.
///
/// This larger buffer size leverages SIMD on x86_64 and other modern platforms for faster speeds.
/// See this GitHub issue: https://github.com/rust-lang/rust/issues/49921
pub fn copy_wide<R: Read, W: Write>(reader: &mut R, writer: &mut W) -> io::Result<u64> {
    let mut buffer = [0u8; 65536];
    let mut total = 0;
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => return Ok(total),
            Ok(n) => {
                writer.write_all(&buffer[..n])?;
                total += n as u64;
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Recursively removes `path` if it exists, tolerating it already being absent.
pub fn remove_dir_all_if_exists(path: &Path) -> io::Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Copies a directory tree from `src` to `dst`, preserving (but not following) symlinks.
/// `dst` must not already exist.
pub fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    std::fs::create_dir_all(dst)?;

    for entry in WalkDir::new(src).follow_links(false).min_depth(1) {
        let entry = entry.map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let rel = entry.path().strip_prefix(src).expect("under src");
        let target = dst.join(rel);

        let file_type = entry.file_type();
        if file_type.is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            let link = std::fs::read_link(entry.path())?;
            std::os::unix::fs::symlink(&link, &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn copy_wide_round_trips_bytes() {
        let data = vec![7u8; 200_000];
        let mut reader = io::Cursor::new(data.clone());
        let mut writer = Vec::new();
        let n = copy_wide(&mut reader, &mut writer).unwrap();
        assert_eq!(n as usize, data.len());
        assert_eq!(writer, data);
    }

    #[test]
    fn copy_tree_preserves_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        fs::create_dir_all(src.join("sub")).unwrap();
        fs::write(src.join("sub").join("file"), b"hi").unwrap();
        std::os::unix::fs::symlink("sub/file", src.join("link")).unwrap();

        copy_tree(&src, &dst).unwrap();

        assert_eq!(fs::read(dst.join("sub").join("file")).unwrap(), b"hi");
        assert!(fs::symlink_metadata(dst.join("link"))
            .unwrap()
            .file_type()
            .is_symlink());
    }

    #[test]
    fn remove_dir_all_if_exists_tolerates_absence() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(remove_dir_all_if_exists(&missing).is_ok());
    }
}
