//! Stable content hashing over a single file or a directory tree.
//!
//! Directory hashing deliberately excludes symlinks and non-regular files (device nodes, fifos,
//! sockets) from the digest. This is a known weakness carried over from the upstream design: a
//! symlink's target can change, or a non-regular file's contents can be swapped out, without the
//! object's recorded hash changing. It is not fixed here; see `DESIGN.md`.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::error::{Result, StoreError};

/// Threshold above which a file is hashed via a memory-mapped read rather than a buffered one.
const MMAP_THRESHOLD: u64 = 16 * 1024;

/// An incremental hasher that computes object content digests.
#[derive(Debug, Default)]
pub struct Hasher(Sha256);

impl Hasher {
    pub fn new() -> Self {
        Hasher(Sha256::new())
    }

    /// Adds input bytes to the hash state. You can call this any number of times.
    pub fn update(&mut self, bytes: &[u8]) -> &mut Self {
        self.0.update(bytes);
        self
    }

    /// Finalizes the hash state and returns the lowercase hex digest.
    pub fn finish_hex(self) -> String {
        hex::encode(self.0.finalize())
    }
}

/// Reads `path` using a memory-mapped read for large files and a buffered read otherwise,
/// feeding the bytes to `sink` either way. Both paths are byte-for-byte identical; mmap is
/// strictly a performance strategy for big sequential reads.
fn feed_file_bytes(path: &Path, sink: &mut impl Write) -> Result<()> {
    let file = File::open(path).map_err(|e| StoreError::io(path, e))?;
    let len = file.metadata().map_err(|e| StoreError::io(path, e))?.len();

    if len >= MMAP_THRESHOLD {
        // Safety: the file is opened read-only for the duration of the mapping and we do not
        // mutate it concurrently; callers must not mutate `path` from another process while
        // hashing, which matches the store's single-mutator design (see `SPEC_FULL.md` §5).
        let mmap = unsafe { memmap::Mmap::map(&file) }.map_err(|e| StoreError::io(path, e))?;
        sink.write_all(&mmap).map_err(|e| StoreError::io(path, e))?;
    } else {
        let mut file = file;
        let mut buf = Vec::with_capacity(len as usize);
        file.read_to_end(&mut buf).map_err(|e| StoreError::io(path, e))?;
        sink.write_all(&buf).map_err(|e| StoreError::io(path, e))?;
    }

    Ok(())
}

/// Computes the file-mode digest for a single-file import: `sha256("bin/" || name || bytes)`.
pub fn hash_file(name: &str, path: &Path) -> Result<String> {
    let mut hasher = Hasher::new();
    hasher.update(b"bin/");
    hasher.update(name.as_bytes());

    let mut sink = HasherSink(&mut hasher);
    feed_file_bytes(path, &mut sink)?;

    Ok(hasher.finish_hex())
}

/// Adapter letting `Hasher` be used as a `Write` sink, since there's no underlying writer to pass
/// bytes on to here.
struct HasherSink<'a>(&'a mut Hasher);

impl Write for HasherSink<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Computes the directory-mode digest over every regular file under `root`, as described in
/// `SPEC_FULL.md` §4.1: enumerate regular files, pair each with its path relative to `root`,
/// sort lexicographically by that relative path, then feed `relative_path || bytes` in order.
///
/// Symlinks and non-regular files are skipped. Fails if more than `max_files` regular files are
/// found, or if recursion depth exceeds what `walkdir` can represent on this platform.
pub fn hash_dir(root: &Path, max_files: usize) -> Result<String> {
    let mut files: Vec<_> = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| {
            entry
                .path()
                .strip_prefix(root)
                .expect("walkdir yields paths under root")
                .to_path_buf()
        })
        .collect();

    if files.len() > max_files {
        return Err(StoreError::ResourceExhausted(format!(
            "directory contains {} files, exceeding the cap of {}",
            files.len(),
            max_files
        )));
    }

    files.sort();

    let mut hasher = Hasher::new();
    for rel in &files {
        let rel_str = rel.to_str().ok_or_else(|| {
            StoreError::invalid(format!("path {} contains invalid UTF-8", rel.display()))
        })?;
        hasher.update(rel_str.as_bytes());

        let mut sink = HasherSink(&mut hasher);
        feed_file_bytes(&root.join(rel), &mut sink)?;
    }

    Ok(hasher.finish_hex())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn hash_file_matches_manual_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello");
        fs::write(&path, b"x").unwrap();

        let got = hash_file("hello", &path).unwrap();

        let mut expected = Sha256::new();
        expected.update(b"bin/");
        expected.update(b"hello");
        expected.update(b"x");
        let expected = hex::encode(expected.finalize());

        assert_eq!(got, expected);
    }

    #[test]
    fn hash_dir_is_order_independent_of_creation_order() {
        let dir_a = tempfile::tempdir().unwrap();
        fs::write(dir_a.path().join("b.txt"), b"2").unwrap();
        fs::write(dir_a.path().join("a.txt"), b"1").unwrap();

        let dir_b = tempfile::tempdir().unwrap();
        fs::write(dir_b.path().join("a.txt"), b"1").unwrap();
        fs::write(dir_b.path().join("b.txt"), b"2").unwrap();

        assert_eq!(
            hash_dir(dir_a.path(), 1024).unwrap(),
            hash_dir(dir_b.path(), 1024).unwrap()
        );
    }

    #[test]
    fn hash_dir_ignores_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("real.txt"), b"data").unwrap();
        std::os::unix::fs::symlink("real.txt", dir.path().join("link.txt")).unwrap();

        let with_link = hash_dir(dir.path(), 1024).unwrap();
        fs::remove_file(dir.path().join("link.txt")).unwrap();
        let without_link = hash_dir(dir.path(), 1024).unwrap();

        assert_eq!(with_link, without_link);
    }

    #[test]
    fn hash_dir_rejects_too_many_files() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..5 {
            fs::write(dir.path().join(format!("f{i}")), b"x").unwrap();
        }

        assert!(hash_dir(dir.path(), 2).is_err());
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;
    use std::fs;

    proptest! {
        /// Hashing the same bytes under the same name is deterministic (`SPEC_FULL.md` §8,
        /// property 1).
        #[test]
        fn hash_file_is_deterministic(name in "[a-zA-Z0-9_.-]{1,32}", bytes in proptest::collection::vec(any::<u8>(), 0..512)) {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("f");
            fs::write(&path, &bytes).unwrap();

            let first = hash_file(&name, &path).unwrap();
            let second = hash_file(&name, &path).unwrap();
            prop_assert_eq!(first, second);
        }

        /// Hashing a directory is independent of the order files were created in, and stable
        /// across repeated calls (`SPEC_FULL.md` §8, property 2).
        #[test]
        fn hash_dir_is_idempotent(names in proptest::collection::hash_set("[a-zA-Z0-9_]{1,16}", 1..6), byte in any::<u8>()) {
            let dir = tempfile::tempdir().unwrap();
            for name in &names {
                fs::write(dir.path().join(name), [byte]).unwrap();
            }

            let first = hash_dir(dir.path(), 1024).unwrap();
            let second = hash_dir(dir.path(), 1024).unwrap();
            prop_assert_eq!(first, second);
        }
    }
}
