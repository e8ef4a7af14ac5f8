//! Object identifiers and the path computer that derives them.

use std::fmt::{self, Display, Formatter};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use sha2::{Digest, Sha256};
use smol_str::SmolStr;

use crate::error::{Result, StoreError};
use crate::hash::Hasher;

/// Conservative POSIX `PATH_MAX`. Not read from the platform; see `DESIGN.md` for why this
/// crate hardcodes it rather than pulling in `libc` solely for this constant.
const PATH_MAX: usize = 4096;

/// Length in hex characters of a SHA-256 digest.
pub const HASH_HEX_LEN: usize = 64;

/// The human-readable label portion of an object identifier.
///
/// Validated the same way the teacher repo validates package names: non-empty, bounded length,
/// restricted character set, and may not start with `.` (to prevent hidden-file confusion and
/// directory-traversal-adjacent tricks).
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ObjectName(SmolStr);

impl ObjectName {
    /// Leaves enough room for a hyphen and a 64-character hex hash alongside the name within a
    /// 255-byte filename limit (the common `ext4`/`tmpfs` ceiling).
    pub const MAX: usize = 255 - 1 - HASH_HEX_LEN;

    pub fn parse<T: AsRef<str>>(s: T) -> Result<Self> {
        let s = s.as_ref();

        if s.is_empty() {
            return Err(StoreError::invalid("object name cannot be empty"));
        }
        if s.len() > Self::MAX {
            return Err(StoreError::invalid(format!(
                "object name must be shorter than {} characters",
                Self::MAX
            )));
        }
        if s.starts_with('.') {
            return Err(StoreError::invalid("object name cannot start with '.'"));
        }
        if !s.chars().all(is_name_char) {
            return Err(StoreError::invalid(format!(
                "object name {s:?} contains an invalid character"
            )));
        }

        Ok(ObjectName(SmolStr::new(s)))
    }
}

impl AsRef<str> for ObjectName {
    fn as_ref(&self) -> &str {
        self.0.as_str()
    }
}

impl Display for ObjectName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ObjectName {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        ObjectName::parse(s)
    }
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "+-._?=".contains(c)
}

/// A full object identifier: `<hex-hash>-<name>`.
///
/// This is the textual form of a store object. Its on-disk location, given a store root, is
/// `<store_root>/<identifier>` (flat — there is no two-character sharding subdirectory, unlike
/// the teacher's Merkle-object layout).
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ObjectId(String);

impl ObjectId {
    fn new(hash_hex: &str, name: &ObjectName) -> Self {
        ObjectId(format!("{hash_hex}-{name}"))
    }

    /// Returns the hex hash component.
    pub fn hash_hex(&self) -> &str {
        &self.0[..HASH_HEX_LEN]
    }

    /// Returns the human-readable name component.
    pub fn name(&self) -> &str {
        &self.0[HASH_HEX_LEN + 1..]
    }

    /// Returns the object's directory under `store_root`.
    pub fn to_path(&self, store_root: &Path) -> PathBuf {
        store_root.join(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ObjectId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ObjectId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() <= HASH_HEX_LEN + 1
            || s.as_bytes()[HASH_HEX_LEN] != b'-'
            || !s[..HASH_HEX_LEN].bytes().all(|b| b.is_ascii_hexdigit())
        {
            return Err(StoreError::invalid(format!(
                "{s:?} is not a valid object identifier"
            )));
        }

        ObjectName::parse(&s[HASH_HEX_LEN + 1..])?;
        Ok(ObjectId(s.to_string()))
    }
}

impl serde::Serialize for ObjectId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for ObjectId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        ObjectId::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Derives a fresh [`ObjectId`] for `name`, seeded either by a caller-provided hex string or by
/// the hash of `name` itself, concatenated with each reference's identifier string in insertion
/// order, per `SPEC_FULL.md` §4.1.
///
/// Fails if the resulting object path would exceed the platform path maximum.
pub fn compute_identifier<'a>(
    store_root: &Path,
    seed: Option<&str>,
    name: &ObjectName,
    references: impl IntoIterator<Item = &'a ObjectId>,
) -> Result<ObjectId> {
    let seed_bytes: Vec<u8> = match seed {
        Some(hex_seed) => {
            hex::decode(hex_seed).map_err(|e| StoreError::invalid(format!("bad seed: {e}")))?
        }
        None => Sha256::digest(name.as_ref().as_bytes()).to_vec(),
    };

    let mut hasher = Hasher::new();
    hasher.update(&seed_bytes);
    for reference in references {
        hasher.update(reference.as_str().as_bytes());
    }

    let id = ObjectId::new(&hasher.finish_hex(), name);

    let path = id.to_path(store_root);
    let path_str = path.to_string_lossy();
    if path_str.len() > PATH_MAX {
        return Err(StoreError::invalid(format!(
            "object path exceeds PATH_MAX ({} > {})",
            path_str.len(),
            PATH_MAX
        )));
    }

    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_dotted_names() {
        assert!(ObjectName::parse("").is_err());
        assert!(ObjectName::parse(".hidden").is_err());
        assert!(ObjectName::parse("hello").is_ok());
    }

    #[test]
    fn same_name_and_refs_produce_same_identifier() {
        let root = PathBuf::from("/data/nix/store");
        let name = ObjectName::parse("hello").unwrap();

        let id1 = compute_identifier(&root, None, &name, std::iter::empty()).unwrap();
        let id2 = compute_identifier(&root, None, &name, std::iter::empty()).unwrap();

        assert_eq!(id1, id2);
        assert_eq!(id1.name(), "hello");
        assert_eq!(id1.hash_hex().len(), HASH_HEX_LEN);
    }

    #[test]
    fn different_references_change_identifier() {
        let root = PathBuf::from("/data/nix/store");
        let name = ObjectName::parse("hello").unwrap();
        let dep_name = ObjectName::parse("libc").unwrap();
        let dep = compute_identifier(&root, None, &dep_name, std::iter::empty()).unwrap();

        let without_refs = compute_identifier(&root, None, &name, std::iter::empty()).unwrap();
        let with_refs = compute_identifier(&root, None, &name, std::iter::once(&dep)).unwrap();

        assert_ne!(without_refs, with_refs);
    }

    #[test]
    fn round_trips_through_display_and_parse() {
        let root = PathBuf::from("/data/nix/store");
        let name = ObjectName::parse("hello").unwrap();
        let id = compute_identifier(&root, None, &name, std::iter::empty()).unwrap();

        let text = id.to_string();
        let parsed: ObjectId = text.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn rejects_malformed_identifier_strings() {
        assert!("not-a-hash-hello".parse::<ObjectId>().is_err());
        assert!("".parse::<ObjectId>().is_err());
    }
}
