use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Length in bytes of a raw object id.
pub const OBJECT_ID_LENGTH: usize = 20;

/// Length in hex characters of a full object id.
pub const OBJECT_ID_HEX_LENGTH: usize = OBJECT_ID_LENGTH * 2;

/// Identifier of an object stored in a pack.
///
/// Ids are 20 raw bytes, as in Git's SHA-1 object format. Pack indexes keep
/// them sorted by raw byte order, which is also the `Ord` of this type.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId([u8; OBJECT_ID_LENGTH]);

impl ObjectId {
    /// Derive a synthetic id from arbitrary bytes.
    ///
    /// This is a truncated BLAKE3 digest, handy for tests and tooling that
    /// need stable, well-distributed ids. It is not a Git object hash.
    pub fn digest(data: &[u8]) -> Self {
        let mut id = [0u8; OBJECT_ID_LENGTH];
        id.copy_from_slice(&blake3::hash(data).as_bytes()[..OBJECT_ID_LENGTH]);
        Self(id)
    }

    /// Create an `ObjectId` from a pre-computed hash.
    pub const fn from_hash(hash: [u8; OBJECT_ID_LENGTH]) -> Self {
        Self(hash)
    }

    /// Copy an id out of a raw byte slice.
    pub fn from_raw(raw: &[u8]) -> Result<Self, TypeError> {
        if raw.len() < OBJECT_ID_LENGTH {
            return Err(TypeError::InvalidLength {
                expected: OBJECT_ID_LENGTH,
                actual: raw.len(),
            });
        }
        let mut id = [0u8; OBJECT_ID_LENGTH];
        id.copy_from_slice(&raw[..OBJECT_ID_LENGTH]);
        Ok(Self(id))
    }

    /// The null object ID (all zeros). Represents "no object".
    pub const fn null() -> Self {
        Self([0u8; OBJECT_ID_LENGTH])
    }

    /// Returns `true` if this is the null object ID.
    pub fn is_null(&self) -> bool {
        self.0 == [0u8; OBJECT_ID_LENGTH]
    }

    /// The raw id bytes.
    pub fn as_bytes(&self) -> &[u8; OBJECT_ID_LENGTH] {
        &self.0
    }

    /// First byte of the id, used to index fan-out tables.
    pub fn first_byte(&self) -> u8 {
        self.0[0]
    }

    /// Hex-encoded string representation.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short hex representation (first 8 characters).
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Parse from a full-length hex string.
    pub fn from_hex(s: &str) -> Result<Self, TypeError> {
        let bytes = hex::decode(s).map_err(|e| TypeError::InvalidHex(e.to_string()))?;
        if bytes.len() != OBJECT_ID_LENGTH {
            return Err(TypeError::InvalidLength {
                expected: OBJECT_ID_LENGTH,
                actual: bytes.len(),
            });
        }
        Self::from_raw(&bytes)
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.short_hex())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; OBJECT_ID_LENGTH]> for ObjectId {
    fn from(bytes: [u8; OBJECT_ID_LENGTH]) -> Self {
        Self(bytes)
    }
}

/// A possibly-shortened object id, as typed by a user (`abcd`, `a1b2c3f`).
///
/// Holds up to 40 hex nibbles. Odd-length prefixes are supported; the
/// trailing nibble occupies the high half of its byte.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct AbbreviatedObjectId {
    bytes: [u8; OBJECT_ID_LENGTH],
    nibbles: usize,
}

impl AbbreviatedObjectId {
    /// Parse an abbreviation of 1 to 40 hex characters.
    pub fn from_hex(s: &str) -> Result<Self, TypeError> {
        if s.is_empty() || s.len() > OBJECT_ID_HEX_LENGTH {
            return Err(TypeError::InvalidLength {
                expected: OBJECT_ID_HEX_LENGTH,
                actual: s.len(),
            });
        }
        let mut bytes = [0u8; OBJECT_ID_LENGTH];
        for (i, c) in s.chars().enumerate() {
            let nibble = c
                .to_digit(16)
                .ok_or_else(|| TypeError::InvalidHex(s.to_string()))? as u8;
            if i % 2 == 0 {
                bytes[i / 2] = nibble << 4;
            } else {
                bytes[i / 2] |= nibble;
            }
        }
        Ok(Self {
            bytes,
            nibbles: s.len(),
        })
    }

    /// Number of hex digits in the abbreviation.
    pub fn len(&self) -> usize {
        self.nibbles
    }

    /// Abbreviations always carry at least one digit.
    pub fn is_empty(&self) -> bool {
        self.nibbles == 0
    }

    /// True if all 40 digits are present.
    pub fn is_complete(&self) -> bool {
        self.nibbles == OBJECT_ID_HEX_LENGTH
    }

    /// The full id, if the abbreviation is complete.
    pub fn to_object_id(&self) -> Option<ObjectId> {
        self.is_complete().then(|| ObjectId(self.bytes))
    }

    /// First byte of the prefix. Only meaningful when `len() >= 2`; for a
    /// single digit the low nibble is zero.
    pub fn first_byte(&self) -> u8 {
        self.bytes[0]
    }

    /// Compare this prefix against the same-length prefix of `id`.
    ///
    /// Returns `Equal` when `id` starts with this abbreviation.
    pub fn prefix_compare(&self, id: &ObjectId) -> Ordering {
        let full = self.nibbles / 2;
        let cmp = self.bytes[..full].cmp(&id.as_bytes()[..full]);
        if cmp != Ordering::Equal || self.nibbles % 2 == 0 {
            return cmp;
        }
        (self.bytes[full] >> 4).cmp(&(id.as_bytes()[full] >> 4))
    }

    /// True if `id` starts with this abbreviation.
    pub fn is_prefix_of(&self, id: &ObjectId) -> bool {
        self.prefix_compare(id) == Ordering::Equal
    }
}

impl fmt::Debug for AbbreviatedObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AbbreviatedObjectId({self})")
    }
}

impl fmt::Display for AbbreviatedObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = hex::encode(self.bytes);
        f.write_str(&hex[..self.nibbles])
    }
}

/// Git object types that can appear as whole objects in a pack.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectType {
    Commit,
    Tree,
    Blob,
    Tag,
}

impl ObjectType {
    /// Type code used in pack object headers.
    pub fn type_code(&self) -> u8 {
        match self {
            Self::Commit => 1,
            Self::Tree => 2,
            Self::Blob => 3,
            Self::Tag => 4,
        }
    }

    /// Parse a pack header type code (whole objects only).
    pub fn from_type_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Commit),
            2 => Some(Self::Tree),
            3 => Some(Self::Blob),
            4 => Some(Self::Tag),
            _ => None,
        }
    }

    /// Canonical lowercase name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Commit => "commit",
            Self::Tree => "tree",
            Self::Blob => "blob",
            Self::Tag => "tag",
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_deterministic() {
        assert_eq!(ObjectId::digest(b"hello"), ObjectId::digest(b"hello"));
        assert_ne!(ObjectId::digest(b"hello"), ObjectId::digest(b"world"));
    }

    #[test]
    fn null_is_all_zeros() {
        let null = ObjectId::null();
        assert!(null.is_null());
        assert_eq!(null.as_bytes(), &[0u8; 20]);
    }

    #[test]
    fn hex_roundtrip() {
        let id = ObjectId::digest(b"test");
        let parsed = ObjectId::from_hex(&id.to_hex()).unwrap();
        assert_eq!(id, parsed);
        assert_eq!(format!("{id}").len(), 40);
    }

    #[test]
    fn from_hex_wrong_length() {
        let err = ObjectId::from_hex("abcd").unwrap_err();
        assert_eq!(
            err,
            TypeError::InvalidLength {
                expected: 20,
                actual: 2
            }
        );
    }

    #[test]
    fn from_raw_short_slice() {
        assert!(ObjectId::from_raw(&[1, 2, 3]).is_err());
    }

    #[test]
    fn serde_roundtrip() {
        let id = ObjectId::digest(b"serde test");
        let json = serde_json::to_string(&id).unwrap();
        let parsed: ObjectId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn abbreviation_even_length() {
        let id = ObjectId::from_hex("abcd0123456789abcdef0123456789abcdef0123").unwrap();
        let abbrev = AbbreviatedObjectId::from_hex("abcd").unwrap();
        assert_eq!(abbrev.len(), 4);
        assert!(abbrev.is_prefix_of(&id));
        assert_eq!(abbrev.to_string(), "abcd");
        assert!(abbrev.to_object_id().is_none());
    }

    #[test]
    fn abbreviation_odd_length() {
        let id = ObjectId::from_hex("abcd0123456789abcdef0123456789abcdef0123").unwrap();
        assert!(AbbreviatedObjectId::from_hex("abc").unwrap().is_prefix_of(&id));
        assert!(!AbbreviatedObjectId::from_hex("abe").unwrap().is_prefix_of(&id));
        assert_eq!(
            AbbreviatedObjectId::from_hex("abe").unwrap().prefix_compare(&id),
            Ordering::Greater
        );
    }

    #[test]
    fn abbreviation_complete() {
        let id = ObjectId::digest(b"complete");
        let abbrev = AbbreviatedObjectId::from_hex(&id.to_hex()).unwrap();
        assert!(abbrev.is_complete());
        assert_eq!(abbrev.to_object_id(), Some(id));
    }

    #[test]
    fn abbreviation_rejects_bad_input() {
        assert!(AbbreviatedObjectId::from_hex("").is_err());
        assert!(AbbreviatedObjectId::from_hex("xyz").is_err());
        assert!(AbbreviatedObjectId::from_hex(&"a".repeat(41)).is_err());
    }

    #[test]
    fn object_type_codes() {
        for ty in [
            ObjectType::Commit,
            ObjectType::Tree,
            ObjectType::Blob,
            ObjectType::Tag,
        ] {
            assert_eq!(ObjectType::from_type_code(ty.type_code()), Some(ty));
        }
        assert!(ObjectType::from_type_code(0).is_none());
        assert!(ObjectType::from_type_code(6).is_none());
        assert_eq!(ObjectType::Blob.to_string(), "blob");
    }
}
