//! 16-byte content and encoded keys.
//!
//! A [`HashKey`] plays two roles: the *content key* is the md5 of the raw
//! payload, the *encoded key* is the md5 of the framed BLTE container.
//! Ordering is plain byte-lexicographic, which is what every paginated
//! table on disk is sorted by. The all-zero key marks the end of a page.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub const KEY_SIZE: usize = 16;

/// Length of the key prefix stored in local `.idx` files.
pub const TRUNCATED_KEY_SIZE: usize = 9;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct HashKey(pub [u8; KEY_SIZE]);

impl HashKey {
    pub const ZERO: HashKey = HashKey([0u8; KEY_SIZE]);

    /// md5 of `data`.
    pub fn of(data: &[u8]) -> Self {
        HashKey(md5::compute(data).0)
    }

    /// Build a key from the first 16 bytes of `bytes`.
    /// Returns `None` when fewer than 16 bytes are available.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let raw: [u8; KEY_SIZE] = bytes.get(..KEY_SIZE)?.try_into().ok()?;
        Some(HashKey(raw))
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s.trim()).ok()?;
        if bytes.len() != KEY_SIZE {
            return None;
        }
        Self::from_slice(&bytes)
    }

    /// Lowercase hex, the form used for every key-derived file name.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; KEY_SIZE]
    }

    /// The 9-byte prefix used by the local index.
    pub fn truncated(&self) -> [u8; TRUNCATED_KEY_SIZE] {
        let mut out = [0u8; TRUNCATED_KEY_SIZE];
        out.copy_from_slice(&self.0[..TRUNCATED_KEY_SIZE]);
        out
    }

    /// Key bytes in reverse order, as written in front of every record of
    /// a local archive data file.
    pub fn reversed(&self) -> [u8; KEY_SIZE] {
        let mut out = self.0;
        out.reverse();
        out
    }
}

impl fmt::Display for HashKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for HashKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HashKey({})", self.to_hex())
    }
}

impl FromStr for HashKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        HashKey::from_hex(s).ok_or_else(|| format!("not a 32-digit hex key: {s:?}"))
    }
}

impl From<[u8; KEY_SIZE]> for HashKey {
    fn from(raw: [u8; KEY_SIZE]) -> Self {
        HashKey(raw)
    }
}

impl AsRef<[u8]> for HashKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

// Keys travel through JSON (identity cache, settings) as hex strings.
impl Serialize for HashKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for HashKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// First `n` bytes of the md5 of `data`. Index files store 8-byte
/// truncated checksums.
pub(crate) fn md5_prefix<const N: usize>(data: &[u8]) -> [u8; N] {
    let digest = md5::compute(data).0;
    let mut out = [0u8; N];
    out.copy_from_slice(&digest[..N]);
    out
}
