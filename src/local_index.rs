//! Local `.idx` bucket files: truncated encoded key → (archive, offset, size).
//!
//! Sixteen buckets, one file each, named `{bucket:02x}{version:08x}.idx`.
//! A key's bucket is the XOR of its nine stored bytes folded to a nibble.
//!
//! ```text
//! 0x00  header_hash_size u32 LE (16)
//! 0x04  header_hash      u32 LE   hashlittle2 over 0x08..0x18
//! 0x08  version u16 LE (7) | bucket u8 | extra_bytes u8
//!       size_bytes u8 (4) | offset_bytes u8 (5) | key_bytes u8 (9) | offset_bits u8 (30)
//! 0x10  max_archive_size u64 LE
//! 0x18  8 bytes padding
//! 0x20  entries_size u32 LE | entries_hash u32 LE
//! 0x28  entries: key[9] | (archive << 30 | offset) u40 BE | size u32 LE
//! ```
//! The entries hash chains `hashlittle2` across the 18-byte entries in key
//! order. Files are zero-padded to [`LOCAL_INDEX_MIN_SIZE`].

use std::collections::BTreeMap;
use std::fs;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::jenkins::hashlittle2;
use crate::key::{HashKey, TRUNCATED_KEY_SIZE};
use crate::writer::StoredBlob;

pub const BUCKET_COUNT:         usize = 16;
pub const LOCAL_INDEX_VERSION:  u16   = 7;
pub const LOCAL_INDEX_MIN_SIZE: usize = 0xC0000;
pub const MAX_ARCHIVE_SIZE:     u64   = 0x40_0000_0000;

const HEADER_HASH_SIZE: u32   = 0x10;
const ENTRIES_START:    usize = 0x28;
const ENTRY_SIZE:       usize = 18;
const OFFSET_BITS:      u8    = 30;

pub type TruncatedKey = [u8; TRUNCATED_KEY_SIZE];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalIndexEntry {
    pub key:     TruncatedKey,
    pub archive: u32,
    pub offset:  u32,
    /// Record size including the 30-byte archive header.
    pub size:    u32,
}

impl LocalIndexEntry {
    fn to_bytes(self) -> [u8; ENTRY_SIZE] {
        let mut out = [0u8; ENTRY_SIZE];
        out[..9].copy_from_slice(&self.key);
        let packed = ((self.archive as u64) << OFFSET_BITS) | self.offset as u64;
        out[9..14].copy_from_slice(&packed.to_be_bytes()[3..]);
        out[14..].copy_from_slice(&self.size.to_le_bytes());
        out
    }

    fn from_reader(r: &mut impl Read) -> std::io::Result<Self> {
        let mut key = [0u8; TRUNCATED_KEY_SIZE];
        r.read_exact(&mut key)?;
        let packed = r.read_uint::<BigEndian>(5)?;
        let size = r.read_u32::<LittleEndian>()?;
        Ok(Self {
            key,
            archive: (packed >> OFFSET_BITS) as u32,
            offset:  (packed & ((1 << OFFSET_BITS) - 1)) as u32,
            size,
        })
    }
}

/// Bucket of a key: XOR all nine stored bytes, then fold the nibbles.
pub fn bucket_of(key: &[u8]) -> u8 {
    let x = key.iter().take(TRUNCATED_KEY_SIZE).fold(0u8, |acc, b| acc ^ b);
    (x & 0x0F) ^ (x >> 4)
}

#[derive(Debug, Clone)]
struct Bucket {
    version:          u32,
    max_archive_size: u64,
    extra_bytes:      u8,
    entries:          BTreeMap<TruncatedKey, LocalIndexEntry>,
    dirty:            bool,
    // File this bucket was loaded from, replaced on flush.
    source:           Option<PathBuf>,
}

impl Bucket {
    fn empty() -> Self {
        Self {
            version:          1,
            max_archive_size: MAX_ARCHIVE_SIZE,
            extra_bytes:      0,
            entries:          BTreeMap::new(),
            dirty:            false,
            source:           None,
        }
    }
}

pub struct LocalIndex {
    dir:     PathBuf,
    buckets: Vec<Bucket>,
}

impl LocalIndex {
    /// Empty index rooted at `dir` (normally `Data/data`).
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir:     dir.into(),
            buckets: (0..BUCKET_COUNT).map(|_| Bucket::empty()).collect(),
        }
    }

    /// Load the newest version of every bucket found in `dir`.
    pub fn load(dir: impl Into<PathBuf>) -> Result<Self> {
        let mut index = Self::new(dir);
        let mut newest: Vec<Option<(u32, PathBuf)>> = vec![None; BUCKET_COUNT];

        for entry in fs::read_dir(&index.dir)? {
            let path = entry?.path();
            let Some((bucket, version)) = parse_file_name(&path) else { continue };
            let slot = &mut newest[bucket as usize];
            if slot.as_ref().map_or(true, |(v, _)| version > *v) {
                *slot = Some((version, path));
            }
        }

        for (bucket, found) in newest.into_iter().enumerate() {
            if let Some((version, path)) = found {
                let parsed = parse_bucket(&fs::read(&path)?, &path)?;
                let slot = &mut index.buckets[bucket];
                *slot = parsed;
                slot.version = version;
                slot.source = Some(path);
                debug!(bucket, version, entries = slot.entries.len(), "loaded local index");
            }
        }
        Ok(index)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn lookup(&self, key: &HashKey) -> Option<LocalIndexEntry> {
        self.lookup_truncated(&key.truncated())
    }

    pub fn lookup_truncated(&self, key: &TruncatedKey) -> Option<LocalIndexEntry> {
        self.buckets[bucket_of(key) as usize].entries.get(key).copied()
    }

    /// Insert or update the entry for a blob appended to a local archive.
    /// Blobs that only went out as loose objects are ignored.
    pub fn record_new_blob(&mut self, blob: &StoredBlob) {
        let (Some(archive), Some(offset)) = (blob.archive, blob.offset) else { return };
        let key = blob.encoded_key.truncated();
        let bucket = &mut self.buckets[bucket_of(&key) as usize];
        bucket.entries.insert(key, LocalIndexEntry { key, archive, offset, size: blob.archived_size() });
        bucket.dirty = true;
    }

    pub fn remove(&mut self, key: &HashKey) -> Option<LocalIndexEntry> {
        let key = key.truncated();
        let bucket = &mut self.buckets[bucket_of(&key) as usize];
        let removed = bucket.entries.remove(&key);
        if removed.is_some() {
            bucket.dirty = true;
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entries(&self) -> impl Iterator<Item = &LocalIndexEntry> {
        self.buckets.iter().flat_map(|b| b.entries.values())
    }

    /// Rewrite every dirty bucket. Returns the paths written.
    pub fn flush(&mut self) -> Result<Vec<PathBuf>> {
        let mut written = Vec::new();
        for (n, bucket) in self.buckets.iter_mut().enumerate() {
            if !bucket.dirty {
                continue;
            }
            let path = self.dir.join(file_name(n as u8, bucket.version));
            fs::create_dir_all(&self.dir)?;
            let tmp = path.with_extension("idx.tmp");
            fs::write(&tmp, serialize_bucket(n as u8, bucket)?)?;
            fs::rename(&tmp, &path)?;

            if let Some(old) = bucket.source.replace(path.clone()) {
                if old != path {
                    if let Err(e) = fs::remove_file(&old) {
                        warn!("could not remove stale index {}: {e}", old.display());
                    }
                }
            }
            bucket.dirty = false;
            debug!(bucket = n, entries = bucket.entries.len(), "flushed local index");
            written.push(path);
        }
        Ok(written)
    }
}

pub fn file_name(bucket: u8, version: u32) -> String {
    format!("{bucket:02x}{version:08x}.idx")
}

fn parse_file_name(path: &Path) -> Option<(u8, u32)> {
    if path.extension()? != "idx" {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    if stem.len() != 10 {
        return None;
    }
    let bucket = u8::from_str_radix(&stem[..2], 16).ok()?;
    let version = u32::from_str_radix(&stem[2..], 16).ok()?;
    ((bucket as usize) < BUCKET_COUNT).then_some((bucket, version))
}

fn header_hash(header: &[u8]) -> u32 {
    let (mut pc, mut pb) = (0u32, 0u32);
    hashlittle2(header, &mut pc, &mut pb);
    pc
}

fn serialize_bucket(bucket: u8, b: &Bucket) -> Result<Vec<u8>> {
    let body_len = b.entries.len() * ENTRY_SIZE;
    let mut out = Vec::with_capacity(LOCAL_INDEX_MIN_SIZE.max(ENTRIES_START + body_len));

    out.write_u32::<LittleEndian>(HEADER_HASH_SIZE)?;
    out.write_u32::<LittleEndian>(0)?; // patched below
    out.write_u16::<LittleEndian>(LOCAL_INDEX_VERSION)?;
    out.write_u8(bucket)?;
    out.write_u8(b.extra_bytes)?;
    out.write_u8(4)?;
    out.write_u8(5)?;
    out.write_u8(TRUNCATED_KEY_SIZE as u8)?;
    out.write_u8(OFFSET_BITS)?;
    out.write_u64::<LittleEndian>(b.max_archive_size)?;
    out.extend_from_slice(&[0u8; 8]);

    let hh = header_hash(&out[8..8 + HEADER_HASH_SIZE as usize]);
    out[4..8].copy_from_slice(&hh.to_le_bytes());

    let (mut pc, mut pb) = (0u32, 0u32);
    let mut body = Vec::with_capacity(body_len);
    for entry in b.entries.values() {
        let raw = entry.to_bytes();
        hashlittle2(&raw, &mut pc, &mut pb);
        body.extend_from_slice(&raw);
    }
    out.write_u32::<LittleEndian>(body_len as u32)?;
    out.write_u32::<LittleEndian>(pc)?;
    out.extend_from_slice(&body);

    if out.len() < LOCAL_INDEX_MIN_SIZE {
        out.resize(LOCAL_INDEX_MIN_SIZE, 0);
    }
    Ok(out)
}

fn parse_bucket(data: &[u8], path: &Path) -> Result<Bucket> {
    let corrupt = |detail: String| Error::corrupt("local index", format!("{}: {detail}", path.display()));
    if data.len() < ENTRIES_START {
        return Err(corrupt(format!("{} bytes is shorter than the header", data.len())));
    }

    let mut r = Cursor::new(data);
    let hash_size = r.read_u32::<LittleEndian>()? as usize;
    let stored_header_hash = r.read_u32::<LittleEndian>()?;
    if hash_size != HEADER_HASH_SIZE as usize {
        return Err(corrupt(format!("header hash size {hash_size}")));
    }
    if header_hash(&data[8..8 + hash_size]) != stored_header_hash {
        return Err(corrupt("header hash mismatch".into()));
    }

    let version = r.read_u16::<LittleEndian>()?;
    if version != LOCAL_INDEX_VERSION {
        return Err(corrupt(format!("unsupported version {version}")));
    }
    let _bucket = r.read_u8()?;
    let extra_bytes = r.read_u8()?;
    let (size_bytes, offset_bytes, key_bytes) = (r.read_u8()?, r.read_u8()?, r.read_u8()?);
    if (size_bytes, offset_bytes, key_bytes) != (4, 5, TRUNCATED_KEY_SIZE as u8) {
        return Err(corrupt(format!("unsupported field sizes {size_bytes}/{offset_bytes}/{key_bytes}")));
    }
    let _offset_bits = r.read_u8()?;
    let max_archive_size = r.read_u64::<LittleEndian>()?;

    r.set_position(0x20);
    let entries_size = r.read_u32::<LittleEndian>()? as usize;
    let stored_entries_hash = r.read_u32::<LittleEndian>()?;
    if ENTRIES_START + entries_size > data.len() || entries_size % ENTRY_SIZE != 0 {
        return Err(corrupt(format!("entries size {entries_size} out of range")));
    }

    let (mut pc, mut pb) = (0u32, 0u32);
    let mut entries = BTreeMap::new();
    for raw in data[ENTRIES_START..ENTRIES_START + entries_size].chunks_exact(ENTRY_SIZE) {
        hashlittle2(raw, &mut pc, &mut pb);
        let entry = LocalIndexEntry::from_reader(&mut Cursor::new(raw))?;
        entries.insert(entry.key, entry);
    }
    if pc != stored_entries_hash {
        return Err(corrupt("entries hash mismatch".into()));
    }

    Ok(Bucket {
        version: 1,
        max_archive_size,
        extra_bytes,
        entries,
        dirty: false,
        source: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_fold() {
        assert_eq!(bucket_of(&[0u8; 9]), 0);
        // xor = 0x5A -> 0xA ^ 0x5 = 0xF
        assert_eq!(bucket_of(&[0x5A, 0, 0, 0, 0, 0, 0, 0, 0]), 0x0F);
        // bytes past the ninth do not count
        assert_eq!(bucket_of(&[0, 0, 0, 0, 0, 0, 0, 0, 0, 0xFF]), 0);
    }

    #[test]
    fn entry_packs_archive_and_offset() {
        let e = LocalIndexEntry { key: [7; 9], archive: 3, offset: 0x1234_5678 & 0x3FFF_FFFF, size: 99 };
        let raw = e.to_bytes();
        let back = LocalIndexEntry::from_reader(&mut Cursor::new(&raw[..])).unwrap();
        assert_eq!(back, e);
    }

    #[test]
    fn file_names() {
        assert_eq!(file_name(0x0a, 0x2f), "0a0000002f.idx");
        assert_eq!(parse_file_name(Path::new("/x/0a0000002f.idx")), Some((0x0a, 0x2f)));
        assert_eq!(parse_file_name(Path::new("/x/ff0000002f.idx")), None);
    }
}
