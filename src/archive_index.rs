//! CDN archive index (`<hash>.index`).
//!
//! Describes one packed CDN archive: `(encoded key, size, offset)` rows
//! sorted by key, packed into fixed-size pages, followed by a table of
//! contents (last key of every page), 8-byte md5 prefixes of every page but
//! the last, and a 36-byte footer:
//!
//! ```text
//! lower_hash[8]  md5(last page)
//! upper_hash[8]  md5(toc ++ block hashes ++ lower_hash)
//! version 1 | 0 | 0 | page KiB | offset bytes 4 | size bytes 4
//!   | key size 16 | checksum size 8 | entry count u32 LE
//! footer_hash[8] md5(footer[16..] with this field zeroed)
//! ```
//! The file name is the md5 of `footer[8..]`, so an index is addressed by
//! its own footer.

use std::collections::BTreeMap;
use std::io::{Cursor, Read};

use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};
use crate::key::{md5_prefix, HashKey, KEY_SIZE};

pub const PAGE_SIZE: usize = 4096;

const ENTRY_SIZE:    usize = KEY_SIZE + 8;
const CHECKSUM_SIZE: usize = 8;
const FOOTER_SIZE:   usize = 36;
const VERSION:       u8    = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveIndexEntry {
    pub key:    HashKey,
    pub size:   u32,
    pub offset: u32,
}

/// A serialized index and the key it is named by.
#[derive(Debug, Clone)]
pub struct IndexFile {
    pub name:  HashKey,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveIndex {
    entries:   BTreeMap<HashKey, ArchiveIndexEntry>,
    page_size: usize,
}

impl Default for ArchiveIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchiveIndex {
    pub fn new() -> Self {
        Self::with_page_size(PAGE_SIZE)
    }

    /// `page_size` must be a whole number of KiB; the footer stores it so.
    pub fn with_page_size(page_size: usize) -> Self {
        Self { entries: BTreeMap::new(), page_size: page_size.max(1024) / 1024 * 1024 }
    }

    pub fn from_entries(entries: impl IntoIterator<Item = ArchiveIndexEntry>) -> Self {
        let mut index = Self::new();
        index.extend(entries);
        index
    }

    pub fn extend(&mut self, entries: impl IntoIterator<Item = ArchiveIndexEntry>) {
        for e in entries {
            self.entries.insert(e.key, e);
        }
    }

    pub fn insert(&mut self, entry: ArchiveIndexEntry) {
        self.entries.insert(entry.key, entry);
    }

    pub fn remove(&mut self, key: &HashKey) -> Option<ArchiveIndexEntry> {
        self.entries.remove(key)
    }

    pub fn get(&self, key: &HashKey) -> Option<&ArchiveIndexEntry> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &HashKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Rows in key order.
    pub fn entries(&self) -> impl Iterator<Item = &ArchiveIndexEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&ArchiveIndexEntry) -> bool) {
        self.entries.retain(|_, e| keep(e));
    }

    /// Lay the rows out back to back in key order. This is the order the
    /// archive data file is concatenated in when it is rebuilt.
    pub fn pack_offsets(&mut self) {
        let mut offset = 0u32;
        for e in self.entries.values_mut() {
            e.offset = offset;
            offset = offset.wrapping_add(e.size);
        }
    }

    fn entries_per_page(&self) -> usize {
        self.page_size / ENTRY_SIZE
    }

    pub fn build(&self) -> Result<IndexFile> {
        let per_page = self.entries_per_page();
        let rows: Vec<&ArchiveIndexEntry> = self.entries.values().collect();
        let page_count = rows.len().div_ceil(per_page).max(1);

        let mut out = Vec::with_capacity(page_count * (self.page_size + KEY_SIZE + CHECKSUM_SIZE) + FOOTER_SIZE);
        let mut toc = Vec::with_capacity(page_count * KEY_SIZE);
        let mut block_hashes = Vec::with_capacity(page_count * CHECKSUM_SIZE);
        let mut last_page_hash = [0u8; CHECKSUM_SIZE];

        for page_no in 0..page_count {
            let page_rows = rows.iter().skip(page_no * per_page).take(per_page);
            let start = out.len();
            let mut last_key = HashKey::ZERO;
            for e in page_rows {
                out.extend_from_slice(e.key.as_bytes());
                out.write_u32::<BigEndian>(e.size)?;
                out.write_u32::<BigEndian>(e.offset)?;
                last_key = e.key;
            }
            out.resize(start + self.page_size, 0);

            toc.extend_from_slice(last_key.as_bytes());
            let page_hash = md5_prefix::<CHECKSUM_SIZE>(&out[start..]);
            if page_no + 1 < page_count {
                block_hashes.extend_from_slice(&page_hash);
            } else {
                last_page_hash = page_hash;
            }
        }

        let toc_start = out.len();
        out.extend_from_slice(&toc);
        out.extend_from_slice(&block_hashes);

        let footer_start = out.len();
        out.extend_from_slice(&last_page_hash);
        let upper = md5_prefix::<CHECKSUM_SIZE>(&out[toc_start..footer_start + CHECKSUM_SIZE]);
        out.extend_from_slice(&upper);

        out.write_u8(VERSION)?;
        out.write_u8(0)?;
        out.write_u8(0)?;
        out.write_u8((self.page_size / 1024) as u8)?;
        out.write_u8(4)?;
        out.write_u8(4)?;
        out.write_u8(KEY_SIZE as u8)?;
        out.write_u8(CHECKSUM_SIZE as u8)?;
        out.write_u32::<LittleEndian>(rows.len() as u32)?;
        out.extend_from_slice(&[0u8; CHECKSUM_SIZE]);

        let footer_hash = md5_prefix::<CHECKSUM_SIZE>(&out[footer_start + 16..]);
        let len = out.len();
        out[len - CHECKSUM_SIZE..].copy_from_slice(&footer_hash);

        let name = HashKey::of(&out[footer_start + 8..]);
        Ok(IndexFile { name, bytes: out })
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let corrupt = |detail: String| Error::corrupt("archive index", detail);
        if bytes.len() < FOOTER_SIZE {
            return Err(corrupt(format!("{} bytes is shorter than the footer", bytes.len())));
        }

        let footer_start = bytes.len() - FOOTER_SIZE;
        let footer = &bytes[footer_start..];
        let mut r = Cursor::new(&footer[16..]);
        let version = r.read_u8()?;
        let _ = (r.read_u8()?, r.read_u8()?);
        let page_kib = r.read_u8()? as usize;
        let (offset_bytes, size_bytes, key_size, checksum_size) =
            (r.read_u8()?, r.read_u8()?, r.read_u8()?, r.read_u8()?);
        let entry_count = r.read_u32::<LittleEndian>()? as usize;

        if version != VERSION
            || (offset_bytes, size_bytes, key_size, checksum_size) != (4, 4, KEY_SIZE as u8, CHECKSUM_SIZE as u8)
            || page_kib == 0
        {
            return Err(corrupt(format!(
                "unsupported footer v{version} page {page_kib}K fields {offset_bytes}/{size_bytes}/{key_size}/{checksum_size}"
            )));
        }

        let mut zeroed = footer[16..].to_vec();
        let n = zeroed.len();
        zeroed[n - CHECKSUM_SIZE..].fill(0);
        if md5_prefix::<CHECKSUM_SIZE>(&zeroed) != footer[FOOTER_SIZE - CHECKSUM_SIZE..] {
            return Err(corrupt("footer checksum mismatch".into()));
        }

        let page_size = page_kib * 1024;
        let page_count = (bytes.len() - FOOTER_SIZE) / (page_size + KEY_SIZE + CHECKSUM_SIZE) + 1;
        let pages_end = page_count * page_size;
        let toc_len = page_count * KEY_SIZE;
        let hashes_len = (page_count - 1) * CHECKSUM_SIZE;
        if pages_end + toc_len + hashes_len != footer_start {
            return Err(corrupt(format!("{} bytes do not hold {page_count} pages", bytes.len())));
        }

        let upper = md5_prefix::<CHECKSUM_SIZE>(&bytes[pages_end..footer_start + CHECKSUM_SIZE]);
        if upper != footer[CHECKSUM_SIZE..2 * CHECKSUM_SIZE] {
            return Err(corrupt("table of contents checksum mismatch".into()));
        }

        let block_hashes = &bytes[pages_end + toc_len..footer_start];
        let mut index = Self::with_page_size(page_size);
        for page_no in 0..page_count {
            let page = &bytes[page_no * page_size..(page_no + 1) * page_size];
            let hash = md5_prefix::<CHECKSUM_SIZE>(page);
            let expected = if page_no + 1 < page_count {
                &block_hashes[page_no * CHECKSUM_SIZE..(page_no + 1) * CHECKSUM_SIZE]
            } else {
                &footer[..CHECKSUM_SIZE]
            };
            if hash != expected {
                return Err(corrupt(format!("page {page_no} checksum mismatch")));
            }

            let mut r = Cursor::new(page);
            while (r.position() as usize) + ENTRY_SIZE <= page_size {
                let mut key = [0u8; KEY_SIZE];
                r.read_exact(&mut key)?;
                let size = r.read_u32::<BigEndian>()?;
                let offset = r.read_u32::<BigEndian>()?;
                let key = HashKey(key);
                if key.is_zero() {
                    continue;
                }
                index.insert(ArchiveIndexEntry { key, size, offset });
            }
        }

        if index.len() != entry_count {
            return Err(corrupt(format!("footer claims {entry_count} entries, pages hold {}", index.len())));
        }
        Ok(index)
    }
}
