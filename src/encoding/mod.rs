//! Encoding table: content key ↔ encoded key, plus per-blob espec strings.
//!
//! # Layout
//! The decoded file is seven sections, each stored as its own BLTE chunk:
//!
//! | # | section            | default codec |
//! |---|--------------------|---------------|
//! | 0 | header (22 bytes)  | N             |
//! | 1 | espec strings      | Z 9           |
//! | 2 | ckey page lookup   | N             |
//! | 3 | ckey pages         | N             |
//! | 4 | ekey page lookup   | N             |
//! | 5 | ekey pages         | N             |
//! | 6 | own espec string   | Z 9           |
//!
//! Lookups are `(first key, md5(page))` per page. A ckey row is
//! `key_count u8 | size u40 | ckey | ekey * key_count`; an ekey row is
//! `ekey | espec_index u32 | size u40`. The last ekey row is followed by a
//! zero key with an all-ones espec index.

use std::collections::BTreeMap;
use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use tracing::debug;

use crate::blte::ChunkSpec;
use crate::codec::EncodingType;
use crate::error::{Error, Result};
use crate::key::{HashKey, KEY_SIZE};
use crate::writer::StoredBlob;

pub const ENCODING_MAGIC: [u8; 2] = *b"EN";
pub const PAGE_SIZE:      usize   = 4096;

const VERSION:         u8    = 1;
const HEADER_SIZE:     usize = 22;
const LOOKUP_SIZE:     usize = 2 * KEY_SIZE;
const EKEY_ROW_SIZE:   usize = KEY_SIZE + 4 + 5;
const SENTINEL_INDEX:  u32   = u32::MAX;

/// Largest block an espec string describes.
const MAX_BLOCK: u64 = 256 * 1024;

/// Codec choice of the seven sections when no existing file supplied one.
pub fn default_block_map() -> Vec<ChunkSpec> {
    vec![
        ChunkSpec::stored(),
        ChunkSpec::zlib(9),
        ChunkSpec::stored(),
        ChunkSpec::stored(),
        ChunkSpec::stored(),
        ChunkSpec::stored(),
        ChunkSpec::zlib(9),
    ]
}

/// Espec string for a blob of `size` encoded bytes.
pub fn espec_for(size: u64, is_root: bool) -> String {
    if is_root {
        "z".to_string()
    } else if size >= MAX_BLOCK {
        "b:{256K*=z}".to_string()
    } else if size > 1024 {
        format!("b:{{{}K*=z}}", size / 1024)
    } else {
        format!("b:{{{size}*=z}}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodingEntry {
    pub content_key:       HashKey,
    pub decompressed_size: u64,
    /// The first key is canonical.
    pub encoded_keys:      Vec<HashKey>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodingLayoutEntry {
    pub encoded_key:  HashKey,
    pub espec_index:  u32,
    pub size:         u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodingTable {
    ckeys:     BTreeMap<HashKey, EncodingEntry>,
    ekeys:     BTreeMap<HashKey, EncodingLayoutEntry>,
    especs:    Vec<String>,
    root_key:  Option<HashKey>,
    page_size: usize,
    block_map: Vec<ChunkSpec>,
}

impl Default for EncodingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl EncodingTable {
    pub fn new() -> Self {
        Self {
            ckeys:     BTreeMap::new(),
            ekeys:     BTreeMap::new(),
            especs:    Vec::new(),
            root_key:  None,
            page_size: PAGE_SIZE,
            block_map: default_block_map(),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1024) / 1024 * 1024;
        self
    }

    /// Codec choice per section, as read back from the stored file.
    pub fn with_block_map(mut self, map: Vec<ChunkSpec>) -> Self {
        if !map.is_empty() {
            self.block_map = map;
        }
        self
    }

    pub fn block_map(&self) -> &[ChunkSpec] {
        &self.block_map
    }

    /// Content key of the root file; it always gets the whole-object spec.
    pub fn set_root_key(&mut self, key: HashKey) {
        self.root_key = Some(key);
    }

    // ── Lookups ─────────────────────────────────────────────────────────────

    /// Canonical encoded key for a content key.
    pub fn translate(&self, content_key: &HashKey) -> Option<HashKey> {
        self.ckeys.get(content_key).and_then(|e| e.encoded_keys.first().copied())
    }

    pub fn content(&self, content_key: &HashKey) -> Option<&EncodingEntry> {
        self.ckeys.get(content_key)
    }

    /// Espec string and encoded size of an encoded key.
    pub fn describe(&self, encoded_key: &HashKey) -> Option<(&str, u64)> {
        let layout = self.ekeys.get(encoded_key)?;
        let spec = self.especs.get(layout.espec_index as usize)?;
        Some((spec.as_str(), layout.size))
    }

    pub fn layout(&self, encoded_key: &HashKey) -> Option<&EncodingLayoutEntry> {
        self.ekeys.get(encoded_key)
    }

    pub fn contains_encoded(&self, encoded_key: &HashKey) -> bool {
        self.ekeys.contains_key(encoded_key)
    }

    pub fn especs(&self) -> &[String] {
        &self.especs
    }

    pub fn content_entries(&self) -> impl Iterator<Item = &EncodingEntry> {
        self.ckeys.values()
    }

    pub fn layout_entries(&self) -> impl Iterator<Item = &EncodingLayoutEntry> {
        self.ekeys.values()
    }

    pub fn len(&self) -> usize {
        self.ckeys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ckeys.is_empty()
    }

    // ── Mutation ────────────────────────────────────────────────────────────

    /// Record where a blob was stored. A content key owns one canonical
    /// encoded key; replacing it drops the previous encoded row.
    pub fn record(&mut self, blob: &StoredBlob) {
        let ckey = blob.content_key;
        let ekey = blob.encoded_key;

        match self.ckeys.get_mut(&ckey) {
            Some(existing) => {
                if let Some(first) = existing.encoded_keys.first_mut() {
                    if *first != ekey {
                        let old = std::mem::replace(first, ekey);
                        self.ekeys.remove(&old);
                    }
                } else {
                    existing.encoded_keys.push(ekey);
                }
                existing.decompressed_size = blob.decompressed_size;
            }
            None => {
                self.ckeys.insert(ckey, EncodingEntry {
                    content_key:       ckey,
                    decompressed_size: blob.decompressed_size,
                    encoded_keys:      vec![ekey],
                });
            }
        }

        let size = blob.compressed_size as u64;
        let spec = espec_for(size, self.root_key == Some(ckey));
        let espec_index = self.espec_index(&spec);
        self.ekeys.insert(ekey, EncodingLayoutEntry { encoded_key: ekey, espec_index, size });
    }

    /// Existing slot of `spec`, or a new slot at the end of the table.
    fn espec_index(&mut self, spec: &str) -> u32 {
        match self.especs.iter().position(|s| s == spec) {
            Some(i) => i as u32,
            None => {
                self.especs.push(spec.to_string());
                (self.especs.len() - 1) as u32
            }
        }
    }

    /// Drop a content key and every encoded row it owns.
    pub fn remove_content(&mut self, content_key: &HashKey) -> Option<EncodingEntry> {
        let entry = self.ckeys.remove(content_key)?;
        for ekey in &entry.encoded_keys {
            self.ekeys.remove(ekey);
        }
        Some(entry)
    }

    // ── Serialization ───────────────────────────────────────────────────────

    /// The decoded file as its seven sections.
    pub fn sections(&self) -> Result<Vec<Vec<u8>>> {
        let especs = self.espec_block();
        let (ckey_lookup, ckey_pages) = self.ckey_pages()?;
        let (ekey_lookup, ekey_pages) = self.ekey_pages()?;

        let mut header = Vec::with_capacity(HEADER_SIZE);
        header.extend_from_slice(&ENCODING_MAGIC);
        header.write_u8(VERSION)?;
        header.write_u8(KEY_SIZE as u8)?;
        header.write_u8(KEY_SIZE as u8)?;
        header.write_u16::<BigEndian>((self.page_size / 1024) as u16)?;
        header.write_u16::<BigEndian>((self.page_size / 1024) as u16)?;
        header.write_u32::<BigEndian>((ckey_lookup.len() / LOOKUP_SIZE) as u32)?;
        header.write_u32::<BigEndian>((ekey_lookup.len() / LOOKUP_SIZE) as u32)?;
        header.write_u8(0)?;
        header.write_u32::<BigEndian>(especs.len() as u32)?;

        let mut sections = vec![header, especs, ckey_lookup, ckey_pages, ekey_lookup, ekey_pages];
        let own = self.own_espec(&sections);
        sections.push(own.into_bytes());
        Ok(sections)
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(self.sections()?.concat())
    }

    fn espec_block(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for s in &self.especs {
            out.extend_from_slice(s.as_bytes());
            out.push(0);
        }
        out
    }

    /// Espec describing this file's own chunking, e.g.
    /// `b:{22=n,54=z,32=n,4096=n,32=n,4096=n,*=z}`.
    fn own_espec(&self, sections: &[Vec<u8>]) -> String {
        let letter = |i: usize| match self.block_map.get(i).or(self.block_map.last()).map(|s| s.encoding) {
            Some(EncodingType::None) => 'n',
            _ => 'z',
        };
        let mut parts: Vec<String> = sections.iter().enumerate()
            .map(|(i, s)| format!("{}={}", s.len(), letter(i)))
            .collect();
        parts.push(format!("*={}", letter(sections.len())));
        format!("b:{{{}}}", parts.join(","))
    }

    fn ckey_pages(&self) -> Result<(Vec<u8>, Vec<u8>)> {
        let mut pages = Paginator::new(self.page_size);
        for entry in self.ckeys.values() {
            let row_len = 6 + KEY_SIZE * (1 + entry.encoded_keys.len());
            if row_len > self.page_size || entry.encoded_keys.len() > u8::MAX as usize {
                return Err(Error::corrupt("encoding", format!("{} has too many encoded keys", entry.content_key)));
            }
            let row = pages.row(row_len, entry.content_key);
            row.write_u8(entry.encoded_keys.len() as u8)?;
            row.write_uint::<BigEndian>(entry.decompressed_size, 5)?;
            row.extend_from_slice(entry.content_key.as_bytes());
            for ekey in &entry.encoded_keys {
                row.extend_from_slice(ekey.as_bytes());
            }
        }
        Ok(pages.finish())
    }

    fn ekey_pages(&self) -> Result<(Vec<u8>, Vec<u8>)> {
        let mut pages = Paginator::new(self.page_size);
        for entry in self.ekeys.values() {
            let row = pages.row(EKEY_ROW_SIZE, entry.encoded_key);
            row.extend_from_slice(entry.encoded_key.as_bytes());
            row.write_u32::<BigEndian>(entry.espec_index)?;
            row.write_uint::<BigEndian>(entry.size, 5)?;
        }
        let sentinel = pages.row(KEY_SIZE + 4, HashKey::ZERO);
        sentinel.extend_from_slice(&[0u8; KEY_SIZE]);
        sentinel.write_u32::<BigEndian>(SENTINEL_INDEX)?;
        Ok(pages.finish())
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let corrupt = |detail: String| Error::corrupt("encoding", detail);
        let mut r = Cursor::new(bytes);

        let mut magic = [0u8; 2];
        r.read_exact(&mut magic)?;
        if magic != ENCODING_MAGIC {
            return Err(corrupt(format!("bad magic {magic:02x?}")));
        }
        let version = r.read_u8()?;
        let ckey_size = r.read_u8()? as usize;
        let ekey_size = r.read_u8()? as usize;
        if version != VERSION || ckey_size != KEY_SIZE || ekey_size != KEY_SIZE {
            return Err(corrupt(format!("unsupported version {version} key sizes {ckey_size}/{ekey_size}")));
        }
        let ckey_page_size = r.read_u16::<BigEndian>()? as usize * 1024;
        let ekey_page_size = r.read_u16::<BigEndian>()? as usize * 1024;
        let ckey_page_count = r.read_u32::<BigEndian>()? as usize;
        let ekey_page_count = r.read_u32::<BigEndian>()? as usize;
        let _flags = r.read_u8()?;
        let espec_size = r.read_u32::<BigEndian>()? as usize;

        let mut table = EncodingTable::new().with_page_size(ckey_page_size);

        let espec_block = take(&mut r, espec_size)?;
        let mut especs: Vec<String> = espec_block
            .split(|b| *b == 0)
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .collect();
        // piece after the closing NUL
        if especs.last().is_some_and(String::is_empty) {
            especs.pop();
        }
        table.especs = especs;

        let ckey_lookup = take(&mut r, ckey_page_count * LOOKUP_SIZE)?;
        for (i, lookup) in ckey_lookup.chunks_exact(LOOKUP_SIZE).enumerate() {
            let page = take(&mut r, ckey_page_size)?;
            check_page(page, lookup, "ckey", i)?;
            let mut p = Cursor::new(page);
            while p.position() as usize + 6 + KEY_SIZE <= ckey_page_size {
                let count = p.read_u8()? as usize;
                if count == 0 {
                    break;
                }
                let decompressed_size = p.read_uint::<BigEndian>(5)?;
                let content_key = read_key(&mut p)?;
                let mut encoded_keys = Vec::with_capacity(count);
                for _ in 0..count {
                    encoded_keys.push(read_key(&mut p).map_err(|_| corrupt(format!("ckey page {i} row overruns page")))?);
                }
                table.ckeys.insert(content_key, EncodingEntry { content_key, decompressed_size, encoded_keys });
            }
        }

        let ekey_lookup = take(&mut r, ekey_page_count * LOOKUP_SIZE)?;
        for (i, lookup) in ekey_lookup.chunks_exact(LOOKUP_SIZE).enumerate() {
            let page = take(&mut r, ekey_page_size)?;
            check_page(page, lookup, "ekey", i)?;
            let mut p = Cursor::new(page);
            while p.position() as usize + EKEY_ROW_SIZE <= ekey_page_size {
                let encoded_key = read_key(&mut p)?;
                if encoded_key.is_zero() {
                    break;
                }
                let espec_index = p.read_u32::<BigEndian>()?;
                let size = p.read_uint::<BigEndian>(5)?;
                table.ekeys.insert(encoded_key, EncodingLayoutEntry { encoded_key, espec_index, size });
            }
        }

        debug!(ckeys = table.ckeys.len(), ekeys = table.ekeys.len(), especs = table.especs.len(), "parsed encoding table");
        Ok(table)
    }
}

// ── Page packing ────────────────────────────────────────────────────────────

/// Packs variable-length rows into zero-padded pages and keeps the lookup
/// `(first key, md5(page))` alongside.
struct Paginator {
    page_size: usize,
    pages:     Vec<u8>,
    lookup:    Vec<u8>,
    current:   Vec<u8>,
    first_key: Option<HashKey>,
}

impl Paginator {
    fn new(page_size: usize) -> Self {
        Self { page_size, pages: Vec::new(), lookup: Vec::new(), current: Vec::with_capacity(page_size), first_key: None }
    }

    /// Buffer to write a row of `len` bytes into, starting a new page
    /// when the current one cannot hold it.
    fn row(&mut self, len: usize, key: HashKey) -> &mut Vec<u8> {
        if self.current.len() + len > self.page_size {
            self.close_page();
        }
        if self.first_key.is_none() {
            self.first_key = Some(key);
        }
        &mut self.current
    }

    fn close_page(&mut self) {
        self.current.resize(self.page_size, 0);
        self.lookup.extend_from_slice(self.first_key.take().unwrap_or_default().as_bytes());
        self.lookup.extend_from_slice(HashKey::of(&self.current).as_bytes());
        self.pages.append(&mut self.current);
    }

    fn finish(mut self) -> (Vec<u8>, Vec<u8>) {
        if !self.current.is_empty() || self.pages.is_empty() {
            self.close_page();
        }
        (self.lookup, self.pages)
    }
}

fn take<'a>(r: &mut Cursor<&'a [u8]>, len: usize) -> Result<&'a [u8]> {
    let start = r.position() as usize;
    let data: &'a [u8] = *r.get_ref();
    let slice = data.get(start..start + len)
        .ok_or_else(|| Error::corrupt("encoding", format!("section of {len} bytes at {start} runs past the end")))?;
    r.set_position((start + len) as u64);
    Ok(slice)
}

fn read_key(r: &mut impl Read) -> std::io::Result<HashKey> {
    let mut key = [0u8; KEY_SIZE];
    r.read_exact(&mut key)?;
    Ok(HashKey(key))
}

fn check_page(page: &[u8], lookup: &[u8], table: &str, index: usize) -> Result<()> {
    if HashKey::of(page).as_bytes()[..] != lookup[KEY_SIZE..] {
        return Err(Error::corrupt("encoding", format!("{table} page {index} checksum mismatch")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn espec_policy_boundaries() {
        assert_eq!(espec_for(500, false), "b:{500*=z}");
        assert_eq!(espec_for(1024, false), "b:{1024*=z}");
        assert_eq!(espec_for(2000, false), "b:{1K*=z}");
        assert_eq!(espec_for(300 * 1024, false), "b:{256K*=z}");
        assert_eq!(espec_for(300 * 1024, true), "z");
    }

    #[test]
    fn own_espec_lists_section_sizes() {
        let table = EncodingTable::new();
        let sections = table.sections().unwrap();
        let own = String::from_utf8(sections[6].clone()).unwrap();
        assert!(own.starts_with("b:{22=n,"));
        assert!(own.ends_with(",*=z}"));
    }

    #[test]
    fn empty_espec_keeps_later_indices() {
        let mut table = EncodingTable::new();
        table.especs = vec!["z".into(), String::new(), "b:{500*=z}".into()];
        let blob = StoredBlob {
            encoded_key:       HashKey::of(b"e"),
            content_key:       HashKey::of(b"c"),
            compressed_size:   500,
            decompressed_size: 900,
            archive:           None,
            offset:            None,
            out_path:          None,
            path:              None,
            high_priority:     false,
        };
        table.record(&blob);
        assert_eq!(table.layout(&blob.encoded_key).map(|l| l.espec_index), Some(2));

        let back = EncodingTable::parse(&table.sections().unwrap().concat()).unwrap();
        assert_eq!(back.especs(), table.especs());
        assert_eq!(back.describe(&blob.encoded_key), Some(("b:{500*=z}", 500)));
    }
}
