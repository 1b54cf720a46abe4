//! Download manifest (`DL`): the order a client fetches encoded blobs in.

use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use tracing::debug;

use super::tags::{read_u40, write_u40, Tag};
use crate::blte::ChunkSpec;
use crate::encoding::EncodingTable;
use crate::error::{Error, Result};
use crate::key::{HashKey, KEY_SIZE};
use crate::writer::StoredBlob;

pub const DOWNLOAD_MAGIC: [u8; 2] = *b"DL";

/// Tag whose mask new entries are left out of.
const ALTERNATE_TAG: &str = "Alternate";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadHeader {
    pub version:       u8,
    pub has_checksum:  bool,
    /// Version 2 and later.
    pub flag_count:    u8,
    /// Version 3 and later.
    pub base_priority: i8,
}

impl Default for DownloadHeader {
    fn default() -> Self {
        Self { version: 1, has_checksum: false, flag_count: 0, base_priority: 0 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadEntry {
    pub encoded_key: HashKey,
    /// Length of the framed container.
    pub size:        u64,
    /// Lower is fetched earlier.
    pub priority:    u8,
    pub checksum:    u32,
    pub flags:       Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct DownloadManifest {
    pub header: DownloadHeader,
    entries:    Vec<DownloadEntry>,
    tags:       Vec<Tag>,
    block_map:  Vec<ChunkSpec>,
}

impl Default for DownloadManifest {
    fn default() -> Self {
        Self::new()
    }
}

impl DownloadManifest {
    pub fn new() -> Self {
        Self {
            header:    DownloadHeader::default(),
            entries:   Vec::new(),
            tags:      Vec::new(),
            block_map: vec![ChunkSpec::stored(), ChunkSpec::zlib(9), ChunkSpec::zlib(9)],
        }
    }

    pub fn with_block_map(mut self, map: Vec<ChunkSpec>) -> Self {
        if !map.is_empty() {
            self.block_map = map;
        }
        self
    }

    pub fn block_map(&self) -> &[ChunkSpec] {
        &self.block_map
    }

    pub fn entries(&self) -> &[DownloadEntry] {
        &self.entries
    }

    pub fn tags(&self) -> &[Tag] {
        &self.tags
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn position(&self, encoded_key: &HashKey) -> Option<usize> {
        self.entries.iter().position(|e| e.encoded_key == *encoded_key)
    }

    pub fn add_tag(&mut self, name: impl Into<String>, tag_type: u16) {
        self.tags.push(Tag { name: name.into(), tag_type, mask: super::TagMask::new(self.entries.len()) });
    }

    /// Queue a newly stored blob for download.
    ///
    /// Blobs the encoding table already knew are skipped, as are keys the
    /// manifest already lists. High-priority blobs go to priority 0, the
    /// rest to 1; the entry lands after the last entry of equal or lower
    /// priority. Returns whether an entry was added.
    pub fn add(&mut self, blob: &StoredBlob, encoding: &EncodingTable) -> bool {
        if encoding.contains_encoded(&blob.encoded_key) || self.position(&blob.encoded_key).is_some() {
            return false;
        }

        let priority = if blob.high_priority { 0 } else { 1 };
        let at = self.entries.iter()
            .rposition(|e| e.priority <= priority)
            .map_or(0, |i| i + 1);

        self.entries.insert(at, DownloadEntry {
            encoded_key: blob.encoded_key,
            size:        blob.compressed_size as u64,
            priority,
            checksum:    0,
            flags:       vec![0; self.header.flag_count as usize],
        });
        for tag in &mut self.tags {
            tag.mask.insert(at, tag.name != ALTERNATE_TAG);
        }
        true
    }

    /// Drop the entry for `encoded_key` and its bit in every tag.
    pub fn remove(&mut self, encoded_key: &HashKey) -> Option<DownloadEntry> {
        let at = self.position(encoded_key)?;
        for tag in &mut self.tags {
            tag.mask.remove(at);
        }
        Some(self.entries.remove(at))
    }

    // ── Serialization ───────────────────────────────────────────────────────

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let corrupt = |detail: String| Error::corrupt("download manifest", detail);
        let mut r = Cursor::new(bytes);

        let mut magic = [0u8; 2];
        r.read_exact(&mut magic)?;
        if magic != DOWNLOAD_MAGIC {
            return Err(corrupt(format!("bad magic {magic:02x?}")));
        }
        let version = r.read_u8()?;
        let ekey_size = r.read_u8()? as usize;
        if ekey_size != KEY_SIZE {
            return Err(corrupt(format!("encoded key size {ekey_size}")));
        }
        let has_checksum = r.read_u8()? != 0;
        let entry_count = r.read_u32::<BigEndian>()? as usize;
        let tag_count = r.read_u16::<BigEndian>()? as usize;
        let mut header = DownloadHeader { version, has_checksum, ..Default::default() };
        if version >= 2 {
            header.flag_count = r.read_u8()?;
        }
        if version >= 3 {
            header.base_priority = r.read_i8()?;
            let mut reserved = [0u8; 3];
            r.read_exact(&mut reserved)?;
        }

        let row = KEY_SIZE + 6 + if has_checksum { 4 } else { 0 } + header.flag_count as usize;
        let remaining = bytes.len() - r.position() as usize;
        if entry_count.saturating_mul(row) > remaining {
            return Err(corrupt(format!("{entry_count} entries do not fit {remaining} bytes")));
        }

        let mut entries = Vec::with_capacity(entry_count);
        for _ in 0..entry_count {
            let mut key = [0u8; KEY_SIZE];
            r.read_exact(&mut key)?;
            let size = read_u40(&mut r)?;
            let priority = r.read_u8()?;
            let checksum = if has_checksum { r.read_u32::<BigEndian>()? } else { 0 };
            let mut flags = vec![0u8; header.flag_count as usize];
            r.read_exact(&mut flags)?;
            entries.push(DownloadEntry { encoded_key: HashKey(key), size, priority, checksum, flags });
        }

        let mut tags = Vec::with_capacity(tag_count);
        for _ in 0..tag_count {
            tags.push(Tag::read(&mut r, entry_count)?);
        }

        debug!(entries = entries.len(), tags = tags.len(), version, "parsed download manifest");
        Ok(Self { header, entries, tags, ..Self::new() })
    }

    /// Header, entries and tags, one section per chunk.
    pub fn sections(&self) -> Result<Vec<Vec<u8>>> {
        let h = &self.header;
        let mut header = Vec::with_capacity(16);
        header.extend_from_slice(&DOWNLOAD_MAGIC);
        header.write_u8(h.version)?;
        header.write_u8(KEY_SIZE as u8)?;
        header.write_u8(h.has_checksum as u8)?;
        header.write_u32::<BigEndian>(self.entries.len() as u32)?;
        header.write_u16::<BigEndian>(self.tags.len() as u16)?;
        if h.version >= 2 {
            header.write_u8(h.flag_count)?;
        }
        if h.version >= 3 {
            header.write_i8(h.base_priority)?;
            header.extend_from_slice(&[0u8; 3]);
        }

        let mut entries = Vec::new();
        for e in &self.entries {
            entries.extend_from_slice(e.encoded_key.as_bytes());
            write_u40(&mut entries, e.size)?;
            entries.write_u8(e.priority)?;
            if h.has_checksum {
                entries.write_u32::<BigEndian>(e.checksum)?;
            }
            let mut flags = e.flags.clone();
            flags.resize(h.flag_count as usize, 0);
            entries.extend_from_slice(&flags);
        }

        let mut tags = Vec::new();
        for tag in &self.tags {
            tag.write(&mut tags)?;
        }
        Ok(vec![header, entries, tags])
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(self.sections()?.concat())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(seed: &str, high: bool) -> StoredBlob {
        StoredBlob {
            encoded_key:       HashKey::of(seed.as_bytes()),
            content_key:       HashKey(HashKey::of(seed.as_bytes()).reversed()),
            compressed_size:   100,
            decompressed_size: 200,
            archive:           None,
            offset:            None,
            out_path:          None,
            path:              None,
            high_priority:     high,
        }
    }

    #[test]
    fn priority_order_and_alternate_tag() {
        let encoding = EncodingTable::new();
        let mut dl = DownloadManifest::new();
        dl.add_tag("Windows", 1);
        dl.add_tag("Alternate", 0x4000);

        assert!(dl.add(&blob("low", false), &encoding));
        assert!(dl.add(&blob("high", true), &encoding));
        assert!(!dl.add(&blob("high", true), &encoding));

        let order: Vec<u8> = dl.entries().iter().map(|e| e.priority).collect();
        assert_eq!(order, vec![0, 1]);
        assert_eq!(dl.tags()[0].mask.count_ones(), 2);
        assert_eq!(dl.tags()[1].mask.count_ones(), 0);

        let parsed = DownloadManifest::parse(&dl.serialize().unwrap()).unwrap();
        assert_eq!(parsed.entries(), dl.entries());
        assert_eq!(parsed.tags(), dl.tags());

        let removed = dl.remove(&HashKey::of(b"high")).unwrap();
        assert_eq!(removed.priority, 0);
        assert_eq!(dl.tags()[0].mask.len(), 1);
    }
}
