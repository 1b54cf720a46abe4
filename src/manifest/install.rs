//! Install manifest (`IN`): files a launcher writes outside the container.

use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use tracing::{debug, info};

use super::tags::{read_cstring, Tag};
use crate::blte::ChunkSpec;
use crate::error::{Error, Result};
use crate::key::{HashKey, KEY_SIZE};
use crate::writer::StoredBlob;

pub const INSTALL_MAGIC: [u8; 2] = *b"IN";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallEntry {
    pub name:        String,
    pub content_key: HashKey,
    pub size:        u32,
}

#[derive(Debug, Clone)]
pub struct InstallManifest {
    pub version: u8,
    entries:     Vec<InstallEntry>,
    tags:        Vec<Tag>,
    block_map:   Vec<ChunkSpec>,
    dirty:       bool,
}

impl Default for InstallManifest {
    fn default() -> Self {
        Self::new()
    }
}

fn same_name(a: &str, b: &str) -> bool {
    a.len() == b.len()
        && a.bytes().zip(b.bytes()).all(|(x, y)| {
            let norm = |c: u8| if c == b'\\' { b'/' } else { c.to_ascii_lowercase() };
            norm(x) == norm(y)
        })
}

impl InstallManifest {
    pub fn new() -> Self {
        Self {
            version:   1,
            entries:   Vec::new(),
            tags:      Vec::new(),
            block_map: vec![ChunkSpec::zlib(9), ChunkSpec::stored()],
            dirty:     false,
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

    pub fn entries(&self) -> &[InstallEntry] {
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

    /// Case-insensitive, either separator.
    pub fn get(&self, name: &str) -> Option<&InstallEntry> {
        self.entries.iter().find(|e| same_name(&e.name, name))
    }

    /// True once an [`update`](Self::update) changed an entry.
    pub fn needs_write(&self) -> bool {
        self.dirty
    }

    /// Point the entry named like `path` at a newly stored blob. Returns
    /// whether anything changed; paths with no install entry are ignored.
    pub fn update(&mut self, path: &str, blob: &StoredBlob) -> bool {
        let size = blob.decompressed_size.min(u32::MAX as u64) as u32;
        let Some(entry) = self.entries.iter_mut().find(|e| same_name(&e.name, path)) else {
            return false;
        };
        if entry.content_key == blob.content_key && entry.size == size {
            return false;
        }
        info!(name = %entry.name, ckey = %blob.content_key, "install entry updated");
        entry.content_key = blob.content_key;
        entry.size = size;
        self.dirty = true;
        true
    }

    pub fn mark_written(&mut self) {
        self.dirty = false;
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let corrupt = |detail: String| Error::corrupt("install manifest", detail);
        let mut r = Cursor::new(bytes);

        let mut magic = [0u8; 2];
        r.read_exact(&mut magic)?;
        if magic != INSTALL_MAGIC {
            return Err(corrupt(format!("bad magic {magic:02x?}")));
        }
        let version = r.read_u8()?;
        let hash_size = r.read_u8()? as usize;
        if hash_size != KEY_SIZE {
            return Err(corrupt(format!("hash size {hash_size}")));
        }
        let tag_count = r.read_u16::<BigEndian>()? as usize;
        let entry_count = r.read_u32::<BigEndian>()? as usize;

        let mut tags = Vec::with_capacity(tag_count);
        for _ in 0..tag_count {
            tags.push(Tag::read(&mut r, entry_count)?);
        }

        let mut entries = Vec::with_capacity(entry_count.min(bytes.len()));
        for _ in 0..entry_count {
            let name = read_cstring(&mut r)?;
            let mut key = [0u8; KEY_SIZE];
            r.read_exact(&mut key)?;
            let size = r.read_u32::<BigEndian>()?;
            entries.push(InstallEntry { name, content_key: HashKey(key), size });
        }

        debug!(entries = entries.len(), tags = tags.len(), "parsed install manifest");
        Ok(Self { version, entries, tags, ..Self::new() })
    }

    /// Header with tags, then entries.
    pub fn sections(&self) -> Result<Vec<Vec<u8>>> {
        let mut header = Vec::new();
        header.extend_from_slice(&INSTALL_MAGIC);
        header.write_u8(self.version)?;
        header.write_u8(KEY_SIZE as u8)?;
        header.write_u16::<BigEndian>(self.tags.len() as u16)?;
        header.write_u32::<BigEndian>(self.entries.len() as u32)?;
        for tag in &self.tags {
            tag.write(&mut header)?;
        }

        let mut entries = Vec::new();
        for e in &self.entries {
            entries.extend_from_slice(e.name.as_bytes());
            entries.write_u8(0)?;
            entries.extend_from_slice(e.content_key.as_bytes());
            entries.write_u32::<BigEndian>(e.size)?;
        }
        Ok(vec![header, entries])
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(self.sections()?.concat())
    }

    /// Append an entry, mostly for building manifests from scratch.
    pub fn push(&mut self, name: impl Into<String>, content_key: HashKey, size: u32) {
        self.entries.push(InstallEntry { name: name.into(), content_key, size });
        for tag in &mut self.tags {
            tag.mask.insert(usize::MAX, true);
        }
        self.dirty = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_matches_either_separator() {
        let mut install = InstallManifest::new();
        install.push("World of Warcraft.app\\Contents\\Info.plist", HashKey::ZERO, 1);
        install.mark_written();

        let blob = StoredBlob {
            encoded_key:       HashKey::of(b"e"),
            content_key:       HashKey::of(b"plist"),
            compressed_size:   20,
            decompressed_size: 5,
            archive:           None,
            offset:            None,
            out_path:          None,
            path:              None,
            high_priority:     false,
        };
        assert!(!install.update("other.txt", &blob));
        assert!(!install.needs_write());
        assert!(install.update("world of warcraft.app/contents/info.plist", &blob));
        assert!(!install.update("world of warcraft.app/contents/info.plist", &blob));
        assert!(install.needs_write());

        let parsed = InstallManifest::parse(&install.serialize().unwrap()).unwrap();
        assert_eq!(parsed.entries(), install.entries());
        assert_eq!(parsed.entries()[0].size, 5);
    }
}
