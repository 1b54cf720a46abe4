//! Root table: the virtual path filesystem over content keys.
//!
//! The file is a run of chunks:
//!
//! ```text
//! count u32 LE | content_flags u32 LE | locale_flags u32 LE
//! count x file_data_id_delta u32 LE
//! count x (content_key[16] | name_hash u64 LE)
//! ```
//! Ids are delta coded: `id[0] = delta[0]`, `id[i] = id[i-1] + 1 + delta[i]`.
//!
//! Paths are not stored, only their [`path_hash`]. Two paths with the same
//! hash share one slot; the table cannot tell them apart.
//!
//! Exactly one chunk, locale `All_WoW` with no content flags, is the
//! *global* chunk. New files only ever go there.

mod flags;

pub use flags::{ContentFlags, LocaleFlags};

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::{debug, warn};

use crate::blte::ChunkSpec;
use crate::error::{Error, Result};
use crate::identity::IdentityCache;
use crate::jenkins::path_hash;
use crate::key::{HashKey, KEY_SIZE};
use crate::writer::StoredBlob;

const CHUNK_HEADER_SIZE: usize = 12;
const RECORD_SIZE:       usize = KEY_SIZE + 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootEntry {
    pub content_key:         HashKey,
    pub file_data_id:        u32,
    /// Delta from the previous entry of the chunk; rederived on serialize.
    pub file_data_id_offset: u32,
    pub name_hash:           u64,
    /// Known only for files this engine added or the identity cache knows.
    pub path:                Option<String>,
}

/// One locale/content partition. Entries are keyed by id, so iteration is
/// always in id order.
#[derive(Debug, Clone, Default)]
pub struct RootChunk {
    pub content_flags: ContentFlags,
    pub locale_flags:  LocaleFlags,
    entries:           BTreeMap<u32, RootEntry>,
    by_name:           HashMap<u64, BTreeSet<u32>>,
}

impl RootChunk {
    pub fn new(content_flags: ContentFlags, locale_flags: LocaleFlags) -> Self {
        Self { content_flags, locale_flags, ..Default::default() }
    }

    pub fn is_global(&self) -> bool {
        self.locale_flags == LocaleFlags::ALL_WOW && self.content_flags == ContentFlags::NONE
    }

    pub fn entries(&self) -> impl Iterator<Item = &RootEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: u32) -> Option<&RootEntry> {
        self.entries.get(&id)
    }

    pub fn contains_id(&self, id: u32) -> bool {
        self.entries.contains_key(&id)
    }

    /// Ids carrying `hash`, highest last.
    fn ids_named(&self, hash: u64) -> Vec<u32> {
        self.by_name.get(&hash).map(|ids| ids.iter().copied().collect()).unwrap_or_default()
    }

    fn insert(&mut self, entry: RootEntry) {
        if let Some(old) = self.entries.remove(&entry.file_data_id) {
            self.unlink_name(old.name_hash, old.file_data_id);
        }
        self.by_name.entry(entry.name_hash).or_default().insert(entry.file_data_id);
        self.entries.insert(entry.file_data_id, entry);
    }

    fn remove(&mut self, id: u32) -> Option<RootEntry> {
        let entry = self.entries.remove(&id)?;
        self.unlink_name(entry.name_hash, id);
        Some(entry)
    }

    fn unlink_name(&mut self, hash: u64, id: u32) {
        if let Some(ids) = self.by_name.get_mut(&hash) {
            ids.remove(&id);
            if ids.is_empty() {
                self.by_name.remove(&hash);
            }
        }
    }

    fn fix_offsets(&mut self) {
        let mut next = 0u32;
        for entry in self.entries.values_mut() {
            entry.file_data_id_offset = entry.file_data_id - next;
            next = entry.file_data_id.wrapping_add(1);
        }
    }
}

#[derive(Debug, Clone)]
pub struct RootFilesystem {
    chunks:     Vec<RootChunk>,
    global:     usize,
    locale:     LocaleFlags,
    max_id:     u32,
    minimum_id: u32,
    block_spec: ChunkSpec,
}

impl RootFilesystem {
    /// Empty table holding only a global chunk.
    pub fn new(locale: LocaleFlags, minimum_id: u32) -> Self {
        Self {
            chunks:     vec![RootChunk::new(ContentFlags::NONE, LocaleFlags::ALL_WOW)],
            global:     0,
            locale,
            max_id:     0,
            minimum_id,
            block_spec: ChunkSpec::default(),
        }
    }

    pub fn parse(bytes: &[u8], locale: LocaleFlags, minimum_id: u32) -> Result<Self> {
        let corrupt = |detail: String| Error::corrupt("root", detail);
        let mut r = Cursor::new(bytes);
        let mut chunks = Vec::new();
        let mut global = None;
        let mut max_id = 0u32;

        while (r.position() as usize) < bytes.len() {
            let at = r.position() as usize;
            if bytes.len() - at < CHUNK_HEADER_SIZE {
                return Err(corrupt(format!("{} trailing bytes at {at}", bytes.len() - at)));
            }
            let count = r.read_u32::<LittleEndian>()? as usize;
            let content_flags = ContentFlags(r.read_u32::<LittleEndian>()?);
            let locale_flags = LocaleFlags(r.read_u32::<LittleEndian>()?);
            let need = count.checked_mul(4 + RECORD_SIZE)
                .ok_or_else(|| corrupt(format!("chunk at {at} claims {count} entries")))?;
            if bytes.len() - at - CHUNK_HEADER_SIZE < need {
                return Err(corrupt(format!("chunk at {at} claims {count} entries, data ends early")));
            }

            let mut ids = Vec::with_capacity(count);
            let mut next = 0u32;
            for _ in 0..count {
                let delta = r.read_u32::<LittleEndian>()?;
                let id = next.wrapping_add(delta);
                ids.push((id, delta));
                next = id.wrapping_add(1);
            }

            let mut chunk = RootChunk::new(content_flags, locale_flags);
            for (file_data_id, file_data_id_offset) in ids {
                let mut key = [0u8; KEY_SIZE];
                r.read_exact(&mut key)?;
                let name_hash = r.read_u64::<LittleEndian>()?;
                if chunk.contains_id(file_data_id) {
                    return Err(corrupt(format!("id {file_data_id} repeats in chunk {}", chunks.len())));
                }
                max_id = max_id.max(file_data_id);
                chunk.insert(RootEntry {
                    content_key: HashKey(key),
                    file_data_id,
                    file_data_id_offset,
                    name_hash,
                    path: None,
                });
            }

            if global.is_none() && chunk.is_global() {
                global = Some(chunks.len());
            }
            chunks.push(chunk);
        }

        let global = global.ok_or_else(|| corrupt("no global chunk".into()))?;
        debug!(chunks = chunks.len(), max_id, "parsed root");
        Ok(Self { chunks, global, locale, max_id, minimum_id, block_spec: ChunkSpec::default() })
    }

    /// Codec used when the root is written back.
    pub fn with_block_spec(mut self, spec: ChunkSpec) -> Self {
        self.block_spec = spec.without_size();
        self
    }

    pub fn block_spec(&self) -> ChunkSpec {
        self.block_spec
    }

    pub fn locale(&self) -> LocaleFlags {
        self.locale
    }

    pub fn minimum_id(&self) -> u32 {
        self.minimum_id
    }

    pub fn max_id(&self) -> u32 {
        self.max_id
    }

    pub fn chunks(&self) -> &[RootChunk] {
        &self.chunks
    }

    pub fn global(&self) -> &RootChunk {
        &self.chunks[self.global]
    }

    fn matches_locale(&self, index: usize) -> bool {
        index == self.global || self.chunks[index].locale_flags.contains(self.locale)
    }

    // ── Lookups ─────────────────────────────────────────────────────────────

    /// Content key of `path`: the global chunk first, then the chunks of
    /// the active locale. Within a chunk the highest id wins.
    pub fn resolve(&self, path: &str) -> Option<HashKey> {
        self.entry_named(path).map(|e| e.content_key)
    }

    pub fn entry_named(&self, path: &str) -> Option<&RootEntry> {
        let hash = path_hash(path);
        self.search_order()
            .find_map(|i| {
                let chunk = &self.chunks[i];
                chunk.ids_named(hash).last().and_then(|id| chunk.get(*id))
            })
    }

    pub fn resolve_id(&self, id: u32) -> Option<&RootEntry> {
        self.search_order().find_map(|i| self.chunks[i].get(id))
    }

    fn search_order(&self) -> impl Iterator<Item = usize> + '_ {
        std::iter::once(self.global)
            .chain((0..self.chunks.len()).filter(move |i| *i != self.global && self.matches_locale(*i)))
    }

    /// True when any chunk still points at `content_key`.
    pub fn references(&self, content_key: &HashKey) -> bool {
        self.chunks.iter().any(|c| c.entries().any(|e| e.content_key == *content_key))
    }

    // ── Mutation ────────────────────────────────────────────────────────────

    /// Point `path` at a stored blob and return its id.
    ///
    /// An existing entry with the same name hash in the global or an
    /// active-locale chunk keeps its id and only changes content. Otherwise
    /// a new global entry is made, reusing the id the identity cache holds
    /// for `path` when that id is still free.
    pub fn add(&mut self, path: &str, blob: &StoredBlob, cache: &dyn IdentityCache) -> u32 {
        let hash = path_hash(path);
        let mut found = None;

        for i in 0..self.chunks.len() {
            if !self.matches_locale(i) {
                continue;
            }
            let chunk = &mut self.chunks[i];
            for id in chunk.ids_named(hash) {
                if let Some(entry) = chunk.entries.get_mut(&id) {
                    entry.content_key = blob.content_key;
                    entry.path = Some(path.to_string());
                    found = Some(found.map_or(id, |f: u32| f.max(id)));
                }
            }
        }
        if let Some(id) = found {
            self.max_id = self.max_id.max(id);
            return id;
        }

        let id = match cache.lookup(path) {
            Some(id) if !self.global().contains_id(id) => id,
            Some(id) => {
                warn!(id, "cached id for {path} is taken, assigning a new one");
                self.next_id(cache)
            }
            None => self.next_id(cache),
        };
        self.chunks[self.global].insert(RootEntry {
            content_key:         blob.content_key,
            file_data_id:        id,
            file_data_id_offset: 0,
            name_hash:           hash,
            path:                Some(path.to_string()),
        });
        self.max_id = self.max_id.max(id);
        id
    }

    fn next_id(&self, cache: &dyn IdentityCache) -> u32 {
        let highest = self.max_id.max(cache.max_id());
        highest.saturating_add(1).max(self.minimum_id)
    }

    /// Rename `old` to `new` in the global and active-locale chunks.
    /// Returns the renamed entries.
    pub fn rename(&mut self, old: &str, new: &str) -> Vec<RootEntry> {
        let old_hash = path_hash(old);
        let new_hash = path_hash(new);
        let mut renamed = Vec::new();
        if old_hash == new_hash {
            return renamed;
        }

        for i in 0..self.chunks.len() {
            if !self.matches_locale(i) {
                continue;
            }
            let chunk = &mut self.chunks[i];
            for id in chunk.ids_named(old_hash) {
                if let Some(mut entry) = chunk.remove(id) {
                    entry.name_hash = new_hash;
                    entry.path = Some(new.to_string());
                    renamed.push(entry.clone());
                    chunk.insert(entry);
                }
            }
        }
        renamed
    }

    /// Remove `path` from every chunk. Returns the removed entries.
    pub fn remove(&mut self, path: &str) -> Vec<RootEntry> {
        let hash = path_hash(path);
        let mut removed = Vec::new();
        for chunk in &mut self.chunks {
            for id in chunk.ids_named(hash) {
                removed.extend(chunk.remove(id));
            }
        }
        removed
    }

    /// Drop global entries at or above the minimum id that the identity
    /// cache no longer knows about. Does nothing without a minimum id, since
    /// every stock entry would qualify.
    pub fn prune_unknown(&mut self, cache: &dyn IdentityCache) -> Vec<RootEntry> {
        if self.minimum_id == 0 {
            return Vec::new();
        }
        let global = &mut self.chunks[self.global];
        let stale: Vec<u32> = global.entries.range(self.minimum_id..)
            .map(|(id, _)| *id)
            .filter(|id| !cache.has_id(*id))
            .collect();
        stale.into_iter().filter_map(|id| global.remove(id)).collect()
    }

    // ── Serialization ───────────────────────────────────────────────────────

    /// Re-derive every delta from the sorted ids.
    pub fn fix_offsets(&mut self) {
        for chunk in &mut self.chunks {
            chunk.fix_offsets();
        }
    }

    pub fn serialize(&mut self) -> Result<Vec<u8>> {
        self.fix_offsets();
        let total: usize = self.chunks.iter().map(|c| CHUNK_HEADER_SIZE + c.len() * (4 + RECORD_SIZE)).sum();
        let mut out = Vec::with_capacity(total);
        for chunk in &self.chunks {
            out.write_u32::<LittleEndian>(chunk.len() as u32)?;
            out.write_u32::<LittleEndian>(chunk.content_flags.0)?;
            out.write_u32::<LittleEndian>(chunk.locale_flags.0)?;
            for entry in chunk.entries() {
                out.write_u32::<LittleEndian>(entry.file_data_id_offset)?;
            }
            for entry in chunk.entries() {
                out.extend_from_slice(entry.content_key.as_bytes());
                out.write_u64::<LittleEndian>(entry.name_hash)?;
            }
        }
        Ok(out)
    }
}
