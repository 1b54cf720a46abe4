//! The container: every table of one build, owned in one place.
//!
//! Tables never point at each other. Cross-table questions ("which encoded
//! key does this path end up at") are answered here by key lookups.
//!
//! A save runs in fixed order:
//!
//! 1. purge paths the identity cache gave up on
//! 2. encode staged files (parallel, then a barrier)
//! 3. rebuild the CDN archive from loose objects
//! 4. root, download, install, encoding
//! 5. local index flush
//! 6. configs and `.build.info`, last, so a failed save leaves the previous
//!    build as the effective one

use std::collections::BTreeMap;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use tracing::{debug, error, info, warn};

use crate::archive_index::{ArchiveIndex, ArchiveIndexEntry};
use crate::batch::{self, PendingFile};
use crate::blte::{self, BlteReader, ChunkSpec};
use crate::config::{build_info_columns, ContainerSettings, KeyValueConfig, TableConfig};
use crate::encoding::EncodingTable;
use crate::error::{Error, Result};
use crate::identity::{IdentityCache, IdentityRecord, ENCODING_RECORD, ROOT_RECORD};
use crate::jenkins::path_hash;
use crate::key::HashKey;
use crate::local_index::LocalIndex;
use crate::manifest::{DownloadManifest, InstallManifest};
use crate::remote::{CdnHosts, Fetcher};
use crate::root::{RootEntry, RootFilesystem};
use crate::writer::{ArchiveWriter, CdnLayout, StoredBlob};

const BUILD_INFO: &str = ".build.info";

/// What a save produced.
#[derive(Debug, Clone)]
pub struct SaveReport {
    pub build_config: HashKey,
    pub cdn_config:   HashKey,
    pub root:         HashKey,
    pub encoding:     HashKey,
    /// Content files written in this save.
    pub files:        usize,
    /// Paths removed by purge or pruning.
    pub removed:      usize,
    /// Name of the rebuilt CDN archive, if it still has entries.
    pub archive:      Option<HashKey>,
}

pub struct Container {
    settings:     ContainerSettings,
    fetcher:      Box<dyn Fetcher>,
    hosts:        CdnHosts,
    cache:        Box<dyn IdentityCache>,

    build_info:   TableConfig,
    build_config: KeyValueConfig,
    cdn_config:   KeyValueConfig,

    writer:       ArchiveWriter,
    local_index:  LocalIndex,
    cdn_index:    ArchiveIndex,
    cdn_archive:  Option<HashKey>,

    encoding:     EncodingTable,
    root:         RootFilesystem,
    download:     Option<DownloadManifest>,
    install:      Option<InstallManifest>,

    staged:       BTreeMap<String, PendingFile>,
}

impl Container {
    /// Open an existing build. `.build.info` is taken from the output
    /// directory when a previous save left one there, else from the base
    /// directory.
    pub fn open(
        settings: ContainerSettings,
        fetcher:  Box<dyn Fetcher>,
        cache:    Box<dyn IdentityCache>,
    ) -> Result<Self> {
        let info_path = [settings.output_dir.join(BUILD_INFO), settings.base_dir.join(BUILD_INFO)]
            .into_iter()
            .find(|p| p.is_file())
            .ok_or_else(|| Error::missing("build info", settings.base_dir.join(BUILD_INFO).display()))?;
        info!("opening build from {}", info_path.display());
        let build_info = TableConfig::load(&info_path)?;

        let hosts = Self::hosts_for(&settings, &build_info);
        let mut container = Self::assemble(settings, fetcher, cache, hosts, build_info)?;

        let build_key = container.info_key("Build Key")?;
        container.build_config = container.load_config("build config", &build_key)?;
        let cdn_key = container.info_key("CDN Key")?;
        container.cdn_config = container.load_config("CDN config", &cdn_key)?;

        container.open_encoding()?;
        container.open_root()?;
        container.download = container.open_manifest("download", DownloadManifest::parse, DownloadManifest::with_block_map)?;
        container.install = container.open_manifest("install", InstallManifest::parse, InstallManifest::with_block_map)?;
        container.open_cdn_index()?;

        info!(
            root = container.root.global().len(),
            encoding = container.encoding.len(),
            local = container.local_index.len(),
            "build opened"
        );
        Ok(container)
    }

    /// Start an empty build: no files, empty configs, a root with only the
    /// global chunk.
    pub fn create(
        settings: ContainerSettings,
        fetcher:  Box<dyn Fetcher>,
        cache:    Box<dyn IdentityCache>,
    ) -> Result<Self> {
        let mut build_info = TableConfig::new(build_info_columns());
        build_info.set("Branch", "us")?;
        build_info.set("Active", "1")?;
        build_info.set("CDN Path", settings.cdn_path.clone())?;
        build_info.set("CDN Hosts", settings.hosts.join(" "))?;
        build_info.set("Version", "0.0.0.1")?;

        let hosts = Self::hosts_for(&settings, &build_info);
        let mut container = Self::assemble(settings, fetcher, cache, hosts, build_info)?;
        container.build_config = KeyValueConfig::parse("# Build Configuration\n")?;
        container.cdn_config = KeyValueConfig::parse("# CDN Configuration\n")?;
        container.cdn_config.set_all("archives", Vec::new());
        container.download = Some(DownloadManifest::new());
        container.install = Some(InstallManifest::new());
        info!("created empty build");
        Ok(container)
    }

    fn hosts_for(settings: &ContainerSettings, build_info: &TableConfig) -> CdnHosts {
        let mut hosts = settings.hosts.clone();
        if hosts.is_empty() {
            if let Some(listed) = build_info.get("CDN Hosts") {
                hosts = listed.split_whitespace().map(str::to_string).collect();
            }
        }
        let path = build_info.get("CDN Path")
            .filter(|p| !p.is_empty())
            .unwrap_or(settings.cdn_path.as_str())
            .to_string();
        CdnHosts::new(hosts, path)
    }

    fn assemble(
        settings:   ContainerSettings,
        fetcher:    Box<dyn Fetcher>,
        cache:      Box<dyn IdentityCache>,
        hosts:      CdnHosts,
        build_info: TableConfig,
    ) -> Result<Self> {
        let data_dir = settings.data_dir();
        let local_index = if data_dir.is_dir() { LocalIndex::load(&data_dir)? } else { LocalIndex::new(&data_dir) };
        let writer = ArchiveWriter::new(&data_dir, &settings.output_dir, settings.cdn_layout)
            .with_capacity(settings.archive_capacity);

        Ok(Self {
            encoding: EncodingTable::new().with_page_size(settings.page_size),
            root: RootFilesystem::new(settings.locale, settings.minimum_file_id),
            cdn_index: ArchiveIndex::with_page_size(settings.page_size),
            fetcher,
            hosts,
            cache,
            build_info,
            build_config: KeyValueConfig::new(),
            cdn_config: KeyValueConfig::new(),
            writer,
            local_index,
            cdn_archive: None,
            download: None,
            install: None,
            staged: BTreeMap::new(),
            settings,
        })
    }

    // ── Loading ─────────────────────────────────────────────────────────────

    fn info_key(&self, column: &str) -> Result<String> {
        self.build_info.get(column)
            .filter(|k| k.len() >= 4)
            .map(str::to_string)
            .ok_or_else(|| Error::missing("build info column", column))
    }

    /// Local `Data/config` first, then the output directory, then the CDN.
    fn load_config(&self, what: &'static str, key: &str) -> Result<KeyValueConfig> {
        let relative = CdnLayout::Sharded.relative_path(key);
        let local = self.settings.local_config_dir().join(&relative);
        if local.is_file() {
            return KeyValueConfig::load(&local);
        }
        let output = self.config_dir().join(self.settings.cdn_layout.relative_path(key));
        if output.is_file() {
            return KeyValueConfig::load(&output);
        }
        if self.hosts.hosts.is_empty() {
            return Err(Error::missing(what, key));
        }
        self.hosts.download(self.fetcher.as_ref(), "config", key, &output)?;
        KeyValueConfig::load(&output)
    }

    fn config_dir(&self) -> PathBuf {
        self.settings.output_dir.join("config")
    }

    /// BLTE bytes of a stored object: local archive, loose object, CDN.
    fn read_encoded(&self, what: &'static str, ekey: &HashKey) -> Result<Vec<u8>> {
        if let Some(entry) = self.local_index.lookup(ekey) {
            debug!(%ekey, archive = entry.archive, offset = entry.offset, "reading {what} from local archive");
            return self.writer.read_record(entry.archive, entry.offset, entry.size, ekey.as_bytes());
        }
        if let Some(bytes) = self.writer.read_loose(ekey)? {
            return Ok(bytes);
        }
        if self.hosts.hosts.is_empty() {
            return Err(Error::missing(what, ekey));
        }
        let bytes = self.hosts.fetch(self.fetcher.as_ref(), "data", &ekey.to_hex())?;
        let dest = self.writer.loose_path(ekey);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&dest, &bytes)?;
        Ok(bytes)
    }

    /// Decode a system file, returning its bytes and per-chunk codecs.
    fn read_system(&self, what: &'static str, ekey: &HashKey) -> Result<(Vec<u8>, Vec<ChunkSpec>)> {
        let bytes = self.read_encoded(what, ekey)?;
        let mut reader = BlteReader::new(Cursor::new(bytes)).map_err(|e| {
            error!(%ekey, "{what} is not a valid BLTE container: {e}");
            e
        })?;
        let map = reader.encoding_map()?;
        Ok((reader.into_decoded(), map))
    }

    /// Encoded key of a system file named in the build config by content key.
    fn system_ekey(&self, what: &'static str) -> Result<Option<HashKey>> {
        let Some(ckey) = self.build_config.key(what, 0) else { return Ok(None) };
        self.build_config.key(what, 1)
            .filter(|e| !e.is_zero())
            .or_else(|| self.encoding.translate(&ckey))
            .map(Some)
            .ok_or_else(|| Error::missing(what, ckey))
    }

    fn open_encoding(&mut self) -> Result<()> {
        let ekey = self.build_config.key("encoding", 1)
            .ok_or_else(|| Error::missing("encoding", "build config key"))?;
        let (bytes, map) = self.read_system("encoding", &ekey)?;

        if let Some(expected) = self.build_config.value("encoding-size", 0).and_then(|s| s.parse::<u64>().ok()) {
            if bytes.len() as u64 != expected {
                error!(%ekey, expected, actual = bytes.len(), "encoding size mismatch");
                return Err(Error::corrupt("encoding", format!(
                    "decoded to {} bytes, build config says {expected}", bytes.len()
                )));
            }
        }
        self.encoding = EncodingTable::parse(&bytes)?.with_block_map(map);
        Ok(())
    }

    fn open_root(&mut self) -> Result<()> {
        let ekey = self.system_ekey("root")?.ok_or_else(|| Error::missing("root", "build config key"))?;
        let (bytes, map) = self.read_system("root", &ekey)?;
        let mut root = RootFilesystem::parse(&bytes, self.settings.locale, self.settings.minimum_file_id)?;
        if let Some(spec) = map.first() {
            root = root.with_block_spec(*spec);
        }
        if let Some(ckey) = self.build_config.key("root", 0) {
            self.encoding.set_root_key(ckey);
        }
        self.root = root;
        Ok(())
    }

    fn open_manifest<T>(
        &self,
        what:  &'static str,
        parse: fn(&[u8]) -> Result<T>,
        remap: fn(T, Vec<ChunkSpec>) -> T,
    ) -> Result<Option<T>> {
        let Some(ekey) = self.system_ekey(what)? else {
            debug!("build has no {what} manifest");
            return Ok(None);
        };
        let (bytes, map) = self.read_system(what, &ekey)?;
        let size_key = format!("{what}-size");
        if let Some(expected) = self.build_config.value(&size_key, 0).and_then(|s| s.parse::<u64>().ok()) {
            if bytes.len() as u64 != expected {
                return Err(Error::corrupt(what, format!(
                    "decoded to {} bytes, build config says {expected}", bytes.len()
                )));
            }
        }
        Ok(Some(remap(parse(&bytes)?, map)))
    }

    /// First archive listed in the CDN config whose index sits in the
    /// output directory.
    fn open_cdn_index(&mut self) -> Result<()> {
        let names: Vec<String> = self.cdn_config.get("archives").map(<[String]>::to_vec).unwrap_or_default();
        for name in names {
            let Some(key) = HashKey::from_hex(&name) else { continue };
            let path = self.index_path(&key);
            if path.is_file() {
                self.cdn_index = ArchiveIndex::parse(&fs::read(&path)?)?;
                self.cdn_archive = Some(key);
                debug!(entries = self.cdn_index.len(), "loaded CDN index {name}");
                break;
            }
        }
        Ok(())
    }

    fn index_path(&self, name: &HashKey) -> PathBuf {
        let mut path = self.writer.loose_path(name).into_os_string();
        path.push(".index");
        PathBuf::from(path)
    }

    // ── Accessors ───────────────────────────────────────────────────────────

    pub fn settings(&self) -> &ContainerSettings {
        &self.settings
    }

    pub fn root(&self) -> &RootFilesystem {
        &self.root
    }

    pub fn encoding(&self) -> &EncodingTable {
        &self.encoding
    }

    pub fn download(&self) -> Option<&DownloadManifest> {
        self.download.as_ref()
    }

    pub fn install(&self) -> Option<&InstallManifest> {
        self.install.as_ref()
    }

    pub fn install_mut(&mut self) -> Option<&mut InstallManifest> {
        self.install.as_mut()
    }

    pub fn local_index(&self) -> &LocalIndex {
        &self.local_index
    }

    pub fn cdn_index(&self) -> &ArchiveIndex {
        &self.cdn_index
    }

    pub fn build_config(&self) -> &KeyValueConfig {
        &self.build_config
    }

    pub fn cdn_config(&self) -> &KeyValueConfig {
        &self.cdn_config
    }

    pub fn build_info(&self) -> &TableConfig {
        &self.build_info
    }

    pub fn identity_cache(&self) -> &dyn IdentityCache {
        self.cache.as_ref()
    }

    pub fn staged(&self) -> impl Iterator<Item = &str> {
        self.staged.keys().map(String::as_str)
    }

    // ── File operations ─────────────────────────────────────────────────────

    /// Stage `bytes` under `path` for the next save.
    pub fn add_file(&mut self, path: &str, bytes: Vec<u8>) {
        self.stage(PendingFile::from_bytes(path, bytes));
    }

    /// Stage a file from disk; it is read when the save encodes it.
    pub fn add_file_from_disk(&mut self, path: &str, file: impl Into<PathBuf>) -> Result<()> {
        let file = file.into();
        if !file.is_file() {
            return Err(Error::missing("source file", file.display()));
        }
        self.stage(PendingFile::from_disk(path, file));
        Ok(())
    }

    pub fn stage(&mut self, file: PendingFile) {
        debug!("staged {}", file.path);
        self.staged.insert(file.path.clone(), file);
    }

    /// Rename in the root and carry the identity record over. Returns the
    /// number of entries renamed.
    pub fn rename_file(&mut self, old: &str, new: &str) -> usize {
        let renamed = self.root.rename(old, new);
        for entry in &renamed {
            let record = self.identity_of(new, entry);
            self.cache.record_or_update(record);
        }
        if !renamed.is_empty() {
            self.cache.remove(old);
            info!(count = renamed.len(), "renamed {old} to {new}");
        }
        renamed.len()
    }

    /// Remove `path` from every root chunk and from the download manifest,
    /// CDN index and encoding table when nothing else uses its content.
    pub fn remove_file(&mut self, path: &str) -> Vec<RootEntry> {
        self.staged.remove(path);
        let removed = self.root.remove(path);
        self.drop_entries(&removed);
        self.cache.remove(path);
        if !removed.is_empty() {
            info!(count = removed.len(), "removed {path}");
        }
        removed
    }

    /// Forget the content of removed entries once no root entry uses it.
    fn drop_entries(&mut self, entries: &[RootEntry]) {
        for entry in entries {
            if self.root.references(&entry.content_key) {
                continue;
            }
            if let Some(ekey) = self.encoding.translate(&entry.content_key) {
                if let Some(dl) = self.download.as_mut() {
                    dl.remove(&ekey);
                }
                self.cdn_index.remove(&ekey);
            }
            self.encoding.remove_content(&entry.content_key);
        }
    }

    fn identity_of(&self, path: &str, entry: &RootEntry) -> IdentityRecord {
        IdentityRecord {
            path:         path.to_string(),
            file_data_id: entry.file_data_id,
            name_hash:    path_hash(path),
            content_key:  entry.content_key,
            encoded_key:  self.encoding.translate(&entry.content_key).unwrap_or(HashKey::ZERO),
        }
    }

    /// Lazy reader over the stored content of `path`.
    pub fn open_file(&self, path: &str) -> Result<BlteReader<Cursor<Vec<u8>>>> {
        let ckey = self.root.resolve(path).ok_or_else(|| Error::missing("root entry", path))?;
        let ekey = self.encoding.translate(&ckey).ok_or_else(|| Error::missing("encoding entry", ckey))?;
        let bytes = self.read_encoded("content", &ekey)?;
        Ok(BlteReader::new(Cursor::new(bytes))?)
    }

    // ── Save ────────────────────────────────────────────────────────────────

    pub fn save(&mut self) -> Result<SaveReport> {
        let old_root = self.cache.get(ROOT_RECORD).map(|r| r.encoded_key);
        let old_encoding = self.cache.get(ENCODING_RECORD).map(|r| r.encoded_key);

        let mut removed = 0;
        for path in self.cache.purge_list() {
            removed += self.remove_file(&path).len();
        }
        let pruned = self.root.prune_unknown(self.cache.as_ref());
        removed += pruned.len();
        self.drop_entries(&pruned);

        info!("encoding staged files");
        let files: Vec<PendingFile> = std::mem::take(&mut self.staged).into_values().collect();
        let blobs = batch::encode_all(&self.writer, self.settings.write_mode, &files, self.settings.max_in_flight)?;
        drop(files);

        info!("rebuilding CDN archive");
        let (archive, stale_archive) = self.rebuild_cdn_archive(&blobs)?;

        info!("writing root");
        for blob in &blobs {
            if let Some(path) = &blob.path {
                let id = self.root.add(path, blob, self.cache.as_ref());
                self.cache.record_or_update(IdentityRecord {
                    path:         path.clone(),
                    file_data_id: id,
                    name_hash:    path_hash(path),
                    content_key:  blob.content_key,
                    encoded_key:  blob.encoded_key,
                });
            }
        }
        let root_bytes = self.root.serialize()?;
        let framed = blte::encode_sections(&[root_bytes], &[self.root.block_spec()])?;
        let root_blob = self.writer.store(self.settings.write_mode, &framed)?.high_priority();
        if let Some(old) = self.build_config.key("root", 0).filter(|k| *k != root_blob.content_key) {
            if let (Some(dl), Some(old_ekey)) = (self.download.as_mut(), self.encoding.translate(&old)) {
                dl.remove(&old_ekey);
            }
            self.encoding.remove_content(&old);
        }
        self.build_config.set_all("root", vec![root_blob.content_key.to_hex()]);
        self.encoding.set_root_key(root_blob.content_key);

        let mut system = vec![root_blob.clone()];

        if let Some(dl) = self.download.as_mut() {
            info!("writing download manifest");
            for blob in blobs.iter().chain(std::iter::once(&root_blob)) {
                dl.add(blob, &self.encoding);
            }
            let framed = blte::encode_sections(&dl.sections()?, dl.block_map())?;
            let stored = self.writer.store(self.settings.write_mode, &framed)?;
            set_system_keys(&mut self.build_config, &mut self.encoding, "download", &stored);
            system.push(stored);
        }

        if let Some(install) = self.install.as_mut() {
            for blob in &blobs {
                if let Some(path) = &blob.path {
                    install.update(path, blob);
                }
            }
            if install.needs_write() || !self.build_config.contains("install") {
                info!("writing install manifest");
                let framed = blte::encode_sections(&install.sections()?, install.block_map())?;
                let stored = self.writer.store(self.settings.write_mode, &framed)?;
                set_system_keys(&mut self.build_config, &mut self.encoding, "install", &stored);
                install.mark_written();
                system.push(stored);
            }
        }

        info!("writing encoding");
        for blob in blobs.iter().chain(&system) {
            self.encoding.record(blob);
        }
        let sections = self.encoding.sections()?;
        let expected: usize = sections.iter().map(Vec::len).sum();
        let framed = blte::encode_sections(&sections, self.encoding.block_map())?;
        let decoded = blte::decode(&framed.bytes)?;
        if decoded.len() != expected {
            return Err(Error::corrupt("encoding", format!(
                "framed file decodes to {} bytes, expected {expected}", decoded.len()
            )));
        }
        let encoding_blob = self.writer.store(self.settings.write_mode, &framed)?;
        set_system_keys(&mut self.build_config, &mut self.encoding, "encoding", &encoding_blob);
        system.push(encoding_blob.clone());

        if self.settings.write_mode.to_archive() {
            for blob in blobs.iter().chain(&system) {
                self.local_index.record_new_blob(blob);
            }
            let written = self.local_index.flush()?;
            debug!(files = written.len(), "local index flushed");
        }

        info!("writing configs");
        let (build_key, cdn_key) = self.write_configs()?;

        self.cache.record_or_update(IdentityRecord::system(ROOT_RECORD, root_blob.content_key, root_blob.encoded_key));
        self.cache.record_or_update(IdentityRecord::system(
            ENCODING_RECORD, encoding_blob.content_key, encoding_blob.encoded_key,
        ));
        self.cache.save()?;

        if let Some(stale) = stale_archive {
            self.remove_archive_files(&stale);
        }
        for (old, new) in [(old_root, root_blob.encoded_key), (old_encoding, encoding_blob.encoded_key)] {
            if let Some(old) = old.filter(|o| *o != new && !o.is_zero()) {
                let path = self.writer.loose_path(&old);
                if path.is_file() {
                    if let Err(e) = fs::remove_file(&path) {
                        warn!("could not remove old system file {}: {e}", path.display());
                    }
                }
            }
        }

        let report = SaveReport {
            build_config: build_key,
            cdn_config:   cdn_key,
            root:         root_blob.content_key,
            encoding:     encoding_blob.encoded_key,
            files:        blobs.len(),
            removed,
            archive,
        };
        info!(build = %report.build_config, cdn = %report.cdn_config, files = report.files, "save complete");
        Ok(report)
    }

    /// Rebuild the CDN archive from the loose objects that still exist plus
    /// the ones just written. Returns the archive's new name and the name of
    /// the archive it replaces; the replaced files stay on disk until the
    /// configs pointing away from them are written.
    fn rebuild_cdn_archive(&mut self, blobs: &[StoredBlob]) -> Result<(Option<HashKey>, Option<HashKey>)> {
        let writer = &self.writer;
        self.cdn_index.retain(|e| writer.has_loose(&e.key));
        for blob in blobs.iter().filter(|b| b.out_path.is_some()) {
            self.cdn_index.insert(ArchiveIndexEntry {
                key:    blob.encoded_key,
                size:   blob.compressed_size,
                offset: 0,
            });
        }

        let old = self.cdn_archive.take();
        if self.cdn_index.is_empty() {
            if let Some(old) = old {
                self.set_archives(Some(&old), None);
                info!("CDN archive {old} is empty, dropping it");
            }
            return Ok((None, old));
        }

        self.cdn_index.pack_offsets();
        let index = self.cdn_index.build()?;
        let data_path = self.writer.loose_path(&index.name);
        if let Some(parent) = data_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut data = Vec::new();
        for entry in self.cdn_index.entries() {
            let bytes = self.writer.read_loose(&entry.key)?
                .ok_or_else(|| Error::missing("loose object", entry.key))?;
            data.extend_from_slice(&bytes);
        }
        fs::write(&data_path, data)?;
        fs::write(self.index_path(&index.name), &index.bytes)?;

        self.set_archives(old.as_ref(), Some(&index.name));
        self.cdn_archive = Some(index.name);
        info!(entries = self.cdn_index.len(), "CDN archive {}", index.name);
        Ok((Some(index.name), old.filter(|o| *o != index.name)))
    }

    fn remove_archive_files(&self, name: &HashKey) {
        for path in [self.writer.loose_path(name), self.index_path(name)] {
            if path.is_file() {
                if let Err(e) = fs::remove_file(&path) {
                    warn!("could not remove {}: {e}", path.display());
                }
            }
        }
    }

    /// Swap `old` for `new` in the CDN config's archive list.
    fn set_archives(&mut self, old: Option<&HashKey>, new: Option<&HashKey>) {
        let mut archives: Vec<String> = self.cdn_config.get("archives").map(<[String]>::to_vec).unwrap_or_default();
        if let Some(old) = old {
            let old = old.to_hex();
            archives.retain(|a| *a != old);
        }
        if let Some(new) = new {
            let new = new.to_hex();
            if !archives.contains(&new) {
                archives.insert(0, new);
            }
        }
        self.cdn_config.set_all("archives", archives);
    }

    fn write_configs(&mut self) -> Result<(HashKey, HashKey)> {
        for key in ["archive-group", "patch-archives", "patch-archive-group"] {
            self.cdn_config.remove(key);
        }
        self.build_config.set("patch", 0, "");
        self.build_config.set("patch-size", 0, "0");
        self.build_config.set("patch-config", 0, "");

        let dir = self.config_dir();
        let (build_key, _) = self.build_config.write_to(&dir, self.settings.cdn_layout)?;
        let (cdn_key, _) = self.cdn_config.write_to(&dir, self.settings.cdn_layout)?;

        self.build_info.set("Build Key", build_key.to_hex())?;
        self.build_info.set("CDN Key", cdn_key.to_hex())?;
        if !self.hosts.hosts.is_empty() && self.build_info.set("CDN Hosts", self.hosts.hosts.join(" ")).is_err() {
            debug!("build info has no CDN Hosts column");
        }
        self.build_info.write(&self.settings.output_dir.join(BUILD_INFO))?;

        info!(build = %build_key, cdn = %cdn_key, "configs written");
        Ok((build_key, cdn_key))
    }

    /// Persist the identity cache and drop the container.
    pub fn close(mut self) -> Result<()> {
        if !self.staged.is_empty() {
            warn!(files = self.staged.len(), "closing with unsaved staged files");
        }
        self.cache.save()?;
        debug!("container closed");
        Ok(())
    }

    /// Output path a loose object with `key` lives at.
    pub fn loose_path(&self, key: &HashKey) -> PathBuf {
        self.writer.loose_path(key)
    }

    pub fn output_dir(&self) -> &Path {
        &self.settings.output_dir
    }
}

/// `name = ckey ekey`, `name-size = decoded encoded`. The content the key
/// pointed at before leaves the encoding table.
fn set_system_keys(config: &mut KeyValueConfig, encoding: &mut EncodingTable, name: &str, blob: &StoredBlob) {
    if let Some(old) = config.key(name, 0).filter(|k| *k != blob.content_key) {
        encoding.remove_content(&old);
    }
    config.set_all(name, vec![blob.content_key.to_hex(), blob.encoded_key.to_hex()]);
    config.set_all(&format!("{name}-size"), vec![
        blob.decompressed_size.to_string(),
        blob.compressed_size.to_string(),
    ]);
}
