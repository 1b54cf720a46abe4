//! Archive writer: places framed BLTE containers on disk.
//!
//! Two destinations, selectable per call through [`WriteMode`]:
//!
//! * **Rotating archive** - `Data/data/data.NNN`. Each record is a 30-byte
//!   header (reversed encoded key, record size LE, 10 reserved bytes)
//!   followed by the BLTE bytes. When the newest archive cannot take the
//!   record it is closed and `data.NNN+1` is started.
//! * **Loose object** - a file named by the lowercase hex of the encoded
//!   key, flat or sharded `xx/yy/hex`, without the 30-byte header. These
//!   are what a CDN serves.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::blte::{frame, EncodedBlob, Framed};
use crate::error::{Error, Result};
use crate::key::{HashKey, TRUNCATED_KEY_SIZE};

/// Bytes in front of every record of a local archive data file.
pub const ARCHIVE_HEADER_SIZE: usize = 30;
/// Default size cap of one `data.NNN` file.
pub const ARCHIVE_CAPACITY:    u64   = 0x4000_0000;
/// Record offsets are stored in 30 bits, which bounds any capacity.
pub const MAX_ARCHIVE_OFFSET:  u64   = 1 << 30;

// ── Modes and layout ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    /// Append to the rotating local archive.
    Archive,
    /// Write a loose object for CDN-style distribution.
    Loose,
    Both,
}

impl WriteMode {
    #[inline]
    pub fn to_archive(self) -> bool {
        matches!(self, WriteMode::Archive | WriteMode::Both)
    }

    #[inline]
    pub fn to_loose(self) -> bool {
        matches!(self, WriteMode::Loose | WriteMode::Both)
    }
}

/// Directory layout of key-named files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CdnLayout {
    #[default]
    Flat,
    /// `xx/yy/<hex>` using the first four hex digits.
    Sharded,
}

impl CdnLayout {
    pub fn relative_path(self, name: &str) -> PathBuf {
        match self {
            CdnLayout::Flat => PathBuf::from(name),
            CdnLayout::Sharded if name.len() >= 4 => {
                PathBuf::from(&name[0..2]).join(&name[2..4]).join(name)
            }
            CdnLayout::Sharded => PathBuf::from(name),
        }
    }
}

// ── StoredBlob ───────────────────────────────────────────────────────────────

/// Where a stored container ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub encoded_key:       HashKey,
    pub content_key:       HashKey,
    /// Length of the framed BLTE container, without the archive header.
    pub compressed_size:   u32,
    pub decompressed_size: u64,
    pub archive:           Option<u32>,
    pub offset:            Option<u32>,
    pub out_path:          Option<PathBuf>,
    /// Virtual path for content files, `None` for system files.
    pub path:              Option<String>,
    pub high_priority:     bool,
}

impl StoredBlob {
    /// Record size as the local index stores it.
    pub fn archived_size(&self) -> u32 {
        self.compressed_size + ARCHIVE_HEADER_SIZE as u32
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn high_priority(mut self) -> Self {
        self.high_priority = true;
        self
    }
}

// ── Writer ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct ArchiveCursor {
    number: u32,
    len:    u64,
}

pub struct ArchiveWriter {
    data_dir:   PathBuf,
    output_dir: PathBuf,
    layout:     CdnLayout,
    capacity:   u64,
    // Appends to data.NNN are serialized; loose writes are not.
    cursor:     Mutex<Option<ArchiveCursor>>,
}

impl ArchiveWriter {
    pub fn new(data_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>, layout: CdnLayout) -> Self {
        Self {
            data_dir:   data_dir.into(),
            output_dir: output_dir.into(),
            layout,
            capacity:   ARCHIVE_CAPACITY,
            cursor:     Mutex::new(None),
        }
    }

    pub fn with_capacity(mut self, capacity: u64) -> Self {
        self.capacity = capacity.clamp(1, MAX_ARCHIVE_OFFSET);
        self
    }

    pub fn layout(&self) -> CdnLayout {
        self.layout
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn data_file_path(&self, number: u32) -> PathBuf {
        self.data_dir.join(format!("data.{number:03}"))
    }

    pub fn loose_path(&self, key: &HashKey) -> PathBuf {
        self.output_dir.join(self.layout.relative_path(&key.to_hex()))
    }

    /// Frame `blobs` and store the result.
    pub fn store_blobs(&self, mode: WriteMode, blobs: &[EncodedBlob], content_key: HashKey) -> Result<StoredBlob> {
        self.store(mode, &frame(blobs, content_key))
    }

    pub fn store(&self, mode: WriteMode, framed: &Framed) -> Result<StoredBlob> {
        let compressed_size = u32::try_from(framed.bytes.len())
            .map_err(|_| Error::corrupt("blob", format!("{} bytes do not fit a record", framed.bytes.len())))?;

        let mut result = StoredBlob {
            encoded_key:       framed.encoded_key,
            content_key:       framed.content_key,
            compressed_size,
            decompressed_size: framed.decoded_size,
            archive:           None,
            offset:            None,
            out_path:          None,
            path:              None,
            high_priority:     false,
        };

        if mode.to_archive() {
            let (number, offset) = self.append(framed)?;
            result.archive = Some(number);
            result.offset = Some(offset);
        }

        if mode.to_loose() {
            let path = self.loose_path(&framed.encoded_key);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, &framed.bytes)?;
            result.out_path = Some(path);
        }

        debug!(ekey = %result.encoded_key, ckey = %result.content_key, size = compressed_size, "stored blob");
        Ok(result)
    }

    fn append(&self, framed: &Framed) -> Result<(u32, u32)> {
        let needed = (ARCHIVE_HEADER_SIZE + framed.bytes.len()) as u64;
        if needed > self.capacity {
            return Err(Error::corrupt("blob", format!("{needed} bytes exceed archive capacity {}", self.capacity)));
        }

        let mut guard = self.cursor.lock().map_err(|_| Error::Config("archive cursor poisoned".into()))?;
        let mut cursor = match *guard {
            Some(c) => c,
            None => self.newest_archive()?,
        };
        if self.capacity.saturating_sub(cursor.len) <= needed {
            cursor = ArchiveCursor { number: cursor.number + 1, len: 0 };
            info!(archive = cursor.number, "archive full, rotating to {}", self.data_file_path(cursor.number).display());
        }

        fs::create_dir_all(&self.data_dir)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.data_file_path(cursor.number))?;
        let offset = file.seek(SeekFrom::End(0))?;

        let mut record = Vec::with_capacity(needed as usize);
        record.extend_from_slice(&framed.encoded_key.reversed());
        record.write_u32::<LittleEndian>(needed as u32)?;
        record.extend_from_slice(&[0u8; 10]);
        record.extend_from_slice(&framed.bytes);
        file.write_all(&record)?;
        file.flush()?;

        cursor.len = offset + needed;
        *guard = Some(cursor);
        Ok((cursor.number, offset as u32))
    }

    /// Highest-numbered `data.NNN` and its length, or an empty archive 0.
    fn newest_archive(&self) -> Result<ArchiveCursor> {
        let mut newest = ArchiveCursor { number: 0, len: 0 };
        let entries = match fs::read_dir(&self.data_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(newest),
            Err(e) => return Err(e.into()),
        };
        let mut found = false;
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let number = name.to_str()
                .and_then(|n| n.strip_prefix("data."))
                .and_then(|n| n.parse::<u32>().ok());
            if let Some(number) = number {
                if !found || number > newest.number {
                    newest = ArchiveCursor { number, len: entry.metadata()?.len() };
                    found = true;
                }
            }
        }
        Ok(newest)
    }

    // ── Read-back ───────────────────────────────────────────────────────────

    /// Read one archive record and return its BLTE bytes. `key` is the
    /// (possibly truncated) encoded key the record must carry.
    pub fn read_record(&self, archive: u32, offset: u32, size: u32, key: &[u8]) -> Result<Vec<u8>> {
        let path = self.data_file_path(archive);
        let mut file = File::open(&path)?;
        file.seek(SeekFrom::Start(offset as u64))?;

        let mut reversed = [0u8; 16];
        file.read_exact(&mut reversed)?;
        reversed.reverse();
        let check = key.len().min(TRUNCATED_KEY_SIZE);
        if reversed[..check] != key[..check] {
            return Err(Error::corrupt("archive record", format!(
                "{}@{offset}: key {} does not match {}", path.display(), hex::encode(&reversed[..check]), hex::encode(&key[..check]),
            )));
        }
        let stored_size = file.read_u32::<LittleEndian>()?;
        if stored_size != size {
            return Err(Error::corrupt("archive record", format!(
                "{}@{offset}: size {stored_size} does not match index size {size}", path.display(),
            )));
        }
        let mut reserved = [0u8; 10];
        file.read_exact(&mut reserved)?;

        let body = (size as usize).checked_sub(ARCHIVE_HEADER_SIZE)
            .ok_or_else(|| Error::corrupt("archive record", format!("size {size} below header size")))?;
        let mut bytes = vec![0u8; body];
        file.read_exact(&mut bytes)?;
        Ok(bytes)
    }

    /// Loose object bytes, if present under this writer's layout.
    pub fn read_loose(&self, key: &HashKey) -> Result<Option<Vec<u8>>> {
        match fs::read(self.loose_path(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn has_loose(&self, key: &HashKey) -> bool {
        self.loose_path(key).is_file()
    }
}
