//! Encode stage of a save: frame and store every staged file.
//!
//! Files are independent, so with the `parallel` feature they are encoded
//! on a dedicated Rayon pool sized to `max_in_flight`. The call returns only
//! once every file has been stored, which is the barrier the sequential
//! table updates wait on.

use std::borrow::Cow;
use std::fs;
use std::path::PathBuf;

use tracing::{debug, info};

use crate::blte::{self, ChunkSpec};
use crate::error::Result;
use crate::writer::{ArchiveWriter, StoredBlob, WriteMode};

/// Block size content files are split into.
pub const CONTENT_BLOCK_SIZE: usize = 256 * 1024;

/// Default chunking of content files: zlib 9 in 256 KiB blocks.
pub fn content_specs() -> Vec<ChunkSpec> {
    vec![ChunkSpec::zlib(9).with_size(CONTENT_BLOCK_SIZE)]
}

#[derive(Debug, Clone)]
pub enum Source {
    Bytes(Vec<u8>),
    /// Read when the file is encoded.
    Disk(PathBuf),
}

/// A file waiting for the next save.
#[derive(Debug, Clone)]
pub struct PendingFile {
    pub path:          String,
    pub source:        Source,
    pub specs:         Vec<ChunkSpec>,
    pub high_priority: bool,
}

impl PendingFile {
    pub fn from_bytes(path: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self { path: path.into(), source: Source::Bytes(bytes), specs: content_specs(), high_priority: false }
    }

    pub fn from_disk(path: impl Into<String>, file: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), source: Source::Disk(file.into()), specs: content_specs(), high_priority: false }
    }

    pub fn with_specs(mut self, specs: Vec<ChunkSpec>) -> Self {
        self.specs = specs;
        self
    }

    pub fn high_priority(mut self) -> Self {
        self.high_priority = true;
        self
    }

    fn load(&self) -> Result<Cow<'_, [u8]>> {
        Ok(match &self.source {
            Source::Bytes(b) => Cow::Borrowed(b.as_slice()),
            Source::Disk(p) => Cow::Owned(fs::read(p)?),
        })
    }
}

fn encode_one(writer: &ArchiveWriter, mode: WriteMode, file: &PendingFile) -> Result<StoredBlob> {
    let payload = file.load()?;
    let framed = blte::encode(&payload, &file.specs)?;
    let mut stored = writer.store(mode, &framed)?.with_path(file.path.clone());
    stored.high_priority = file.high_priority;
    debug!(ekey = %stored.encoded_key, ckey = %stored.content_key, "encoded {}", file.path);
    Ok(stored)
}

/// Encode and store `files`, at most `max_in_flight` at a time. Results
/// come back in input order; the first failure aborts the batch.
pub fn encode_all(
    writer:        &ArchiveWriter,
    mode:          WriteMode,
    files:         &[PendingFile],
    max_in_flight: usize,
) -> Result<Vec<StoredBlob>> {
    if files.is_empty() {
        return Ok(Vec::new());
    }
    info!(files = files.len(), max_in_flight, "encoding staged files");

    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(max_in_flight.max(1))
            .build()
            .map_err(|e| crate::error::Error::Config(format!("encode pool: {e}")))?;
        pool.install(|| {
            files.par_iter()
                .map(|f| encode_one(writer, mode, f))
                .collect()
        })
    }

    #[cfg(not(feature = "parallel"))]
    {
        let _ = max_in_flight;
        files.iter().map(|f| encode_one(writer, mode, f)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::CdnLayout;

    #[test]
    fn stores_every_file_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ArchiveWriter::new(dir.path().join("data"), dir.path().join("cdn"), CdnLayout::Flat);
        let files: Vec<PendingFile> = (0..8)
            .map(|i| PendingFile::from_bytes(format!("file{i}.txt"), vec![i as u8; 1000 * (i + 1)]))
            .collect();

        let stored = encode_all(&writer, WriteMode::Both, &files, 3).unwrap();
        assert_eq!(stored.len(), 8);
        for (file, blob) in files.iter().zip(&stored) {
            assert_eq!(blob.path.as_deref(), Some(file.path.as_str()));
            assert!(blob.archive.is_some());
            assert!(writer.has_loose(&blob.encoded_key));
        }
    }

    #[test]
    fn missing_source_fails_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ArchiveWriter::new(dir.path().join("data"), dir.path().join("cdn"), CdnLayout::Flat);
        let files = vec![PendingFile::from_disk("gone.txt", dir.path().join("gone.txt"))];
        assert!(encode_all(&writer, WriteMode::Loose, &files, 2).is_err());
    }
}
