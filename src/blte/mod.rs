//! BLTE block container: framing, eager encode, lazy decode.
//!
//! # Layout
//! ```text
//! "BLTE" | header_size u32 BE
//!        | header_size == 0 -> one implicit chunk fills the rest
//!        | otherwise: flags u8 (0x0F) | chunk_count u24 BE
//!        |   chunk_count x (compressed u32 BE, decompressed u32 BE, md5[16])
//! chunk bytes, each: tag u8 ('N' | 'Z') | payload
//! ```
//! `header_size` counts from the magic, so a framed header is always
//! `24 * chunk_count + 12` bytes. A single chunk is written headerless.
//!
//! # Encoded key
//! The encoded key of a framed container is the md5 of its header region
//! when a header is present and the md5 of the whole output otherwise. For
//! one chunk both are the same bytes; for many chunks this is what a stock
//! client recomputes when it validates an archive record.
//!
//! # Decoding
//! [`BlteReader`] inflates lazily: a chunk is only decoded once a read or
//! a forward seek reaches it. Decoded bytes stay buffered, so seeking
//! backwards never re-inflates anything.

use std::io::{self, Cursor, Read, Seek, SeekFrom};

use byteorder::{BigEndian, ReadBytesExt};
use thiserror::Error;

use crate::codec::{detect_level, get_codec, CodecError, EncodingType, DEFAULT_LEVEL};
use crate::key::HashKey;

pub const BLTE_MAGIC:      [u8; 4] = *b"BLTE";
/// Required value of the flags byte of a framed header.
pub const FRAME_FLAGS:     u8      = 0x0F;
/// Magic plus header size.
pub const MIN_HEADER_SIZE: usize   = 8;
/// Per-chunk entry in a framed header.
pub const CHUNK_INFO_SIZE: usize   = 24;

/// Size of a framed header describing `chunks` chunks.
#[inline]
pub fn header_size_for(chunks: usize) -> usize {
    CHUNK_INFO_SIZE * chunks + 12
}

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum BlteError {
    #[error("BLTE too short: {0} bytes")]
    TooShort(u64),
    #[error("Bad BLTE magic {0:02x?}")]
    BadMagic([u8; 4]),
    #[error("Bad BLTE flags byte 0x{0:02x}")]
    BadFlags(u8),
    #[error("BLTE header declares no chunks")]
    NoChunks,
    #[error("BLTE header size {declared} does not match {chunks} chunks (expected {expected})")]
    HeaderSizeMismatch { declared: u32, chunks: u32, expected: usize },
    #[error("BLTE chunk table runs past the end of the data")]
    Truncated,
    #[error("Unknown chunk encoding tag 0x{0:02x}")]
    UnknownEncoding(u8),
    #[error("Checksum mismatch in chunk {chunk}")]
    ChecksumMismatch { chunk: usize },
    #[error("Chunk {chunk} inflated to {actual} bytes, header says {expected}")]
    SizeMismatch { chunk: usize, expected: u32, actual: usize },
    #[error("Chunk too large: {0} bytes")]
    ChunkTooLarge(usize),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl BlteError {
    /// Every variant except plain I/O describes damaged or foreign input.
    pub fn is_corruption(&self) -> bool {
        !matches!(self, BlteError::Io(_))
    }
}

// ── Chunk specs ──────────────────────────────────────────────────────────────

/// How one chunk is encoded, and optionally how many payload bytes it takes.
///
/// A spec without a size takes whatever is left. When a payload outlives
/// its spec list the last spec repeats, which is the `*` of an espec string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpec {
    pub encoding: EncodingType,
    pub level:    i32,
    pub size:     Option<usize>,
}

impl ChunkSpec {
    pub fn stored() -> Self {
        Self { encoding: EncodingType::None, level: 0, size: None }
    }

    pub fn zlib(level: i32) -> Self {
        Self { encoding: EncodingType::ZLib, level, size: None }
    }

    pub fn with_size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }

    /// Same encoding and level with the size cleared.
    pub fn without_size(self) -> Self {
        Self { size: None, ..self }
    }
}

impl Default for ChunkSpec {
    fn default() -> Self {
        ChunkSpec::zlib(DEFAULT_LEVEL)
    }
}

// ── EncodedBlob ──────────────────────────────────────────────────────────────

/// One compressed chunk, ready to be framed. Immutable once built.
#[derive(Debug, Clone)]
pub struct EncodedBlob {
    /// Length of `data`.
    pub compressed_size:   u32,
    pub decompressed_size: u32,
    /// Tag byte followed by the encoded payload.
    pub data:              Vec<u8>,
    /// md5 of the raw bytes.
    pub content_key:       HashKey,
}

impl EncodedBlob {
    pub fn new(raw: &[u8], spec: ChunkSpec) -> Result<Self, BlteError> {
        let decompressed_size = u32::try_from(raw.len())
            .map_err(|_| BlteError::ChunkTooLarge(raw.len()))?;
        let payload = get_codec(spec.encoding).compress(raw, spec.level)?;

        let mut data = Vec::with_capacity(payload.len() + 1);
        data.push(spec.encoding.tag());
        data.extend_from_slice(&payload);

        let compressed_size = u32::try_from(data.len())
            .map_err(|_| BlteError::ChunkTooLarge(data.len()))?;
        Ok(Self {
            compressed_size,
            decompressed_size,
            data,
            content_key: HashKey::of(raw),
        })
    }

    /// md5 of the chunk bytes as stored in a framed header.
    pub fn checksum(&self) -> HashKey {
        HashKey::of(&self.data)
    }
}

/// Split `payload` according to `specs` and compress each piece.
pub fn split(payload: &[u8], specs: &[ChunkSpec]) -> Result<Vec<EncodedBlob>, BlteError> {
    let default = [ChunkSpec::default()];
    let specs = if specs.is_empty() { &default[..] } else { specs };

    let mut blobs = Vec::new();
    let mut rest = payload;
    let mut i = 0;
    loop {
        let spec = specs[i.min(specs.len() - 1)];
        let take = spec.size.map_or(rest.len(), |n| n.max(1).min(rest.len()));
        let (head, tail) = rest.split_at(take);
        blobs.push(EncodedBlob::new(head, spec)?);
        rest = tail;
        i += 1;
        if rest.is_empty() {
            break;
        }
    }
    Ok(blobs)
}

// ── Framing ──────────────────────────────────────────────────────────────────

/// A framed container together with its encoded key.
#[derive(Debug, Clone)]
pub struct Framed {
    pub bytes:         Vec<u8>,
    pub encoded_key:   HashKey,
    /// 0 for the headerless single-chunk form.
    pub header_size:   usize,
    pub content_key:   HashKey,
    pub decoded_size:  u64,
}

/// Frame already-encoded chunks. `content_key` is the md5 of the whole
/// decoded payload and is passed in because chunks only know their own.
pub fn frame(blobs: &[EncodedBlob], content_key: HashKey) -> Framed {
    let body: usize = blobs.iter().map(|b| b.data.len()).sum();
    let header_size = if blobs.len() > 1 { header_size_for(blobs.len()) } else { 0 };

    let mut bytes = Vec::with_capacity(MIN_HEADER_SIZE.max(header_size) + body);
    bytes.extend_from_slice(&BLTE_MAGIC);
    bytes.extend_from_slice(&(header_size as u32).to_be_bytes());
    if header_size > 0 {
        bytes.push(FRAME_FLAGS);
        bytes.extend_from_slice(&(blobs.len() as u32).to_be_bytes()[1..]);
        for blob in blobs {
            bytes.extend_from_slice(&blob.compressed_size.to_be_bytes());
            bytes.extend_from_slice(&blob.decompressed_size.to_be_bytes());
            bytes.extend_from_slice(blob.checksum().as_bytes());
        }
    }
    for blob in blobs {
        bytes.extend_from_slice(&blob.data);
    }

    let encoded_key = if header_size > 0 {
        HashKey::of(&bytes[..header_size])
    } else {
        HashKey::of(&bytes)
    };
    let decoded_size = blobs.iter().map(|b| b.decompressed_size as u64).sum();
    Framed { bytes, encoded_key, header_size, content_key, decoded_size }
}

/// Compress `payload` eagerly and frame it.
pub fn encode(payload: &[u8], specs: &[ChunkSpec]) -> Result<Framed, BlteError> {
    let blobs = split(payload, specs)?;
    Ok(frame(&blobs, HashKey::of(payload)))
}

/// Encode one section per chunk, each with its own spec. System files are
/// written this way so that every table section lands in its own chunk.
pub fn encode_sections(sections: &[Vec<u8>], specs: &[ChunkSpec]) -> Result<Framed, BlteError> {
    let mut blobs = Vec::with_capacity(sections.len());
    let mut ctx = md5::Context::new();
    for (i, section) in sections.iter().enumerate() {
        let spec = specs.get(i).or(specs.last()).copied().unwrap_or_default();
        blobs.push(EncodedBlob::new(section, spec.without_size())?);
        ctx.consume(section);
    }
    if blobs.is_empty() {
        blobs.push(EncodedBlob::new(&[], specs.first().copied().unwrap_or_default())?);
    }
    Ok(frame(&blobs, HashKey(ctx.compute().0)))
}

/// Decode a whole container in one go.
pub fn decode(bytes: &[u8]) -> Result<Vec<u8>, BlteError> {
    let mut reader = BlteReader::new(Cursor::new(bytes))?;
    reader.decode_all()?;
    Ok(reader.into_decoded())
}

// ── Lazy reader ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct ChunkInfo {
    /// Position of the tag byte within the source.
    offset:            u64,
    compressed_size:   u32,
    /// Unknown for the headerless form until inflated.
    decompressed_size: Option<u32>,
    checksum:          Option<HashKey>,
}

/// Lazily decoding view of a BLTE container.
pub struct BlteReader<R> {
    src:     R,
    chunks:  Vec<ChunkInfo>,
    /// Index of the next chunk to inflate.
    next:    usize,
    decoded: Vec<u8>,
    pos:     u64,
    map:     Vec<ChunkSpec>,
}

impl<R: Read + Seek> BlteReader<R> {
    /// Parse and validate the header. No chunk is inflated yet.
    pub fn new(mut src: R) -> Result<Self, BlteError> {
        let total = src.seek(SeekFrom::End(0))?;
        src.seek(SeekFrom::Start(0))?;
        if total < MIN_HEADER_SIZE as u64 {
            return Err(BlteError::TooShort(total));
        }

        let mut magic = [0u8; 4];
        src.read_exact(&mut magic)?;
        if magic != BLTE_MAGIC {
            return Err(BlteError::BadMagic(magic));
        }
        let header_size = src.read_u32::<BigEndian>()?;

        let chunks = if header_size == 0 {
            vec![ChunkInfo {
                offset:            MIN_HEADER_SIZE as u64,
                compressed_size:   (total - MIN_HEADER_SIZE as u64) as u32,
                decompressed_size: None,
                checksum:          None,
            }]
        } else {
            if total < 12 {
                return Err(BlteError::TooShort(total));
            }
            let flags = src.read_u8()?;
            if flags != FRAME_FLAGS {
                return Err(BlteError::BadFlags(flags));
            }
            let count = src.read_u24::<BigEndian>()?;
            if count == 0 {
                return Err(BlteError::NoChunks);
            }
            let expected = header_size_for(count as usize);
            if header_size as usize != expected {
                return Err(BlteError::HeaderSizeMismatch { declared: header_size, chunks: count, expected });
            }
            if total < expected as u64 {
                return Err(BlteError::Truncated);
            }

            let mut offset = header_size as u64;
            let mut chunks = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let compressed_size = src.read_u32::<BigEndian>()?;
                let decompressed_size = src.read_u32::<BigEndian>()?;
                let mut sum = [0u8; 16];
                src.read_exact(&mut sum)?;
                chunks.push(ChunkInfo {
                    offset,
                    compressed_size,
                    decompressed_size: Some(decompressed_size),
                    checksum: Some(HashKey(sum)),
                });
                offset += compressed_size as u64;
            }
            if offset > total {
                return Err(BlteError::Truncated);
            }
            chunks
        };

        Ok(Self {
            src,
            chunks,
            next:    0,
            decoded: Vec::new(),
            pos:     0,
            map:     Vec::new(),
        })
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Number of chunks inflated so far.
    pub fn chunks_decoded(&self) -> usize {
        self.next
    }

    /// Decoded length. Known from the header for framed containers; the
    /// headerless form has to be inflated first.
    pub fn decoded_len(&mut self) -> Result<u64, BlteError> {
        let declared: Option<u64> = self.chunks.iter()
            .map(|c| c.decompressed_size.map(u64::from))
            .sum();
        match declared {
            Some(n) => Ok(n),
            None => {
                self.decode_all()?;
                Ok(self.decoded.len() as u64)
            }
        }
    }

    /// Encoding and level of every chunk, sized to its decoded length.
    /// Inflates whatever is still pending.
    pub fn encoding_map(&mut self) -> Result<Vec<ChunkSpec>, BlteError> {
        self.decode_all()?;
        Ok(self.map.clone())
    }

    pub fn decode_all(&mut self) -> Result<(), BlteError> {
        while self.next < self.chunks.len() {
            self.decode_next()?;
        }
        Ok(())
    }

    pub fn into_decoded(self) -> Vec<u8> {
        self.decoded
    }

    fn fill_to(&mut self, target: u64) -> Result<(), BlteError> {
        while (self.decoded.len() as u64) < target && self.next < self.chunks.len() {
            self.decode_next()?;
        }
        Ok(())
    }

    fn decode_next(&mut self) -> Result<(), BlteError> {
        let index = self.next;
        let info = self.chunks[index].clone();

        let mut data = vec![0u8; info.compressed_size as usize];
        self.src.seek(SeekFrom::Start(info.offset))?;
        self.src.read_exact(&mut data).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => BlteError::Truncated,
            _ => BlteError::Io(e),
        })?;

        if let Some(expected) = info.checksum {
            if HashKey::of(&data) != expected {
                return Err(BlteError::ChecksumMismatch { chunk: index });
            }
        }

        let (&tag, payload) = data.split_first().ok_or(BlteError::Truncated)?;
        let encoding = EncodingType::from_tag(tag).ok_or(BlteError::UnknownEncoding(tag))?;
        let plain = get_codec(encoding).decompress(payload)?;
        if let Some(expected) = info.decompressed_size {
            if plain.len() != expected as usize {
                return Err(BlteError::SizeMismatch { chunk: index, expected, actual: plain.len() });
            }
        }

        let level = match encoding {
            EncodingType::ZLib => detect_level(payload).unwrap_or(DEFAULT_LEVEL),
            EncodingType::None => 0,
        };
        self.map.push(ChunkSpec { encoding, level, size: Some(plain.len()) });
        self.decoded.extend_from_slice(&plain);
        self.next += 1;
        Ok(())
    }
}

fn to_io(e: BlteError) -> io::Error {
    match e {
        BlteError::Io(inner) => inner,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}

impl<R: Read + Seek> Read for BlteReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.fill_to(self.pos + buf.len() as u64).map_err(to_io)?;
        let start = self.pos.min(self.decoded.len() as u64) as usize;
        let n = buf.len().min(self.decoded.len() - start);
        buf[..n].copy_from_slice(&self.decoded[start..start + n]);
        self.pos += n as u64;
        Ok(n)
    }
}

impl<R: Read + Seek> Seek for BlteReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n)   => Some(n),
            SeekFrom::Current(d) => self.pos.checked_add_signed(d),
            SeekFrom::End(d)     => self.decoded_len().map_err(to_io)?.checked_add_signed(d),
        };
        let target = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before start of BLTE stream")
        })?;
        self.fill_to(target).map_err(to_io)?;
        self.pos = target;
        Ok(target)
    }
}
