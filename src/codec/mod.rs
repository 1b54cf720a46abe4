//! Chunk codecs used inside BLTE containers.
//!
//! # Tags
//! Every BLTE chunk starts with a one-byte encoding tag followed by the
//! tagged payload:
//!   - `N` - payload stored verbatim.
//!   - `Z` - payload is a zlib stream (2-byte header, deflate body, adler32).
//!
//! Other tags exist in the wild (`F` recursive frames, `E` encrypted). They
//! are rejected as unrecognized; this engine neither reads nor writes them.
//!
//! # Level recovery
//! A zlib header carries the compressor's level class in `FLEVEL`, the top
//! two bits of its second byte. [`detect_level`] maps the class back to a
//! concrete level so a rewritten chunk compresses like the chunk it replaces.

use std::io::{self, Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use thiserror::Error;

/// Level used for new chunks when nothing else was requested.
pub const DEFAULT_LEVEL: i32 = 9;

// ── Encoding tags ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncodingType {
    None,
    ZLib,
}

impl EncodingType {
    /// On-disk tag byte.
    #[inline]
    pub fn tag(self) -> u8 {
        match self {
            EncodingType::None => b'N',
            EncodingType::ZLib => b'Z',
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            b'N' => Some(EncodingType::None),
            b'Z' => Some(EncodingType::ZLib),
            _    => None,
        }
    }

    /// Human-readable name (diagnostics and CLI only).
    pub fn name(self) -> &'static str {
        match self {
            EncodingType::None => "none",
            EncodingType::ZLib => "zlib",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "none" | "n" => Some(EncodingType::None),
            "zlib" | "z" => Some(EncodingType::ZLib),
            _            => None,
        }
    }
}

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Decompression error: {0}")]
    Decompression(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── Codec trait ──────────────────────────────────────────────────────────────

pub trait Codec: Send + Sync {
    fn encoding(&self) -> EncodingType;
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError>;
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;
}

// ── Built-in codec implementations ──────────────────────────────────────────

pub struct NoneCodec;
impl Codec for NoneCodec {
    fn encoding(&self) -> EncodingType { EncodingType::None }
    fn compress(&self, data: &[u8], _: i32) -> Result<Vec<u8>, CodecError> { Ok(data.to_vec()) }
    fn decompress(&self, data: &[u8])        -> Result<Vec<u8>, CodecError> { Ok(data.to_vec()) }
}

pub struct ZlibCodec;
impl Codec for ZlibCodec {
    fn encoding(&self) -> EncodingType { EncodingType::ZLib }

    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError> {
        let level = level.clamp(0, 9) as u32;
        let mut enc = ZlibEncoder::new(Vec::with_capacity(data.len() / 2 + 16), Compression::new(level));
        enc.write_all(data).map_err(|e| CodecError::Compression(e.to_string()))?;
        enc.finish().map_err(|e| CodecError::Compression(e.to_string()))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::with_capacity(data.len() * 2);
        ZlibDecoder::new(data)
            .read_to_end(&mut out)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        Ok(out)
    }
}

// ── Factory ──────────────────────────────────────────────────────────────────

pub fn get_codec(encoding: EncodingType) -> Box<dyn Codec> {
    match encoding {
        EncodingType::None => Box::new(NoneCodec),
        EncodingType::ZLib => Box::new(ZlibCodec),
    }
}

/// Recover the compression level from a zlib stream header.
///
/// `FLEVEL` 0 and 1 map to themselves, 2 and 3 to 6 and 9.
/// Returns `None` when `stream` is too short to carry a header.
pub fn detect_level(stream: &[u8]) -> Option<i32> {
    let flevel = (*stream.get(1)? >> 6) as i32;
    Some(if flevel > 1 { flevel * 3 } else { flevel })
}
