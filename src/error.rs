//! Crate-wide error type.
//!
//! The variants follow the four failure classes the engine distinguishes:
//!
//! * **Corruption**: bad magic, bad flags, header/size disagreement,
//!   checksum mismatch. Always fatal for the current operation.
//! * **Missing data**: a key that should resolve does not. Fatal for the
//!   system files, recoverable through the fetcher for content blobs.
//! * **Transient I/O**: one download host failed. Only surfaces as
//!   [`Error::HostsExhausted`] once every configured host was tried.
//! * **Structural**: archive capacity. Never surfaces; the writer rotates.

use std::io;
use thiserror::Error;

use crate::blte::BlteError;
use crate::codec::CodecError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Corrupt {what}: {detail}")]
    Corrupt { what: &'static str, detail: String },
    #[error("Missing {what} {key}")]
    Missing { what: &'static str, key: String },
    #[error("All download hosts failed for {0}")]
    HostsExhausted(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error(transparent)]
    Blte(#[from] BlteError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn corrupt(what: &'static str, detail: impl Into<String>) -> Self {
        Error::Corrupt { what, detail: detail.into() }
    }

    pub(crate) fn missing(what: &'static str, key: impl ToString) -> Self {
        Error::Missing { what, key: key.to_string() }
    }

    /// True for the corruption class, including corruption reported by the
    /// framing layer.
    pub fn is_corruption(&self) -> bool {
        match self {
            Error::Corrupt { .. } => true,
            Error::Blte(e) => e.is_corruption(),
            _ => false,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Error::Missing { .. })
    }
}
