pub mod error;
pub mod key;
pub mod jenkins;
pub mod codec;
pub mod blte;
pub mod writer;
pub mod local_index;
pub mod archive_index;
pub mod encoding;
pub mod identity;
pub mod root;
pub mod manifest;
pub mod config;
pub mod remote;
pub mod batch;
pub mod container;

pub use error::{Error, Result};
pub use key::HashKey;
pub use blte::{BlteReader, ChunkSpec, Framed};
pub use writer::{ArchiveWriter, CdnLayout, StoredBlob, WriteMode};
pub use local_index::LocalIndex;
pub use archive_index::{ArchiveIndex, ArchiveIndexEntry};
pub use encoding::EncodingTable;
pub use identity::{IdentityCache, IdentityRecord, JsonIdentityCache, MemoryIdentityCache};
pub use root::{ContentFlags, LocaleFlags, RootFilesystem};
pub use manifest::{DownloadManifest, InstallManifest};
pub use config::{ContainerSettings, KeyValueConfig, TableConfig};
pub use remote::{CdnHosts, Fetcher, MirrorFetcher, OfflineFetcher};
pub use batch::PendingFile;
pub use container::{Container, SaveReport};
