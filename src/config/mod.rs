//! Container settings and the config files a build is described by.

pub mod build_config;
pub mod build_info;

pub use build_config::KeyValueConfig;
pub use build_info::{build_info_columns, Column, TableConfig};

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;

use serde::{Deserialize, Serialize};

use crate::archive_index::PAGE_SIZE;
use crate::error::Result;
use crate::root::LocaleFlags;
use crate::writer::{CdnLayout, WriteMode, ARCHIVE_CAPACITY};

/// How a [`Container`](crate::container::Container) finds its inputs and
/// where it writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerSettings {
    /// Installed client; holds `.build.info` and `Data/`.
    pub base_dir: PathBuf,

    /// Where CDN files, configs and the new `.build.info` go.
    pub output_dir: PathBuf,

    /// Locale whose root chunks are searched and edited (default: enUS)
    pub locale: LocaleFlags,

    /// Lowest id handed to a new file (default: 0)
    pub minimum_file_id: u32,

    pub cdn_layout: CdnLayout,

    pub write_mode: WriteMode,

    /// Bytes per local `data.NNN` file before rotation (default: 1 GiB)
    pub archive_capacity: u64,

    /// Page size of encoding and archive index files (default: 4096)
    pub page_size: usize,

    /// Encode operations running at once (default: available parallelism)
    pub max_in_flight: usize,

    /// CDN hosts, tried in order.
    pub hosts: Vec<String>,

    /// Product path on every host, e.g. `tpr/wow`.
    pub cdn_path: String,

    /// JSON identity cache; `None` keeps ids in memory only.
    pub identity_cache: Option<PathBuf>,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            base_dir:         PathBuf::from("."),
            output_dir:       PathBuf::from("./output"),
            locale:           LocaleFlags::EN_US,
            minimum_file_id:  0,
            cdn_layout:       CdnLayout::Flat,
            write_mode:       WriteMode::Loose,
            archive_capacity: ARCHIVE_CAPACITY,
            page_size:        PAGE_SIZE,
            max_in_flight:    thread::available_parallelism().map_or(4, |n| n.get()),
            hosts:            Vec::new(),
            cdn_path:         "tpr/wow".to_string(),
            identity_cache:   None,
        }
    }
}

impl ContainerSettings {
    pub fn new(base_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            output_dir: output_dir.into(),
            ..Default::default()
        }
    }

    pub fn with_locale(mut self, locale: LocaleFlags) -> Self {
        self.locale = locale;
        self
    }

    pub fn with_minimum_file_id(mut self, id: u32) -> Self {
        self.minimum_file_id = id;
        self
    }

    pub fn with_cdn_layout(mut self, layout: CdnLayout) -> Self {
        self.cdn_layout = layout;
        self
    }

    pub fn with_write_mode(mut self, mode: WriteMode) -> Self {
        self.write_mode = mode;
        self
    }

    pub fn with_archive_capacity(mut self, capacity: u64) -> Self {
        self.archive_capacity = capacity;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_max_in_flight(mut self, n: usize) -> Self {
        self.max_in_flight = n.max(1);
        self
    }

    pub fn with_hosts(mut self, hosts: Vec<String>) -> Self {
        self.hosts = hosts;
        self
    }

    pub fn with_cdn_path(mut self, path: impl Into<String>) -> Self {
        self.cdn_path = path.into();
        self
    }

    pub fn with_identity_cache(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity_cache = Some(path.into());
        self
    }

    /// `Data/data`: local archives and `.idx` files.
    pub fn data_dir(&self) -> PathBuf {
        self.base_dir.join("Data").join("data")
    }

    /// `Data/config`: locally cached configs, always sharded.
    pub fn local_config_dir(&self) -> PathBuf {
        self.base_dir.join("Data").join("config")
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        Ok(serde_json::from_slice(&fs::read(path)?)?)
    }

    pub fn to_json_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}
