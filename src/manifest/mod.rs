//! Download and install manifests. Both are tag-masked entry lists written
//! as multi-chunk BLTE, one chunk per section.

mod tags;
pub mod download;
pub mod install;

pub use download::{DownloadEntry, DownloadHeader, DownloadManifest};
pub use install::{InstallEntry, InstallManifest};
pub use tags::{Tag, TagMask};
