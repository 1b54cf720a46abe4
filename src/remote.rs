//! Fetching configs and data from CDN hosts.
//!
//! Transport sits behind [`Fetcher`]; [`CdnHosts`] builds
//! `http://{host}/{cdn_path}/{kind}/xx/yy/{hex}` URLs and walks the host
//! list in order until one answers.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Error, Result};

pub trait Fetcher: Send + Sync {
    /// Body of `url`, or `None` when the host does not serve it.
    fn fetch_bytes(&self, url: &str) -> Option<Vec<u8>>;

    /// Save `url` to `dest`. Returns whether the file was written.
    fn download(&self, url: &str, dest: &Path) -> bool {
        let Some(bytes) = self.fetch_bytes(url) else {
            return false;
        };
        let written = dest.parent().map_or(Ok(()), fs::create_dir_all)
            .and_then(|_| fs::write(dest, bytes));
        match written {
            Ok(()) => true,
            Err(e) => {
                warn!("could not save {url} to {}: {e}", dest.display());
                false
            }
        }
    }
}

/// Never fetches anything; for fully local containers.
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineFetcher;

impl Fetcher for OfflineFetcher {
    fn fetch_bytes(&self, _url: &str) -> Option<Vec<u8>> {
        None
    }
}

/// Serves URLs from a directory tree laid out as `root/{host}/{path}`.
#[derive(Debug, Clone)]
pub struct MirrorFetcher {
    root: PathBuf,
}

impl MirrorFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn local_path(&self, url: &str) -> Option<PathBuf> {
        let rest = url.split_once("://").map_or(url, |(_, r)| r);
        let mut path = self.root.clone();
        for segment in rest.split('/').filter(|s| !s.is_empty()) {
            if segment == ".." {
                return None;
            }
            path.push(segment);
        }
        Some(path)
    }
}

impl Fetcher for MirrorFetcher {
    fn fetch_bytes(&self, url: &str) -> Option<Vec<u8>> {
        fs::read(self.local_path(url)?).ok()
    }
}

#[cfg(feature = "http")]
pub use http::HttpFetcher;

#[cfg(feature = "http")]
mod http {
    use super::Fetcher;
    use reqwest::blocking::Client;
    use tracing::debug;

    /// Blocking HTTP transport.
    #[derive(Debug, Clone, Default)]
    pub struct HttpFetcher {
        client: Client,
    }

    impl HttpFetcher {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl Fetcher for HttpFetcher {
        fn fetch_bytes(&self, url: &str) -> Option<Vec<u8>> {
            match self.client.get(url).send() {
                Ok(resp) if resp.status().is_success() => resp.bytes().ok().map(|b| b.to_vec()),
                Ok(resp) => {
                    debug!(status = %resp.status(), "{url}");
                    None
                }
                Err(e) => {
                    debug!("{url}: {e}");
                    None
                }
            }
        }
    }
}

/// Ordered CDN host list for one product.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CdnHosts {
    pub hosts:    Vec<String>,
    pub cdn_path: String,
}

impl CdnHosts {
    pub fn new(hosts: Vec<String>, cdn_path: impl Into<String>) -> Self {
        Self { hosts, cdn_path: cdn_path.into() }
    }

    /// Path below the host: `{cdn_path}/{kind}/xx/yy/{name}`.
    pub fn object_path(&self, kind: &str, name: &str) -> String {
        let name = name.to_ascii_lowercase();
        let shard = if name.len() >= 4 { format!("{}/{}/", &name[0..2], &name[2..4]) } else { String::new() };
        format!("{}/{kind}/{shard}{name}", self.cdn_path.trim_matches('/'))
    }

    pub fn url(&self, host: &str, path: &str) -> String {
        let host = host.trim_end_matches('/');
        if host.contains("://") {
            format!("{host}/{path}")
        } else {
            format!("http://{host}/{path}")
        }
    }

    /// Fetch `kind/name` from the first host that has it.
    pub fn fetch(&self, fetcher: &dyn Fetcher, kind: &str, name: &str) -> Result<Vec<u8>> {
        let path = self.object_path(kind, name);
        for host in &self.hosts {
            let url = self.url(host, &path);
            match fetcher.fetch_bytes(&url) {
                Some(bytes) => {
                    debug!(bytes = bytes.len(), "fetched {url}");
                    return Ok(bytes);
                }
                None => warn!("{host} failed for {path}, trying next host"),
            }
        }
        Err(Error::HostsExhausted(path))
    }

    /// Like [`fetch`](Self::fetch), saving the body to `dest`.
    pub fn download(&self, fetcher: &dyn Fetcher, kind: &str, name: &str, dest: &Path) -> Result<()> {
        let path = self.object_path(kind, name);
        for host in &self.hosts {
            if fetcher.download(&self.url(host, &path), dest) {
                return Ok(());
            }
            warn!("{host} failed for {path}, trying next host");
        }
        Err(Error::HostsExhausted(path))
    }
}
