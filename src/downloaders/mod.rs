//! Remote origin access
//!
//! The patcher only ever needs two operations from the origin: fetch a whole
//! file, or fetch an inclusive byte range of one. [`Fetcher`] abstracts both so
//! the engine can run against HTTP or an in-memory origin in tests.
//!
//! Every remote path is relative to `<origin>/releases/<branch>/`.

mod http;

pub use http::HttpFetcher;

use crate::error::PatchError;
use crate::manifest::{FileEntry, ReleaseId};
use anyhow::{Context, Result};
use std::fmt;
use std::io::Read;

/// Status the fetcher reports for a successful request, ranged or not.
pub const STATUS_OK: u16 = 200;

pub struct FetchResponse {
    pub status: u16,
    pub body: Box<dyn Read + Send>,
}

impl FetchResponse {
    pub fn ok(body: impl Read + Send + 'static) -> Self {
        Self {
            status: STATUS_OK,
            body: Box::new(body),
        }
    }

    /// The body, or a transport error for any non-success status.
    pub fn into_success(self, path: &str) -> Result<Box<dyn Read + Send>> {
        if self.status != STATUS_OK {
            return Err(PatchError::Transport {
                path: path.to_string(),
                status: self.status,
            }
            .into());
        }
        Ok(self.body)
    }
}

impl fmt::Debug for FetchResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchResponse")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Source of release files.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, path: &str) -> Result<FetchResponse>;

    /// Bytes `start..=end_inclusive` of `path`.
    fn fetch_range(&self, path: &str, start: u64, end_inclusive: u64) -> Result<FetchResponse>;
}

/// Remote paths for one project.
#[derive(Debug, Clone)]
pub struct RemoteLayout {
    project: String,
}

impl RemoteLayout {
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
        }
    }

    fn releases(&self) -> String {
        format!("projects/{}/releases", self.project)
    }

    pub fn release_listing(&self) -> String {
        format!("{}/releaselisting", self.releases())
    }

    pub fn release_manifest(&self, version: &str) -> String {
        format!("{}/{}/releasemanifest", self.releases(), version)
    }

    /// Where the origin serves `entry`, with `.compressed` for wire-compressed kinds.
    pub fn file(&self, entry: &FileEntry) -> String {
        let suffix = if entry.kind.compressed_on_wire() {
            ".compressed"
        } else {
            ""
        };
        format!(
            "{}/{}/files/{}{}",
            self.releases(),
            entry.release,
            entry.path,
            suffix
        )
    }

    /// Key of `entry` in a packing manifest.
    pub fn packed_key(&self, entry: &FileEntry) -> String {
        format!("/{}", self.file(entry))
    }

    pub fn packing_manifest(&self, version: &str) -> String {
        format!("{}/{}/packages/files/packagemanifest", self.releases(), version)
    }

    pub fn blob(&self, version: &str, blob: &str) -> String {
        format!("{}/{}/packages/files/{}", self.releases(), version, blob)
    }
}

/// Current release of a project: the first line of its release listing.
pub fn resolve_release(fetcher: &dyn Fetcher, project: &str) -> Result<ReleaseId> {
    let path = RemoteLayout::new(project).release_listing();
    let mut body = fetcher.fetch(&path)?.into_success(&path)?;

    let mut text = String::new();
    body.read_to_string(&mut text)
        .with_context(|| format!("Failed to read release listing: {}", path))?;

    let first = text
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .with_context(|| format!("Release listing is empty: {}", path))?;
    ReleaseId::parse(first)
}
