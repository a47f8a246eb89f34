//! In-memory origin and fixture builders for tests.

use crate::downloaders::{FetchResponse, Fetcher, RemoteLayout};
use crate::hash::Checksum;
use crate::manifest::{FileEntry, FileKind, ReleaseId};
use anyhow::Result;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::collections::HashMap;
use std::io::{Cursor, Write};
use std::sync::Mutex;

type FetchHook = Box<dyn Fn(&str) + Send + Sync>;

/// Origin serving canned bytes, with range support and a request log.
#[derive(Default)]
pub struct MemoryFetcher {
    files: Mutex<HashMap<String, Vec<u8>>>,
    failing: Mutex<HashMap<String, u16>>,
    requests: Mutex<Vec<String>>,
    hook: Mutex<Option<FetchHook>>,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: &str, data: Vec<u8>) {
        self.files.lock().unwrap().insert(path.to_string(), data);
    }

    /// Answer `path` with `status` from now on.
    pub fn fail(&self, path: &str, status: u16) {
        self.failing.lock().unwrap().insert(path.to_string(), status);
    }

    /// Run `hook` before every request.
    pub fn on_fetch(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        *self.hook.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    pub fn clear_requests(&self) {
        self.requests.lock().unwrap().clear();
    }

    fn lookup(&self, path: &str) -> Result<Option<Vec<u8>>, u16> {
        self.requests.lock().unwrap().push(path.to_string());
        if let Some(hook) = self.hook.lock().unwrap().as_ref() {
            hook(path);
        }
        if let Some(&status) = self.failing.lock().unwrap().get(path) {
            return Err(status);
        }
        Ok(self.files.lock().unwrap().get(path).cloned())
    }
}

impl Fetcher for MemoryFetcher {
    fn fetch(&self, path: &str) -> Result<FetchResponse> {
        Ok(match self.lookup(path) {
            Ok(Some(data)) => FetchResponse::ok(Cursor::new(data)),
            Ok(None) => missing(404),
            Err(status) => missing(status),
        })
    }

    fn fetch_range(&self, path: &str, start: u64, end_inclusive: u64) -> Result<FetchResponse> {
        Ok(match self.lookup(path) {
            Ok(Some(data)) => {
                let end = (end_inclusive as usize + 1).min(data.len());
                let start = (start as usize).min(end);
                FetchResponse::ok(Cursor::new(data[start..end].to_vec()))
            }
            Ok(None) => missing(404),
            Err(status) => missing(status),
        })
    }
}

fn missing(status: u16) -> FetchResponse {
    FetchResponse {
        status,
        body: Box::new(Cursor::new(Vec::new())),
    }
}

pub fn zlib(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// One file of a fixture release.
#[derive(Debug, Clone)]
pub struct RemoteFile {
    pub path: String,
    pub release: String,
    pub kind: FileKind,
    pub content: Vec<u8>,
}

impl RemoteFile {
    pub fn new(path: &str, release: &str, kind: FileKind, content: &[u8]) -> Self {
        Self {
            path: path.to_string(),
            release: release.to_string(),
            kind,
            content: content.to_vec(),
        }
    }

    pub fn wire_bytes(&self) -> Vec<u8> {
        if self.kind.compressed_on_wire() {
            zlib(&self.content)
        } else {
            self.content.clone()
        }
    }

    pub fn entry(&self) -> FileEntry {
        let name = self.path.rsplit('/').next().unwrap_or(&self.path);
        FileEntry {
            path: self.path.clone(),
            name: name.to_string(),
            release: ReleaseId::parse(&self.release).unwrap(),
            kind: self.kind,
            size: self.content.len() as u64,
            compressed_size: self.wire_bytes().len() as u64,
            checksum: Checksum::of(&self.content),
        }
    }

    pub fn manifest_line(&self) -> String {
        let entry = self.entry();
        let directory = &self.path[..self.path.len() - entry.name.len()];
        format!(
            "{},{},{},{},{},{},{}",
            entry.name,
            directory,
            entry.release,
            entry.kind.token(),
            entry.size,
            entry.compressed_size,
            entry.checksum
        )
    }
}

/// A release published on a [`MemoryFetcher`].
#[derive(Debug, Clone)]
pub struct FixtureRelease {
    pub project: String,
    pub version: String,
    pub files: Vec<RemoteFile>,
}

impl FixtureRelease {
    pub fn new(project: &str, version: &str, files: Vec<RemoteFile>) -> Self {
        Self {
            project: project.to_string(),
            version: version.to_string(),
            files,
        }
    }

    pub fn manifest_text(&self) -> String {
        let mut text = String::from("# name,directory,release,kind,size,compressed_size,md5\n");
        for file in &self.files {
            text.push_str(&file.manifest_line());
            text.push('\n');
        }
        text
    }

    /// Publish the listing, the manifest and every file individually.
    pub fn publish(&self, fetcher: &MemoryFetcher) {
        let remote = RemoteLayout::new(&self.project);
        fetcher.insert(&remote.release_listing(), format!("{}\n", self.version).into_bytes());
        fetcher.insert(
            &remote.release_manifest(&self.version),
            self.manifest_text().into_bytes(),
        );
        for file in &self.files {
            fetcher.insert(&remote.file(&file.entry()), file.wire_bytes());
        }
    }

    /// Publish one blob holding the listed paths back to back, preceded by
    /// `lead` filler bytes, plus its packing manifest.
    pub fn publish_package(&self, fetcher: &MemoryFetcher, blob: &str, paths: &[&str], lead: usize) {
        let remote = RemoteLayout::new(&self.project);
        let mut data = vec![0xAAu8; lead];
        let mut packing = String::from("PKG1\n");

        for path in paths {
            let file = self
                .files
                .iter()
                .find(|f| f.path == *path)
                .unwrap_or_else(|| panic!("no fixture file {}", path));
            let bytes = file.wire_bytes();
            packing.push_str(&format!(
                "{},{},{},{}\n",
                remote.packed_key(&file.entry()),
                blob,
                data.len(),
                bytes.len()
            ));
            data.extend_from_slice(&bytes);
        }

        fetcher.insert(&remote.blob(&self.version, blob), data);
        fetcher.insert(&remote.packing_manifest(&self.version), packing.into_bytes());
    }
}
