//! Release manifest model
//!
//! A release manifest lists every file of one release: where it lives, which
//! release last changed it, how it is shipped and stored, and its checksum.
//!
//! Text format, one record per line (blank lines and `#` comments ignored):
//!
//! ```text
//! name,directory,release,kind,size,compressed_size,md5
//! Xerath.skn,DATA/Characters/Xerath/,0.0.0.25,archive-compressed,5120,2048,9e107d9d372bb6826bd81d3542a419d6
//! ```

pub mod packing;

pub use packing::{PackedLocation, PackingManifest};

use crate::error::PatchError;
use crate::hash::Checksum;
use anyhow::{bail, Context, Result};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::io::Read;
use std::str::FromStr;

/// How an entry is shipped by the origin and stored locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    /// Plain file, shipped as-is.
    LooseRaw,
    /// Plain file, shipped zlib-compressed.
    LooseCompressed,
    /// Archive member kept compressed inside the container.
    CompressedArchiveMember,
    /// Archive member shipped compressed, stored inflated.
    UncompressedArchiveMember,
    /// Release-keyed resource outside the release directory.
    Managed,
}

impl FileKind {
    pub fn code(self) -> u8 {
        match self {
            FileKind::LooseRaw => 0,
            FileKind::LooseCompressed => 1,
            FileKind::CompressedArchiveMember => 2,
            FileKind::UncompressedArchiveMember => 3,
            FileKind::Managed => 4,
        }
    }

    pub fn token(self) -> &'static str {
        match self {
            FileKind::LooseRaw => "raw",
            FileKind::LooseCompressed => "compressed",
            FileKind::CompressedArchiveMember => "archive-compressed",
            FileKind::UncompressedArchiveMember => "archive-uncompressed",
            FileKind::Managed => "managed",
        }
    }

    pub fn is_archive(self) -> bool {
        matches!(
            self,
            FileKind::CompressedArchiveMember | FileKind::UncompressedArchiveMember
        )
    }

    /// Everything but raw loose files travels zlib-compressed.
    pub fn compressed_on_wire(self) -> bool {
        self != FileKind::LooseRaw
    }

    /// Only compressed archive members keep their wire encoding on disk.
    pub fn stored_compressed(self) -> bool {
        self == FileKind::CompressedArchiveMember
    }
}

impl FromStr for FileKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "0" | "raw" => FileKind::LooseRaw,
            "1" | "compressed" => FileKind::LooseCompressed,
            "2" | "archive-compressed" => FileKind::CompressedArchiveMember,
            "3" | "archive-uncompressed" => FileKind::UncompressedArchiveMember,
            "4" | "managed" => FileKind::Managed,
            other => bail!("Unknown file kind '{}'", other),
        })
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// Release identifier, kept as text for paths and packed into a `u32` for
/// ordering (`a.b.c.d` → `a<<24 | b<<16 | c<<8 | d`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReleaseId {
    text: String,
    numeric: u32,
}

impl ReleaseId {
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        let numeric = if text.contains('.') {
            let parts: Vec<&str> = text.split('.').collect();
            if parts.len() != 4 {
                bail!("Release id '{}' must have four dotted components", text);
            }
            let mut value = 0u32;
            for part in parts {
                let byte: u8 = part
                    .parse()
                    .with_context(|| format!("Invalid release id component in '{}'", text))?;
                value = (value << 8) | u32::from(byte);
            }
            value
        } else {
            text.parse()
                .with_context(|| format!("Invalid release id '{}'", text))?
        };

        Ok(Self {
            text: text.to_string(),
            numeric,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn numeric(&self) -> u32 {
        self.numeric
    }
}

impl Ord for ReleaseId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.numeric
            .cmp(&other.numeric)
            .then_with(|| self.text.cmp(&other.text))
    }
}

impl PartialOrd for ReleaseId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ReleaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// One file of a release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Full logical path, e.g. `DATA/Characters/Xerath/Xerath.skn`
    pub path: String,
    /// Final path component
    pub name: String,
    pub release: ReleaseId,
    pub kind: FileKind,
    /// Uncompressed size
    pub size: u64,
    /// Size on the wire when compressed
    pub compressed_size: u64,
    /// MD5 of the uncompressed content
    pub checksum: Checksum,
}

impl FileEntry {
    /// Bytes the origin sends for this entry.
    pub fn wire_size(&self) -> u64 {
        if self.kind.compressed_on_wire() {
            self.compressed_size
        } else {
            self.size
        }
    }

    /// Bytes this entry occupies once stored locally.
    pub fn stored_size(&self) -> u64 {
        if self.kind.stored_compressed() {
            self.compressed_size
        } else {
            self.size
        }
    }

    fn parse_line(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() != 7 {
            bail!("expected 7 fields, found {}", fields.len());
        }

        let name = fields[0];
        if name.is_empty() {
            bail!("empty file name");
        }

        let mut directory = fields[1].replace('\\', "/");
        directory = directory.trim_start_matches('/').to_string();
        if !directory.is_empty() && !directory.ends_with('/') {
            directory.push('/');
        }

        Ok(Self {
            path: format!("{}{}", directory, name),
            name: name.to_string(),
            release: ReleaseId::parse(fields[2])?,
            kind: fields[3].parse()?,
            size: fields[4].parse().context("invalid size")?,
            compressed_size: fields[5].parse().context("invalid compressed size")?,
            checksum: Checksum::from_hex(fields[6])?,
        })
    }
}

impl Ord for FileEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.release
            .numeric()
            .cmp(&other.release.numeric())
            .then_with(|| self.path.cmp(&other.path))
    }
}

impl PartialOrd for FileEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Parsed release manifest, ordered as listed and indexed by path.
#[derive(Debug, Clone, Default)]
pub struct ReleaseManifest {
    entries: Vec<FileEntry>,
    by_path: HashMap<String, usize>,
}

impl ReleaseManifest {
    pub fn parse(text: &str) -> Result<Self> {
        let mut entries = Vec::new();
        let mut by_path = HashMap::new();

        for (number, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let entry = FileEntry::parse_line(line).map_err(|e| {
                PatchError::structural(format!("Release manifest line {}: {:#}", number + 1, e))
            })?;

            if by_path.insert(entry.path.clone(), entries.len()).is_some() {
                return Err(PatchError::structural(format!(
                    "Release manifest line {}: duplicate path {}",
                    number + 1,
                    entry.path
                ))
                .into());
            }
            entries.push(entry);
        }

        Ok(Self { entries, by_path })
    }

    pub fn from_reader<R: Read>(mut reader: R) -> Result<Self> {
        let mut text = String::new();
        reader
            .read_to_string(&mut text)
            .context("Failed to read release manifest")?;
        Self::parse(&text)
    }

    pub fn entries(&self) -> &[FileEntry] {
        &self.entries
    }

    pub fn get(&self, path: &str) -> Option<&FileEntry> {
        self.by_path.get(path).map(|&i| &self.entries[i])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Release ids that still own managed files.
    pub fn managed_releases(&self) -> HashSet<&str> {
        self.entries
            .iter()
            .filter(|e| e.kind == FileKind::Managed)
            .map(|e| e.release.as_str())
            .collect()
    }

    /// All archive members bucketed per container generation.
    pub fn archive_groups(&self) -> Vec<VersionedGroup> {
        group_by_release(self.entries.iter().filter(|e| e.kind.is_archive()).cloned())
    }
}

/// Archive members destined for one container generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedGroup {
    pub release: ReleaseId,
    pub entries: Vec<FileEntry>,
}

impl VersionedGroup {
    pub fn stored_size(&self) -> u64 {
        self.entries.iter().map(FileEntry::stored_size).sum()
    }
}

/// Bucket entries by release id, groups in ascending release order and
/// members in the order they arrive.
pub fn group_by_release(entries: impl IntoIterator<Item = FileEntry>) -> Vec<VersionedGroup> {
    let mut buckets: BTreeMap<ReleaseId, Vec<FileEntry>> = BTreeMap::new();
    for entry in entries {
        buckets.entry(entry.release.clone()).or_default().push(entry);
    }

    buckets
        .into_iter()
        .map(|(release, entries)| VersionedGroup { release, entries })
        .collect()
}
