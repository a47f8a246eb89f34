//! On-disk index of an archive container
//!
//! Layout (little-endian):
//! - magic `RAFX`
//! - version `u32`
//! - entry count `u32`
//! - per entry: path length `u16`, UTF-8 path, offset `u64`, size `u64`,
//!   MD5 `[u8; 16]`

use anyhow::{bail, Context, Result};
use binrw::{binrw, BinRead, BinWrite};
use std::io::Cursor;

pub const INDEX_VERSION: u32 = 1;

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRecord {
    #[br(temp)]
    #[bw(calc = path.len() as u16)]
    path_len: u16,

    #[br(count = path_len, try_map = String::from_utf8)]
    #[bw(map = |p: &String| p.as_bytes().to_vec())]
    pub path: String,

    pub offset: u64,
    pub size: u64,
    pub checksum: [u8; 16],
}

impl IndexRecord {
    pub fn new(path: String, offset: u64, size: u64, checksum: [u8; 16]) -> Self {
        Self {
            path,
            offset,
            size,
            checksum,
        }
    }
}

#[binrw]
#[brw(little, magic = b"RAFX")]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexFile {
    #[br(assert(version == INDEX_VERSION, "unsupported index version {}", version))]
    pub version: u32,

    #[br(temp)]
    #[bw(calc = records.len() as u32)]
    count: u32,

    #[br(count = count)]
    pub records: Vec<IndexRecord>,
}

impl IndexFile {
    pub fn new(records: Vec<IndexRecord>) -> Self {
        Self {
            version: INDEX_VERSION,
            records,
        }
    }

    /// Parse an index. An empty buffer is an empty index.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Ok(Self::new(Vec::new()));
        }
        Self::read(&mut Cursor::new(bytes)).context("Failed to parse archive index")
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        if let Some(long) = self.records.iter().find(|r| r.path.len() > u16::MAX as usize) {
            bail!("Archive path too long for index: {}", long.path);
        }
        if self.records.len() > u32::MAX as usize {
            bail!("Too many archive entries: {}", self.records.len());
        }

        let mut cursor = Cursor::new(Vec::new());
        self.write(&mut cursor)
            .context("Failed to encode archive index")?;
        Ok(cursor.into_inner())
    }
}
