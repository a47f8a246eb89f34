//! Packing manifest: where individual files live inside remote combined blobs.
//!
//! ```text
//! PKG1
//! /projects/client/releases/0.0.0.25/files/DATA/a.bin.compressed,BIN_0x00000000,0,1200
//! ```

use crate::error::PatchError;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::io::Read;

pub const PACKING_HEADER: &str = "PKG1";

/// Location of one file inside a blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedLocation {
    pub blob: String,
    pub offset: u64,
    pub size: u64,
}

impl PackedLocation {
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Map from remote file path to its packed location.
#[derive(Debug, Clone, Default)]
pub struct PackingManifest {
    locations: HashMap<String, PackedLocation>,
}

impl PackingManifest {
    pub fn parse(text: &str) -> Result<Self> {
        let mut lines = text.lines();
        let header = lines.next().map(str::trim).unwrap_or_default();
        if header != PACKING_HEADER {
            return Err(PatchError::structural(format!(
                "Packing manifest has wrong header '{}'",
                header
            ))
            .into());
        }

        let mut locations = HashMap::new();
        for (number, line) in lines.enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            if fields.len() != 4 {
                return Err(PatchError::structural(format!(
                    "Packing manifest line {}: expected 4 fields, found {}",
                    number + 2,
                    fields.len()
                ))
                .into());
            }

            let offset: u64 = fields[2]
                .parse()
                .with_context(|| format!("Packing manifest line {}: bad offset", number + 2))?;
            let size: u64 = fields[3]
                .parse()
                .with_context(|| format!("Packing manifest line {}: bad size", number + 2))?;
            if offset.checked_add(size).is_none() {
                return Err(PatchError::structural(format!(
                    "Packing manifest line {}: extent {}+{} overflows",
                    number + 2,
                    offset,
                    size
                ))
                .into());
            }

            locations.insert(
                fields[0].to_string(),
                PackedLocation {
                    blob: fields[1].to_string(),
                    offset,
                    size,
                },
            );
        }

        Ok(Self { locations })
    }

    pub fn from_reader<R: Read>(mut reader: R) -> Result<Self> {
        let mut text = String::new();
        reader
            .read_to_string(&mut text)
            .context("Failed to read packing manifest")?;
        Self::parse(&text)
    }

    pub fn locate(&self, remote_path: &str) -> Option<&PackedLocation> {
        self.locations.get(remote_path)
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }
}
