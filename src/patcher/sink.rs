//! Output sinks for fetched entries
//!
//! Wire bytes go in; the stored form comes out in a temp file or an archive
//! extent. The uncompressed content is hashed on the way so every entry is
//! checked against its manifest checksum before it is committed.

use crate::archive::{ArchiveRegistry, ContainerSink};
use crate::error::PatchError;
use crate::hash::{Checksum, HashingWriter};
use crate::manifest::{FileEntry, FileKind};
use crate::paths::{ensure_parent_dirs, InstallLayout};
use anyhow::{Context, Result};
use flate2::write::ZlibDecoder;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use tempfile::NamedTempFile;

enum Mode<W: Write> {
    /// Wire bytes are the content and are stored as-is.
    Plain(HashingWriter<W>),
    /// Wire bytes are inflated before storing.
    Inflate(ZlibDecoder<HashingWriter<W>>),
    /// Wire bytes are stored compressed; a side decoder hashes the content.
    KeepCompressed {
        out: W,
        check: ZlibDecoder<HashingWriter<io::Sink>>,
    },
}

/// Converts an entry's wire bytes into its stored form.
pub struct EntryWriter<W: Write> {
    mode: Mode<W>,
}

impl<W: Write> EntryWriter<W> {
    pub fn new(kind: FileKind, out: W) -> Self {
        let mode = if !kind.compressed_on_wire() {
            Mode::Plain(HashingWriter::new(out))
        } else if kind.stored_compressed() {
            Mode::KeepCompressed {
                out,
                check: ZlibDecoder::new(HashingWriter::discarding()),
            }
        } else {
            Mode::Inflate(ZlibDecoder::new(HashingWriter::new(out)))
        };
        Self { mode }
    }

    /// Flush everything and return the output with the content checksum.
    pub fn finish(self) -> io::Result<(W, Checksum)> {
        match self.mode {
            Mode::Plain(writer) => Ok(writer.into_parts()),
            Mode::Inflate(decoder) => Ok(decoder.finish()?.into_parts()),
            Mode::KeepCompressed { out, check } => {
                let (_, checksum) = check.finish()?.into_parts();
                Ok((out, checksum))
            }
        }
    }
}

impl<W: Write> Write for EntryWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.mode {
            Mode::Plain(writer) => writer.write(buf),
            Mode::Inflate(decoder) => decoder.write(buf),
            Mode::KeepCompressed { out, check } => {
                out.write_all(buf)?;
                check.write_all(buf)?;
                Ok(buf.len())
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.mode {
            Mode::Plain(writer) => writer.flush(),
            Mode::Inflate(decoder) => decoder.flush(),
            Mode::KeepCompressed { out, .. } => out.flush(),
        }
    }
}

/// Reader over an entry's uncompressed content given its stored bytes.
pub fn content_reader<'a, R: Read + 'a>(kind: FileKind, stored: R) -> Box<dyn Read + 'a> {
    if kind.stored_compressed() {
        Box::new(flate2::read::ZlibDecoder::new(stored))
    } else {
        Box::new(stored)
    }
}

fn check_integrity(entry: &FileEntry, actual: Checksum) -> Result<()> {
    if actual != entry.checksum {
        return Err(PatchError::Integrity {
            path: entry.path.clone(),
            expected: entry.checksum.to_string(),
            actual: actual.to_string(),
        }
        .into());
    }
    Ok(())
}

/// Destination for one entry's wire bytes. Dropping a sink without
/// finishing it discards what was written.
pub trait MemberSink: Write + Send {
    /// Verify the content and commit it.
    fn finish(self: Box<Self>) -> Result<()>;
}

/// Loose or managed file, written to a temp file beside its target.
pub struct LooseFileSink {
    entry: FileEntry,
    target: PathBuf,
    writer: EntryWriter<NamedTempFile>,
}

impl LooseFileSink {
    pub fn create(entry: &FileEntry, target: PathBuf) -> Result<Self> {
        ensure_parent_dirs(&target)
            .with_context(|| format!("Failed to create directory for {}", target.display()))?;
        let dir = target.parent().context("Target has no parent directory")?;
        let tmp = NamedTempFile::new_in(dir)
            .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;

        Ok(Self {
            entry: entry.clone(),
            target,
            writer: EntryWriter::new(entry.kind, tmp),
        })
    }
}

impl Write for LooseFileSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

impl MemberSink for LooseFileSink {
    fn finish(self: Box<Self>) -> Result<()> {
        let this = *self;
        let (mut tmp, checksum) = this
            .writer
            .finish()
            .with_context(|| format!("Failed to decode {}", this.entry.path))?;
        check_integrity(&this.entry, checksum)?;

        tmp.flush()?;
        tmp.persist(&this.target)
            .with_context(|| format!("Failed to move file into place: {}", this.target.display()))?;
        Ok(())
    }
}

/// Archive member, written into its reserved container extent.
pub struct ArchiveMemberSink {
    entry: FileEntry,
    writer: EntryWriter<ContainerSink>,
}

impl Write for ArchiveMemberSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

impl MemberSink for ArchiveMemberSink {
    fn finish(self: Box<Self>) -> Result<()> {
        let this = *self;
        let (sink, checksum) = this
            .writer
            .finish()
            .with_context(|| format!("Failed to decode archive member {}", this.entry.path))?;
        check_integrity(&this.entry, checksum)?;

        let stored = sink.finish()?;
        if stored.size != this.entry.stored_size() {
            return Err(PatchError::structural(format!(
                "Archive member {} stored {} bytes, expected {}",
                this.entry.path,
                stored.size,
                this.entry.stored_size()
            ))
            .into());
        }
        Ok(())
    }
}

/// Opens the right sink for an entry.
pub struct SinkFactory<'a> {
    pub layout: &'a InstallLayout,
    pub registry: &'a ArchiveRegistry,
    pub version: &'a str,
}

impl SinkFactory<'_> {
    pub fn open(&self, entry: &FileEntry) -> Result<Box<dyn MemberSink>> {
        if entry.kind.is_archive() {
            let container = self.registry.get_or_open(entry.release.as_str())?;
            let sink = container.open_write(&entry.path, entry.stored_size(), entry.checksum)?;
            Ok(Box::new(ArchiveMemberSink {
                entry: entry.clone(),
                writer: EntryWriter::new(entry.kind, sink),
            }))
        } else {
            let target = self.layout.file_path(entry, self.version);
            Ok(Box::new(LooseFileSink::create(entry, target)?))
        }
    }
}
