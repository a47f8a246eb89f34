//! MD5 checksums for release entries.
//!
//! Release manifests carry the MD5 of each file's uncompressed content. This
//! module parses those checksums and verifies streams against them without
//! loading whole files into memory.

use anyhow::{bail, Context, Result};
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;

/// Read buffer used while hashing.
pub const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// 16-byte MD5 digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Checksum(pub [u8; 16]);

impl Checksum {
    /// Digest of an in-memory buffer.
    pub fn of(data: &[u8]) -> Self {
        Checksum(md5::compute(data).0)
    }

    /// Parse 32 hex digits (either case).
    pub fn from_hex(hex: &str) -> Result<Self> {
        let hex = hex.trim();
        if hex.len() != 32 || !hex.is_ascii() {
            bail!("Checksum must be 32 hex digits, got '{}'", hex);
        }

        let mut bytes = [0u8; 16];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
                .with_context(|| format!("Invalid hex in checksum '{}'", hex))?;
        }
        Ok(Checksum(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({})", self)
    }
}

/// Result of checking a stream against an expected checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    Match,
    Mismatch(Checksum),
    /// The chunk callback asked to stop before the stream was exhausted.
    Interrupted,
}

/// Hash a stream in fixed-size chunks.
///
/// `on_chunk` sees the length of every chunk read and returns `false` to stop
/// early, in which case `None` is returned.
pub fn stream_md5<R: Read>(mut reader: R, mut on_chunk: impl FnMut(usize) -> bool) -> Result<Option<Checksum>> {
    let mut context = md5::Context::new();
    let mut buf = vec![0u8; HASH_BUFFER_SIZE];

    loop {
        let read = reader.read(&mut buf).context("Failed to read stream for hashing")?;
        if read == 0 {
            break;
        }
        context.consume(&buf[..read]);
        if !on_chunk(read) {
            return Ok(None);
        }
    }

    Ok(Some(Checksum(context.compute().0)))
}

/// Verify a stream against `expected`.
pub fn verify_stream<R: Read>(
    reader: R,
    expected: &Checksum,
    on_chunk: impl FnMut(usize) -> bool,
) -> Result<Verification> {
    Ok(match stream_md5(reader, on_chunk)? {
        None => Verification::Interrupted,
        Some(actual) if actual == *expected => Verification::Match,
        Some(actual) => Verification::Mismatch(actual),
    })
}

/// Writer that hashes everything passing through to `inner`.
pub struct HashingWriter<W: Write> {
    inner: W,
    context: md5::Context,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            context: md5::Context::new(),
        }
    }

    pub fn into_parts(self) -> (W, Checksum) {
        (self.inner, Checksum(self.context.compute().0))
    }
}

impl HashingWriter<io::Sink> {
    pub fn discarding() -> Self {
        Self::new(io::sink())
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.context.consume(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// MD5 of a file on disk.
pub fn compute_file_md5(path: &Path) -> Result<Checksum> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open file for hashing: {}", path.display()))?;
    let reader = BufReader::with_capacity(HASH_BUFFER_SIZE, file);
    stream_md5(reader, |_| true)?
        .with_context(|| format!("Hashing interrupted: {}", path.display()))
}
