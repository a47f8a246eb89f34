//! Archive containers
//!
//! A container is a pair of files: `Archive_<n>.raf` holds the index and
//! `Archive_<n>.raf.dat` holds member bytes. Members are appended; replacing
//! or removing a member leaves a gap that only compaction reclaims.
//!
//! Writers reserve their extent when the sink is opened, so several sinks on
//! the same container can be written concurrently without overlapping.

pub mod format;
pub mod registry;

pub use registry::ArchiveRegistry;

use crate::error::PatchError;
use crate::hash::Checksum;
use anyhow::{Context, Result};
use format::{IndexFile, IndexRecord};
use regex::Regex;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use tracing::{debug, warn};

pub const DATA_SUFFIX: &str = ".dat";

fn index_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^Archive_(\d+)\.raf$").expect("static regex"))
}

/// Where one member lives in the data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub offset: u64,
    pub size: u64,
    pub checksum: Checksum,
}

impl ArchiveEntry {
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

#[derive(Debug, Default)]
struct ContainerState {
    entries: HashMap<String, ArchiveEntry>,
    next_offset: u64,
    dirty: bool,
}

/// Index and data file of an existing container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerFiles {
    pub index: PathBuf,
    pub data: PathBuf,
}

impl ContainerFiles {
    pub fn for_index(index: PathBuf) -> Self {
        let mut data = index.clone().into_os_string();
        data.push(DATA_SUFFIX);
        Self {
            index,
            data: PathBuf::from(data),
        }
    }

    /// Find the single container in `dir`. Anything but exactly one index with
    /// its data file means the installation needs repair.
    pub fn locate(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            return Err(PatchError::repair(dir, "archive directory is missing").into());
        }

        let indexes = list_index_files(dir)?;
        let index = match indexes.as_slice() {
            [] => return Err(PatchError::repair(dir, "no archive index").into()),
            [one] => one.clone(),
            _ => return Err(PatchError::repair(dir, "more than one archive index").into()),
        };

        let files = Self::for_index(index);
        if !files.data.is_file() {
            return Err(PatchError::repair(dir, "archive data file is missing").into());
        }
        Ok(files)
    }
}

fn list_index_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut indexes = Vec::new();
    for entry in fs::read_dir(dir)
        .with_context(|| format!("Failed to list archive directory: {}", dir.display()))?
    {
        let entry = entry?;
        if entry.file_type()?.is_file()
            && index_name_regex().is_match(&entry.file_name().to_string_lossy())
        {
            indexes.push(entry.path());
        }
    }
    indexes.sort();
    Ok(indexes)
}

/// Keyed blob store backed by an index file and a data file.
#[derive(Debug)]
pub struct ArchiveContainer {
    files: ContainerFiles,
    state: Mutex<ContainerState>,
}

impl ArchiveContainer {
    /// Open the container in `dir`, creating `Archive_1.raf` if there is none.
    pub fn open_or_create(dir: &Path) -> Result<Arc<Self>> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create archive directory: {}", dir.display()))?;

        let indexes = list_index_files(dir)?;
        match indexes.as_slice() {
            [] => Self::create(dir.join("Archive_1.raf")),
            [one] => Self::open(ContainerFiles::for_index(one.clone())),
            _ => Err(PatchError::repair(dir, "more than one archive index").into()),
        }
    }

    /// Open an existing index/data pair.
    pub fn open(files: ContainerFiles) -> Result<Arc<Self>> {
        if !files.data.is_file() {
            let dir = files.index.parent().unwrap_or(Path::new(""));
            return Err(PatchError::repair(dir, "archive data file is missing").into());
        }

        let bytes = fs::read(&files.index)
            .with_context(|| format!("Failed to read archive index: {}", files.index.display()))?;
        let index = IndexFile::decode(&bytes)
            .with_context(|| format!("Corrupt archive index: {}", files.index.display()))?;

        let data_len = fs::metadata(&files.data)?.len();
        let mut state = ContainerState {
            next_offset: data_len,
            ..Default::default()
        };
        for record in index.records {
            let entry = ArchiveEntry {
                offset: record.offset,
                size: record.size,
                checksum: Checksum(record.checksum),
            };
            state.next_offset = state.next_offset.max(entry.end());
            state.entries.insert(record.path, entry);
        }

        debug!(
            "Opened archive {} ({} entries, {} bytes)",
            files.index.display(),
            state.entries.len(),
            data_len
        );

        Ok(Arc::new(Self {
            files,
            state: Mutex::new(state),
        }))
    }

    /// Create an empty container, replacing any files at `index`.
    pub fn create(index: PathBuf) -> Result<Arc<Self>> {
        let files = ContainerFiles::for_index(index);
        if let Some(parent) = files.index.parent() {
            fs::create_dir_all(parent)?;
        }
        File::create(&files.data)
            .with_context(|| format!("Failed to create archive data: {}", files.data.display()))?;

        let container = Arc::new(Self {
            files,
            state: Mutex::new(ContainerState {
                dirty: true,
                ..Default::default()
            }),
        });
        container.sync()?;
        Ok(container)
    }

    pub fn files(&self) -> &ContainerFiles {
        &self.files
    }

    fn lock(&self) -> MutexGuard<'_, ContainerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.lock().entries.contains_key(path)
    }

    pub fn entry(&self, path: &str) -> Option<ArchiveEntry> {
        self.lock().entries.get(path).copied()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All members ordered by offset.
    pub fn entries(&self) -> Vec<(String, ArchiveEntry)> {
        let mut entries: Vec<_> = self
            .lock()
            .entries
            .iter()
            .map(|(path, entry)| (path.clone(), *entry))
            .collect();
        entries.sort_by(|a, b| a.1.offset.cmp(&b.1.offset).then_with(|| a.0.cmp(&b.0)));
        entries
    }

    pub fn data_len(&self) -> Result<u64> {
        Ok(fs::metadata(&self.files.data)
            .with_context(|| format!("Failed to stat {}", self.files.data.display()))?
            .len())
    }

    /// Drop the mapping for `path`. The bytes stay until compaction.
    pub fn remove(&self, path: &str) -> Option<ArchiveEntry> {
        let mut state = self.lock();
        let removed = state.entries.remove(path);
        if removed.is_some() {
            state.dirty = true;
        }
        removed
    }

    /// Register `path` with a fresh extent of `reserved` bytes and return a
    /// sink positioned at its start. A previous mapping for the same path is
    /// replaced.
    pub fn open_write(
        self: &Arc<Self>,
        path: &str,
        reserved: u64,
        checksum: Checksum,
    ) -> Result<ContainerSink> {
        let mut file = OpenOptions::new()
            .write(true)
            .open(&self.files.data)
            .with_context(|| format!("Failed to open archive data: {}", self.files.data.display()))?;

        let offset = {
            let mut state = self.lock();
            let offset = state.next_offset;
            state.next_offset += reserved;
            state.entries.insert(
                path.to_string(),
                ArchiveEntry {
                    offset,
                    size: reserved,
                    checksum,
                },
            );
            state.dirty = true;
            offset
        };

        file.seek(SeekFrom::Start(offset))?;
        Ok(ContainerSink {
            container: Arc::clone(self),
            path: path.to_string(),
            offset,
            reserved,
            written: 0,
            writer: Some(BufWriter::new(file)),
        })
    }

    /// Reader over a member's stored bytes.
    pub fn open_read(&self, path: &str) -> Result<Option<io::Take<BufReader<File>>>> {
        let Some(entry) = self.entry(path) else {
            return Ok(None);
        };

        let mut file = File::open(&self.files.data)
            .with_context(|| format!("Failed to open archive data: {}", self.files.data.display()))?;
        file.seek(SeekFrom::Start(entry.offset))?;
        Ok(Some(BufReader::new(file).take(entry.size)))
    }

    /// Persist the index and flush the data file without closing.
    pub fn sync(&self) -> Result<()> {
        let mut state = self.lock();
        if !state.dirty {
            return Ok(());
        }

        let mut records: Vec<IndexRecord> = state
            .entries
            .iter()
            .map(|(path, e)| IndexRecord::new(path.clone(), e.offset, e.size, e.checksum.0))
            .collect();
        records.sort_by_key(|r| r.offset);
        let bytes = IndexFile::new(records).encode()?;

        let mut tmp = self.files.index.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        {
            let mut out = File::create(&tmp)
                .with_context(|| format!("Failed to write archive index: {}", tmp.display()))?;
            out.write_all(&bytes)?;
            out.sync_data()?;
        }
        fs::rename(&tmp, &self.files.index)
            .with_context(|| format!("Failed to replace archive index: {}", self.files.index.display()))?;

        File::open(&self.files.data)?.sync_data()?;
        state.dirty = false;
        Ok(())
    }

    /// Final sync; the container must not be written afterwards.
    pub fn close(&self) -> Result<()> {
        self.sync()
    }

    fn settle(&self, path: &str, offset: u64, written: u64) {
        let mut state = self.lock();
        if let Some(entry) = state.entries.get_mut(path) {
            if entry.offset == offset && entry.size != written {
                entry.size = written;
                state.dirty = true;
            }
        }
    }

    fn release(&self, path: &str, offset: u64) {
        let mut state = self.lock();
        if state.entries.get(path).is_some_and(|e| e.offset == offset) {
            state.entries.remove(path);
            state.dirty = true;
        }
    }
}

/// Writer for one reserved member extent.
///
/// Dropping a sink without [`ContainerSink::finish`] releases its mapping.
#[derive(Debug)]
pub struct ContainerSink {
    container: Arc<ArchiveContainer>,
    path: String,
    offset: u64,
    reserved: u64,
    written: u64,
    writer: Option<BufWriter<File>>,
}

impl ContainerSink {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Flush and record the final member size.
    pub fn finish(mut self) -> Result<ArchiveEntry> {
        if let Some(mut writer) = self.writer.take() {
            writer
                .flush()
                .with_context(|| format!("Failed to flush archive member {}", self.path))?;
        }
        if self.written != self.reserved {
            warn!(
                "Archive member {} wrote {} of {} reserved bytes",
                self.path, self.written, self.reserved
            );
        }
        self.container.settle(&self.path, self.offset, self.written);
        let entry = self.container.entry(&self.path).with_context(|| {
            format!("Archive member {} was replaced while writing", self.path)
        })?;
        Ok(entry)
    }
}

impl Write for ContainerSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let remaining = self.reserved - self.written;
        if buf.len() as u64 > remaining {
            return Err(io::Error::other(PatchError::structural(format!(
                "write past reserved extent of {} ({} bytes reserved)",
                self.path, self.reserved
            ))));
        }
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| io::Error::other("archive sink already finished"))?;
        let n = writer.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for ContainerSink {
    fn drop(&mut self) {
        if self.writer.is_some() {
            self.container.release(&self.path, self.offset);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn put(container: &Arc<ArchiveContainer>, path: &str, data: &[u8]) -> Result<ArchiveEntry> {
        let mut sink = container.open_write(path, data.len() as u64, Checksum::of(data))?;
        sink.write_all(data)?;
        sink.finish()
    }

    fn read(container: &ArchiveContainer, path: &str) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        container
            .open_read(path)?
            .context("missing member")?
            .read_to_end(&mut out)?;
        Ok(out)
    }

    #[test]
    fn test_write_read_reopen() -> Result<()> {
        let tmp = TempDir::new()?;
        let container = ArchiveContainer::open_or_create(tmp.path())?;
        assert!(tmp.path().join("Archive_1.raf").is_file());
        assert!(tmp.path().join("Archive_1.raf.dat").is_file());

        let a = put(&container, "DATA/a.bin", b"hello")?;
        let b = put(&container, "DATA/b.bin", b"world!!")?;
        assert_eq!(a.offset, 0);
        assert_eq!(b.offset, 5);
        container.close()?;

        let reopened = ArchiveContainer::open_or_create(tmp.path())?;
        assert_eq!(reopened.len(), 2);
        assert_eq!(read(&reopened, "DATA/b.bin")?, b"world!!");
        assert_eq!(reopened.entry("DATA/a.bin").unwrap().checksum, Checksum::of(b"hello"));
        assert_eq!(reopened.data_len()?, 12);
        Ok(())
    }

    #[test]
    fn test_concurrent_sinks_do_not_overlap() -> Result<()> {
        let tmp = TempDir::new()?;
        let container = ArchiveContainer::open_or_create(tmp.path())?;

        let mut first = container.open_write("one", 4, Checksum::of(b"1111"))?;
        let mut second = container.open_write("two", 4, Checksum::of(b"2222"))?;
        second.write_all(b"2222")?;
        first.write_all(b"1111")?;
        second.finish()?;
        first.finish()?;

        assert_eq!(read(&container, "one")?, b"1111");
        assert_eq!(read(&container, "two")?, b"2222");
        Ok(())
    }

    #[test]
    fn test_overrun_is_refused() -> Result<()> {
        let tmp = TempDir::new()?;
        let container = ArchiveContainer::open_or_create(tmp.path())?;
        let mut sink = container.open_write("small", 2, Checksum::default())?;
        assert!(sink.write_all(b"abc").is_err());
        Ok(())
    }

    #[test]
    fn test_dropped_sink_releases_mapping() -> Result<()> {
        let tmp = TempDir::new()?;
        let container = ArchiveContainer::open_or_create(tmp.path())?;
        {
            let mut sink = container.open_write("partial", 10, Checksum::default())?;
            sink.write_all(b"abc")?;
        }
        assert!(!container.contains("partial"));
        Ok(())
    }

    #[test]
    fn test_replace_and_remove() -> Result<()> {
        let tmp = TempDir::new()?;
        let container = ArchiveContainer::open_or_create(tmp.path())?;
        put(&container, "x", b"old")?;
        let new = put(&container, "x", b"newer")?;
        assert_eq!(new.offset, 3);
        assert_eq!(container.len(), 1);
        assert_eq!(read(&container, "x")?, b"newer");

        assert!(container.remove("x").is_some());
        assert!(container.open_read("x")?.is_none());
        Ok(())
    }

    #[test]
    fn test_locate_requires_repair() -> Result<()> {
        let tmp = TempDir::new()?;
        let missing = tmp.path().join("nope");
        let err = ContainerFiles::locate(&missing).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PatchError>(),
            Some(PatchError::RepairRequired { .. })
        ));

        fs::write(tmp.path().join("Archive_1.raf"), b"")?;
        assert!(ContainerFiles::locate(tmp.path()).is_err());

        fs::write(tmp.path().join("Archive_1.raf.dat"), b"")?;
        assert!(ContainerFiles::locate(tmp.path()).is_ok());

        fs::write(tmp.path().join("Archive_2.raf"), b"")?;
        assert!(ContainerFiles::locate(tmp.path()).is_err());
        Ok(())
    }
}
