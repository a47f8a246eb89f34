//! Worker pools for the loose-file and archive-member phases
//!
//! Each pool is a fixed set of scoped threads pulling from one shared queue.
//! A worker pops under the lock and processes unlocked, and stops when the
//! queue is empty, the task finished, or an error was recorded.

use super::sink::{content_reader, SinkFactory};
use super::task::TaskState;
use crate::archive::ArchiveRegistry;
use crate::downloaders::{Fetcher, RemoteLayout};
use crate::hash::{verify_stream, Verification};
use crate::manifest::{FileEntry, VersionedGroup};
use crate::paths::InstallLayout;
use anyhow::{Context, Result};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    LooseFile,
    ArchiveMember,
    Package,
    Difference,
}

/// Observable state of one worker.
#[derive(Debug)]
pub struct WorkerSlot {
    kind: WorkerKind,
    /// f32 bits; 1.0 while idle
    progress: AtomicU32,
    alternative: AtomicBool,
    /// Unix millis, -1 while idle
    started_at: AtomicI64,
    status: Mutex<String>,
}

/// Snapshot of a busy worker for display.
#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkerStatus {
    pub kind: String,
    pub status: String,
    pub progress: f32,
    pub reusing: bool,
}

impl WorkerSlot {
    pub fn new(kind: WorkerKind) -> Self {
        Self {
            kind,
            progress: AtomicU32::new(1.0f32.to_bits()),
            alternative: AtomicBool::new(false),
            started_at: AtomicI64::new(-1),
            status: Mutex::new(String::new()),
        }
    }

    pub fn kind(&self) -> WorkerKind {
        self.kind
    }

    pub fn begin(&self, status: &str) {
        self.progress.store(0.0f32.to_bits(), Ordering::Relaxed);
        self.alternative.store(false, Ordering::Relaxed);
        self.started_at
            .store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status.to_string();
    }

    pub fn idle(&self) {
        self.progress.store(1.0f32.to_bits(), Ordering::Relaxed);
        self.alternative.store(false, Ordering::Relaxed);
        self.started_at.store(-1, Ordering::Relaxed);
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn set_progress(&self, fraction: f32) {
        self.progress
            .store(fraction.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    pub fn progress(&self) -> f32 {
        f32::from_bits(self.progress.load(Ordering::Relaxed))
    }

    pub fn set_alternative(&self, reusing: bool) {
        self.alternative.store(reusing, Ordering::Relaxed);
    }

    pub fn is_alternative(&self) -> bool {
        self.alternative.load(Ordering::Relaxed)
    }

    pub fn is_busy(&self) -> bool {
        self.started_at.load(Ordering::Relaxed) >= 0
    }

    /// Share of the current item still to do; 0 while idle.
    pub fn unfinished(&self) -> f32 {
        if self.is_busy() {
            1.0 - self.progress()
        } else {
            0.0
        }
    }

    pub fn snapshot(&self) -> Option<WorkerStatus> {
        if !self.is_busy() {
            return None;
        }
        Some(WorkerStatus {
            kind: format!("{:?}", self.kind),
            status: self
                .status
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            progress: self.progress(),
            reusing: self.is_alternative(),
        })
    }
}

const THROUGHPUT_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct Window {
    started: Instant,
    bytes_at_start: u64,
    kib_per_sec: f64,
}

/// Bytes transferred in one run with a once-per-second rate estimate.
#[derive(Debug)]
pub struct ThroughputMeter {
    total: AtomicU64,
    window: Mutex<Window>,
}

impl Default for ThroughputMeter {
    fn default() -> Self {
        Self::new()
    }
}

impl ThroughputMeter {
    pub fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            window: Mutex::new(Window {
                started: Instant::now(),
                bytes_at_start: 0,
                kib_per_sec: 0.0,
            }),
        }
    }

    pub fn record(&self, bytes: u64) {
        let total = self.total.fetch_add(bytes, Ordering::Relaxed) + bytes;
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        let elapsed = window.started.elapsed();
        if elapsed >= THROUGHPUT_WINDOW {
            let delta = total.saturating_sub(window.bytes_at_start);
            window.kib_per_sec = delta as f64 / 1024.0 / elapsed.as_secs_f64();
            window.started = Instant::now();
            window.bytes_at_start = total;
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn kib_per_sec(&self) -> f64 {
        self.window
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .kib_per_sec
    }
}

/// Shared FIFO of pending work.
#[derive(Debug)]
pub struct WorkQueue<T> {
    items: Mutex<VecDeque<T>>,
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
        }
    }
}

impl<T> WorkQueue<T> {
    pub fn fill(&self, items: impl IntoIterator<Item = T>) {
        let mut queue = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        queue.clear();
        queue.extend(items);
    }

    pub fn pop(&self) -> Option<T> {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Run one worker per slot until the queue drains. The first error is
/// recorded on `state` and stops every other worker at its next check.
pub fn run_pool<T: Send>(
    slots: &[WorkerSlot],
    queue: &WorkQueue<T>,
    state: &TaskState,
    work: impl Fn(&WorkerSlot, T) -> Result<()> + Sync,
) {
    thread::scope(|s| {
        for slot in slots {
            let work = &work;
            s.spawn(move || {
                while !state.should_stop() {
                    let Some(item) = queue.pop() else {
                        break;
                    };
                    if let Err(e) = work(slot, item) {
                        state.fail(format!("{:#}", e));
                        break;
                    }
                }
                slot.idle();
            });
        }
    });
}

/// Done share of a pool phase: popped items minus what busy workers still
/// have left.
pub fn phase_fraction(total: usize, remaining: usize, slots: &[WorkerSlot]) -> f32 {
    if total == 0 {
        return 0.0;
    }
    let popped = total.saturating_sub(remaining) as f32;
    let unfinished: f32 = slots.iter().map(WorkerSlot::unfinished).sum();
    ((popped - unfinished) / total as f32).clamp(0.0, 1.0)
}

/// Copy `reader` into `writer` in chunks. `on_chunk` sees each chunk's length
/// and returns `false` to stop; `None` is returned when stopped.
pub fn copy_chunked(
    reader: &mut dyn Read,
    writer: &mut dyn Write,
    chunk_size: usize,
    mut on_chunk: impl FnMut(usize) -> bool,
) -> Result<Option<u64>> {
    let mut buf = vec![0u8; chunk_size];
    let mut copied = 0u64;
    loop {
        let n = reader.read(&mut buf).context("Failed to read stream")?;
        if n == 0 {
            return Ok(Some(copied));
        }
        writer.write_all(&buf[..n]).context("Failed to write stream")?;
        copied += n as u64;
        if !on_chunk(n) {
            return Ok(None);
        }
    }
}

/// Counts shared by the workers of one run.
#[derive(Debug, Default)]
pub struct RunCounters {
    pub downloaded: AtomicUsize,
    pub reused: AtomicUsize,
    pub refetched: AtomicUsize,
}

/// Everything a worker needs; borrowed for the duration of a phase.
pub struct WorkContext<'a> {
    pub fetcher: &'a dyn Fetcher,
    pub layout: &'a InstallLayout,
    pub remote: &'a RemoteLayout,
    pub registry: &'a ArchiveRegistry,
    pub version: &'a str,
    pub state: &'a TaskState,
    pub meter: &'a ThroughputMeter,
    pub counters: &'a RunCounters,
    /// Verify files already on disk and keep them when they match
    pub reuse_existing: bool,
    pub chunk_size: usize,
    /// How often open containers are synced during the package phase
    pub sync_interval: Duration,
}

impl WorkContext<'_> {
    pub fn sinks(&self) -> SinkFactory<'_> {
        SinkFactory {
            layout: self.layout,
            registry: self.registry,
            version: self.version,
        }
    }

    /// Download one entry into a fresh sink. Returns `false` if stopped.
    fn download(&self, slot: &WorkerSlot, entry: &FileEntry, progress: impl Fn(u64) -> f32) -> Result<bool> {
        let path = self.remote.file(entry);
        let mut body = self.fetcher.fetch(&path)?.into_success(&path)?;
        let mut sink = self.sinks().open(entry)?;

        let mut received = 0u64;
        let copied = copy_chunked(&mut body, &mut sink, self.chunk_size, |n| {
            received += n as u64;
            self.meter.record(n as u64);
            slot.set_progress(progress(received));
            !self.state.should_stop()
        })
        .with_context(|| format!("Failed to download {}", path))?;

        if copied.is_none() {
            return Ok(false);
        }
        sink.finish()?;
        self.counters.downloaded.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    /// Loose-file worker body.
    pub fn process_loose(&self, slot: &WorkerSlot, entry: FileEntry) -> Result<()> {
        slot.begin(&entry.name);
        let target = self.layout.file_path(&entry, self.version);

        if self.reuse_existing && target.is_file() {
            slot.set_alternative(true);
            let file = File::open(&target)
                .with_context(|| format!("Failed to open {}", target.display()))?;

            let mut checked = 0u64;
            let size = entry.size.max(1) as f32;
            let verdict = verify_stream(BufReader::new(file), &entry.checksum, |n| {
                checked += n as u64;
                slot.set_progress(checked as f32 / size);
                !self.state.should_stop()
            })?;

            match verdict {
                Verification::Match => {
                    debug!("Reusing {}", entry.path);
                    self.counters.reused.fetch_add(1, Ordering::Relaxed);
                    slot.set_progress(1.0);
                    return Ok(());
                }
                Verification::Interrupted => return Ok(()),
                Verification::Mismatch(actual) => {
                    warn!(
                        "Checksum mismatch for {} (expected {}, found {}), downloading",
                        entry.path, entry.checksum, actual
                    );
                    self.counters.refetched.fetch_add(1, Ordering::Relaxed);
                    slot.set_alternative(false);
                }
            }
        }

        let wire = entry.wire_size().max(1) as f32;
        self.download(slot, &entry, |received| received as f32 / wire)?;
        Ok(())
    }

    /// Archive-member worker body: one container generation per item.
    pub fn process_group(&self, slot: &WorkerSlot, group: VersionedGroup) -> Result<()> {
        slot.begin(&format!("Archive {}", group.release));
        let container = self.registry.get_or_open(group.release.as_str())?;
        let members = group.entries.len().max(1) as f32;

        for (index, entry) in group.entries.iter().enumerate() {
            if self.state.should_stop() {
                return Ok(());
            }
            let base = index as f32 / members;
            slot.set_alternative(false);
            slot.set_progress(base);

            if let Some(stored) = container.open_read(&entry.path)? {
                slot.set_alternative(true);
                let verdict = verify_stream(content_reader(entry.kind, stored), &entry.checksum, |_| {
                    !self.state.should_stop()
                })
                .with_context(|| format!("Failed to verify archive member {}", entry.path));

                match verdict {
                    Ok(Verification::Match) => {
                        debug!("Archive member {} already present", entry.path);
                        self.counters.reused.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    Ok(Verification::Interrupted) => return Ok(()),
                    Ok(Verification::Mismatch(actual)) => {
                        warn!(
                            "Archive member {} is stale (expected {}, found {}), refetching",
                            entry.path, entry.checksum, actual
                        );
                    }
                    Err(e) => {
                        warn!("Archive member {} is unreadable, refetching: {:#}", entry.path, e);
                    }
                }
                container.remove(&entry.path);
                self.counters.refetched.fetch_add(1, Ordering::Relaxed);
                slot.set_alternative(false);
            }

            let wire = entry.wire_size().max(1) as f32;
            let finished = self.download(slot, entry, |received| {
                base + (received as f32 / wire).min(1.0) / members
            })?;
            if !finished {
                return Ok(());
            }
        }
        Ok(())
    }
}
