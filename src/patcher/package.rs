//! Bulk download through packed blobs
//!
//! The origin also publishes each release as a few large blobs plus a packing
//! manifest saying where every file sits inside them. Candidates found there
//! are fetched with one ranged request per coalesced range, and each response
//! is split across the sinks of every entry it covers.

use super::ranges::{coalesce, total_span, ByteRange};
use super::sink::MemberSink;
use super::workers::{WorkContext, WorkerSlot};
use crate::error::PatchError;
use crate::manifest::{FileEntry, PackedLocation, PackingManifest};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How often open containers are synced while streaming.
pub const SYNC_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct PackedItem {
    pub entry: FileEntry,
    pub location: PackedLocation,
}

impl PackedItem {
    pub fn range(&self) -> ByteRange {
        ByteRange::new(self.location.offset, self.location.end())
    }
}

struct OpenSink {
    index: usize,
    sink: Box<dyn MemberSink>,
    written: u64,
}

/// Splits one blob's byte stream across the entries it contains.
///
/// `items` must be sorted by offset and the stream must be pushed in
/// ascending, non-overlapping pieces that cover every entry.
pub struct BlobDemux<'a, O> {
    items: &'a [PackedItem],
    cursor: usize,
    open: Vec<OpenSink>,
    opener: O,
    serviced: Vec<FileEntry>,
}

impl<'a, O> BlobDemux<'a, O>
where
    O: FnMut(&FileEntry) -> Result<Box<dyn MemberSink>>,
{
    pub fn new(items: &'a [PackedItem], opener: O) -> Self {
        Self {
            items,
            cursor: 0,
            open: Vec::new(),
            opener,
            serviced: Vec::new(),
        }
    }

    pub fn open_sinks(&self) -> usize {
        self.open.len()
    }

    /// Feed `buf`, which holds blob bytes `[off, off + buf.len())`.
    pub fn push(&mut self, off: u64, buf: &[u8]) -> Result<()> {
        let items = self.items;
        let end = off + buf.len() as u64;

        while let Some(item) = items.get(self.cursor) {
            let start = item.location.offset;
            let admit = start < end || (item.location.size == 0 && start <= end);
            if !admit {
                break;
            }
            if start < off {
                return Err(PatchError::structural(format!(
                    "Packed entry {} starts at {} before stream position {}",
                    item.entry.path, start, off
                ))
                .into());
            }
            let sink = (self.opener)(&item.entry)?;
            self.open.push(OpenSink {
                index: self.cursor,
                sink,
                written: 0,
            });
            self.cursor += 1;
        }

        let mut i = 0;
        while i < self.open.len() {
            let open = &mut self.open[i];
            let location = &items[open.index].location;

            let pos = location.offset + open.written;
            if pos < off {
                return Err(PatchError::structural(format!(
                    "Stream skipped bytes of packed entry at {}",
                    location.offset
                ))
                .into());
            }
            let hi = location.end().min(end);
            if hi > pos {
                let slice = &buf[(pos - off) as usize..(hi - off) as usize];
                open.sink
                    .write_all(slice)
                    .context("Failed to write packed entry")?;
                open.written += slice.len() as u64;
            }

            if open.written == location.size {
                let done = self.open.remove(i);
                self.complete(done)?;
            } else {
                i += 1;
            }
        }
        Ok(())
    }

    fn complete(&mut self, done: OpenSink) -> Result<()> {
        let items = self.items;
        let entry = &items[done.index].entry;
        match done.sink.finish() {
            Ok(()) => {
                self.serviced.push(entry.clone());
                Ok(())
            }
            Err(e) if matches!(e.downcast_ref::<PatchError>(), Some(PatchError::Integrity { .. })) => {
                warn!("Packed copy of {} failed verification: {}", entry.path, e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Close whatever is still open, discarding partial entries, and return
    /// the fully delivered ones.
    pub fn finish(mut self) -> Vec<FileEntry> {
        if !self.open.is_empty() {
            warn!(
                "{} packed entries were not fully delivered, they will be fetched individually",
                self.open.len()
            );
        }
        self.open.clear();
        self.serviced
    }
}

/// Candidates grouped per blob in first-seen order, each sorted by offset.
pub fn plan_blobs(
    packing: &PackingManifest,
    candidates: &[FileEntry],
    key: impl Fn(&FileEntry) -> String,
) -> Vec<(String, Vec<PackedItem>)> {
    let mut blobs: Vec<(String, Vec<PackedItem>)> = Vec::new();
    let mut by_name: HashMap<String, usize> = HashMap::new();

    for entry in candidates {
        let Some(location) = packing.locate(&key(entry)) else {
            continue;
        };
        if location.size != entry.wire_size() {
            warn!(
                "Packed size of {} is {}, manifest says {}; fetching individually",
                entry.path,
                location.size,
                entry.wire_size()
            );
            continue;
        }

        let slot = *by_name.entry(location.blob.clone()).or_insert_with(|| {
            blobs.push((location.blob.clone(), Vec::new()));
            blobs.len() - 1
        });
        blobs[slot].1.push(PackedItem {
            entry: entry.clone(),
            location: location.clone(),
        });
    }

    for (_, items) in &mut blobs {
        items.sort_by_key(|item| item.location.offset);
    }
    blobs
}

/// Fetch whatever the packing manifest covers. Returns the entries that were
/// fully written and verified.
pub fn run_package_phase(
    ctx: &WorkContext<'_>,
    candidates: &[FileEntry],
    slot: &WorkerSlot,
) -> Result<Vec<FileEntry>> {
    let manifest_path = ctx.remote.packing_manifest(ctx.version);
    let body = ctx
        .fetcher
        .fetch(&manifest_path)?
        .into_success(&manifest_path)?;
    let packing = PackingManifest::from_reader(body)?;

    let blobs = plan_blobs(&packing, candidates, |e| ctx.remote.packed_key(e));
    let plan: Vec<(String, Vec<PackedItem>, Vec<ByteRange>)> = blobs
        .into_iter()
        .map(|(blob, items)| {
            let ranges = coalesce(items.iter().map(PackedItem::range));
            (blob, items, ranges)
        })
        .collect();

    let packed: usize = plan.iter().map(|(_, items, _)| items.len()).sum();
    let total: u64 = plan.iter().map(|(_, _, ranges)| total_span(ranges)).sum();
    info!(
        "Package phase: {} of {} candidates in {} blobs, {} bytes",
        packed,
        candidates.len(),
        plan.len(),
        total
    );

    let sinks = ctx.sinks();
    let mut serviced = Vec::new();
    let mut delivered = 0u64;
    let mut last_sync = Instant::now();
    let mut buf = vec![0u8; ctx.chunk_size];

    for (blob, items, ranges) in &plan {
        slot.begin(blob);
        let path = ctx.remote.blob(ctx.version, blob);
        let mut demux = BlobDemux::new(items, |entry: &FileEntry| sinks.open(entry));

        for range in ranges {
            if range.span() == 0 {
                demux.push(range.min, &[])?;
                continue;
            }

            debug!("Fetching {} bytes {}..{}", blob, range.min, range.max);
            let mut body = ctx
                .fetcher
                .fetch_range(&path, range.min, range.last_byte())?
                .into_success(&path)?;

            let mut off = range.min;
            loop {
                let n = body
                    .read(&mut buf)
                    .with_context(|| format!("Failed to read {}", path))?;
                if n == 0 {
                    break;
                }
                if off + n as u64 > range.max {
                    return Err(PatchError::structural(format!(
                        "{} returned more than the requested {} bytes",
                        path,
                        range.span()
                    ))
                    .into());
                }

                demux.push(off, &buf[..n])?;
                off += n as u64;
                delivered += n as u64;
                ctx.meter.record(n as u64);
                slot.set_progress(delivered as f32 / total.max(1) as f32);

                if last_sync.elapsed() >= ctx.sync_interval {
                    ctx.registry.sync_all()?;
                    last_sync = Instant::now();
                }
                if ctx.state.should_stop() {
                    serviced.extend(demux.finish());
                    slot.idle();
                    return Ok(serviced);
                }
            }

            if off < range.max {
                warn!("{} ended {} bytes early", path, range.max - off);
            }
        }

        serviced.extend(demux.finish());
    }

    ctx.registry.sync_all()?;
    slot.idle();
    info!("Package phase serviced {} entries", serviced.len());
    Ok(serviced)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveRegistry;
    use crate::downloaders::{FetchResponse, Fetcher, RemoteLayout};
    use crate::hash::Checksum;
    use crate::manifest::FileKind;
    use crate::patcher::task::TaskState;
    use crate::patcher::workers::{RunCounters, ThroughputMeter, WorkerKind};
    use crate::paths::InstallLayout;
    use crate::testutil::{FixtureRelease, MemoryFetcher, RemoteFile};
    use std::io::{self, Write};
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    type Captured = Arc<Mutex<HashMap<String, Vec<u8>>>>;

    struct CaptureSink {
        path: String,
        data: Vec<u8>,
        out: Captured,
    }

    impl Write for CaptureSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.data.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl MemberSink for CaptureSink {
        fn finish(self: Box<Self>) -> Result<()> {
            let this = *self;
            this.out.lock().unwrap().insert(this.path, this.data);
            Ok(())
        }
    }

    fn capture(out: &Captured) -> impl FnMut(&FileEntry) -> Result<Box<dyn MemberSink>> + '_ {
        move |entry| {
            Ok(Box::new(CaptureSink {
                path: entry.path.clone(),
                data: Vec::new(),
                out: Arc::clone(out),
            }) as Box<dyn MemberSink>)
        }
    }

    fn item(path: &str, offset: u64, size: u64) -> PackedItem {
        PackedItem {
            entry: RemoteFile::new(path, "1", FileKind::LooseRaw, b"").entry(),
            location: PackedLocation {
                blob: "BIN".into(),
                offset,
                size,
            },
        }
    }

    fn blob_bytes(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    /// Drive a demux over coalesced ranges in fixed-size chunks.
    fn stream(items: &[PackedItem], blob: &[u8], chunk: usize) -> Result<HashMap<String, Vec<u8>>> {
        let out: Captured = Arc::default();
        let mut demux = BlobDemux::new(items, capture(&out));
        for range in coalesce(items.iter().map(PackedItem::range)) {
            let bytes = &blob[range.min as usize..range.max as usize];
            if bytes.is_empty() {
                demux.push(range.min, &[])?;
            }
            for (i, piece) in bytes.chunks(chunk).enumerate() {
                demux.push(range.min + (i * chunk) as u64, piece)?;
            }
        }
        let serviced = demux.finish();
        assert_eq!(serviced.len(), items.len());
        let captured = out.lock().unwrap().clone();
        Ok(captured)
    }

    #[test]
    fn test_single_chunk_feeds_interleaved_entries() -> Result<()> {
        let blob = blob_bytes(300);
        let items = vec![item("a", 0, 80), item("b", 80, 40), item("c", 130, 90)];

        let out: Captured = Arc::default();
        let mut demux = BlobDemux::new(&items, capture(&out));
        demux.push(0, &blob)?;
        assert_eq!(demux.open_sinks(), 0);
        assert_eq!(demux.finish().len(), 3);

        let out = out.lock().unwrap();
        assert_eq!(out["a"], blob[0..80]);
        assert_eq!(out["b"], blob[80..120]);
        assert_eq!(out["c"], blob[130..220]);
        Ok(())
    }

    #[test]
    fn test_output_independent_of_chunk_size() -> Result<()> {
        let blob = blob_bytes(1000);
        let items = vec![
            item("a", 0, 80),
            item("b", 80, 40),
            item("inner", 90, 10),
            item("empty", 125, 0),
            item("c", 130, 90),
            item("d", 500, 499),
        ];

        let reference = stream(&items, &blob, 1000)?;
        for chunk in [1, 3, 7, 64, 333] {
            assert_eq!(stream(&items, &blob, chunk)?, reference, "chunk {}", chunk);
        }
        assert_eq!(reference["inner"], blob[90..100]);
        assert!(reference["empty"].is_empty());
        assert_eq!(reference["d"], blob[500..999]);
        Ok(())
    }

    #[test]
    fn test_short_stream_leaves_entry_unserviced() -> Result<()> {
        let blob = blob_bytes(100);
        let items = vec![item("a", 0, 50), item("b", 50, 50)];
        let out: Captured = Arc::default();
        let mut demux = BlobDemux::new(&items, capture(&out));
        demux.push(0, &blob[..70])?;
        assert_eq!(demux.open_sinks(), 1);

        let serviced = demux.finish();
        assert_eq!(serviced.len(), 1);
        assert_eq!(serviced[0].path, "a");
        assert!(!out.lock().unwrap().contains_key("b"));
        Ok(())
    }

    #[test]
    fn test_skipped_start_is_structural() {
        let items = vec![item("a", 10, 5)];
        let out: Captured = Arc::default();
        let mut demux = BlobDemux::new(&items, capture(&out));
        let err = demux.push(12, &[0u8; 10]).unwrap_err();
        assert!(matches!(err.downcast_ref::<PatchError>(), Some(PatchError::Structural(_))));
    }

    #[test]
    fn test_plan_groups_blobs_in_first_seen_order() -> Result<()> {
        let release = FixtureRelease::new(
            "client",
            "0.0.0.2",
            vec![
                RemoteFile::new("x", "0.0.0.2", FileKind::LooseRaw, b"xxxx"),
                RemoteFile::new("y", "0.0.0.2", FileKind::LooseRaw, b"yy"),
            ],
        );
        let remote = RemoteLayout::new("client");
        let packing = PackingManifest::parse(&format!(
            "PKG1\n{},BIN_B,10,4\n{},BIN_A,0,2\n",
            remote.packed_key(&release.files[0].entry()),
            remote.packed_key(&release.files[1].entry()),
        ))?;

        let candidates: Vec<FileEntry> = release.files.iter().map(RemoteFile::entry).collect();
        let plan = plan_blobs(&packing, &candidates, |e| remote.packed_key(e));
        let order: Vec<&str> = plan.iter().map(|(b, _)| b.as_str()).collect();
        assert_eq!(order, vec!["BIN_B", "BIN_A"]);
        Ok(())
    }

    struct Env {
        _tmp: TempDir,
        fetcher: MemoryFetcher,
        layout: InstallLayout,
        remote: RemoteLayout,
        registry: ArchiveRegistry,
        state: TaskState,
        meter: ThroughputMeter,
        counters: RunCounters,
    }

    impl Env {
        fn new() -> Result<Self> {
            let tmp = TempDir::new()?;
            let layout = InstallLayout::new(tmp.path(), "client");
            Ok(Self {
                registry: ArchiveRegistry::new(layout.clone()),
                layout,
                _tmp: tmp,
                fetcher: MemoryFetcher::new(),
                remote: RemoteLayout::new("client"),
                state: TaskState::new(),
                meter: ThroughputMeter::new(),
                counters: RunCounters::default(),
            })
        }

        fn ctx<'a>(&'a self, fetcher: &'a dyn Fetcher) -> WorkContext<'a> {
            WorkContext {
                fetcher,
                layout: &self.layout,
                remote: &self.remote,
                registry: &self.registry,
                version: "0.0.0.2",
                state: &self.state,
                meter: &self.meter,
                counters: &self.counters,
                reuse_existing: false,
                chunk_size: 16,
                sync_interval: SYNC_INTERVAL,
            }
        }
    }

    fn fixture() -> FixtureRelease {
        FixtureRelease::new(
            "client",
            "0.0.0.2",
            vec![
                RemoteFile::new("DATA/a.cfg", "0.0.0.2", FileKind::LooseCompressed, &b"alpha ".repeat(40)),
                RemoteFile::new("DATA/b.skn", "0.0.0.1", FileKind::CompressedArchiveMember, &b"beta".repeat(30)),
                RemoteFile::new("DATA/c.dds", "0.0.0.1", FileKind::UncompressedArchiveMember, &b"gamma".repeat(25)),
                RemoteFile::new("game.exe", "0.0.0.2", FileKind::LooseRaw, b"MZ"),
            ],
        )
    }

    #[test]
    fn test_package_phase_installs_packed_entries() -> Result<()> {
        let env = Env::new()?;
        let release = fixture();
        release.publish(&env.fetcher);
        release.publish_package(&env.fetcher, "BIN_0", &["DATA/a.cfg", "DATA/b.skn", "DATA/c.dds"], 13);

        let candidates: Vec<FileEntry> = release.files.iter().map(RemoteFile::entry).collect();
        let slot = WorkerSlot::new(WorkerKind::Package);
        env.fetcher.clear_requests();
        let serviced = run_package_phase(&env.ctx(&env.fetcher), &candidates, &slot)?;

        let mut paths: Vec<&str> = serviced.iter().map(|e| e.path.as_str()).collect();
        paths.sort();
        assert_eq!(paths, vec!["DATA/a.cfg", "DATA/b.skn", "DATA/c.dds"]);

        // One manifest request and one ranged request for the contiguous run
        assert_eq!(env.fetcher.requests().len(), 2);

        let cfg = std::fs::read(env.layout.file_path(&candidates[0], "0.0.0.2"))?;
        assert_eq!(cfg, release.files[0].content);

        let container = env.registry.get_or_open("0.0.0.1")?;
        let mut dds = Vec::new();
        container.open_read("DATA/c.dds")?.unwrap().read_to_end(&mut dds)?;
        assert_eq!(Checksum::of(&dds), candidates[2].checksum);
        assert!(!slot.is_busy());
        Ok(())
    }

    #[test]
    fn test_wrong_packing_header_fails() -> Result<()> {
        let env = Env::new()?;
        let release = fixture();
        release.publish(&env.fetcher);
        env.fetcher
            .insert(&env.remote.packing_manifest("0.0.0.2"), b"PKG0\n".to_vec());

        let slot = WorkerSlot::new(WorkerKind::Package);
        let candidates: Vec<FileEntry> = release.files.iter().map(RemoteFile::entry).collect();
        let err = run_package_phase(&env.ctx(&env.fetcher), &candidates, &slot).unwrap_err();
        assert!(matches!(err.downcast_ref::<PatchError>(), Some(PatchError::Structural(_))));
        Ok(())
    }

    /// Origin that answers range requests with the whole file.
    struct IgnoresRanges<'a>(&'a MemoryFetcher);

    impl Fetcher for IgnoresRanges<'_> {
        fn fetch(&self, path: &str) -> Result<FetchResponse> {
            self.0.fetch(path)
        }
        fn fetch_range(&self, path: &str, _start: u64, _end: u64) -> Result<FetchResponse> {
            self.0.fetch(path)
        }
    }

    #[test]
    fn test_oversized_response_is_fatal() -> Result<()> {
        let env = Env::new()?;
        let release = fixture();
        release.publish(&env.fetcher);
        release.publish_package(&env.fetcher, "BIN_0", &["DATA/a.cfg"], 0);
        // Trailing bytes past the packed entry
        let blob_path = env.remote.blob("0.0.0.2", "BIN_0");
        let mut blob = release.files[0].wire_bytes();
        blob.extend_from_slice(&[0u8; 64]);
        env.fetcher.insert(&blob_path, blob);

        let slot = WorkerSlot::new(WorkerKind::Package);
        let candidates = vec![release.files[0].entry()];
        let fetcher = IgnoresRanges(&env.fetcher);
        let err = run_package_phase(&env.ctx(&fetcher), &candidates, &slot).unwrap_err();
        assert!(err.to_string().contains("more than the requested"));
        Ok(())
    }

    /// Origin whose range bodies report what the archive index on disk
    /// holds each time they are read.
    struct WatchesIndex<'a> {
        inner: &'a MemoryFetcher,
        index: std::path::PathBuf,
        seen: Arc<Mutex<Vec<Vec<String>>>>,
    }

    struct WatchedBody {
        body: Box<dyn Read + Send>,
        index: std::path::PathBuf,
        seen: Arc<Mutex<Vec<Vec<String>>>>,
    }

    impl Read for WatchedBody {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let paths = match std::fs::read(&self.index) {
                Ok(bytes) => crate::archive::format::IndexFile::decode(&bytes)
                    .map(|index| index.records.into_iter().map(|r| r.path).collect())
                    .unwrap_or_default(),
                Err(_) => Vec::new(),
            };
            self.seen.lock().unwrap().push(paths);
            self.body.read(buf)
        }
    }

    impl Fetcher for WatchesIndex<'_> {
        fn fetch(&self, path: &str) -> Result<FetchResponse> {
            self.inner.fetch(path)
        }
        fn fetch_range(&self, path: &str, start: u64, end: u64) -> Result<FetchResponse> {
            let response = self.inner.fetch_range(path, start, end)?;
            Ok(FetchResponse {
                status: response.status,
                body: Box::new(WatchedBody {
                    body: response.body,
                    index: self.index.clone(),
                    seen: Arc::clone(&self.seen),
                }),
            })
        }
    }

    #[test]
    fn test_index_is_synced_while_member_is_open() -> Result<()> {
        let env = Env::new()?;
        let release = fixture();
        release.publish(&env.fetcher);
        release.publish_package(&env.fetcher, "BIN_0", &["DATA/c.dds"], 0);

        let fetcher = WatchesIndex {
            inner: &env.fetcher,
            index: env.layout.archive_dir("0.0.0.1").join("Archive_1.raf"),
            seen: Arc::default(),
        };
        let mut ctx = env.ctx(&fetcher);
        ctx.sync_interval = Duration::ZERO;

        let slot = WorkerSlot::new(WorkerKind::Package);
        let candidates = vec![release.files[2].entry()];
        let serviced = run_package_phase(&ctx, &candidates, &slot)?;
        assert_eq!(serviced.len(), 1);

        // 125 bytes in 16-byte chunks: the member stays open for several reads
        let seen = fetcher.seen.lock().unwrap();
        assert!(seen.len() > 2);
        assert!(seen[0].is_empty());
        assert_eq!(seen[1], vec!["DATA/c.dds".to_string()]);
        Ok(())
    }
}
