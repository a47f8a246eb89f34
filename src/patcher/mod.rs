//! Patch orchestrator
//!
//! Drives one release update through its phases:
//! marker check, release directory preparation, manifest download, candidate
//! selection, the opportunistic package phase, the loose-file and
//! archive-member pools, container close, managed-file cleanup and finally the
//! completion marker. Phases are strict barriers; an error recorded by any
//! worker stops the run at the next one.

pub mod compact;
pub mod config;
pub mod diff;
pub mod package;
pub mod ranges;
pub mod sink;
pub mod task;
pub mod workers;

pub use compact::{ArchiveCompactor, CompactOutcome};
pub use config::{ConfigError, EntryFilter, PatchConfig};
pub use task::{run_task, PatchTask, Task, TaskState};
pub use workers::{ThroughputMeter, WorkerStatus};

use crate::archive::ArchiveRegistry;
use crate::downloaders::{resolve_release, Fetcher, HttpFetcher, RemoteLayout};
use crate::error::PatchError;
use crate::manifest::{group_by_release, FileEntry, ReleaseId, ReleaseManifest, VersionedGroup};
use crate::paths::InstallLayout;
use anyhow::{bail, Context, Result};
use diff::DiffInput;
use std::collections::HashSet;
use std::fs;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tracing::{debug, info, warn};
use walkdir::WalkDir;
use workers::{phase_fraction, run_pool, RunCounters, WorkContext, WorkQueue, WorkerKind, WorkerSlot};

fn current_rss_kb() -> Option<u64> {
    let status = fs::read_to_string("/proc/self/status").ok()?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            let kb = rest.split_whitespace().next()?.parse::<u64>().ok()?;
            return Some(kb);
        }
    }
    None
}

pub(crate) fn log_phase_metrics(phase: &str, started: Instant) {
    let elapsed_ms = started.elapsed().as_millis();
    let rss_kb = current_rss_kb().unwrap_or(0);
    info!(
        "Phase done: phase='{}' elapsed_ms={} rss_kb={}",
        phase, elapsed_ms, rss_kb
    );
}

/// Outcome of a patch run
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct PatchSummary {
    pub project: String,
    pub version: String,
    /// Completion marker was already present, nothing was done
    pub up_to_date: bool,
    pub candidates: usize,
    /// Entries delivered by the package phase
    pub packaged: usize,
    pub loose_files: usize,
    pub archive_groups: usize,
    pub archive_members: usize,
    pub downloaded: usize,
    pub reused: usize,
    pub refetched: usize,
    pub bytes_transferred: u64,
    pub managed_dirs_removed: usize,
    pub bytes_freed: u64,
    pub cancelled: bool,
    pub elapsed_ms: u64,
}

/// State of the release directory after preparation.
#[derive(Debug, Default)]
struct Prepared {
    previous: Option<ReleaseManifest>,
    /// Previous directory was left unfinished; verify everything on disk
    force_single: bool,
}

#[derive(Debug, Default)]
struct Progress {
    loose_total: AtomicUsize,
    archive_total: AtomicUsize,
    /// f32 bits
    loose_weight: AtomicU32,
    archive_weight: AtomicU32,
    package_active: AtomicBool,
    complete: AtomicBool,
}

/// Updates one project to one release.
pub struct ReleasePatcher {
    config: PatchConfig,
    fetcher: Arc<dyn Fetcher>,
    layout: InstallLayout,
    remote: RemoteLayout,
    registry: ArchiveRegistry,
    state: Arc<TaskState>,
    meter: Arc<ThroughputMeter>,
    counters: RunCounters,
    diff_slot: WorkerSlot,
    package_slot: WorkerSlot,
    loose_slots: Vec<WorkerSlot>,
    archive_slots: Vec<WorkerSlot>,
    loose_queue: WorkQueue<FileEntry>,
    archive_queue: WorkQueue<VersionedGroup>,
    progress: Progress,
    summary: Mutex<PatchSummary>,
}

impl ReleasePatcher {
    pub fn new(config: PatchConfig, fetcher: Arc<dyn Fetcher>) -> Result<Self> {
        config.validate()?;
        let layout = InstallLayout::new(&config.root, &config.project);

        Ok(Self {
            remote: RemoteLayout::new(&config.project),
            registry: ArchiveRegistry::new(layout.clone()),
            layout,
            fetcher,
            state: Arc::new(TaskState::new()),
            meter: Arc::new(ThroughputMeter::new()),
            counters: RunCounters::default(),
            diff_slot: WorkerSlot::new(WorkerKind::Difference),
            package_slot: WorkerSlot::new(WorkerKind::Package),
            loose_slots: (0..config.workers)
                .map(|_| WorkerSlot::new(WorkerKind::LooseFile))
                .collect(),
            archive_slots: (0..config.workers)
                .map(|_| WorkerSlot::new(WorkerKind::ArchiveMember))
                .collect(),
            loose_queue: WorkQueue::default(),
            archive_queue: WorkQueue::default(),
            progress: Progress::default(),
            summary: Mutex::new(PatchSummary {
                project: config.project.clone(),
                ..Default::default()
            }),
            config,
        })
    }

    /// Patcher talking HTTP to the configured origin.
    pub fn with_http(config: PatchConfig) -> Result<Self> {
        let fetcher = HttpFetcher::new(&config.origin, &config.branch)?;
        Self::new(config, Arc::new(fetcher))
    }

    pub fn layout(&self) -> &InstallLayout {
        &self.layout
    }

    /// Shared handle for cancelling from another thread.
    pub fn state_handle(&self) -> Arc<TaskState> {
        Arc::clone(&self.state)
    }

    pub fn meter(&self) -> Arc<ThroughputMeter> {
        Arc::clone(&self.meter)
    }

    pub fn summary(&self) -> PatchSummary {
        self.summary
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Busy workers across all pools.
    pub fn workers(&self) -> Vec<WorkerStatus> {
        [&self.diff_slot, &self.package_slot]
            .into_iter()
            .chain(self.loose_slots.iter())
            .chain(self.archive_slots.iter())
            .filter_map(WorkerSlot::snapshot)
            .collect()
    }

    fn record(&self, update: impl FnOnce(&mut PatchSummary)) {
        update(&mut self.summary.lock().unwrap_or_else(PoisonError::into_inner));
    }

    fn resolve_version(&self) -> Result<ReleaseId> {
        match &self.config.version {
            Some(version) => ReleaseId::parse(version),
            None => {
                let version = resolve_release(self.fetcher.as_ref(), &self.config.project)?;
                info!("Resolved {} to release {}", self.config.project, version);
                Ok(version)
            }
        }
    }

    fn download_manifest(&self, version: &str) -> Result<String> {
        let path = self.remote.release_manifest(version);
        let mut body = self.fetcher.fetch(&path)?.into_success(&path)?;
        let mut text = String::new();
        body.read_to_string(&mut text)
            .with_context(|| format!("Failed to read release manifest: {}", path))?;
        Ok(text)
    }

    fn load_saved_manifest(&self, version: &str) -> Option<ReleaseManifest> {
        let path = self.layout.saved_manifest(version);
        if !path.is_file() {
            return None;
        }
        match fs::read_to_string(&path)
            .map_err(anyhow::Error::from)
            .and_then(|text| ReleaseManifest::parse(&text))
        {
            Ok(manifest) => Some(manifest),
            Err(e) => {
                warn!("Ignoring unreadable saved manifest {}: {:#}", path.display(), e);
                None
            }
        }
    }

    /// Rename the newest installed release directory to `version` and work
    /// out what can be trusted in it.
    fn prepare_release_dir(&self, version: &ReleaseId) -> Result<Prepared> {
        let v = version.as_str();
        let target = self.layout.release_dir(v);
        let newest = self.layout.newest_release_dir()?;

        if let Some(newest) = &newest {
            if newest.as_str() != v {
                let old = self.layout.release_dir(newest.as_str());
                if target.exists() {
                    return Err(PatchError::structural(format!(
                        "Cannot move {} to {}: target already exists",
                        old.display(),
                        target.display()
                    ))
                    .into());
                }
                fs::rename(&old, &target).with_context(|| {
                    format!("Failed to move {} to {}", old.display(), target.display())
                })?;
                info!("Moved release directory {} -> {}", newest, v);
            }
        }
        fs::create_dir_all(&target)
            .with_context(|| format!("Failed to create {}", target.display()))?;

        let Some(newest) = newest else {
            return Ok(Prepared::default());
        };

        let mut prepared = Prepared::default();
        let marker = self.layout.marker(v);
        match read_marker(&marker)? {
            Some(marked) => {
                if !(self.config.ignore_marker && marked == v) {
                    fs::remove_file(&marker)
                        .with_context(|| format!("Failed to remove {}", marker.display()))?;
                    debug!("Removed completion marker of release {}", marked);
                }
                prepared.previous = self.load_saved_manifest(v);
                if prepared.previous.is_none() {
                    warn!("Release {} has no saved manifest, verifying existing files", newest);
                    prepared.force_single = true;
                }
            }
            None => {
                warn!("Release {} was not completed, verifying existing files", newest);
                prepared.force_single = true;
            }
        }
        Ok(prepared)
    }

    fn context<'a>(&'a self, version: &'a str, reuse_existing: bool) -> WorkContext<'a> {
        WorkContext {
            fetcher: self.fetcher.as_ref(),
            layout: &self.layout,
            remote: &self.remote,
            registry: &self.registry,
            version,
            state: &self.state,
            meter: self.meter.as_ref(),
            counters: &self.counters,
            reuse_existing,
            chunk_size: self.config.chunk_size,
            sync_interval: package::SYNC_INTERVAL,
        }
    }

    fn build_candidates(
        &self,
        ctx: &WorkContext<'_>,
        manifest: &ReleaseManifest,
        previous: Option<&ReleaseManifest>,
        forced: bool,
    ) -> Result<Vec<FileEntry>> {
        let filter = self.config.filter()?;

        if forced {
            let all: Vec<FileEntry> = manifest
                .entries()
                .iter()
                .filter(|e| filter.accepts(e))
                .cloned()
                .collect();
            info!("Verifying all {} entries", all.len());
            return Ok(all);
        }

        self.diff_slot.begin("Comparing manifests");
        let input = DiffInput {
            current: manifest,
            previous,
            filter: &filter,
            layout: &self.layout,
            registry: &self.registry,
            version: ctx.version,
        };
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        let diffed = diff::compute_candidates(&input, parallelism);
        self.diff_slot.idle();
        let mut candidates = diffed?;
        info!(
            "{} of {} entries need patching",
            candidates.len(),
            manifest.len()
        );

        if candidates.is_empty() || self.state.should_stop() {
            return Ok(candidates);
        }

        let phase = Instant::now();
        self.state.set_status("Downloading packages");
        self.progress.package_active.store(true, Ordering::Relaxed);
        let packaged = package::run_package_phase(ctx, &candidates, &self.package_slot);
        self.progress.package_active.store(false, Ordering::Relaxed);
        self.package_slot.idle();

        match packaged {
            Ok(serviced) => {
                let done: HashSet<&str> = serviced.iter().map(|e| e.path.as_str()).collect();
                candidates.retain(|e| !done.contains(e.path.as_str()));
                self.record(|s| s.packaged = serviced.len());
            }
            Err(e) => {
                warn!("Package download failed, falling back to single files: {:#}", e);
            }
        }
        log_phase_metrics("Packages", phase);
        Ok(candidates)
    }

    /// Stop at a barrier if a worker failed.
    fn check_barrier(&self) -> Result<()> {
        if let Some(message) = self.state.error() {
            bail!("{}", message);
        }
        Ok(())
    }

    fn collect_managed(&self, manifest: &ReleaseManifest) -> Result<(usize, u64)> {
        let root = self.layout.managed_root();
        if !root.is_dir() {
            return Ok((0, 0));
        }

        let keep = manifest.managed_releases();
        let mut removed = 0;
        let mut freed = 0u64;
        for entry in fs::read_dir(&root)
            .with_context(|| format!("Failed to list {}", root.display()))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if keep.contains(name.as_str()) {
                continue;
            }

            let dir = entry.path();
            let bytes: u64 = WalkDir::new(&dir)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .filter_map(|e| e.metadata().ok())
                .map(|m| m.len())
                .sum();
            fs::remove_dir_all(&dir)
                .with_context(|| format!("Failed to remove {}", dir.display()))?;
            info!("Removed managed files of release {} ({} bytes)", name, bytes);
            removed += 1;
            freed += bytes;
        }
        Ok((removed, freed))
    }

    fn write_marker(&self, version: &str, manifest_text: &str) -> Result<()> {
        let saved = self.layout.saved_manifest(version);
        fs::write(&saved, manifest_text)
            .with_context(|| format!("Failed to save {}", saved.display()))?;

        let marker = self.layout.marker(version);
        fs::write(
            &marker,
            format!("{}\n{}\n", version, chrono::Utc::now().to_rfc3339()),
        )
        .with_context(|| format!("Failed to write {}", marker.display()))?;
        info!("Release {} complete", version);
        Ok(())
    }

    fn patch(&self) -> Result<()> {
        let version = self.resolve_version()?;
        let v = version.as_str();
        self.record(|s| s.version = v.to_string());
        info!("=== Patching {} to release {} ===", self.config.project, v);

        if !self.config.ignore_marker && read_marker(&self.layout.marker(v))?.as_deref() == Some(v) {
            info!("Release {} is already installed", v);
            self.record(|s| s.up_to_date = true);
            return Ok(());
        }

        let phase = Instant::now();
        self.state.set_status("Preparing release directory");
        let prepared = self.prepare_release_dir(&version)?;
        log_phase_metrics("Prepare", phase);

        let phase = Instant::now();
        self.state.set_status("Downloading release manifest");
        let manifest_text = self.download_manifest(v)?;
        let manifest = ReleaseManifest::parse(&manifest_text)
            .with_context(|| format!("Invalid release manifest for {}", v))?;
        info!("Release manifest lists {} entries", manifest.len());

        let forced = self.config.force || prepared.force_single;
        let ctx = self.context(v, forced);
        self.state.set_status("Comparing releases");
        let candidates = self.build_candidates(&ctx, &manifest, prepared.previous.as_ref(), forced)?;
        log_phase_metrics("Candidates", phase);
        if self.state.should_stop() {
            return Ok(());
        }

        let (members, loose): (Vec<_>, Vec<_>) =
            candidates.into_iter().partition(|e| e.kind.is_archive());
        let member_count = members.len();
        let mut groups = group_by_release(members);
        groups.sort_by_key(|g| std::cmp::Reverse(g.entries.len()));

        let units = (loose.len() + member_count).max(1) as f32;
        self.progress
            .loose_weight
            .store((loose.len() as f32 / units).to_bits(), Ordering::Relaxed);
        self.progress
            .archive_weight
            .store((member_count as f32 / units).to_bits(), Ordering::Relaxed);
        self.record(|s| {
            s.candidates = s.packaged + loose.len() + member_count;
            s.loose_files = loose.len();
            s.archive_groups = groups.len();
            s.archive_members = member_count;
        });

        let phase = Instant::now();
        info!("Loose files: {}", loose.len());
        self.state.set_status("Downloading files");
        self.progress.loose_total.store(loose.len(), Ordering::Relaxed);
        self.loose_queue.fill(loose);
        run_pool(&self.loose_slots, &self.loose_queue, &self.state, |slot, entry| {
            ctx.process_loose(slot, entry)
        });
        log_phase_metrics("Loose files", phase);
        self.check_barrier()?;
        if self.state.should_stop() {
            return Ok(());
        }

        let phase = Instant::now();
        info!("Archive members: {} in {} archives", member_count, groups.len());
        self.state.set_status("Updating archives");
        self.progress.archive_total.store(groups.len(), Ordering::Relaxed);
        self.archive_queue.fill(groups);
        run_pool(&self.archive_slots, &self.archive_queue, &self.state, |slot, group| {
            ctx.process_group(slot, group)
        });
        log_phase_metrics("Archives", phase);
        self.check_barrier()?;
        if self.state.should_stop() {
            return Ok(());
        }

        self.state.set_status("Closing archives");
        self.registry.close_all()?;

        let phase = Instant::now();
        let (removed, freed) = self.collect_managed(&manifest)?;
        self.record(|s| {
            s.managed_dirs_removed = removed;
            s.bytes_freed = freed;
        });
        log_phase_metrics("Cleanup", phase);

        if self.state.should_stop() {
            return Ok(());
        }
        self.write_marker(v, &manifest_text)
    }

    /// Entries that would be patched, without touching the installation.
    pub fn preview(&self) -> Result<Vec<FileEntry>> {
        let version = self.resolve_version()?;
        let manifest = ReleaseManifest::parse(&self.download_manifest(version.as_str())?)?;
        let filter = self.config.filter()?;

        let (previous, installed) = match self.layout.newest_release_dir()? {
            Some(id) => {
                let marked = read_marker(&self.layout.marker(id.as_str()))?.is_some();
                let previous = if marked {
                    self.load_saved_manifest(id.as_str())
                } else {
                    None
                };
                (previous, id.as_str().to_string())
            }
            None => (None, version.as_str().to_string()),
        };

        let input = DiffInput {
            current: &manifest,
            previous: previous.as_ref(),
            filter: &filter,
            layout: &self.layout,
            registry: &self.registry,
            version: &installed,
        };
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        diff::compute_candidates(&input, parallelism)
    }
}

/// Version named on the first line of a completion marker.
fn read_marker(path: &Path) -> Result<Option<String>> {
    if !path.is_file() {
        return Ok(None);
    }
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read marker {}", path.display()))?;
    Ok(text.lines().next().map(|l| l.trim().to_string()))
}

impl PatchTask for ReleasePatcher {
    fn name(&self) -> &'static str {
        "patch"
    }

    fn state(&self) -> &TaskState {
        &self.state
    }

    fn percentage(&self) -> f32 {
        let p = &self.progress;
        if p.complete.load(Ordering::Relaxed) {
            return 100.0;
        }

        let package = if p.package_active.load(Ordering::Relaxed) {
            self.package_slot.progress() * 100.0
        } else {
            0.0
        };
        let loose = phase_fraction(
            p.loose_total.load(Ordering::Relaxed),
            self.loose_queue.len(),
            &self.loose_slots,
        );
        let archive = phase_fraction(
            p.archive_total.load(Ordering::Relaxed),
            self.archive_queue.len(),
            &self.archive_slots,
        );
        let weighted = loose * f32::from_bits(p.loose_weight.load(Ordering::Relaxed))
            + archive * f32::from_bits(p.archive_weight.load(Ordering::Relaxed));
        (weighted * 100.0 + package).clamp(0.0, 100.0)
    }

    fn throughput_kib(&self) -> Option<f64> {
        Some(self.meter.kib_per_sec())
    }

    fn run(&self) -> Result<()> {
        let started = Instant::now();
        let result = self.patch();

        // Keep whatever was written usable even when the run stopped early
        if let Err(e) = self.registry.close_all() {
            warn!("Failed to close archives: {:#}", e);
        }

        let cancelled = self.state.is_cancelled();
        self.record(|s| {
            s.downloaded = self.counters.downloaded.load(Ordering::Relaxed);
            s.reused = self.counters.reused.load(Ordering::Relaxed);
            s.refetched = self.counters.refetched.load(Ordering::Relaxed);
            s.bytes_transferred = self.meter.total_bytes();
            s.cancelled = cancelled;
            s.elapsed_ms = started.elapsed().as_millis() as u64;
        });

        if result.is_ok() && !cancelled && self.state.error().is_none() {
            self.progress.complete.store(true, Ordering::Relaxed);
            self.state.finish();
        }
        if cancelled {
            info!("Patch cancelled");
        }
        result
    }
}
