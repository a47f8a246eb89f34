//! Archive compaction
//!
//! Replacing or dropping members leaves dead bytes in a container's data
//! file. Compaction copies the members the installed manifest still names
//! into a fresh container under `<dir>/temp/` and swaps it in.

use super::task::{PatchTask, TaskState};
use super::workers::copy_chunked;
use super::log_phase_metrics;
use crate::archive::{ArchiveContainer, ContainerFiles};
use crate::error::PatchError;
use crate::manifest::{ReleaseManifest, VersionedGroup};
use crate::paths::InstallLayout;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

pub const TEMP_DIR: &str = "temp";

/// Outcome for one container.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub enum CompactOutcome {
    AlreadyCompact,
    Rewritten { members: usize, reclaimed: u64 },
    Removed,
    Interrupted,
}

pub struct ArchiveCompactor {
    layout: InstallLayout,
    version: String,
    chunk_size: usize,
    state: TaskState,
    total: AtomicU64,
    done: AtomicU64,
}

impl ArchiveCompactor {
    pub fn new(layout: InstallLayout, version: impl Into<String>, chunk_size: usize) -> Self {
        Self {
            layout,
            version: version.into(),
            chunk_size: chunk_size.max(1),
            state: TaskState::new(),
            total: AtomicU64::new(0),
            done: AtomicU64::new(0),
        }
    }

    fn installed_manifest(&self) -> Result<ReleaseManifest> {
        let path = self.layout.saved_manifest(&self.version);
        if !path.is_file() {
            return Err(PatchError::repair(
                self.layout.release_dir(&self.version),
                "no saved release manifest",
            )
            .into());
        }
        let text = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        ReleaseManifest::parse(&text)
    }

    /// Compact every container referenced by the installed manifest.
    pub fn compact_all(&self) -> Result<Vec<(String, CompactOutcome)>> {
        let manifest = self.installed_manifest()?;
        let groups = manifest.archive_groups();
        self.total
            .store(groups.iter().map(VersionedGroup::stored_size).sum(), Ordering::Relaxed);

        let mut outcomes = Vec::new();
        for group in &groups {
            if self.state.should_stop() {
                break;
            }
            self.state
                .set_status(format!("Compacting archive {}", group.release));
            let outcome = self.compact_group(group)?;
            info!("Archive {}: {:?}", group.release, outcome);
            outcomes.push((group.release.to_string(), outcome));
        }
        Ok(outcomes)
    }

    /// Rewrite one container so it holds exactly the group's members.
    pub fn compact_group(&self, group: &VersionedGroup) -> Result<CompactOutcome> {
        let dir = self.layout.archive_dir(group.release.as_str());
        let files = ContainerFiles::locate(&dir)?;
        let source = ArchiveContainer::open(files.clone())?;

        let expected_len = group.stored_size();
        let data_len = source.data_len()?;
        if data_len == expected_len && source.len() == group.entries.len() {
            debug!("Archive {} is already compact", group.release);
            self.done.fetch_add(expected_len, Ordering::Relaxed);
            return Ok(CompactOutcome::AlreadyCompact);
        }

        let temp = dir.join(TEMP_DIR);
        if temp.exists() {
            debug!("Removing leftover {}", temp.display());
            fs::remove_dir_all(&temp)
                .with_context(|| format!("Failed to clear {}", temp.display()))?;
        }
        let index_name = files
            .index
            .file_name()
            .context("Archive index has no file name")?;
        let target = ArchiveContainer::create(temp.join(index_name))?;

        let mut copied = 0usize;
        for entry in &group.entries {
            let Some(stored) = source.entry(&entry.path) else {
                debug!("{} not in archive {}, skipping", entry.path, group.release);
                continue;
            };
            let Some(mut reader) = source.open_read(&entry.path)? else {
                continue;
            };

            let mut sink = target.open_write(&entry.path, stored.size, stored.checksum)?;
            let written = copy_chunked(&mut reader, &mut sink, self.chunk_size, |n| {
                self.done.fetch_add(n as u64, Ordering::Relaxed);
                !self.state.should_stop()
            })?;

            let Some(written) = written else {
                drop(sink);
                drop(target);
                fs::remove_dir_all(&temp).ok();
                return Ok(CompactOutcome::Interrupted);
            };
            if written != stored.size {
                return Err(PatchError::structural(format!(
                    "Copied {} bytes of {} from archive {}, expected {}",
                    written, entry.path, group.release, stored.size
                ))
                .into());
            }
            sink.finish()?;
            copied += 1;
        }
        target.close()?;
        let new_files = target.files().clone();
        drop(target);
        drop(source);

        if copied == 0 {
            fs::remove_dir_all(&dir)
                .with_context(|| format!("Failed to remove {}", dir.display()))?;
            return Ok(CompactOutcome::Removed);
        }

        replace(&new_files.index, &files.index)?;
        replace(&new_files.data, &files.data)?;
        fs::remove_dir_all(&temp).ok();

        let reclaimed = data_len.saturating_sub(fs::metadata(&files.data)?.len());
        Ok(CompactOutcome::Rewritten {
            members: copied,
            reclaimed,
        })
    }
}

/// Delete `old`, then move `new` into its place.
fn replace(new: &Path, old: &Path) -> Result<()> {
    if old.exists() {
        fs::remove_file(old).with_context(|| format!("Failed to delete {}", old.display()))?;
    }
    fs::rename(new, old)
        .with_context(|| format!("Failed to move {} to {}", new.display(), old.display()))?;
    Ok(())
}

impl PatchTask for ArchiveCompactor {
    fn name(&self) -> &'static str {
        "compact"
    }

    fn state(&self) -> &TaskState {
        &self.state
    }

    fn percentage(&self) -> f32 {
        let total = self.total.load(Ordering::Relaxed);
        if total == 0 {
            return if self.state.is_finished() { 100.0 } else { 0.0 };
        }
        (self.done.load(Ordering::Relaxed) as f32 / total as f32 * 100.0).min(100.0)
    }

    fn run(&self) -> Result<()> {
        let started = Instant::now();
        info!("=== Compacting archives of release {} ===", self.version);
        let outcomes = self.compact_all()?;
        let rewritten = outcomes
            .iter()
            .filter(|(_, o)| matches!(o, CompactOutcome::Rewritten { .. }))
            .count();
        info!(
            "Compacted {} of {} archives in {:.1}s",
            rewritten,
            outcomes.len(),
            started.elapsed().as_secs_f64()
        );
        log_phase_metrics("Compact", started);
        if !self.state.is_cancelled() {
            self.state.finish();
        }
        Ok(())
    }
}
