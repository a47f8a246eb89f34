//! Difference engine
//!
//! Splits the current manifest into contiguous shards, checks each shard on
//! its own scoped thread, and merges the per-shard results back into one list
//! ordered by release id. Within a release the manifest order is kept, so the
//! output does not depend on the shard count.

use super::config::EntryFilter;
use crate::archive::ArchiveRegistry;
use crate::manifest::{FileEntry, ReleaseManifest};
use crate::paths::InstallLayout;
use anyhow::{anyhow, Result};
use std::thread;
use tracing::debug;

pub struct DiffInput<'a> {
    pub current: &'a ReleaseManifest,
    pub previous: Option<&'a ReleaseManifest>,
    pub filter: &'a EntryFilter,
    pub layout: &'a InstallLayout,
    pub registry: &'a ArchiveRegistry,
    /// Release directory the loose files live in
    pub version: &'a str,
}

impl DiffInput<'_> {
    /// Whether `entry` has to be fetched.
    pub fn needs_patch(&self, entry: &FileEntry) -> Result<bool> {
        if entry.kind.is_archive() {
            // Members are verified by checksum later, existence is enough here
            return Ok(match self.registry.get_existing(entry.release.as_str())? {
                Some(container) => !container.contains(&entry.path),
                None => true,
            });
        }

        let unchanged = self
            .previous
            .and_then(|previous| previous.get(&entry.path))
            .is_some_and(|old| old.checksum == entry.checksum);
        Ok(!(unchanged && self.layout.file_path(entry, self.version).is_file()))
    }

    fn shard(&self, entries: &[FileEntry]) -> Result<Vec<FileEntry>> {
        let mut out = Vec::new();
        for entry in entries {
            if self.filter.accepts(entry) && self.needs_patch(entry)? {
                out.push(entry.clone());
            }
        }
        out.sort_by_key(|e| e.release.numeric());
        Ok(out)
    }
}

/// Entries of `input.current` that need patching, ordered by release id.
pub fn compute_candidates(input: &DiffInput<'_>, parallelism: usize) -> Result<Vec<FileEntry>> {
    let entries = input.current.entries();
    if entries.is_empty() {
        return Ok(Vec::new());
    }

    let shard_size = entries.len().div_ceil(parallelism.max(1));
    let shards: Vec<Vec<FileEntry>> = thread::scope(|s| {
        let handles: Vec<_> = entries
            .chunks(shard_size)
            .map(|chunk| s.spawn(move || input.shard(chunk)))
            .collect();

        handles
            .into_iter()
            .map(|h| h.join().map_err(|_| anyhow!("Difference shard panicked"))?)
            .collect::<Result<_>>()
    })?;

    debug!(
        "Compared {} entries in {} shards",
        entries.len(),
        shards.len()
    );
    Ok(merge_sorted(shards))
}

/// K-way merge of lists each sorted by numeric release id. Ties go to the
/// lowest list index, so the merge is stable.
pub fn merge_sorted(lists: Vec<Vec<FileEntry>>) -> Vec<FileEntry> {
    let total = lists.iter().map(Vec::len).sum();
    let mut out = Vec::with_capacity(total);
    let mut heads: Vec<std::iter::Peekable<std::vec::IntoIter<FileEntry>>> =
        lists.into_iter().map(|l| l.into_iter().peekable()).collect();

    loop {
        let mut best: Option<(usize, u32)> = None;
        for (i, head) in heads.iter_mut().enumerate() {
            if let Some(entry) = head.peek() {
                let key = entry.release.numeric();
                if best.is_none_or(|(_, b)| key < b) {
                    best = Some((i, key));
                }
            }
        }

        match best.and_then(|(i, _)| heads[i].next()) {
            Some(entry) => out.push(entry),
            None => break,
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::FileKind;
    use crate::testutil::{FixtureRelease, RemoteFile};
    use std::fs;
    use std::io::Write;
    use tempfile::TempDir;

    fn names(entries: &[FileEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.path.as_str()).collect()
    }

    fn manifest(files: &[RemoteFile]) -> ReleaseManifest {
        let text = FixtureRelease::new("client", "0.0.0.9", files.to_vec()).manifest_text();
        ReleaseManifest::parse(&text).unwrap()
    }

    #[test]
    fn test_merge_orders_by_release_and_is_stable() {
        let e = |path: &str, release: &str| RemoteFile::new(path, release, FileKind::LooseRaw, b"").entry();
        let merged = merge_sorted(vec![
            vec![e("a", "1"), e("b", "3")],
            vec![e("c", "1"), e("d", "2")],
            vec![],
            vec![e("f", "0"), e("g", "3")],
        ]);
        assert_eq!(names(&merged), vec!["f", "a", "c", "d", "b", "g"]);
    }

    #[test]
    fn test_output_independent_of_shard_count() -> anyhow::Result<()> {
        let tmp = TempDir::new()?;
        let layout = InstallLayout::new(tmp.path(), "client");
        let registry = ArchiveRegistry::new(layout.clone());

        let files: Vec<RemoteFile> = (0..37)
            .map(|i| {
                RemoteFile::new(
                    &format!("f{:02}", i),
                    &format!("0.0.0.{}", (i * 7) % 5),
                    FileKind::LooseRaw,
                    format!("{}", i).as_bytes(),
                )
            })
            .collect();
        let current = manifest(&files);
        let filter = EntryFilter::accept_all();
        let input = DiffInput {
            current: &current,
            previous: None,
            filter: &filter,
            layout: &layout,
            registry: &registry,
            version: "0.0.0.9",
        };

        let mut expected = current.entries().to_vec();
        expected.sort_by_key(|e| e.release.numeric());

        for parallelism in [1, 2, 3, 8, 64] {
            let out = compute_candidates(&input, parallelism)?;
            assert_eq!(names(&out), names(&expected), "parallelism {}", parallelism);
        }
        Ok(())
    }

    #[test]
    fn test_unchanged_present_files_are_skipped() -> anyhow::Result<()> {
        let tmp = TempDir::new()?;
        let layout = InstallLayout::new(tmp.path(), "client");
        let registry = ArchiveRegistry::new(layout.clone());

        // A changed between releases, B did not
        let a_old = RemoteFile::new("A", "0.0.0.1", FileKind::LooseRaw, b"old a");
        let b = RemoteFile::new("B", "0.0.0.1", FileKind::LooseRaw, b"b");
        let a_new = RemoteFile::new("A", "0.0.0.2", FileKind::LooseRaw, b"new a");

        let previous = manifest(&[a_old.clone(), b.clone()]);
        let current = manifest(&[a_new, b.clone()]);

        for file in [&a_old, &b] {
            let path = layout.file_path(&file.entry(), "0.0.0.9");
            fs::create_dir_all(path.parent().unwrap())?;
            fs::write(path, &file.content)?;
        }

        let filter = EntryFilter::accept_all();
        let input = DiffInput {
            current: &current,
            previous: Some(&previous),
            filter: &filter,
            layout: &layout,
            registry: &registry,
            version: "0.0.0.9",
        };
        assert_eq!(names(&compute_candidates(&input, 4)?), vec!["A"]);

        // A missing file is a candidate even when unchanged
        fs::remove_file(layout.file_path(&b.entry(), "0.0.0.9"))?;
        assert_eq!(names(&compute_candidates(&input, 4)?), vec!["B", "A"]);
        Ok(())
    }

    #[test]
    fn test_archive_members_use_container_existence() -> anyhow::Result<()> {
        let tmp = TempDir::new()?;
        let layout = InstallLayout::new(tmp.path(), "client");
        let registry = ArchiveRegistry::new(layout.clone());

        let present = RemoteFile::new("p.bin", "0.0.0.3", FileKind::CompressedArchiveMember, b"p");
        let absent = RemoteFile::new("q.bin", "0.0.0.3", FileKind::CompressedArchiveMember, b"q");
        let other = RemoteFile::new("r.bin", "0.0.0.4", FileKind::UncompressedArchiveMember, b"r");

        let container = registry.get_or_open("0.0.0.3")?;
        let mut sink = container.open_write("p.bin", 1, present.entry().checksum)?;
        sink.write_all(b"x")?;
        sink.finish()?;

        let current = manifest(&[present, absent, other]);
        let filter = EntryFilter::accept_all();
        let input = DiffInput {
            current: &current,
            previous: None,
            filter: &filter,
            layout: &layout,
            registry: &registry,
            version: "0.0.0.9",
        };
        assert_eq!(names(&compute_candidates(&input, 2)?), vec!["q.bin", "r.bin"]);
        // Looking up a missing generation must not create it
        assert!(!layout.archive_dir("0.0.0.4").exists());
        Ok(())
    }

    #[test]
    fn test_filter_applies() -> anyhow::Result<()> {
        let tmp = TempDir::new()?;
        let layout = InstallLayout::new(tmp.path(), "client");
        let registry = ArchiveRegistry::new(layout.clone());
        let current = manifest(&[
            RemoteFile::new("DATA/a", "1", FileKind::LooseRaw, b"a"),
            RemoteFile::new("other/b", "1", FileKind::LooseRaw, b"b"),
        ]);

        let mut config = crate::patcher::PatchConfig::new(tmp.path(), "http://x", "client");
        config.include = Some("^DATA/".into());
        let filter = config.filter()?;
        let input = DiffInput {
            current: &current,
            previous: None,
            filter: &filter,
            layout: &layout,
            registry: &registry,
            version: "1",
        };
        assert_eq!(names(&compute_candidates(&input, 2)?), vec!["DATA/a"]);
        Ok(())
    }
}
