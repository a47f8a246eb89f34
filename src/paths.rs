//! On-disk layout of a patched installation
//!
//! Everything lives under `<root>/projects/<project>/`:
//! - `releases/<version>/` holds the completion marker, the saved manifest and
//!   loose files under `deploy/`
//! - `managedfiles/<release>/` holds managed files keyed by the release that
//!   last changed them
//! - `filearchives/<release>/` holds one archive container per release

use crate::manifest::{FileEntry, FileKind, ReleaseId};
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

pub const MARKER_FILE: &str = "S_OK";
pub const SAVED_MANIFEST_FILE: &str = "releasemanifest";
pub const DEPLOY_DIR: &str = "deploy";

/// Paths for one project below an install root.
#[derive(Debug, Clone)]
pub struct InstallLayout {
    root: PathBuf,
    project: String,
}

impl InstallLayout {
    pub fn new(root: impl Into<PathBuf>, project: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            project: project.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn project_dir(&self) -> PathBuf {
        self.root.join("projects").join(&self.project)
    }

    pub fn releases_dir(&self) -> PathBuf {
        self.project_dir().join("releases")
    }

    pub fn release_dir(&self, version: &str) -> PathBuf {
        self.releases_dir().join(version)
    }

    pub fn marker(&self, version: &str) -> PathBuf {
        self.release_dir(version).join(MARKER_FILE)
    }

    pub fn saved_manifest(&self, version: &str) -> PathBuf {
        self.release_dir(version).join(SAVED_MANIFEST_FILE)
    }

    pub fn deploy_dir(&self, version: &str) -> PathBuf {
        self.release_dir(version).join(DEPLOY_DIR)
    }

    pub fn managed_root(&self) -> PathBuf {
        self.project_dir().join("managedfiles")
    }

    pub fn managed_dir(&self, release: &str) -> PathBuf {
        self.managed_root().join(release)
    }

    pub fn archives_root(&self) -> PathBuf {
        self.project_dir().join("filearchives")
    }

    pub fn archive_dir(&self, release: &str) -> PathBuf {
        self.archives_root().join(release)
    }

    /// Where a loose or managed entry lives once installed for `version`.
    pub fn file_path(&self, entry: &FileEntry, version: &str) -> PathBuf {
        let base = if entry.kind == FileKind::Managed {
            self.managed_dir(entry.release.as_str())
        } else {
            self.deploy_dir(version)
        };
        join_logical(&base, &entry.path)
    }

    /// Newest release directory by numeric id, ignoring names that are not
    /// release ids.
    pub fn newest_release_dir(&self) -> Result<Option<ReleaseId>> {
        let dir = self.releases_dir();
        if !dir.exists() {
            return Ok(None);
        }

        let mut newest: Option<ReleaseId> = None;
        for entry in fs::read_dir(&dir)
            .with_context(|| format!("Failed to list releases: {}", dir.display()))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Ok(id) = ReleaseId::parse(&name.to_string_lossy()) else {
                continue;
            };
            if newest.as_ref().is_none_or(|n| id > *n) {
                newest = Some(id);
            }
        }
        Ok(newest)
    }
}

/// Join a `/`-separated logical path onto a base directory.
pub fn join_logical(base: &Path, logical: &str) -> PathBuf {
    logical
        .split(['/', '\\'])
        .filter(|s| !s.is_empty() && *s != "." && *s != "..")
        .fold(base.to_path_buf(), |acc, part| acc.join(part))
}

/// Create parent directories for a path if they don't exist
pub fn ensure_parent_dirs(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}
