//! Patch run configuration
//!
//! Defines the configuration structure for a patch run and the path filter
//! built from it.

use crate::manifest::FileEntry;
use regex::Regex;
use std::path::PathBuf;

/// Default number of workers per pool
pub const DEFAULT_WORKERS: usize = 6;

/// Default read size while streaming downloads
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Configuration for one patch run
#[derive(Debug, Clone)]
pub struct PatchConfig {
    /// Installation root (contains `projects/`)
    pub root: PathBuf,

    /// Origin base URL, e.g. `http://cdn.example.com`
    pub origin: String,

    /// Release branch on the origin
    pub branch: String,

    /// Project to patch
    pub project: String,

    /// Target release; resolved from the release listing when `None`
    pub version: Option<String>,

    /// Workers per pool
    pub workers: usize,

    /// Treat every entry as a candidate and verify what is already on disk
    pub force: bool,

    /// Patch even when a completion marker for the version exists
    pub ignore_marker: bool,

    /// Only patch paths matching this regex
    pub include: Option<String>,

    /// Skip paths matching this regex
    pub exclude: Option<String>,

    /// Read size while streaming
    pub chunk_size: usize,
}

impl PatchConfig {
    pub fn new(root: impl Into<PathBuf>, origin: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            origin: origin.into(),
            branch: "live".to_string(),
            project: project.into(),
            version: None,
            workers: DEFAULT_WORKERS,
            force: false,
            ignore_marker: false,
            include: None,
            exclude: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Default install root under the user's local data directory
    pub fn default_root() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cdnpatch")
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.project.trim().is_empty() || self.project.contains(['/', '\\']) {
            return Err(ConfigError::InvalidProject(self.project.clone()));
        }

        if self.branch.trim().is_empty() || self.branch.contains(['/', '\\']) {
            return Err(ConfigError::InvalidBranch(self.branch.clone()));
        }

        if !(self.origin.starts_with("http://") || self.origin.starts_with("https://")) {
            return Err(ConfigError::InvalidOrigin(self.origin.clone()));
        }

        if self.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }

        if self.chunk_size == 0 {
            return Err(ConfigError::ZeroChunkSize);
        }

        self.filter()?;
        Ok(())
    }

    /// Path filter from the include/exclude patterns
    pub fn filter(&self) -> Result<EntryFilter, ConfigError> {
        let compile = |pattern: &Option<String>| -> Result<Option<Regex>, ConfigError> {
            pattern
                .as_deref()
                .map(|p| {
                    Regex::new(p).map_err(|source| ConfigError::InvalidFilter {
                        pattern: p.to_string(),
                        source,
                    })
                })
                .transpose()
        };

        Ok(EntryFilter {
            include: compile(&self.include)?,
            exclude: compile(&self.exclude)?,
        })
    }
}

/// Path inclusion predicate for manifest entries
#[derive(Debug, Clone, Default)]
pub struct EntryFilter {
    include: Option<Regex>,
    exclude: Option<Regex>,
}

impl EntryFilter {
    pub fn accept_all() -> Self {
        Self::default()
    }

    pub fn accepts(&self, entry: &FileEntry) -> bool {
        self.include.as_ref().is_none_or(|re| re.is_match(&entry.path))
            && !self.exclude.as_ref().is_some_and(|re| re.is_match(&entry.path))
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid project name: '{0}'")]
    InvalidProject(String),

    #[error("Invalid branch name: '{0}'")]
    InvalidBranch(String),

    #[error("Origin must be an http(s) URL: '{0}'")]
    InvalidOrigin(String),

    #[error("At least one worker is required")]
    NoWorkers,

    #[error("Chunk size must be greater than zero")]
    ZeroChunkSize,

    #[error("Invalid filter pattern '{pattern}': {source}")]
    InvalidFilter {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}
