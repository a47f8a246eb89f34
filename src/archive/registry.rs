//! One open container per release id, shared by every worker of a run.

use super::{ArchiveContainer, ContainerFiles};
use crate::paths::InstallLayout;
use anyhow::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

#[derive(Debug)]
pub struct ArchiveRegistry {
    layout: InstallLayout,
    open: Mutex<HashMap<String, Arc<ArchiveContainer>>>,
}

impl ArchiveRegistry {
    pub fn new(layout: InstallLayout) -> Self {
        Self {
            layout,
            open: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<ArchiveContainer>>> {
        self.open.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The container for `release`, opening or creating it on first use.
    pub fn get_or_open(&self, release: &str) -> Result<Arc<ArchiveContainer>> {
        let mut open = self.lock();
        if let Some(container) = open.get(release) {
            return Ok(Arc::clone(container));
        }

        let container = ArchiveContainer::open_or_create(&self.layout.archive_dir(release))?;
        debug!("Registered archive for release {}", release);
        open.insert(release.to_string(), Arc::clone(&container));
        Ok(container)
    }

    /// The container for `release` only if it already exists on disk.
    pub fn get_existing(&self, release: &str) -> Result<Option<Arc<ArchiveContainer>>> {
        if let Some(container) = self.lock().get(release) {
            return Ok(Some(Arc::clone(container)));
        }
        let dir = self.layout.archive_dir(release);
        if !dir.is_dir() {
            return Ok(None);
        }
        // Never create anything here; a broken pair surfaces once a worker opens it
        let files = match ContainerFiles::locate(&dir) {
            Ok(files) => files,
            Err(e) => {
                debug!("No usable archive for release {}: {:#}", release, e);
                return Ok(None);
            }
        };

        let mut open = self.lock();
        if let Some(container) = open.get(release) {
            return Ok(Some(Arc::clone(container)));
        }
        let container = ArchiveContainer::open(files)?;
        open.insert(release.to_string(), Arc::clone(&container));
        Ok(Some(container))
    }

    pub fn sync_all(&self) -> Result<()> {
        let open: Vec<_> = self.lock().values().cloned().collect();
        for container in open {
            container.sync()?;
        }
        Ok(())
    }

    /// Sync and forget every container.
    pub fn close_all(&self) -> Result<()> {
        let open: Vec<_> = self.lock().drain().map(|(_, c)| c).collect();
        for container in open {
            container.close()?;
        }
        Ok(())
    }

    pub fn open_count(&self) -> usize {
        self.lock().len()
    }
}
