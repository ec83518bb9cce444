use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::device::{DiskSpace, FreeSpaceProbe};
use crate::error::{PoolError, PoolResult};
use crate::events::{CancelFlag, EngineSink};
use crate::logical::{LogicalFile, LogicalItems};
use crate::paths::FolderPath;
use crate::physical::{self, PhysicalFile, PhysicalItem};
use crate::rebalance::{self, RebalanceReport};
use crate::repair::{self, FixReport};
use crate::units::ByteSize;
use crate::volume::Volume;

/// Aggregate space over a pool's volumes.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PoolSpace {
    pub total: ByteSize,
    pub used: ByteSize,
    pub free: ByteSize,
}

/// A detected pool: volumes in stable detection order plus the injected
/// host capabilities. Logical items are derived on each enumeration;
/// there is no persistent index.
pub struct Pool {
    id: Uuid,
    volumes: Vec<Volume>,
    sink: Arc<dyn EngineSink>,
    probe: Arc<dyn FreeSpaceProbe>,
    suppress_walk_errors: bool,
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("id", &self.id)
            .field("volumes", &self.volumes)
            .finish_non_exhaustive()
    }
}

impl Pool {
    pub(crate) fn assemble(
        id: Uuid,
        volumes: Vec<Volume>,
        sink: Arc<dyn EngineSink>,
        probe: Arc<dyn FreeSpaceProbe>,
    ) -> Self {
        Pool {
            id,
            volumes,
            sink,
            probe,
            suppress_walk_errors: true,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Human label, taken from the first volume's descriptor.
    pub fn name(&self) -> &str {
        self.volumes
            .first()
            .map(|volume| volume.label.as_str())
            .unwrap_or("")
    }

    pub fn volumes(&self) -> &[Volume] {
        &self.volumes
    }

    pub fn volume(&self, index: usize) -> PoolResult<&Volume> {
        self.volumes
            .get(index)
            .ok_or_else(|| PoolError::NotFound(format!("volume #{index} in pool {}", self.id)))
    }

    pub fn volume_index_by_mount(&self, mount: &Path) -> Option<usize> {
        self.volumes
            .iter()
            .position(|volume| volume.mount == mount)
    }

    /// Whether unreadable subtrees degrade to empty during enumeration
    /// (the default) or abort with an error.
    pub fn set_error_suppression(&mut self, suppress: bool) {
        self.suppress_walk_errors = suppress;
    }

    pub fn suppresses_errors(&self) -> bool {
        self.suppress_walk_errors
    }

    pub(crate) fn sink(&self) -> &dyn EngineSink {
        self.sink.as_ref()
    }

    pub fn space(&self) -> PoolResult<PoolSpace> {
        let mut total = ByteSize::ZERO;
        let mut free = ByteSize::ZERO;
        for volume in &self.volumes {
            let space = volume.space(self.probe.as_ref())?;
            total += space.total;
            free += space.free;
        }
        Ok(PoolSpace {
            total,
            used: total.saturating_sub(free),
            free,
        })
    }

    pub fn volume_space(&self, index: usize) -> PoolResult<DiskSpace> {
        self.volume(index)?.space(self.probe.as_ref())
    }

    pub(crate) fn volume_free(&self, index: usize) -> PoolResult<u64> {
        Ok(self.volume_space(index)?.free.get())
    }

    /// Lazy breadth-first enumeration of the merged namespace under
    /// `root`.
    pub fn items(&self, root: &FolderPath, recursive: bool) -> LogicalItems<'_> {
        LogicalItems::new(&self.volumes, root, recursive)
    }

    /// Logical files only.
    pub fn files(
        &self,
        root: &FolderPath,
        recursive: bool,
    ) -> impl Iterator<Item = LogicalFile> + '_ {
        self.items(root, recursive)
            .filter_map(crate::logical::LogicalItem::into_file)
    }

    /// Sum of the logical sizes of every file under a folder.
    pub fn folder_size(&self, folder: &FolderPath) -> ByteSize {
        ByteSize(self.files(folder, true).map(|file| file.size).sum())
    }

    /// Probes a single logical path; `None` when no location exists.
    pub fn logical_file(&self, path: &FolderPath) -> Option<LogicalFile> {
        let file = crate::logical::probe_locations(&self.volumes, path);
        (!file.locations.is_empty()).then_some(file)
    }

    /// Real files and folders of one volume.
    pub fn physical_items(&self, volume_index: usize) -> PoolResult<Vec<PhysicalItem>> {
        let volume = self.volume(volume_index)?;
        physical::enumerate_volume(volume, volume_index, self.suppress_walk_errors)
    }

    /// Real files of one volume, shadow copies included.
    pub fn physical_files(&self, volume_index: usize) -> PoolResult<Vec<PhysicalFile>> {
        let volume = self.volume(volume_index)?;
        physical::enumerate_files(volume, volume_index, self.suppress_walk_errors)
    }

    pub fn fix_missing_duplication_on_all_folders(
        &self,
        cancel: Option<&CancelFlag>,
    ) -> PoolResult<FixReport> {
        repair::fix_missing_duplication_on_all_folders(self, cancel)
    }

    pub fn fix_duplicate_primaries(&self, cancel: Option<&CancelFlag>) -> PoolResult<FixReport> {
        repair::fix_duplicate_primaries(self, cancel)
    }

    pub fn fix_duplicate_shadow_copies(
        &self,
        cancel: Option<&CancelFlag>,
    ) -> PoolResult<FixReport> {
        repair::fix_duplicate_shadow_copies(self, cancel)
    }

    pub fn fix_missing_primaries(&self, cancel: Option<&CancelFlag>) -> PoolResult<FixReport> {
        repair::fix_missing_primaries(self, cancel)
    }

    pub fn fix_missing_shadow_copies(
        &self,
        cancel: Option<&CancelFlag>,
    ) -> PoolResult<FixReport> {
        repair::fix_missing_shadow_copies(self, cancel)
    }

    pub fn rebalance(&self, cancel: Option<&CancelFlag>) -> PoolResult<RebalanceReport> {
        rebalance::rebalance(self, cancel)
    }

    /// Volume with the greatest free space outside `exclude`; ties break
    /// by volume order. `None` when every volume is excluded.
    pub(crate) fn volume_with_most_free(
        &self,
        exclude: &std::collections::HashSet<usize>,
    ) -> PoolResult<Option<usize>> {
        let mut best: Option<(u64, usize)> = None;
        for index in 0..self.volumes.len() {
            if exclude.contains(&index) {
                continue;
            }
            let free = self.volume_free(index)?;
            if best.map(|(top, _)| free > top).unwrap_or(true) {
                best = Some((free, index));
            }
        }
        Ok(best.map(|(_, index)| index))
    }
}
