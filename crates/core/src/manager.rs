use std::fs;
use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::descriptor::{pool_root_dir_name, VolumeDescriptor, DESCRIPTOR_SUFFIX};
use crate::detect::PoolDetector;
use crate::device::{FreeSpaceProbe, MountEnumerator, StaticMounts, SysinfoDisks};
use crate::error::{PoolError, PoolResult};
use crate::events::{is_cancelled, CancelFlag, Emitter, EngineOperation, EngineSink, NoopSink};
use crate::fileops;
use crate::paths::{DrivePath, PoolName};
use crate::physical::PhysicalFile;
use crate::pool::Pool;
use crate::units::ByteSize;

#[derive(Debug, Clone, Copy)]
pub struct RemoveDriveOptions {
    pub auto_balance: bool,
}

impl Default for RemoveDriveOptions {
    fn default() -> Self {
        RemoveDriveOptions { auto_balance: true }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReplaceDriveOptions {
    pub rebalance_after: bool,
}

impl Default for ReplaceDriveOptions {
    fn default() -> Self {
        ReplaceDriveOptions {
            rebalance_after: true,
        }
    }
}

/// Result of the pre-check for removing a drive from a pool.
#[derive(Debug, Clone, Serialize)]
pub struct RemovalSpaceCheck {
    pub required: ByteSize,
    pub available: ByteSize,
    pub has_sufficient_space: bool,
    pub shortfall: ByteSize,
    pub recommendation: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RemoveDriveReport {
    pub migrated_files: u64,
    pub migrated_bytes: u64,
    pub warnings: Vec<String>,
}

/// Pool lifecycle: create and delete pools, add, remove and replace
/// member drives.
pub struct PoolManager {
    mounts: Arc<dyn MountEnumerator>,
    probe: Arc<dyn FreeSpaceProbe>,
    sink: Arc<dyn EngineSink>,
}

impl PoolManager {
    pub fn new(
        mounts: Arc<dyn MountEnumerator>,
        probe: Arc<dyn FreeSpaceProbe>,
        sink: Arc<dyn EngineSink>,
    ) -> Self {
        PoolManager {
            mounts,
            probe,
            sink,
        }
    }

    pub fn with_defaults() -> Self {
        let disks = Arc::new(SysinfoDisks::new());
        PoolManager {
            mounts: disks.clone(),
            probe: disks,
            sink: Arc::new(NoopSink),
        }
    }

    fn detector(&self) -> PoolDetector {
        PoolDetector::new(self.mounts.clone(), self.probe.clone(), self.sink.clone())
    }

    pub fn detect_pools(&self) -> PoolResult<Vec<Pool>> {
        self.detector().detect()
    }

    pub fn find_pool(&self, name: &PoolName) -> PoolResult<Pool> {
        self.detector().detect_one(name)
    }

    fn seed_drive(&self, drive: &DrivePath, id: Uuid, name: &PoolName, description: Option<&str>) -> PoolResult<()> {
        if !drive.as_path().is_dir() {
            return Err(PoolError::InvalidArgument(format!(
                "drive path {} is missing",
                drive
            )));
        }
        let root = drive.as_path().join(pool_root_dir_name(&id));
        fs::create_dir_all(&root).map_err(|err| PoolError::io(&root, err))?;

        let mut descriptor = VolumeDescriptor::new(id, name.as_str());
        descriptor.description = description.map(str::to_string);
        let descriptor_path = drive
            .as_path()
            .join(format!("{}{}", name.as_str(), DESCRIPTOR_SUFFIX));
        descriptor.store(&descriptor_path)
    }

    /// Creates a pool over the given drives: a fresh 128-bit id, the
    /// `{<id>}` directory and a descriptor on every drive.
    pub fn create_pool(
        &self,
        name: &PoolName,
        drives: &[DrivePath],
        description: Option<&str>,
    ) -> PoolResult<Pool> {
        if drives.is_empty() {
            return Err(PoolError::InvalidArgument(
                "a pool needs at least one drive".to_string(),
            ));
        }
        if self.detect_pools()?.iter().any(|pool| name.matches(pool.name())) {
            return Err(PoolError::InvalidArgument(format!(
                "pool \"{name}\" already exists"
            )));
        }

        let id = Uuid::new_v4();
        let mut emitter = Emitter::new(self.sink.as_ref(), EngineOperation::Lifecycle);
        for (index, drive) in drives.iter().enumerate() {
            self.seed_drive(drive, id, name, description)?;
            emitter.emit("create_pool", Some(drive.as_path()), index as u64 + 1, 0);
        }

        let detector = PoolDetector::new(
            Arc::new(StaticMounts::new(
                drives.iter().map(|drive| drive.as_path().to_path_buf()),
            )),
            self.probe.clone(),
            self.sink.clone(),
        );
        detector
            .detect()?
            .into_iter()
            .find(|pool| pool.id() == id)
            .ok_or_else(|| PoolError::NotFound(format!("freshly created pool \"{name}\"")))
    }

    /// Removes the pool's descriptors; with `remove_data` the `{<id>}`
    /// trees go too, otherwise the data directories stay intact.
    pub fn delete_pool(&self, name: &PoolName, remove_data: bool) -> PoolResult<()> {
        let pool = self.find_pool(name)?;
        let mut emitter = Emitter::new(self.sink.as_ref(), EngineOperation::Lifecycle);
        for (index, volume) in pool.volumes().iter().enumerate() {
            fileops::delete_file(&volume.descriptor_path)?;
            if remove_data {
                let root = volume.root();
                match fs::remove_dir_all(&root) {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => return Err(PoolError::io(&root, err)),
                }
            }
            emitter.emit("delete_pool", Some(volume.mount.as_path()), index as u64 + 1, 0);
        }
        Ok(())
    }

    /// Extends an existing pool onto a new drive.
    pub fn add_drive(&self, name: &PoolName, drive: &DrivePath) -> PoolResult<()> {
        let pool = self.find_pool(name)?;
        if pool.volume_index_by_mount(drive.as_path()).is_some() {
            return Err(PoolError::InvalidArgument(format!(
                "drive {drive} already belongs to pool \"{name}\""
            )));
        }
        let description = pool
            .volumes()
            .first()
            .and_then(|volume| volume.description.clone());
        self.seed_drive(drive, pool.id(), name, description.as_deref())?;
        let mut emitter = Emitter::new(self.sink.as_ref(), EngineOperation::Lifecycle);
        emitter.emit("add_drive", Some(drive.as_path()), 1, 0);
        Ok(())
    }

    /// Whether the rest of the pool can absorb the files of one drive.
    pub fn check_space_for_drive_removal(
        &self,
        name: &PoolName,
        drive: &DrivePath,
    ) -> PoolResult<RemovalSpaceCheck> {
        let pool = self.find_pool(name)?;
        let index = pool
            .volume_index_by_mount(drive.as_path())
            .ok_or_else(|| {
                PoolError::NotFound(format!("drive {drive} in pool \"{name}\""))
            })?;

        let required: u64 = pool
            .physical_files(index)?
            .iter()
            .map(|file| file.size)
            .sum();
        let mut available = 0_u64;
        for other in 0..pool.volumes().len() {
            if other != index {
                available = available.saturating_add(pool.volume_free(other)?);
            }
        }

        let has_sufficient_space = available >= required;
        let shortfall = required.saturating_sub(available);
        let recommendation = if has_sufficient_space {
            format!(
                "The remaining volumes hold {} free for the {} to migrate; removal can proceed.",
                ByteSize(available),
                ByteSize(required)
            )
        } else {
            format!(
                "The remaining volumes are {} short of the {} required; add storage to the pool or free up space before removing this drive.",
                ByteSize(shortfall),
                ByteSize(required)
            )
        };
        Ok(RemovalSpaceCheck {
            required: ByteSize(required),
            available: ByteSize(available),
            has_sufficient_space,
            shortfall: ByteSize(shortfall),
            recommendation,
        })
    }

    fn migrate_volume_files(
        &self,
        pool: &Pool,
        source: usize,
        report: &mut RemoveDriveReport,
        cancel: Option<&CancelFlag>,
    ) -> PoolResult<()> {
        let mut emitter = Emitter::new(self.sink.as_ref(), EngineOperation::Lifecycle);
        let mut free: Vec<u64> = Vec::with_capacity(pool.volumes().len());
        for index in 0..pool.volumes().len() {
            free.push(pool.volume_free(index)?);
        }

        let mut files: Vec<PhysicalFile> = pool.physical_files(source)?;
        files.sort_by(|a, b| {
            b.size
                .cmp(&a.size)
                .then_with(|| a.logical_path.cmp(&b.logical_path))
        });

        for file in files {
            if is_cancelled(cancel) {
                break;
            }
            // Largest-free target that fits and does not hold the file.
            let holders = pool
                .logical_file(&file.logical_path)
                .map(|logical| logical.volumes())
                .unwrap_or_default();
            let mut target: Option<usize> = None;
            for candidate in 0..pool.volumes().len() {
                if candidate == source || holders.contains(&candidate) {
                    continue;
                }
                if free[candidate] <= file.size {
                    continue;
                }
                if target.map(|best| free[candidate] > free[best]).unwrap_or(true) {
                    target = Some(candidate);
                }
            }
            let Some(target) = target else {
                report.warnings.push(format!(
                    "no volume can absorb {}",
                    file.disk_path.display()
                ));
                continue;
            };

            let target_volume = pool.volume(target)?;
            match fileops::move_to_volume(&file, target_volume, !file.is_shadow) {
                Ok(_) => {
                    free[target] = free[target].saturating_sub(file.size);
                    report.migrated_files = report.migrated_files.saturating_add(1);
                    report.migrated_bytes = report.migrated_bytes.saturating_add(file.size);
                    emitter.emit(
                        "migrating",
                        Some(file.disk_path.as_path()),
                        report.migrated_files,
                        report.warnings.len() as u64,
                    );
                }
                Err(err) => report.warnings.push(format!(
                    "cannot migrate {}: {err}",
                    file.disk_path.display()
                )),
            }
        }
        Ok(())
    }

    /// Takes a drive out of a pool. The space pre-check must pass; with
    /// `auto_balance` every physical file migrates to the remaining
    /// volumes (largest free space first) and the pool tree on the drive
    /// is torn down. Without it only the descriptor is removed and the
    /// data stays on the drive.
    pub fn remove_drive(
        &self,
        name: &PoolName,
        drive: &DrivePath,
        options: &RemoveDriveOptions,
        cancel: Option<&CancelFlag>,
    ) -> PoolResult<RemoveDriveReport> {
        let check = self.check_space_for_drive_removal(name, drive)?;
        if !check.has_sufficient_space {
            return Err(PoolError::CapacityExceeded {
                required: check.required.get(),
                available: check.available.get(),
            });
        }

        let pool = self.find_pool(name)?;
        let index = pool
            .volume_index_by_mount(drive.as_path())
            .ok_or_else(|| {
                PoolError::NotFound(format!("drive {drive} in pool \"{name}\""))
            })?;

        let mut report = RemoveDriveReport::default();
        if options.auto_balance {
            self.migrate_volume_files(&pool, index, &mut report, cancel)?;
        }

        let volume = pool.volume(index)?;
        fileops::delete_file(&volume.descriptor_path)?;
        if options.auto_balance {
            let root = volume.root();
            match fs::remove_dir_all(&root) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(PoolError::io(&root, err)),
            }
        }

        let mut emitter = Emitter::new(self.sink.as_ref(), EngineOperation::Lifecycle);
        emitter.emit(
            "remove_drive",
            Some(drive.as_path()),
            report.migrated_files,
            report.warnings.len() as u64,
        );
        Ok(report)
    }

    /// Swaps one drive for another: migrate off the old drive, seed the
    /// new one, then optionally spread the data back out.
    pub fn replace_drive(
        &self,
        name: &PoolName,
        old: &DrivePath,
        new: &DrivePath,
        options: &ReplaceDriveOptions,
        cancel: Option<&CancelFlag>,
    ) -> PoolResult<RemoveDriveReport> {
        let mut emitter = Emitter::new(self.sink.as_ref(), EngineOperation::Lifecycle);

        emitter.emit("replace_drive:remove", Some(old.as_path()), 0, 0);
        let report = self.remove_drive(
            name,
            old,
            &RemoveDriveOptions { auto_balance: true },
            cancel,
        )?;

        emitter.emit("replace_drive:add", Some(new.as_path()), 1, 0);
        self.add_drive(name, new)?;

        if options.rebalance_after && !is_cancelled(cancel) {
            emitter.emit("replace_drive:rebalance", None, 2, 0);
            let pool = self.find_pool(name)?;
            pool.rebalance(cancel)?;
        }
        emitter.emit("replace_drive:done", None, 3, 0);
        Ok(report)
    }
}
