use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use uuid::Uuid;

use crate::descriptor::{is_descriptor_name, pool_root_dir_name, VolumeDescriptor};
use crate::device::{FreeSpaceProbe, MountEnumerator, SysinfoDisks};
use crate::error::{PoolError, PoolResult};
use crate::events::{Emitter, EngineOperation, EngineSink, NoopSink};
use crate::paths::PoolName;
use crate::pool::Pool;
use crate::volume::Volume;

/// Scans mount roots for volume descriptors and groups the resulting
/// volumes into pools.
pub struct PoolDetector {
    mounts: Arc<dyn MountEnumerator>,
    probe: Arc<dyn FreeSpaceProbe>,
    sink: Arc<dyn EngineSink>,
}

impl PoolDetector {
    pub fn new(
        mounts: Arc<dyn MountEnumerator>,
        probe: Arc<dyn FreeSpaceProbe>,
        sink: Arc<dyn EngineSink>,
    ) -> Self {
        PoolDetector {
            mounts,
            probe,
            sink,
        }
    }

    /// Host defaults: mounted disks via sysinfo, no event sink.
    pub fn with_defaults() -> Self {
        let disks = Arc::new(SysinfoDisks::new());
        PoolDetector {
            mounts: disks.clone(),
            probe: disks,
            sink: Arc::new(NoopSink),
        }
    }

    /// Detects every pool reachable from the candidate mount roots.
    ///
    /// A volume is valid iff its descriptor parses with a well-formed id
    /// and a label, and the sibling `{<id>}` directory exists. IO errors
    /// on one mount skip that mount only; "no pools" is an empty list,
    /// never an error. Volume order within a pool is stable for a fixed
    /// mount order.
    pub fn detect(&self) -> PoolResult<Vec<Pool>> {
        let mut emitter = Emitter::new(self.sink.as_ref(), EngineOperation::Detect);
        let mut groups: Vec<(Uuid, Vec<Volume>)> = Vec::new();
        let mut scanned = 0_u64;
        let mut errors = 0_u64;

        for mount in self.mounts.mount_roots() {
            let entries = match fs::read_dir(&mount) {
                Ok(entries) => entries,
                Err(_) => {
                    errors = errors.saturating_add(1);
                    continue;
                }
            };

            let mut descriptor_paths: Vec<PathBuf> = entries
                .flatten()
                .filter(|entry| {
                    entry.file_type().map(|t| t.is_file()).unwrap_or(false)
                        && is_descriptor_name(&entry.file_name().to_string_lossy())
                })
                .map(|entry| entry.path())
                .collect();
            descriptor_paths.sort();

            for path in descriptor_paths {
                let descriptor = match VolumeDescriptor::load(&path) {
                    Ok(Some(descriptor)) => descriptor,
                    Ok(None) => continue,
                    Err(_) => {
                        errors = errors.saturating_add(1);
                        continue;
                    }
                };
                if !mount.join(pool_root_dir_name(&descriptor.id)).is_dir() {
                    continue;
                }

                let index = match groups.iter().position(|(id, _)| *id == descriptor.id) {
                    Some(index) => index,
                    None => {
                        groups.push((descriptor.id, Vec::new()));
                        groups.len() - 1
                    }
                };
                let group = &mut groups[index].1;
                // One volume per pool per mount; a second descriptor
                // with the same id on the same mount is redundant.
                if group.iter().any(|volume| volume.mount == mount) {
                    continue;
                }
                group.push(Volume {
                    id: descriptor.id,
                    label: descriptor.volume_label,
                    description: descriptor.description,
                    mount: mount.clone(),
                    descriptor_path: path,
                });
            }

            scanned = scanned.saturating_add(1);
            emitter.emit("scanning", Some(mount.as_path()), scanned, errors);
        }

        emitter.emit("done", None, scanned, errors);
        Ok(groups
            .into_iter()
            .map(|(id, volumes)| {
                Pool::assemble(id, volumes, self.sink.clone(), self.probe.clone())
            })
            .collect())
    }

    /// Detects the pool whose volume label matches `name`
    /// (case-insensitive).
    pub fn detect_one(&self, name: &PoolName) -> PoolResult<Pool> {
        self.detect()?
            .into_iter()
            .find(|pool| name.matches(pool.name()))
            .ok_or_else(|| PoolError::NotFound(format!("pool \"{name}\"")))
    }
}
