use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sysinfo::Disks;

use crate::error::{PoolError, PoolResult};
use crate::units::ByteSize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskSpace {
    pub free: ByteSize,
    pub total: ByteSize,
}

impl DiskSpace {
    pub fn used(&self) -> ByteSize {
        self.total.saturating_sub(self.free)
    }
}

/// Host capability: free/total bytes for the filesystem holding `path`.
pub trait FreeSpaceProbe: Send + Sync {
    fn disk_space(&self, path: &Path) -> PoolResult<DiskSpace>;
}

/// Host capability: candidate mount roots to scan for volume descriptors.
pub trait MountEnumerator: Send + Sync {
    fn mount_roots(&self) -> Vec<PathBuf>;
}

/// Default host backend over `sysinfo`: mounted disks become candidate
/// roots, and space queries resolve by longest mount-point prefix.
#[derive(Debug, Default)]
pub struct SysinfoDisks;

impl SysinfoDisks {
    pub fn new() -> Self {
        SysinfoDisks
    }

    fn probes(&self) -> Vec<(PathBuf, DiskSpace)> {
        let disks = Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .map(|disk| {
                (
                    disk.mount_point().to_path_buf(),
                    DiskSpace {
                        free: ByteSize(disk.available_space()),
                        total: ByteSize(disk.total_space()),
                    },
                )
            })
            .collect()
    }
}

impl MountEnumerator for SysinfoDisks {
    fn mount_roots(&self) -> Vec<PathBuf> {
        let mut roots: Vec<PathBuf> = self.probes().into_iter().map(|(path, _)| path).collect();
        roots.sort();
        roots.dedup();
        roots
    }
}

impl FreeSpaceProbe for SysinfoDisks {
    fn disk_space(&self, path: &Path) -> PoolResult<DiskSpace> {
        let mut best: Option<(usize, DiskSpace)> = None;
        for (mount, space) in self.probes() {
            if !path.starts_with(&mount) {
                continue;
            }
            let score = mount.as_os_str().len();
            match best {
                Some((best_score, _)) if best_score >= score => {}
                _ => best = Some((score, space)),
            }
        }
        best.map(|(_, space)| space).ok_or_else(|| {
            PoolError::io(
                path,
                io::Error::new(io::ErrorKind::NotFound, "no disk covers path"),
            )
        })
    }
}

/// Fixed list of mount roots, for platforms where the caller supplies
/// candidates and for tests running against temp directories.
#[derive(Debug, Clone)]
pub struct StaticMounts {
    roots: Vec<PathBuf>,
}

impl StaticMounts {
    pub fn new(roots: impl IntoIterator<Item = PathBuf>) -> Self {
        StaticMounts {
            roots: roots.into_iter().collect(),
        }
    }
}

impl MountEnumerator for StaticMounts {
    fn mount_roots(&self) -> Vec<PathBuf> {
        self.roots.clone()
    }
}
