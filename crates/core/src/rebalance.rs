use serde::Serialize;

use crate::error::PoolResult;
use crate::events::{is_cancelled, CancelFlag, Emitter, EngineOperation};
use crate::fileops;
use crate::physical::PhysicalFile;
use crate::pool::Pool;

/// Volumes within this band of the average are left alone.
pub const MIN_DIFF: u64 = 2 * 1024 * 1024;

/// Files below this size are not worth moving.
pub const MIN_FILE: u64 = 4096;

#[derive(Debug, Clone, Default, Serialize)]
pub struct RebalanceReport {
    pub moved_files: u64,
    pub moved_bytes: u64,
    pub passes: u64,
    pub warnings: Vec<String>,
    pub cancelled: bool,
}

/// Whether the file already exists on the volume, in either role.
fn exists_on(pool: &Pool, file: &PhysicalFile, volume_index: usize) -> bool {
    pool.logical_file(&file.logical_path)
        .map(|logical| logical.volumes().contains(&volume_index))
        .unwrap_or(false)
}

/// Moves files from the volumes with the least free space to the ones
/// with the most until every volume sits within `MIN_DIFF` of the
/// average, or no candidate move remains. The free-space spread never
/// widens, and a full pass without a move terminates the run.
pub fn rebalance(pool: &Pool, cancel: Option<&CancelFlag>) -> PoolResult<RebalanceReport> {
    let mut report = RebalanceReport::default();
    let mut emitter = Emitter::new(pool.sink(), EngineOperation::Rebalance);

    let volume_count = pool.volumes().len() as u64;
    if volume_count == 0 {
        return Ok(report);
    }
    let mut free: Vec<u64> = Vec::with_capacity(pool.volumes().len());
    for index in 0..pool.volumes().len() {
        free.push(pool.volume_free(index)?);
    }
    let avg = free.iter().sum::<u64>() / volume_count;
    if avg < MIN_DIFF {
        return Ok(report);
    }
    emitter.emit("start", None, 0, 0);

    'passes: loop {
        report.passes = report.passes.saturating_add(1);
        let sources: Vec<usize> = (0..free.len())
            .filter(|&v| free[v] < avg.saturating_sub(MIN_DIFF))
            .collect();
        let sinks: Vec<usize> = (0..free.len())
            .filter(|&v| free[v] > avg.saturating_add(MIN_DIFF))
            .collect();
        if sources.is_empty() || sinks.is_empty() {
            break;
        }

        let mut moved_this_pass = false;
        for &source in &sources {
            let mut candidates: Vec<PhysicalFile> = pool
                .physical_files(source)?
                .into_iter()
                .filter(|file| file.size >= MIN_FILE)
                .collect();
            candidates.sort_by(|a, b| {
                b.size
                    .cmp(&a.size)
                    .then_with(|| a.logical_path.cmp(&b.logical_path))
            });

            while free[source] < avg {
                if is_cancelled(cancel) {
                    report.cancelled = true;
                    break 'passes;
                }
                let budget = avg - free[source];
                let Some(position) = candidates.iter().position(|file| file.size <= budget)
                else {
                    break;
                };
                let file = candidates.remove(position);

                let target = sinks.iter().copied().find(|&t| {
                    free[t] > file.size && !exists_on(pool, &file, t)
                });
                let Some(target) = target else {
                    continue;
                };

                let target_volume = pool.volume(target)?;
                match fileops::move_to_volume(&file, target_volume, !file.is_shadow) {
                    Ok(_) => {
                        free[source] = free[source].saturating_add(file.size);
                        free[target] = free[target].saturating_sub(file.size);
                        report.moved_files = report.moved_files.saturating_add(1);
                        report.moved_bytes = report.moved_bytes.saturating_add(file.size);
                        moved_this_pass = true;
                        emitter.emit(
                            "moved",
                            Some(file.disk_path.as_path()),
                            report.moved_files,
                            0,
                        );
                    }
                    Err(err) => {
                        report
                            .warnings
                            .push(format!("cannot move {}: {err}", file.disk_path.display()));
                    }
                }
            }
        }
        if !moved_this_pass {
            break;
        }
    }

    emitter.emit("done", None, report.moved_files, report.warnings.len() as u64);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, Mutex};

    use tempfile::TempDir;
    use uuid::Uuid;

    use crate::detect::PoolDetector;
    use crate::device::{DiskSpace, FreeSpaceProbe, StaticMounts};
    use crate::error::PoolResult;
    use crate::events::NoopSink;
    use crate::paths::FolderPath;
    use crate::pool::Pool;
    use crate::units::ByteSize;

    use super::{rebalance, MIN_DIFF};

    /// Free space ledger the tests adjust as files land on volumes:
    /// free = budget - bytes currently stored under the mount.
    struct LedgerProbe {
        budgets: Mutex<HashMap<PathBuf, u64>>,
    }

    impl LedgerProbe {
        fn new(budgets: HashMap<PathBuf, u64>) -> Self {
            LedgerProbe {
                budgets: Mutex::new(budgets),
            }
        }
    }

    fn tree_size(path: &Path) -> u64 {
        walkdir::WalkDir::new(path)
            .into_iter()
            .flatten()
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| entry.metadata().ok())
            .map(|meta| meta.len())
            .sum()
    }

    impl FreeSpaceProbe for LedgerProbe {
        fn disk_space(&self, path: &Path) -> PoolResult<DiskSpace> {
            let budgets = self.budgets.lock().expect("probe");
            let budget = budgets.get(path).copied().unwrap_or(0);
            let used = tree_size(path);
            Ok(DiskSpace {
                free: ByteSize(budget.saturating_sub(used)),
                total: ByteSize(budget),
            })
        }
    }

    fn seeded_pool(temp: &TempDir, budgets: &[(&str, u64)]) -> Pool {
        let id = Uuid::new_v4();
        let mut roots = Vec::new();
        let mut map = HashMap::new();
        for (name, budget) in budgets {
            let mount = temp.path().join(name);
            fs::create_dir_all(mount.join(format!("{{{id}}}"))).expect("pool root");
            fs::write(
                mount.join(format!("{name}.MP.$DRIVEBENDER")),
                format!("id:{id}\nvolumelabel:pool\n"),
            )
            .expect("descriptor");
            map.insert(mount.clone(), *budget);
            roots.push(mount);
        }
        PoolDetector::new(
            Arc::new(StaticMounts::new(roots)),
            Arc::new(LedgerProbe::new(map)),
            Arc::new(NoopSink),
        )
        .detect()
        .expect("detect")
        .remove(0)
    }

    #[test]
    fn moves_a_large_file_towards_the_freer_volume() {
        let temp = TempDir::new().expect("tempdir");
        const MIB: u64 = 1024 * 1024;
        // v1: 25 MiB disk holding a 20 MiB file (5 MiB free);
        // v2: 45 MiB disk, empty. Average free is 25 MiB.
        let pool = seeded_pool(&temp, &[("v1", 25 * MIB), ("v2", 45 * MIB)]);

        let file = FolderPath::new("big.mkv").expect("path");
        let primary = pool.volumes()[0].primary_path(&file);
        fs::create_dir_all(primary.parent().expect("parent")).expect("mkdir");
        fs::write(&primary, vec![0_u8; (20 * MIB) as usize]).expect("big file");

        let report = rebalance(&pool, None).expect("rebalance");

        assert_eq!(report.moved_files, 1);
        assert!(!pool.volumes()[0].primary_path(&file).exists());
        assert!(pool.volumes()[1].primary_path(&file).is_file());

        let free_after: Vec<u64> = (0..2)
            .map(|i| pool.volume_space(i).expect("space").free.get())
            .collect();
        let spread = free_after[0].abs_diff(free_after[1]);
        assert!(spread <= 2 * MIN_DIFF, "spread {spread} too wide");
    }

    #[test]
    fn balanced_pool_is_left_alone() {
        let temp = TempDir::new().expect("tempdir");
        const MIB: u64 = 1024 * 1024;
        let pool = seeded_pool(&temp, &[("v1", 50 * MIB), ("v2", 50 * MIB)]);

        let report = rebalance(&pool, None).expect("rebalance");
        assert_eq!(report.moved_files, 0);
    }

    #[test]
    fn skips_files_already_present_on_the_target() {
        let temp = TempDir::new().expect("tempdir");
        const MIB: u64 = 1024 * 1024;
        let pool = seeded_pool(&temp, &[("v1", 20 * MIB), ("v2", 56 * MIB)]);

        // The only movable file already has a shadow on the sink volume.
        let file = FolderPath::new("docs/a.bin").expect("path");
        let primary = pool.volumes()[0].primary_path(&file);
        fs::create_dir_all(primary.parent().expect("parent")).expect("mkdir");
        fs::write(&primary, vec![1_u8; (12 * MIB) as usize]).expect("primary");
        let shadow = pool.volumes()[1].shadow_path(&file, 0);
        fs::create_dir_all(shadow.parent().expect("parent")).expect("sentinel");
        fs::write(&shadow, vec![1_u8; (12 * MIB) as usize]).expect("shadow");

        let report = rebalance(&pool, None).expect("rebalance");
        assert_eq!(report.moved_files, 0);
        assert!(primary.is_file());
    }

    #[test]
    fn small_files_stay_put() {
        let temp = TempDir::new().expect("tempdir");
        const MIB: u64 = 1024 * 1024;
        let pool = seeded_pool(&temp, &[("v1", 12 * MIB), ("v2", 12 * MIB)]);

        // Under MIN_FILE, not a rebalance candidate.
        let file = FolderPath::new("tiny.txt").expect("path");
        let primary = pool.volumes()[0].primary_path(&file);
        fs::create_dir_all(primary.parent().expect("parent")).expect("mkdir");
        fs::write(&primary, vec![2_u8; 1024]).expect("tiny");

        let report = rebalance(&pool, None).expect("rebalance");
        assert_eq!(report.moved_files, 0);
    }
}
