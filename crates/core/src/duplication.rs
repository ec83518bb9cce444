use std::fs;
use std::path::PathBuf;

use walkdir::WalkDir;

use crate::error::{PoolError, PoolResult};
use crate::events::{Emitter, EngineOperation};
use crate::fileops;
use crate::logical::LogicalFile;
use crate::paths::FolderPath;
use crate::pool::Pool;
use crate::units::DuplicationLevel;
use crate::volume::{is_shadow_dir_name, shadow_dir_name};

/// Configured duplication level of a folder: the highest sentinel found
/// on any volume (base counts as 1, `.k` as `k + 1`), 0 when none exist.
pub fn get_level(pool: &Pool, folder: &FolderPath) -> DuplicationLevel {
    let mut level = 0_u32;
    for volume in pool.volumes() {
        for (index, _) in volume.shadow_dirs(folder) {
            level = level.max(index + 1);
        }
    }
    DuplicationLevel::clamped(level)
}

fn validate_level(pool: &Pool, level: DuplicationLevel) -> PoolResult<u32> {
    let n = level.get() as usize;
    if n == 0 || n > pool.volumes().len().saturating_sub(1) {
        return Err(PoolError::InvalidArgument(format!(
            "duplication level {n} requires between 1 and {} for a {}-volume pool",
            pool.volumes().len().saturating_sub(1),
            pool.volumes().len()
        )));
    }
    Ok(n as u32)
}

/// Turns duplication on for a folder by creating the sentinel directory
/// (and numbered siblings for levels above one) on every volume. Shadow
/// files are materialized later by the repair engine.
pub fn enable(pool: &Pool, folder: &FolderPath, level: DuplicationLevel) -> PoolResult<()> {
    let n = validate_level(pool, level)?;
    let mut emitter = Emitter::new(pool.sink(), EngineOperation::Duplication);
    for volume in pool.volumes() {
        let base = volume.folder_path(folder);
        for index in 0..n {
            let dir = base.join(shadow_dir_name(index));
            fs::create_dir_all(&dir).map_err(|err| PoolError::io(&dir, err))?;
        }
        emitter.emit("enable", Some(base.as_path()), u64::from(n), 0);
    }
    Ok(())
}

/// Turns duplication off for a folder subtree: every sentinel directory
/// (base and numbered, at any depth) is deleted together with the shadow
/// copies inside it. Primaries are untouched.
pub fn disable(pool: &Pool, folder: &FolderPath) -> PoolResult<()> {
    let mut emitter = Emitter::new(pool.sink(), EngineOperation::Duplication);
    for volume in pool.volumes() {
        let base = volume.folder_path(folder);
        if !base.is_dir() {
            continue;
        }
        let mut sentinels: Vec<PathBuf> = WalkDir::new(&base)
            .follow_links(false)
            .into_iter()
            .flatten()
            .filter(|entry| {
                entry.file_type().is_dir()
                    && is_shadow_dir_name(&entry.file_name().to_string_lossy())
            })
            .map(|entry| entry.path().to_path_buf())
            .collect();
        sentinels.sort();

        let mut removed = 0_u64;
        for sentinel in sentinels {
            match fs::remove_dir_all(&sentinel) {
                Ok(()) => removed = removed.saturating_add(1),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(PoolError::io(&sentinel, err)),
            }
        }
        emitter.emit("disable", Some(base.as_path()), removed, 0);
    }
    Ok(())
}

/// Reshapes a folder to the given level: 0 disables, otherwise sentinels
/// and per-file shadow counts are diffed against the current state.
pub fn set_level(pool: &Pool, folder: &FolderPath, level: DuplicationLevel) -> PoolResult<()> {
    if level.is_disabled() {
        return disable(pool, folder);
    }
    let n = validate_level(pool, level)?;

    for volume in pool.volumes() {
        let base = volume.folder_path(folder);
        for index in 0..n {
            let dir = base.join(shadow_dir_name(index));
            fs::create_dir_all(&dir).map_err(|err| PoolError::io(&dir, err))?;
        }
    }

    let files: Vec<LogicalFile> = pool.files(folder, false).collect();
    for file in &files {
        reshape_file_shadows(pool, file, n)?;
    }

    for volume in pool.volumes() {
        for (index, dir) in volume.shadow_dirs(folder) {
            if index >= n {
                match fs::remove_dir_all(&dir) {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => return Err(PoolError::io(&dir, err)),
                }
            }
        }
    }
    Ok(())
}

/// Brings one file's shadow count to `target`, adding copies on the
/// volumes with most free space and trimming surplus copies from the
/// highest sentinels down.
fn reshape_file_shadows(pool: &Pool, file: &LogicalFile, target: u32) -> PoolResult<()> {
    // (sentinel index, volume, disk path), lowest sentinel first.
    let mut shadows: Vec<(u32, usize, PathBuf)> = Vec::new();
    for (index, volume) in pool.volumes().iter().enumerate() {
        for (sentinel, path) in volume.shadow_locations(&file.path) {
            shadows.push((sentinel, index, path));
        }
    }
    shadows.sort();

    let target = target as usize;
    if shadows.len() > target {
        for (_, _, path) in shadows.split_off(target) {
            fileops::delete_file(&path)?;
        }
    }

    // Kept copies stranded in a sentinel about to be removed slide down
    // to a free slot on the same volume.
    for (sentinel, volume_index, path) in &shadows {
        if *sentinel < target as u32 {
            continue;
        }
        let volume = pool.volume(*volume_index)?;
        let slot = (0..target as u32).find(|candidate| {
            !volume.shadow_path(&file.path, *candidate).is_file()
        });
        match slot {
            Some(slot) => {
                let dest = volume.shadow_path(&file.path, slot);
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent).map_err(|err| PoolError::io(parent, err))?;
                }
                fs::rename(path, &dest).map_err(|err| PoolError::io(path, err))?;
            }
            None => fileops::delete_file(path)?,
        }
    }

    let mut have = pool
        .logical_file(&file.path)
        .map(|f| f.shadow_count())
        .unwrap_or(0);
    while have < target {
        let current = pool.logical_file(&file.path).ok_or_else(|| {
            PoolError::NotFound(format!("logical file {}", file.path))
        })?;
        let Some(candidate) = pool.volume_with_most_free(&current.volumes())? else {
            break;
        };
        create_additional_shadow(pool, &current, candidate)?;
        have += 1;
    }
    Ok(())
}

/// Creates one more shadow copy of a file on the given volume, spilling
/// into the next numbered sentinel when the volume already holds copies.
pub fn create_additional_shadow(
    pool: &Pool,
    file: &LogicalFile,
    target_volume: usize,
) -> PoolResult<()> {
    let volume = pool.volume(target_volume)?;
    if file.primary_on(target_volume).is_some() {
        return Err(PoolError::InvalidArgument(format!(
            "volume \"{}\" already holds the primary of {}",
            volume.label, file.path
        )));
    }

    let source = file
        .primaries()
        .next()
        .or_else(|| file.shadows().next())
        .ok_or_else(|| PoolError::NotFound(format!("no location for {}", file.path)))?;

    let index = volume.shadow_locations(&file.path).len() as u32;
    let dest = volume.shadow_path(&file.path, index);
    fileops::copy_file(&source.disk_path, &dest)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    use tempfile::TempDir;
    use uuid::Uuid;

    use crate::detect::PoolDetector;
    use crate::device::{DiskSpace, FreeSpaceProbe, StaticMounts};
    use crate::error::PoolResult;
    use crate::events::NoopSink;
    use crate::paths::FolderPath;
    use crate::pool::Pool;
    use crate::units::{ByteSize, DuplicationLevel};
    use crate::volume::shadow_dir_name;

    use super::{create_additional_shadow, disable, enable, get_level, set_level};

    struct FixedSpace;

    impl FreeSpaceProbe for FixedSpace {
        fn disk_space(&self, _path: &Path) -> PoolResult<DiskSpace> {
            Ok(DiskSpace {
                free: ByteSize(10 << 30),
                total: ByteSize(20 << 30),
            })
        }
    }

    fn seeded_pool(temp: &TempDir, mounts: &[&str]) -> Pool {
        let id = Uuid::new_v4();
        let mut roots: Vec<PathBuf> = Vec::new();
        for name in mounts {
            let mount = temp.path().join(name);
            fs::create_dir_all(mount.join(format!("{{{id}}}"))).expect("pool root");
            fs::write(
                mount.join(format!("{name}.MP.$DRIVEBENDER")),
                format!("id:{id}\nvolumelabel:pool\n"),
            )
            .expect("descriptor");
            roots.push(mount);
        }
        let detector = PoolDetector::new(
            Arc::new(StaticMounts::new(roots)),
            Arc::new(FixedSpace),
            Arc::new(NoopSink),
        );
        detector.detect().expect("detect").remove(0)
    }

    #[test]
    fn enable_creates_sentinels_on_every_volume() {
        let temp = TempDir::new().expect("tempdir");
        let pool = seeded_pool(&temp, &["m1", "m2", "m3"]);
        let folder = FolderPath::new("docs").expect("path");

        enable(&pool, &folder, DuplicationLevel::DOUBLE).expect("enable");

        for volume in pool.volumes() {
            assert!(volume
                .folder_path(&folder)
                .join(shadow_dir_name(0))
                .is_dir());
            assert!(volume
                .folder_path(&folder)
                .join(shadow_dir_name(1))
                .is_dir());
        }
        assert_eq!(get_level(&pool, &folder).get(), 2);
    }

    #[test]
    fn enable_rejects_levels_the_pool_cannot_hold() {
        let temp = TempDir::new().expect("tempdir");
        let pool = seeded_pool(&temp, &["m1", "m2"]);
        let folder = FolderPath::new("docs").expect("path");

        assert!(enable(&pool, &folder, DuplicationLevel::DOUBLE).is_err());
        assert!(enable(&pool, &folder, DuplicationLevel::DISABLED).is_err());
        assert!(enable(&pool, &folder, DuplicationLevel::SINGLE).is_ok());
    }

    #[test]
    fn level_reflects_the_highest_numbered_sentinel() {
        let temp = TempDir::new().expect("tempdir");
        let pool = seeded_pool(&temp, &["m1", "m2"]);
        let folder = FolderPath::new("docs").expect("path");

        // A numbered sentinel without the base still counts.
        let dir = pool.volumes()[1]
            .folder_path(&folder)
            .join(shadow_dir_name(2));
        fs::create_dir_all(dir).expect("sentinel");

        assert_eq!(get_level(&pool, &folder).get(), 3);
    }

    #[test]
    fn disable_removes_shadow_files_and_all_sentinels() {
        let temp = TempDir::new().expect("tempdir");
        let pool = seeded_pool(&temp, &["m1", "m2"]);
        let folder = FolderPath::new("docs").expect("path");
        let file = FolderPath::new("docs/a.txt").expect("path");

        let primary = pool.volumes()[0].primary_path(&file);
        fs::create_dir_all(primary.parent().expect("parent")).expect("mkdir");
        fs::write(&primary, b"payload").expect("primary");
        enable(&pool, &folder, DuplicationLevel::SINGLE).expect("enable");
        let logical = pool.logical_file(&file).expect("logical");
        create_additional_shadow(&pool, &logical, 1).expect("shadow");
        // A nested folder with its own sentinel goes too.
        let nested = pool.volumes()[0]
            .folder_path(&folder)
            .join("inner")
            .join(shadow_dir_name(1));
        fs::create_dir_all(&nested).expect("nested sentinel");

        disable(&pool, &folder).expect("disable");

        assert_eq!(get_level(&pool, &folder).get(), 0);
        assert!(!nested.exists());
        let logical = pool.logical_file(&file).expect("logical");
        assert_eq!(logical.shadow_count(), 0);
        assert_eq!(logical.primary_count(), 1);
    }

    #[test]
    fn set_level_round_trips_with_get_level() {
        let temp = TempDir::new().expect("tempdir");
        let pool = seeded_pool(&temp, &["m1", "m2", "m3", "m4"]);
        let folder = FolderPath::new("docs").expect("path");

        let primary = pool.volumes()[0].primary_path(&FolderPath::new("docs/a.txt").expect("p"));
        fs::create_dir_all(primary.parent().expect("parent")).expect("mkdir");
        fs::write(&primary, b"payload").expect("primary");

        for n in [2_u8, 3, 1, 0] {
            let level = DuplicationLevel::new(n).expect("level");
            set_level(&pool, &folder, level).expect("set_level");
            assert_eq!(get_level(&pool, &folder).get(), n);
        }
    }

    #[test]
    fn set_level_materializes_and_trims_shadows() {
        let temp = TempDir::new().expect("tempdir");
        let pool = seeded_pool(&temp, &["m1", "m2", "m3"]);
        let folder = FolderPath::new("docs").expect("path");
        let file = FolderPath::new("docs/a.txt").expect("path");

        let primary = pool.volumes()[0].primary_path(&file);
        fs::create_dir_all(primary.parent().expect("parent")).expect("mkdir");
        fs::write(&primary, b"payload").expect("primary");

        set_level(&pool, &folder, DuplicationLevel::DOUBLE).expect("raise");
        let logical = pool.logical_file(&file).expect("logical");
        assert_eq!(logical.shadow_count(), 2);
        // Copies land on distinct volumes, never beside the primary.
        let mut volumes: Vec<usize> = logical.shadows().map(|s| s.volume).collect();
        volumes.sort();
        volumes.dedup();
        assert_eq!(volumes.len(), 2);
        assert!(!volumes.contains(&0));

        set_level(&pool, &folder, DuplicationLevel::SINGLE).expect("lower");
        let logical = pool.logical_file(&file).expect("logical");
        assert_eq!(logical.shadow_count(), 1);
        assert_eq!(get_level(&pool, &folder).get(), 1);
    }

    #[test]
    fn additional_shadow_spills_into_numbered_sentinel() {
        let temp = TempDir::new().expect("tempdir");
        let pool = seeded_pool(&temp, &["m1", "m2"]);
        let file = FolderPath::new("docs/a.txt").expect("path");

        let primary = pool.volumes()[0].primary_path(&file);
        fs::create_dir_all(primary.parent().expect("parent")).expect("mkdir");
        fs::write(&primary, b"payload").expect("primary");

        let logical = pool.logical_file(&file).expect("logical");
        create_additional_shadow(&pool, &logical, 1).expect("first shadow");
        let logical = pool.logical_file(&file).expect("logical");
        create_additional_shadow(&pool, &logical, 1).expect("second shadow");

        let copies = pool.volumes()[1].shadow_locations(&file);
        assert_eq!(
            copies.iter().map(|(i, _)| *i).collect::<Vec<_>>(),
            vec![0, 1]
        );

        // The primary's own volume is refused.
        let logical = pool.logical_file(&file).expect("logical");
        assert!(create_additional_shadow(&pool, &logical, 0).is_err());
    }

    #[test]
    fn most_free_volume_ties_break_by_order() {
        let temp = TempDir::new().expect("tempdir");
        let pool = seeded_pool(&temp, &["m1", "m2", "m3"]);
        let winner = pool
            .volume_with_most_free(&HashSet::from([0]))
            .expect("probe")
            .expect("candidate");
        // Equal free space everywhere: the first non-excluded volume wins.
        assert_eq!(winner, 1);
    }
}
