use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::error::{PoolError, PoolResult};
use crate::events::{is_cancelled, CancelFlag, Emitter, EngineOperation};
use crate::fileops;
use crate::logical::{FileLocation, LogicalFile};
use crate::paths::FolderPath;
use crate::pool::Pool;
use crate::units::DuplicationLevel;
use crate::duplication;
use crate::volume::shadow_dir_name;

const COMPARE_BUF: usize = 64 * 1024;

/// Outcome of one fixer run. Per-file failures are recorded and the run
/// continues with the remaining items.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FixReport {
    pub examined: u64,
    pub repaired: u64,
    pub failed: u64,
    pub warnings: Vec<String>,
    pub cancelled: bool,
}

impl FixReport {
    fn warn(&mut self, message: String) {
        self.failed = self.failed.saturating_add(1);
        self.warnings.push(message);
    }
}

/// Byte equality: sizes first, then a streamed compare.
pub(crate) fn files_equal(a: &Path, b: &Path) -> PoolResult<bool> {
    let meta_a = fs::metadata(a).map_err(|err| PoolError::io(a, err))?;
    let meta_b = fs::metadata(b).map_err(|err| PoolError::io(b, err))?;
    if meta_a.len() != meta_b.len() {
        return Ok(false);
    }

    let mut reader_a = BufReader::new(File::open(a).map_err(|err| PoolError::io(a, err))?);
    let mut reader_b = BufReader::new(File::open(b).map_err(|err| PoolError::io(b, err))?);
    let mut buf_a = vec![0_u8; COMPARE_BUF];
    let mut buf_b = vec![0_u8; COMPARE_BUF];
    loop {
        let read = reader_a
            .read(&mut buf_a)
            .map_err(|err| PoolError::io(a, err))?;
        if read == 0 {
            return Ok(true);
        }
        reader_b
            .read_exact(&mut buf_b[..read])
            .map_err(|err| PoolError::io(b, err))?;
        if buf_a[..read] != buf_b[..read] {
            return Ok(false);
        }
    }
}

pub(crate) fn modified_time(path: &Path) -> SystemTime {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .unwrap_or(UNIX_EPOCH)
}

/// The copy to keep among duplicates: most recently modified, ties going
/// to the earliest location in volume order.
fn select_keeper<'a>(locations: &[&'a FileLocation]) -> &'a FileLocation {
    let mut keeper = locations[0];
    let mut keeper_time = modified_time(&keeper.disk_path);
    for location in &locations[1..] {
        let time = modified_time(&location.disk_path);
        if time > keeper_time {
            keeper = location;
            keeper_time = time;
        }
    }
    keeper
}

fn first_free_sentinel(pool: &Pool, file: &FolderPath, volume_index: usize) -> PoolResult<u32> {
    let volume = pool.volume(volume_index)?;
    Ok((0..=u32::from(DuplicationLevel::MAX))
        .find(|index| !volume.shadow_path(file, *index).is_file())
        .unwrap_or(0))
}

/// Makes `target` hold a primary for the file.
///
/// Already primary there: done. Shadow there: rename it out of the
/// sentinel, demoting any other volume's primary into a shadow (the
/// first rename is rolled back if the demotion fails). Otherwise: copy
/// from the best location via temp-then-rename and delete the old
/// primary, removing the fresh target if that deletion fails so
/// primaries never end up duplicated.
pub fn set_primary(pool: &Pool, file: &LogicalFile, target: usize) -> PoolResult<()> {
    let volume = pool.volume(target)?;
    let target_primary = volume.primary_path(&file.path);
    if file.primary_on(target).is_some() || target_primary.is_file() {
        return Ok(());
    }

    if let Some(shadow) = file.shadow_on(target) {
        if let Some(parent) = target_primary.parent() {
            fs::create_dir_all(parent).map_err(|err| PoolError::io(parent, err))?;
        }
        fs::rename(&shadow.disk_path, &target_primary)
            .map_err(|err| PoolError::io(&shadow.disk_path, err))?;

        if let Some(old) = file.primaries().find(|loc| loc.volume != target) {
            let slot = first_free_sentinel(pool, &file.path, old.volume)?;
            let old_volume = pool.volume(old.volume)?;
            let demoted = old_volume.shadow_path(&file.path, slot);
            let outcome = demoted
                .parent()
                .map(|parent| fs::create_dir_all(parent).map_err(|err| PoolError::io(parent, err)))
                .unwrap_or(Ok(()))
                .and_then(|()| {
                    fs::rename(&old.disk_path, &demoted)
                        .map_err(|err| PoolError::io(&old.disk_path, err))
                });
            if let Err(err) = outcome {
                let _ = fs::rename(&target_primary, &shadow.disk_path);
                return Err(err);
            }
        }
        return Ok(());
    }

    let source = file
        .primaries()
        .next()
        .or_else(|| file.shadows().next())
        .ok_or_else(|| PoolError::NotFound(format!("no location for {}", file.path)))?;
    fileops::copy_file(&source.disk_path, &target_primary)?;
    if let Some(old) = file.primaries().find(|loc| loc.volume != target) {
        if let Err(err) = fileops::delete_file(&old.disk_path) {
            let _ = fileops::delete_file(&target_primary);
            return Err(err);
        }
    }
    Ok(())
}

/// Makes `target` hold a shadow copy for the file; the mirror image of
/// [`set_primary`].
///
/// A primary on the target is demoted into a sentinel and another
/// volume's shadow is promoted to keep the file owning a primary, with
/// rollback if the promotion fails. Otherwise a copy is materialized
/// through temp-then-rename; existing shadows elsewhere stay, since
/// several are legitimate under levels above one.
pub fn set_shadow(pool: &Pool, file: &LogicalFile, target: usize) -> PoolResult<()> {
    let volume = pool.volume(target)?;
    if file.shadow_on(target).is_some() {
        return Ok(());
    }

    if let Some(primary) = file.primary_on(target) {
        let slot = first_free_sentinel(pool, &file.path, target)?;
        let demoted = volume.shadow_path(&file.path, slot);
        if let Some(parent) = demoted.parent() {
            fs::create_dir_all(parent).map_err(|err| PoolError::io(parent, err))?;
        }
        fs::rename(&primary.disk_path, &demoted)
            .map_err(|err| PoolError::io(&primary.disk_path, err))?;

        if let Some(other) = file.shadows().find(|loc| loc.volume != target) {
            let other_volume = pool.volume(other.volume)?;
            let promoted = other_volume.primary_path(&file.path);
            let outcome = promoted
                .parent()
                .map(|parent| fs::create_dir_all(parent).map_err(|err| PoolError::io(parent, err)))
                .unwrap_or(Ok(()))
                .and_then(|()| {
                    fs::rename(&other.disk_path, &promoted)
                        .map_err(|err| PoolError::io(&other.disk_path, err))
                });
            if let Err(err) = outcome {
                let _ = fs::rename(&demoted, &primary.disk_path);
                return Err(err);
            }
        }
        return Ok(());
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

/// Ensures the base sentinel exists on every volume for every folder
/// that directly contains files. Only the directory is created; shadow
/// files are materialized by `fix_missing_shadow_copies`.
pub fn fix_missing_duplication_on_all_folders(
    pool: &Pool,
    cancel: Option<&CancelFlag>,
) -> PoolResult<FixReport> {
    let mut report = FixReport::default();
    let mut emitter = Emitter::new(pool.sink(), EngineOperation::Repair);

    let folders: BTreeSet<FolderPath> = pool
        .files(&FolderPath::root(), true)
        .map(|file| file.path.parent())
        .collect();

    for folder in folders {
        if is_cancelled(cancel) {
            report.cancelled = true;
            break;
        }
        report.examined = report.examined.saturating_add(1);

        let mut created = false;
        let mut failed = false;
        for volume in pool.volumes() {
            let sentinel = volume.folder_path(&folder).join(shadow_dir_name(0));
            if sentinel.is_dir() {
                continue;
            }
            match fs::create_dir_all(&sentinel) {
                Ok(()) => created = true,
                Err(err) => {
                    failed = true;
                    report.warnings.push(format!(
                        "cannot create sentinel {}: {err}",
                        sentinel.display()
                    ));
                }
            }
        }
        if failed {
            report.failed = report.failed.saturating_add(1);
        } else if created {
            report.repaired = report.repaired.saturating_add(1);
        }
        emitter.emit(
            "missing_duplication",
            None,
            report.examined,
            report.failed,
        );
    }
    Ok(report)
}

fn collapse_duplicates(report: &mut FixReport, locations: Vec<&FileLocation>) {
    if locations.len() < 2 {
        return;
    }
    let keeper = select_keeper(&locations);
    let mut removed = false;
    for location in &locations {
        if std::ptr::eq(*location, keeper) {
            continue;
        }
        match files_equal(&keeper.disk_path, &location.disk_path) {
            // Unequal copies stay; a deep integrity check surfaces them
            // as a hash mismatch.
            Ok(false) => {}
            Ok(true) => match fileops::delete_file(&location.disk_path) {
                Ok(()) => removed = true,
                Err(err) => report.warn(format!(
                    "cannot delete duplicate {}: {err}",
                    location.disk_path.display()
                )),
            },
            Err(err) => report.warn(format!(
                "cannot compare {} against {}: {err}",
                location.disk_path.display(),
                keeper.disk_path.display()
            )),
        }
    }
    if removed {
        report.repaired = report.repaired.saturating_add(1);
    }
}

/// Collapses byte-equal primaries of one file down to a single copy.
pub fn fix_duplicate_primaries(pool: &Pool, cancel: Option<&CancelFlag>) -> PoolResult<FixReport> {
    let mut report = FixReport::default();
    let mut emitter = Emitter::new(pool.sink(), EngineOperation::Repair);

    for file in pool.files(&FolderPath::root(), true) {
        if is_cancelled(cancel) {
            report.cancelled = true;
            break;
        }
        report.examined = report.examined.saturating_add(1);
        let primaries: Vec<&FileLocation> = file.primaries().collect();
        collapse_duplicates(&mut report, primaries);
        emitter.emit(
            "duplicate_primaries",
            None,
            report.examined,
            report.failed,
        );
    }
    Ok(report)
}

/// Collapses redundant shadow copies that pile up on a single volume;
/// copies spread across volumes are what duplication levels above one
/// expect and stay put.
pub fn fix_duplicate_shadow_copies(
    pool: &Pool,
    cancel: Option<&CancelFlag>,
) -> PoolResult<FixReport> {
    let mut report = FixReport::default();
    let mut emitter = Emitter::new(pool.sink(), EngineOperation::Repair);

    for file in pool.files(&FolderPath::root(), true) {
        if is_cancelled(cancel) {
            report.cancelled = true;
            break;
        }
        report.examined = report.examined.saturating_add(1);
        for index in 0..pool.volumes().len() {
            let on_volume: Vec<&FileLocation> = file
                .shadows()
                .filter(|loc| loc.volume == index)
                .collect();
            collapse_duplicates(&mut report, on_volume);
        }
        emitter.emit(
            "duplicate_shadow_copies",
            None,
            report.examined,
            report.failed,
        );
    }
    Ok(report)
}

/// Promotes the first shadow of every primary-less file.
pub fn fix_missing_primaries(pool: &Pool, cancel: Option<&CancelFlag>) -> PoolResult<FixReport> {
    let mut report = FixReport::default();
    let mut emitter = Emitter::new(pool.sink(), EngineOperation::Repair);

    for file in pool.files(&FolderPath::root(), true) {
        if is_cancelled(cancel) {
            report.cancelled = true;
            break;
        }
        report.examined = report.examined.saturating_add(1);
        if file.primary_count() > 0 {
            continue;
        }
        let Some(shadow) = file.shadows().next() else {
            continue;
        };
        match set_primary(pool, &file, shadow.volume) {
            Ok(()) => report.repaired = report.repaired.saturating_add(1),
            Err(err) => report.warn(format!("cannot promote {}: {err}", file.path)),
        }
        emitter.emit("missing_primaries", None, report.examined, report.failed);
    }
    Ok(report)
}

/// Materializes shadow copies until every file meets its folder's
/// configured level, choosing the volume with the most free space among
/// those not yet holding the file.
pub fn fix_missing_shadow_copies(
    pool: &Pool,
    cancel: Option<&CancelFlag>,
) -> PoolResult<FixReport> {
    let mut report = FixReport::default();
    let mut emitter = Emitter::new(pool.sink(), EngineOperation::Repair);

    for file in pool.files(&FolderPath::root(), true) {
        if is_cancelled(cancel) {
            report.cancelled = true;
            break;
        }
        let level = duplication::get_level(pool, &file.path.parent()).get() as usize;
        if level == 0 {
            continue;
        }
        report.examined = report.examined.saturating_add(1);

        let mut current = file;
        let mut added = false;
        while current.shadow_count() < level {
            let Some(candidate) = pool.volume_with_most_free(&current.volumes())? else {
                report.warn(format!(
                    "no volume left to hold a shadow of {}",
                    current.path
                ));
                break;
            };
            if let Err(err) = set_shadow(pool, &current, candidate) {
                report.warn(format!("cannot materialize shadow of {}: {err}", current.path));
                break;
            }
            added = true;
            match pool.logical_file(&current.path) {
                Some(next) => current = next,
                None => break,
            }
        }
        if added {
            report.repaired = report.repaired.saturating_add(1);
        }
        emitter.emit(
            "missing_shadow_copies",
            None,
            report.examined,
            report.failed,
        );
    }
    Ok(report)
}
