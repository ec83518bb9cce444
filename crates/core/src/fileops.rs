use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use crate::error::{PoolError, PoolResult};
use crate::physical::PhysicalFile;
use crate::volume::{shadow_dir_index, Volume, TEMP_SUFFIX};

const DELETE_RETRIES: u32 = 3;
const DELETE_BACKOFF: Duration = Duration::from_millis(100);

/// Temp sibling used to stage a destination before the final rename.
pub fn temp_path(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(TEMP_SUFFIX);
    dest.with_file_name(name)
}

fn ensure_parent(dest: &Path) -> PoolResult<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|err| PoolError::io(parent, err))?;
    }
    Ok(())
}

/// Copies `source` to `dest` atomically: stage into the temp sibling,
/// then rename. Either `dest` exists afterwards or nothing persists; the
/// temp never survives an exit path.
pub fn copy_file(source: &Path, dest: &Path) -> PoolResult<()> {
    ensure_parent(dest)?;
    let temp = temp_path(dest);
    if let Err(err) = fs::copy(source, &temp) {
        let _ = fs::remove_file(&temp);
        return Err(PoolError::io(source, err));
    }
    if let Err(err) = fs::rename(&temp, dest) {
        let _ = fs::remove_file(&temp);
        return Err(PoolError::io(dest, err));
    }
    Ok(())
}

/// Unlinks `path`, clearing a read-only attribute first. Absent files
/// are a no-op.
pub fn delete_file(path: &Path) -> PoolResult<()> {
    match fs::symlink_metadata(path) {
        Ok(metadata) => {
            let mut permissions = metadata.permissions();
            if permissions.readonly() {
                #[allow(clippy::permissions_set_readonly_false)]
                permissions.set_readonly(false);
                let _ = fs::set_permissions(path, permissions);
            }
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(PoolError::io(path, err)),
    }
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(PoolError::io(path, err)),
    }
}

/// Moves `source` to `dest` via copy-then-delete. If the source cannot be
/// removed because access is denied, the fresh target is deleted (with
/// retries) so the file does not end up in two places, and the original
/// failure propagates.
pub fn move_file(source: &Path, dest: &Path) -> PoolResult<()> {
    copy_file(source, dest)?;
    if let Err(err) = delete_file(source) {
        if err.is_access_denied() {
            for attempt in 0..DELETE_RETRIES {
                if delete_file(dest).is_ok() {
                    break;
                }
                if attempt + 1 < DELETE_RETRIES {
                    thread::sleep(DELETE_BACKOFF);
                }
            }
        }
        return Err(err);
    }
    Ok(())
}

/// Moves a physical file to another volume, preserving its role: a
/// primary lands at the primary location, a shadow lands under the same
/// sentinel index on the target. Returns the new disk path.
pub fn move_to_volume(
    file: &PhysicalFile,
    target: &Volume,
    as_primary: bool,
) -> PoolResult<PathBuf> {
    let dest = if as_primary {
        target.primary_path(&file.logical_path)
    } else {
        let index = file
            .disk_path
            .parent()
            .and_then(|dir| dir.file_name())
            .and_then(|name| shadow_dir_index(&name.to_string_lossy()))
            .unwrap_or(0);
        target.shadow_path(&file.logical_path, index)
    };
    move_file(&file.disk_path, &dest)?;
    Ok(dest)
}
