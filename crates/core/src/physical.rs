use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use walkdir::WalkDir;

use crate::error::{PoolError, PoolResult};
use crate::paths::FolderPath;
use crate::volume::{is_shadow_dir_name, is_temp_name, Volume};

/// A real file on one volume. For shadow copies the logical path is
/// rewritten to the folder the sentinel sits in.
#[derive(Debug, Clone, Serialize)]
pub struct PhysicalFile {
    pub volume: usize,
    pub logical_path: FolderPath,
    pub disk_path: PathBuf,
    pub is_shadow: bool,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PhysicalFolder {
    pub volume: usize,
    pub logical_path: FolderPath,
    pub disk_path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub enum PhysicalItem {
    File(PhysicalFile),
    Folder(PhysicalFolder),
}

impl PhysicalItem {
    pub fn as_file(&self) -> Option<&PhysicalFile> {
        match self {
            PhysicalItem::File(file) => Some(file),
            PhysicalItem::Folder(_) => None,
        }
    }
}

fn parent_is_shadow(path: &Path) -> bool {
    path.parent()
        .and_then(|dir| dir.file_name())
        .map(|name| is_shadow_dir_name(&name.to_string_lossy()))
        .unwrap_or(false)
}

fn relative_logical(root: &Path, path: &Path) -> Option<FolderPath> {
    let rel = path.strip_prefix(root).ok()?;
    FolderPath::new(&rel.to_string_lossy()).ok()
}

fn walk_error(err: walkdir::Error) -> PoolError {
    let path = err
        .path()
        .map(Path::to_path_buf)
        .unwrap_or_else(PathBuf::new);
    match err.into_io_error() {
        Some(io_err) => PoolError::io(path, io_err),
        None => PoolError::Io {
            path,
            source: io::Error::new(io::ErrorKind::Other, "filesystem loop"),
        },
    }
}

/// Recursively enumerates the real files and folders of one volume.
///
/// Sentinel directories are never yielded as folders; their immediate
/// file children come out as shadow copies of the surrounding folder and
/// anything deeper inside a sentinel is ignored. Temp files are skipped.
/// With `suppress_errors` an unreadable subtree degrades to nothing,
/// otherwise the first failure aborts the enumeration.
pub fn enumerate_volume(
    volume: &Volume,
    volume_index: usize,
    suppress_errors: bool,
) -> PoolResult<Vec<PhysicalItem>> {
    let root = volume.root();
    let mut items = Vec::new();

    let walker = WalkDir::new(&root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            // Shadow folders never nest: do not descend into
            // directories inside a sentinel.
            !(entry.file_type().is_dir() && parent_is_shadow(entry.path()))
        });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                if suppress_errors {
                    continue;
                }
                return Err(walk_error(err));
            }
        };
        if entry.depth() == 0 {
            continue;
        }

        let name = entry.file_name().to_string_lossy().to_string();
        if entry.file_type().is_dir() {
            if is_shadow_dir_name(&name) {
                continue;
            }
            let Some(logical_path) = relative_logical(&root, entry.path()) else {
                continue;
            };
            items.push(PhysicalItem::Folder(PhysicalFolder {
                volume: volume_index,
                logical_path,
                disk_path: entry.path().to_path_buf(),
            }));
        } else if entry.file_type().is_file() {
            if is_temp_name(&name) {
                continue;
            }
            let size = match entry.metadata() {
                Ok(metadata) => metadata.len(),
                Err(err) => {
                    if suppress_errors {
                        continue;
                    }
                    return Err(walk_error(err));
                }
            };
            let is_shadow = parent_is_shadow(entry.path());
            let logical_path = if is_shadow {
                let Some(folder) = entry
                    .path()
                    .parent()
                    .and_then(Path::parent)
                    .and_then(|dir| relative_logical(&root, dir))
                else {
                    continue;
                };
                match folder.join(&name) {
                    Ok(path) => path,
                    Err(_) => continue,
                }
            } else {
                let Some(path) = relative_logical(&root, entry.path()) else {
                    continue;
                };
                path
            };
            items.push(PhysicalItem::File(PhysicalFile {
                volume: volume_index,
                logical_path,
                disk_path: entry.path().to_path_buf(),
                is_shadow,
                size,
            }));
        }
    }

    Ok(items)
}

/// Files only, shadow copies included.
pub fn enumerate_files(
    volume: &Volume,
    volume_index: usize,
    suppress_errors: bool,
) -> PoolResult<Vec<PhysicalFile>> {
    Ok(enumerate_volume(volume, volume_index, suppress_errors)?
        .into_iter()
        .filter_map(|item| match item {
            PhysicalItem::File(file) => Some(file),
            PhysicalItem::Folder(_) => None,
        })
        .collect())
}
