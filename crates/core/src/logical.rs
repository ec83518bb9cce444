use std::collections::{HashSet, VecDeque};
use std::fs;
use std::path::PathBuf;

use serde::Serialize;

use crate::paths::FolderPath;
use crate::volume::{is_shadow_dir_name, is_temp_name, Volume};

/// One physical location of a logical file, referenced by volume index
/// in the pool's stable volume order.
#[derive(Debug, Clone, Serialize)]
pub struct FileLocation {
    pub volume: usize,
    pub disk_path: PathBuf,
    pub is_shadow: bool,
}

/// A file in the merged namespace: one logical path, one or more
/// locations across the pool's volumes.
#[derive(Debug, Clone, Serialize)]
pub struct LogicalFile {
    pub path: FolderPath,
    pub size: u64,
    pub locations: Vec<FileLocation>,
}

impl LogicalFile {
    pub fn primaries(&self) -> impl Iterator<Item = &FileLocation> {
        self.locations.iter().filter(|loc| !loc.is_shadow)
    }

    pub fn shadows(&self) -> impl Iterator<Item = &FileLocation> {
        self.locations.iter().filter(|loc| loc.is_shadow)
    }

    pub fn primary_count(&self) -> usize {
        self.primaries().count()
    }

    pub fn shadow_count(&self) -> usize {
        self.shadows().count()
    }

    /// Volumes holding this file in either role.
    pub fn volumes(&self) -> HashSet<usize> {
        self.locations.iter().map(|loc| loc.volume).collect()
    }

    pub fn primary_on(&self, volume: usize) -> Option<&FileLocation> {
        self.primaries().find(|loc| loc.volume == volume)
    }

    pub fn shadow_on(&self, volume: usize) -> Option<&FileLocation> {
        self.shadows().find(|loc| loc.volume == volume)
    }
}

/// A folder in the merged namespace. Sizes are not precomputed; use
/// `Pool::folder_size` for the descendant sum.
#[derive(Debug, Clone, Serialize)]
pub struct LogicalFolder {
    pub path: FolderPath,
}

#[derive(Debug, Clone, Serialize)]
pub enum LogicalItem {
    File(LogicalFile),
    Folder(LogicalFolder),
}

impl LogicalItem {
    pub fn path(&self) -> &FolderPath {
        match self {
            LogicalItem::File(file) => &file.path,
            LogicalItem::Folder(folder) => &folder.path,
        }
    }

    pub fn into_file(self) -> Option<LogicalFile> {
        match self {
            LogicalItem::File(file) => Some(file),
            LogicalItem::Folder(_) => None,
        }
    }
}

/// Probes every volume for the primary and shadow locations of a logical
/// path. Size comes from the first primary, falling back to the first
/// shadow.
pub(crate) fn probe_locations(volumes: &[Volume], path: &FolderPath) -> LogicalFile {
    let mut locations = Vec::new();
    for (index, volume) in volumes.iter().enumerate() {
        let primary = volume.primary_path(path);
        if primary.is_file() {
            locations.push(FileLocation {
                volume: index,
                disk_path: primary,
                is_shadow: false,
            });
        }
        for (_, shadow) in volume.shadow_locations(path) {
            locations.push(FileLocation {
                volume: index,
                disk_path: shadow,
                is_shadow: true,
            });
        }
    }

    let size = locations
        .iter()
        .find(|loc| !loc.is_shadow)
        .or_else(|| locations.first())
        .and_then(|loc| fs::metadata(&loc.disk_path).ok())
        .map(|metadata| metadata.len())
        .unwrap_or(0);

    LogicalFile {
        path: path.clone(),
        size,
        locations,
    }
}

/// Direct children of a folder on one volume's primary side, sorted by
/// name. Unreadable folders degrade to an empty listing.
fn primary_children(volume: &Volume, folder: &FolderPath) -> Vec<(String, bool)> {
    let dir = volume.folder_path(folder);
    let Ok(entries) = fs::read_dir(&dir) else {
        return Vec::new();
    };
    let mut names: Vec<(String, bool)> = entries
        .flatten()
        .filter_map(|entry| {
            let is_dir = entry.file_type().ok()?.is_dir();
            Some((entry.file_name().to_string_lossy().to_string(), is_dir))
        })
        .collect();
    names.sort();
    names
}

/// File names present in a folder's sentinels on one volume, sorted.
fn shadow_children(volume: &Volume, folder: &FolderPath) -> Vec<String> {
    let mut names = Vec::new();
    for (_, dir) in volume.shadow_dirs(folder) {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
    }
    names.sort();
    names
}

/// Lazy breadth-first walk of the merged namespace.
///
/// Per folder, names come in two passes: the union of the volumes'
/// primary-side children first, then shadow-only names (files whose
/// primary is missing everywhere). First occurrence wins; entries of the
/// same name on several volumes collapse into one item. Order is
/// deterministic for a fixed volume order.
pub struct LogicalItems<'a> {
    volumes: &'a [Volume],
    recursive: bool,
    queue: VecDeque<FolderPath>,
    buffer: VecDeque<LogicalItem>,
}

impl<'a> LogicalItems<'a> {
    pub(crate) fn new(volumes: &'a [Volume], root: &FolderPath, recursive: bool) -> Self {
        LogicalItems {
            volumes,
            recursive,
            queue: VecDeque::from([root.clone()]),
            buffer: VecDeque::new(),
        }
    }

    fn visit(&mut self, folder: &FolderPath) {
        let mut seen: HashSet<String> = HashSet::new();
        let mut ordered: Vec<(String, bool)> = Vec::new();

        for volume in self.volumes {
            for (name, is_dir) in primary_children(volume, folder) {
                if is_dir && is_shadow_dir_name(&name) {
                    continue;
                }
                if !is_dir && is_temp_name(&name) {
                    continue;
                }
                if seen.insert(name.clone()) {
                    ordered.push((name, is_dir));
                }
            }
        }
        for volume in self.volumes {
            for name in shadow_children(volume, folder) {
                if is_temp_name(&name) {
                    continue;
                }
                if seen.insert(name.clone()) {
                    ordered.push((name, false));
                }
            }
        }

        for (name, is_dir) in ordered {
            let Ok(path) = folder.join(&name) else {
                continue;
            };
            if is_dir {
                if self.recursive {
                    self.queue.push_back(path.clone());
                }
                self.buffer
                    .push_back(LogicalItem::Folder(LogicalFolder { path }));
            } else {
                let file = probe_locations(self.volumes, &path);
                if !file.locations.is_empty() {
                    self.buffer.push_back(LogicalItem::File(file));
                }
            }
        }
    }
}

impl<'a> Iterator for LogicalItems<'a> {
    type Item = LogicalItem;

    fn next(&mut self) -> Option<LogicalItem> {
        loop {
            if let Some(item) = self.buffer.pop_front() {
                return Some(item);
            }
            let folder = self.queue.pop_front()?;
            self.visit(&folder);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use tempfile::TempDir;
    use uuid::Uuid;

    use crate::paths::FolderPath;
    use crate::volume::{shadow_dir_name, Volume};

    use super::{LogicalItem, LogicalItems};

    fn two_volumes(temp: &TempDir) -> Vec<Volume> {
        let id = Uuid::new_v4();
        let mut volumes = Vec::new();
        for name in ["v1", "v2"] {
            let mount = temp.path().join(name);
            let volume = Volume {
                id,
                label: name.to_string(),
                description: None,
                descriptor_path: mount.join(format!("{name}.MP.$DRIVEBENDER")),
                mount,
            };
            fs::create_dir_all(volume.root()).expect("pool root");
            volumes.push(volume);
        }
        volumes
    }

    fn write(path: &Path, body: &[u8]) {
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, body).expect("write");
    }

    #[test]
    fn merges_volumes_into_one_namespace() {
        let temp = TempDir::new().expect("tempdir");
        let volumes = two_volumes(&temp);

        write(&volumes[0].root().join("docs/a.txt"), b"one");
        write(&volumes[1].root().join("docs/b.txt"), b"two");
        write(&volumes[1].root().join("movies/m.mkv"), b"film");

        let root = FolderPath::root();
        let items: Vec<_> = LogicalItems::new(&volumes, &root, true).collect();
        let names: Vec<String> = items.iter().map(|i| i.path().to_string()).collect();

        // BFS: both top folders first, then their children.
        assert_eq!(names, vec!["docs", "movies", "docs/a.txt", "docs/b.txt", "movies/m.mkv"]);
    }

    #[test]
    fn same_name_on_two_volumes_collapses_into_one_file() {
        let temp = TempDir::new().expect("tempdir");
        let volumes = two_volumes(&temp);

        write(&volumes[0].root().join("x.bin"), b"same");
        write(&volumes[1].root().join("x.bin"), b"same");

        let root = FolderPath::root();
        let files: Vec<_> = LogicalItems::new(&volumes, &root, true)
            .filter_map(LogicalItem::into_file)
            .collect();

        assert_eq!(files.len(), 1);
        assert_eq!(files[0].primary_count(), 2);
        assert_eq!(files[0].shadow_count(), 0);
    }

    #[test]
    fn shadow_only_files_surface_in_pass_two() {
        let temp = TempDir::new().expect("tempdir");
        let volumes = two_volumes(&temp);

        write(
            &volumes[0]
                .root()
                .join("docs")
                .join(shadow_dir_name(0))
                .join("orphan.txt"),
            b"hi",
        );

        let root = FolderPath::root();
        let files: Vec<_> = LogicalItems::new(&volumes, &root, true)
            .filter_map(LogicalItem::into_file)
            .collect();

        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path.as_str(), "docs/orphan.txt");
        assert_eq!(files[0].primary_count(), 0);
        assert_eq!(files[0].shadow_count(), 1);
    }

    #[test]
    fn temp_files_are_invisible() {
        let temp = TempDir::new().expect("tempdir");
        let volumes = two_volumes(&temp);

        write(&volumes[0].root().join("a.txt"), b"visible");
        write(
            &volumes[0].root().join("a.txt.TEMP.$DRIVEBENDER"),
            b"in progress",
        );

        let root = FolderPath::root();
        let names: Vec<String> = LogicalItems::new(&volumes, &root, true)
            .map(|i| i.path().to_string())
            .collect();
        assert_eq!(names, vec!["a.txt"]);
    }

    #[test]
    fn primary_and_shadow_of_one_file_are_one_item_with_two_locations() {
        let temp = TempDir::new().expect("tempdir");
        let volumes = two_volumes(&temp);

        write(&volumes[0].root().join("docs/a.txt"), b"payload");
        write(
            &volumes[1]
                .root()
                .join("docs")
                .join(shadow_dir_name(0))
                .join("a.txt"),
            b"payload",
        );

        let root = FolderPath::root();
        let files: Vec<_> = LogicalItems::new(&volumes, &root, true)
            .filter_map(LogicalItem::into_file)
            .collect();

        assert_eq!(files.len(), 1);
        let file = &files[0];
        assert_eq!(file.primary_count(), 1);
        assert_eq!(file.shadow_count(), 1);
        assert_eq!(file.size, 7);
        assert_eq!(file.primary_on(0).expect("primary").volume, 0);
        assert_eq!(file.shadow_on(1).expect("shadow").volume, 1);
    }
}
