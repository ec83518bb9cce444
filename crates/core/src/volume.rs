use std::fs;
use std::path::PathBuf;

use serde::Serialize;
use uuid::Uuid;

use crate::descriptor::pool_root_dir_name;
use crate::device::{DiskSpace, FreeSpaceProbe};
use crate::error::PoolResult;
use crate::paths::FolderPath;

/// Directory name marking a shadow folder next to the files it mirrors.
pub const SHADOW_DIR_NAME: &str = "FOLDER.DUPLICATE.$DRIVEBENDER";

/// Extension of in-progress temporaries, invisible to every enumeration.
pub const TEMP_SUFFIX: &str = ".TEMP.$DRIVEBENDER";

pub fn is_temp_name(name: &str) -> bool {
    name.to_ascii_uppercase().ends_with(TEMP_SUFFIX)
}

/// `FOLDER.DUPLICATE.$DRIVEBENDER` maps to index 0, the numbered variant
/// `.<k>` to index `k`. Case-insensitive.
pub fn shadow_dir_index(name: &str) -> Option<u32> {
    let upper = name.to_ascii_uppercase();
    if upper == SHADOW_DIR_NAME {
        return Some(0);
    }
    let rest = upper.strip_prefix(SHADOW_DIR_NAME)?.strip_prefix('.')?;
    let index: u32 = rest.parse().ok()?;
    (index > 0).then_some(index)
}

pub fn is_shadow_dir_name(name: &str) -> bool {
    shadow_dir_index(name).is_some()
}

pub fn shadow_dir_name(index: u32) -> String {
    if index == 0 {
        SHADOW_DIR_NAME.to_string()
    } else {
        format!("{SHADOW_DIR_NAME}.{index}")
    }
}

/// One physical member of a pool: a directory tree at
/// `<mount>/{<pool-id>}` declared by a descriptor at the mount root.
#[derive(Debug, Clone, Serialize)]
pub struct Volume {
    pub id: Uuid,
    pub label: String,
    pub description: Option<String>,
    pub mount: PathBuf,
    pub descriptor_path: PathBuf,
}

impl Volume {
    pub fn root(&self) -> PathBuf {
        self.mount.join(pool_root_dir_name(&self.id))
    }

    /// Physical directory backing a logical folder on this volume.
    pub fn folder_path(&self, folder: &FolderPath) -> PathBuf {
        folder.to_fs_path(&self.root())
    }

    /// Primary location of a logical file on this volume.
    pub fn primary_path(&self, file: &FolderPath) -> PathBuf {
        file.to_fs_path(&self.root())
    }

    /// Shadow location of a logical file under the sentinel of `index`.
    pub fn shadow_path(&self, file: &FolderPath, index: u32) -> PathBuf {
        self.folder_path(&file.parent())
            .join(shadow_dir_name(index))
            .join(file.basename())
    }

    /// Existing sentinel directories in a folder, ordered by index.
    /// Enumeration failures degrade to an empty list.
    pub fn shadow_dirs(&self, folder: &FolderPath) -> Vec<(u32, PathBuf)> {
        let dir = self.folder_path(folder);
        let Ok(entries) = fs::read_dir(&dir) else {
            return Vec::new();
        };
        let mut dirs: Vec<(u32, PathBuf)> = entries
            .flatten()
            .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter_map(|entry| {
                let name = entry.file_name();
                shadow_dir_index(&name.to_string_lossy()).map(|index| (index, entry.path()))
            })
            .collect();
        dirs.sort_by_key(|(index, _)| *index);
        dirs
    }

    /// Existing shadow copies of a logical file on this volume, ordered
    /// by sentinel index.
    pub fn shadow_locations(&self, file: &FolderPath) -> Vec<(u32, PathBuf)> {
        self.shadow_dirs(&file.parent())
            .into_iter()
            .filter_map(|(index, dir)| {
                let candidate = dir.join(file.basename());
                candidate.is_file().then_some((index, candidate))
            })
            .collect()
    }

    pub fn space(&self, probe: &dyn FreeSpaceProbe) -> PoolResult<DiskSpace> {
        probe.disk_space(&self.mount)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use tempfile::TempDir;
    use uuid::Uuid;

    use crate::paths::FolderPath;

    use super::{
        is_shadow_dir_name, is_temp_name, shadow_dir_index, shadow_dir_name, Volume,
    };

    fn volume_at(mount: PathBuf) -> Volume {
        let id = Uuid::new_v4();
        let volume = Volume {
            id,
            label: "v1".to_string(),
            description: None,
            descriptor_path: mount.join("v1.MP.$DRIVEBENDER"),
            mount,
        };
        fs::create_dir_all(volume.root()).expect("pool root");
        volume
    }

    #[test]
    fn sentinel_names_round_trip() {
        assert_eq!(shadow_dir_index("FOLDER.DUPLICATE.$DRIVEBENDER"), Some(0));
        assert_eq!(shadow_dir_index("folder.duplicate.$drivebender"), Some(0));
        assert_eq!(shadow_dir_index("FOLDER.DUPLICATE.$DRIVEBENDER.2"), Some(2));
        assert_eq!(shadow_dir_index("FOLDER.DUPLICATE.$DRIVEBENDER.0"), None);
        assert_eq!(shadow_dir_index("FOLDER.DUPLICATE"), None);
        assert_eq!(shadow_dir_name(0), "FOLDER.DUPLICATE.$DRIVEBENDER");
        assert_eq!(shadow_dir_name(3), "FOLDER.DUPLICATE.$DRIVEBENDER.3");
        assert!(is_shadow_dir_name("Folder.Duplicate.$DriveBender.1"));
    }

    #[test]
    fn temp_names_match_case_insensitively() {
        assert!(is_temp_name("a.txt.TEMP.$DRIVEBENDER"));
        assert!(is_temp_name("a.txt.temp.$drivebender"));
        assert!(!is_temp_name("a.txt"));
    }

    #[test]
    fn path_math_follows_the_layout() {
        let temp = TempDir::new().expect("tempdir");
        let volume = volume_at(temp.path().to_path_buf());
        let file = FolderPath::new("docs/a.txt").expect("path");

        assert_eq!(volume.primary_path(&file), volume.root().join("docs/a.txt"));
        assert_eq!(
            volume.shadow_path(&file, 0),
            volume
                .root()
                .join("docs")
                .join("FOLDER.DUPLICATE.$DRIVEBENDER")
                .join("a.txt")
        );
        assert_eq!(
            volume.shadow_path(&file, 2),
            volume
                .root()
                .join("docs")
                .join("FOLDER.DUPLICATE.$DRIVEBENDER.2")
                .join("a.txt")
        );
    }

    #[test]
    fn finds_existing_sentinels_and_copies() {
        let temp = TempDir::new().expect("tempdir");
        let volume = volume_at(temp.path().to_path_buf());
        let folder = FolderPath::new("docs").expect("path");
        let file = FolderPath::new("docs/a.txt").expect("path");

        fs::create_dir_all(volume.folder_path(&folder).join(shadow_dir_name(0)))
            .expect("sentinel 0");
        fs::create_dir_all(volume.folder_path(&folder).join(shadow_dir_name(2)))
            .expect("sentinel 2");
        fs::write(volume.shadow_path(&file, 2), b"copy").expect("shadow copy");

        let dirs = volume.shadow_dirs(&folder);
        assert_eq!(dirs.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![0, 2]);

        let copies = volume.shadow_locations(&file);
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].0, 2);
    }
}
