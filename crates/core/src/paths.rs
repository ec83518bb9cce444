use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PoolError, PoolResult};

const POOL_NAME_MAX: usize = 255;
const ILLEGAL_NAME_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];
const ILLEGAL_SEGMENT_CHARS: &[char] = &['<', '>', '"', '|', '?', '*', '\0'];

/// Human-facing pool name. Trimmed, bounded, filename-safe; equality is
/// case-insensitive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PoolName(String);

impl PoolName {
    pub fn new(raw: &str) -> PoolResult<Self> {
        let value = raw.trim();
        if value.is_empty() {
            return Err(PoolError::InvalidArgument("pool name is empty".to_string()));
        }
        if value.chars().count() > POOL_NAME_MAX {
            return Err(PoolError::InvalidArgument(format!(
                "pool name exceeds {POOL_NAME_MAX} characters"
            )));
        }
        if let Some(bad) = value
            .chars()
            .find(|c| ILLEGAL_NAME_CHARS.contains(c) || c.is_control())
        {
            return Err(PoolError::InvalidArgument(format!(
                "pool name contains illegal character {bad:?}"
            )));
        }
        Ok(PoolName(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn matches(&self, label: &str) -> bool {
        self.0.to_lowercase() == label.trim().to_lowercase()
    }
}

impl PartialEq for PoolName {
    fn eq(&self, other: &Self) -> bool {
        self.matches(&other.0)
    }
}

impl Eq for PoolName {}

impl Hash for PoolName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_lowercase().hash(state);
    }
}

impl fmt::Display for PoolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An existing directory usable as a mount root for a pool volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DrivePath(PathBuf);

impl DrivePath {
    pub fn new(path: impl Into<PathBuf>) -> PoolResult<Self> {
        let path = path.into();
        if !path.is_dir() {
            return Err(PoolError::InvalidArgument(format!(
                "drive path {} is not an existing directory",
                path.display()
            )));
        }
        Ok(DrivePath(path))
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for DrivePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// A normalized relative path inside the pool namespace.
///
/// `/` is the only separator (`\` is accepted on input and normalized),
/// leading/trailing separators are dropped and empty segments collapse.
/// The empty path is the pool root.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FolderPath(String);

impl FolderPath {
    pub fn root() -> Self {
        FolderPath(String::new())
    }

    pub fn new(raw: &str) -> PoolResult<Self> {
        let mut segments = Vec::new();
        for segment in raw.split(['/', '\\']) {
            if segment.is_empty() {
                continue;
            }
            if let Some(bad) = segment.chars().find(|c| ILLEGAL_SEGMENT_CHARS.contains(c)) {
                return Err(PoolError::InvalidArgument(format!(
                    "path segment {segment:?} contains illegal character {bad:?}"
                )));
            }
            segments.push(segment);
        }
        Ok(FolderPath(segments.join("/")))
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|s| !s.is_empty())
    }

    /// Parent folder; the root's parent is the root itself.
    pub fn parent(&self) -> FolderPath {
        match self.0.rfind('/') {
            Some(idx) => FolderPath(self.0[..idx].to_string()),
            None => FolderPath::root(),
        }
    }

    /// Final segment, empty for the root.
    pub fn basename(&self) -> &str {
        match self.0.rfind('/') {
            Some(idx) => &self.0[idx + 1..],
            None => &self.0,
        }
    }

    pub fn join(&self, child: &str) -> PoolResult<FolderPath> {
        let child = FolderPath::new(child)?;
        Ok(self.join_path(&child))
    }

    pub fn join_path(&self, other: &FolderPath) -> FolderPath {
        if self.is_root() {
            other.clone()
        } else if other.is_root() {
            self.clone()
        } else {
            FolderPath(format!("{}/{}", self.0, other.0))
        }
    }

    /// Resolves the logical path against a physical root directory.
    pub fn to_fs_path(&self, root: &Path) -> PathBuf {
        let mut out = root.to_path_buf();
        for segment in self.segments() {
            out.push(segment);
        }
        out
    }
}

impl fmt::Display for FolderPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            f.write_str("/")
        } else {
            f.write_str(&self.0)
        }
    }
}
