use std::collections::HashMap;
use std::fs;
use std::path::Path;

use chrono::{SecondsFormat, Utc};
use uuid::Uuid;

use crate::error::{PoolError, PoolResult};

/// Filename suffix of a volume descriptor at a mount root.
pub const DESCRIPTOR_SUFFIX: &str = ".MP.$DRIVEBENDER";

pub fn is_descriptor_name(name: &str) -> bool {
    name.to_ascii_uppercase().ends_with(DESCRIPTOR_SUFFIX)
}

/// Parsed body of a `*.MP.$DRIVEBENDER` file.
///
/// The body is UTF-8 text, one `key:value` per line (LF or CRLF), split
/// on the first `:`. Keys are case-insensitive; on duplicates the last
/// wins; blank and malformed lines are ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeDescriptor {
    pub id: Uuid,
    pub volume_label: String,
    pub description: Option<String>,
    pub created: Option<String>,
}

impl VolumeDescriptor {
    pub fn new(id: Uuid, volume_label: impl Into<String>) -> Self {
        VolumeDescriptor {
            id,
            volume_label: volume_label.into(),
            description: None,
            created: Some(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
        }
    }

    /// Parses a descriptor body. `None` when required keys are missing
    /// or the id is not a valid 128-bit identifier.
    pub fn parse(body: &str) -> Option<Self> {
        let mut fields: HashMap<String, String> = HashMap::new();
        for line in body.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            fields.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        }

        let id = Uuid::parse_str(fields.get("id")?).ok()?;
        let volume_label = fields.get("volumelabel")?.clone();
        if volume_label.is_empty() {
            return None;
        }
        Some(VolumeDescriptor {
            id,
            volume_label,
            description: fields.get("description").cloned().filter(|s| !s.is_empty()),
            created: fields.get("created").cloned().filter(|s| !s.is_empty()),
        })
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("volumelabel:{}\n", self.volume_label));
        out.push_str(&format!("id:{}\n", self.id));
        if let Some(description) = &self.description {
            out.push_str(&format!("description:{description}\n"));
        }
        if let Some(created) = &self.created {
            out.push_str(&format!("created:{created}\n"));
        }
        out
    }

    pub fn load(path: &Path) -> PoolResult<Option<Self>> {
        let body = fs::read_to_string(path).map_err(|err| PoolError::io(path, err))?;
        Ok(Self::parse(&body))
    }

    pub fn store(&self, path: &Path) -> PoolResult<()> {
        fs::write(path, self.render()).map_err(|err| PoolError::io(path, err))
    }
}

/// Directory name of a pool root under a mount: `{<pool-id>}`.
pub fn pool_root_dir_name(id: &Uuid) -> String {
    format!("{{{id}}}")
}
