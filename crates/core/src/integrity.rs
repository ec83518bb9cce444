use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::duplication;
use crate::error::{PoolError, PoolResult};
use crate::events::{is_cancelled, CancelFlag, Emitter, EngineOperation};
use crate::fileops;
use crate::logical::{FileLocation, LogicalFile};
use crate::paths::FolderPath;
use crate::pool::Pool;
use crate::repair as repair_mod;

const HASH_BUF: usize = 64 * 1024;

/// Mount-root directory receiving pre-repair backups. It sits beside the
/// descriptor, outside `{<pool-id>}`, so it can never surface in the
/// logical namespace.
pub const BACKUP_DIR_NAME: &str = "BACKUP.$DRIVEBENDER";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    MissingPrimary,
    MissingShadowCopy,
    DuplicatePrimary,
    DuplicateShadowCopy,
    OrphanedShadowCopy,
    HashMismatch,
    CorruptedFile,
    AccessDenied,
}

impl IssueKind {
    /// Hash mismatches and permission problems need a human.
    pub fn auto_repairable(self) -> bool {
        !matches!(self, IssueKind::HashMismatch | IssueKind::AccessDenied)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IntegrityIssue {
    pub kind: IssueKind,
    pub path: FolderPath,
    pub locations: Vec<FileLocation>,
    pub detail: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IntegrityReport {
    pub issues: Vec<IntegrityIssue>,
    pub files_checked: u64,
    pub warnings: Vec<String>,
    pub cancelled: bool,
}

impl IntegrityReport {
    pub fn count(&self, kind: IssueKind) -> usize {
        self.issues.iter().filter(|issue| issue.kind == kind).count()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CheckOptions {
    pub deep_scan: bool,
    pub cancel_flag: Option<CancelFlag>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RepairOptions {
    pub dry_run: bool,
    pub create_backup: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RepairSummary {
    pub attempted: u64,
    pub repaired: u64,
    pub unsupported: u64,
    pub failed: u64,
    pub warnings: Vec<String>,
}

fn hash_location(path: &Path) -> io::Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0_u8; HASH_BUF];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn check_logical_file(
    pool: &Pool,
    file: &LogicalFile,
    deep_scan: bool,
    issues: &mut Vec<IntegrityIssue>,
) {
    let level = duplication::get_level(pool, &file.path.parent()).get() as usize;
    let primaries = file.primary_count();
    let shadows = file.shadow_count();

    if primaries == 0 && shadows > 0 {
        issues.push(IntegrityIssue {
            kind: IssueKind::MissingPrimary,
            path: file.path.clone(),
            locations: file.shadows().cloned().collect(),
            detail: format!("{shadows} shadow copies exist but no primary"),
        });
    }
    if primaries > 1 {
        issues.push(IntegrityIssue {
            kind: IssueKind::DuplicatePrimary,
            path: file.path.clone(),
            locations: file.primaries().cloned().collect(),
            detail: format!("{primaries} primaries across volumes"),
        });
    }
    if level > 0 && shadows < level {
        issues.push(IntegrityIssue {
            kind: IssueKind::MissingShadowCopy,
            path: file.path.clone(),
            locations: file.locations.clone(),
            detail: format!("folder level {level}, only {shadows} shadow copies"),
        });
    }
    if level > 0 && shadows > level {
        issues.push(IntegrityIssue {
            kind: IssueKind::DuplicateShadowCopy,
            path: file.path.clone(),
            locations: file.shadows().cloned().collect(),
            detail: format!("folder level {level}, {shadows} shadow copies"),
        });
    }
    if level == 0 && shadows > 0 && primaries > 0 {
        issues.push(IntegrityIssue {
            kind: IssueKind::OrphanedShadowCopy,
            path: file.path.clone(),
            locations: file.shadows().cloned().collect(),
            detail: "shadow copies exist but duplication is off for the folder".to_string(),
        });
    }

    if deep_scan {
        let mut by_digest: HashMap<String, Vec<FileLocation>> = HashMap::new();
        for location in &file.locations {
            match hash_location(&location.disk_path) {
                Ok(digest) => by_digest.entry(digest).or_default().push(location.clone()),
                Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
                    issues.push(IntegrityIssue {
                        kind: IssueKind::AccessDenied,
                        path: file.path.clone(),
                        locations: vec![location.clone()],
                        detail: "access denied while hashing".to_string(),
                    });
                }
                Err(err) => {
                    issues.push(IntegrityIssue {
                        kind: IssueKind::CorruptedFile,
                        path: file.path.clone(),
                        locations: vec![location.clone()],
                        detail: format!("hash failed: {err}"),
                    });
                }
            }
        }
        if by_digest.len() > 1 {
            let locations: Vec<FileLocation> =
                by_digest.into_values().flatten().collect();
            issues.push(IntegrityIssue {
                kind: IssueKind::HashMismatch,
                path: file.path.clone(),
                locations,
                detail: "locations disagree on SHA-256".to_string(),
            });
        }
    } else {
        for location in &file.locations {
            if let Err(err) = fs::metadata(&location.disk_path) {
                if err.kind() == io::ErrorKind::PermissionDenied {
                    issues.push(IntegrityIssue {
                        kind: IssueKind::AccessDenied,
                        path: file.path.clone(),
                        locations: vec![location.clone()],
                        detail: "access denied while inspecting".to_string(),
                    });
                }
            }
        }
    }
}

/// Walks the pool and reports every integrity issue. A deep scan hashes
/// all locations with SHA-256; a shallow one judges structure only.
pub fn check(pool: &Pool, options: &CheckOptions) -> PoolResult<IntegrityReport> {
    let mut report = IntegrityReport::default();
    let mut emitter = Emitter::new(pool.sink(), EngineOperation::IntegrityCheck);
    emitter.emit(
        if options.deep_scan { "deep" } else { "shallow" },
        None,
        0,
        0,
    );

    for file in pool.files(&FolderPath::root(), true) {
        if is_cancelled(options.cancel_flag.as_ref()) {
            report.cancelled = true;
            break;
        }
        report.files_checked = report.files_checked.saturating_add(1);
        check_logical_file(pool, &file, options.deep_scan, &mut report.issues);
        emitter.emit(
            "checking",
            None,
            report.files_checked,
            report.issues.len() as u64,
        );
    }

    emitter.emit("done", None, report.files_checked, report.issues.len() as u64);
    Ok(report)
}

/// Inspects a single logical path.
pub fn check_file(
    pool: &Pool,
    path: &FolderPath,
    deep_scan: bool,
) -> PoolResult<Vec<IntegrityIssue>> {
    let file = pool
        .logical_file(path)
        .ok_or_else(|| PoolError::NotFound(format!("logical file {path}")))?;
    let mut issues = Vec::new();
    check_logical_file(pool, &file, deep_scan, &mut issues);
    Ok(issues)
}

fn backup_locations(pool: &Pool, issue: &IntegrityIssue) -> PoolResult<()> {
    let stamp = Utc::now().format("%Y%m%d-%H%M%S").to_string();
    for location in &issue.locations {
        let volume = pool.volume(location.volume)?;
        let mut dest = volume
            .mount
            .join(BACKUP_DIR_NAME)
            .join(&stamp)
            .join(format!("v{}", location.volume));
        for segment in issue.path.segments() {
            dest.push(segment);
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|err| PoolError::io(parent, err))?;
        }
        fs::copy(&location.disk_path, &dest)
            .map_err(|err| PoolError::io(&location.disk_path, err))?;
    }
    Ok(())
}

fn keep_most_recent(locations: &[FileLocation], keep: usize) -> Vec<&FileLocation> {
    let mut ordered: Vec<&FileLocation> = locations.iter().collect();
    // Newest first; detection order breaks ties.
    ordered.sort_by(|a, b| {
        repair_mod::modified_time(&b.disk_path)
            .cmp(&repair_mod::modified_time(&a.disk_path))
            .then_with(|| a.volume.cmp(&b.volume))
    });
    ordered.split_off(keep.min(ordered.len()))
}

fn ensure_shadow_level(pool: &Pool, path: &FolderPath) -> PoolResult<bool> {
    let level = duplication::get_level(pool, &path.parent()).get() as usize;
    let mut current = pool
        .logical_file(path)
        .ok_or_else(|| PoolError::NotFound(format!("logical file {path}")))?;
    let mut progressed = false;
    while current.shadow_count() < level {
        let Some(candidate) = pool.volume_with_most_free(&current.volumes())? else {
            return Ok(progressed);
        };
        repair_mod::set_shadow(pool, &current, candidate)?;
        progressed = true;
        current = pool
            .logical_file(path)
            .ok_or_else(|| PoolError::NotFound(format!("logical file {path}")))?;
    }
    Ok(true)
}

/// Repairs one issue. Unsupported kinds return `false`; `dry_run`
/// reports what would happen without touching disk; `create_backup`
/// copies every affected location into a timestamped directory at the
/// mount root first.
pub fn repair(pool: &Pool, issue: &IntegrityIssue, options: &RepairOptions) -> PoolResult<bool> {
    if !issue.kind.auto_repairable() {
        return Ok(false);
    }
    if options.dry_run {
        return Ok(true);
    }

    let mut emitter = Emitter::new(pool.sink(), EngineOperation::IntegrityRepair);
    emitter.emit("repairing", None, 0, 0);

    if options.create_backup && !issue.locations.is_empty() {
        backup_locations(pool, issue)?;
    }

    // Locations in the issue may be stale; act on a fresh probe.
    let Some(file) = pool.logical_file(&issue.path) else {
        return Ok(false);
    };

    match issue.kind {
        IssueKind::MissingPrimary => {
            if file.primary_count() > 0 {
                return Ok(true);
            }
            let Some(shadow) = file.shadows().next() else {
                return Ok(false);
            };
            repair_mod::set_primary(pool, &file, shadow.volume)?;
            Ok(true)
        }
        IssueKind::MissingShadowCopy => ensure_shadow_level(pool, &issue.path),
        IssueKind::DuplicatePrimary => {
            let primaries: Vec<FileLocation> = file.primaries().cloned().collect();
            for surplus in keep_most_recent(&primaries, 1) {
                fileops::delete_file(&surplus.disk_path)?;
            }
            Ok(true)
        }
        IssueKind::DuplicateShadowCopy => {
            let level = duplication::get_level(pool, &issue.path.parent()).get() as usize;
            let shadows: Vec<FileLocation> = file.shadows().cloned().collect();
            for surplus in keep_most_recent(&shadows, level.max(1)) {
                fileops::delete_file(&surplus.disk_path)?;
            }
            Ok(true)
        }
        IssueKind::OrphanedShadowCopy => {
            if file.primary_count() == 0 {
                if let Some(shadow) = file.shadows().next() {
                    repair_mod::set_primary(pool, &file, shadow.volume)?;
                }
            }
            let Some(file) = pool.logical_file(&issue.path) else {
                return Ok(false);
            };
            for shadow in file.shadows() {
                fileops::delete_file(&shadow.disk_path)?;
            }
            Ok(true)
        }
        IssueKind::CorruptedFile => {
            let Some(bad) = issue.locations.first() else {
                return Ok(false);
            };
            let survivors: Vec<&FileLocation> = file
                .locations
                .iter()
                .filter(|loc| loc.disk_path != bad.disk_path)
                .collect();
            if survivors.is_empty() {
                return Ok(false);
            }
            fileops::delete_file(&bad.disk_path)?;
            let Some(fresh) = pool.logical_file(&issue.path) else {
                return Ok(false);
            };
            if bad.is_shadow {
                repair_mod::set_shadow(pool, &fresh, bad.volume)?;
            } else {
                repair_mod::set_primary(pool, &fresh, bad.volume)?;
            }
            Ok(true)
        }
        IssueKind::HashMismatch | IssueKind::AccessDenied => Ok(false),
    }
}

/// Drives `repair` over a checker result, continuing past per-issue
/// failures.
pub fn repair_all(
    pool: &Pool,
    issues: &[IntegrityIssue],
    options: &RepairOptions,
    cancel: Option<&CancelFlag>,
) -> PoolResult<RepairSummary> {
    let mut summary = RepairSummary::default();
    for issue in issues {
        if is_cancelled(cancel) {
            break;
        }
        summary.attempted = summary.attempted.saturating_add(1);
        match repair(pool, issue, options) {
            Ok(true) => summary.repaired = summary.repaired.saturating_add(1),
            Ok(false) => summary.unsupported = summary.unsupported.saturating_add(1),
            Err(err) => {
                summary.failed = summary.failed.saturating_add(1);
                summary
                    .warnings
                    .push(format!("repair of {} failed: {err}", issue.path));
            }
        }
    }
    Ok(summary)
}
