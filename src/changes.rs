//! Change logs
//!
//! A [`ChangeLog`] is the ordered list of [`Change`] records that takes a
//! profile's baseline state to the current state of a system. It drives
//! both halves of the pipeline: the backup side uploads the paths it marks
//! as overwritten, and the restore side derives from it what to delete
//! ([`ChangeLog::deleted`]) and which ownership and permission fixes to
//! apply ([`ChangeLog::statfixes`]).
//!
//! ## File format
//!
//! One change per line, tab separated, op code first:
//!
//! ```text
//! o	/etc/foo.conf	0	0
//! s	/etc/ssl/private	0	111	0700
//! d	/etc/old.conf
//! ```
//!
//! uid and gid are decimal, the mode is octal permission bits.

use crate::dirindex::{DirIndex, Record};
use crate::error::{DeltaError, Result};
use crate::pathmap::PathMap;
use crate::userdb::IdMap;
use crate::utils;
use std::ffi::OsStr;
use std::fmt;
use std::fs;
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, instrument, trace};

/// Kind of change, with its one character code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeOp {
    /// `o`: content is new or changed
    Overwrite,
    /// `s`: only mode, owner or group changed
    Stat,
    /// `d`: the path no longer exists
    Deleted,
}

impl ChangeOp {
    /// Single character op code
    pub fn code(self) -> char {
        match self {
            ChangeOp::Overwrite => 'o',
            ChangeOp::Stat => 's',
            ChangeOp::Deleted => 'd',
        }
    }

    /// Parse an op code, rejecting unknown ones
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "o" => Some(ChangeOp::Overwrite),
            "s" => Some(ChangeOp::Stat),
            "d" => Some(ChangeOp::Deleted),
            _ => None,
        }
    }
}

/// A single change record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// New or changed content, with the owner it had when detected
    Overwrite {
        /// Absolute path
        path: PathBuf,
        /// Owner user id
        uid: u32,
        /// Owner group id
        gid: u32,
    },
    /// Changed attributes only
    Stat {
        /// Absolute path
        path: PathBuf,
        /// Owner user id
        uid: u32,
        /// Owner group id
        gid: u32,
        /// Permission bits
        mode: u32,
    },
    /// Path removed
    Deleted {
        /// Absolute path
        path: PathBuf,
    },
}

impl Change {
    /// Overwrite change with ownership read from the path via `lstat`
    pub fn overwrite(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let (uid, gid) = utils::owner_of(&path)?;
        Ok(Change::Overwrite { path, uid, gid })
    }

    /// Stat change with ownership and mode read from the path via `lstat`
    pub fn stat(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let record = Record::from_path(&path)?;
        Ok(Self::stat_from_record(path, &record))
    }

    fn overwrite_from_record(path: PathBuf, record: &Record) -> Self {
        Change::Overwrite {
            path,
            uid: record.uid,
            gid: record.gid,
        }
    }

    fn stat_from_record(path: PathBuf, record: &Record) -> Self {
        Change::Stat {
            path,
            uid: record.uid,
            gid: record.gid,
            mode: record.permissions(),
        }
    }

    /// Kind of change
    pub fn op(&self) -> ChangeOp {
        match self {
            Change::Overwrite { .. } => ChangeOp::Overwrite,
            Change::Stat { .. } => ChangeOp::Stat,
            Change::Deleted { .. } => ChangeOp::Deleted,
        }
    }

    /// Path the change applies to
    pub fn path(&self) -> &Path {
        match self {
            Change::Overwrite { path, .. } | Change::Stat { path, .. } | Change::Deleted { path } => path,
        }
    }

    /// Recorded owner, if the change carries one
    pub fn owner(&self) -> Option<(u32, u32)> {
        match self {
            Change::Overwrite { uid, gid, .. } | Change::Stat { uid, gid, .. } => Some((*uid, *gid)),
            Change::Deleted { .. } => None,
        }
    }

    /// Serialize to one line of the change log format (without newline)
    pub fn to_line(&self) -> Vec<u8> {
        let mut line = Vec::new();
        line.push(self.op().code() as u8);
        line.push(b'\t');
        line.extend_from_slice(self.path().as_os_str().as_bytes());
        match self {
            Change::Overwrite { uid, gid, .. } => {
                line.extend_from_slice(format!("\t{}\t{}", uid, gid).as_bytes());
            }
            Change::Stat { uid, gid, mode, .. } => {
                line.extend_from_slice(format!("\t{}\t{}\t0{:o}", uid, gid, mode).as_bytes());
            }
            Change::Deleted { .. } => {}
        }
        line
    }

    /// Parse one line of the change log format
    ///
    /// On failure the reason is returned for the caller to wrap into a
    /// parse error carrying the line.
    pub fn parse(line: &[u8]) -> std::result::Result<Self, String> {
        let fields: Vec<&[u8]> = line.split(|&b| b == b'\t').collect();
        let code = std::str::from_utf8(fields[0]).map_err(|_| "invalid op code".to_string())?;
        let op = ChangeOp::from_code(code).ok_or_else(|| format!("unknown op code {:?}", code))?;

        let expected = match op {
            ChangeOp::Overwrite => 4,
            ChangeOp::Stat => 5,
            ChangeOp::Deleted => 2,
        };
        if fields.len() != expected {
            return Err(format!(
                "op '{}' expects {} fields, found {}",
                op.code(),
                expected,
                fields.len()
            ));
        }

        let path = PathBuf::from(OsStr::from_bytes(fields[1]));
        if !path.is_absolute() {
            return Err("path is not absolute".to_string());
        }

        let decimal = |field: &[u8], what: &str| -> std::result::Result<u32, String> {
            std::str::from_utf8(field)
                .ok()
                .and_then(|s| s.parse::<u32>().ok())
                .ok_or_else(|| format!("invalid {}", what))
        };

        Ok(match op {
            ChangeOp::Overwrite => Change::Overwrite {
                path,
                uid: decimal(fields[2], "uid")?,
                gid: decimal(fields[3], "gid")?,
            },
            ChangeOp::Stat => {
                let mode = std::str::from_utf8(fields[4])
                    .ok()
                    .map(|s| s.trim_start_matches("0o"))
                    .and_then(|s| u32::from_str_radix(s, 8).ok())
                    .ok_or_else(|| "invalid mode".to_string())?;
                Change::Stat {
                    path,
                    uid: decimal(fields[2], "uid")?,
                    gid: decimal(fields[3], "gid")?,
                    mode: utils::permission_bits(mode),
                }
            }
            ChangeOp::Deleted => Change::Deleted { path },
        })
    }
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.to_line()))
    }
}

/// An ownership or permission fix derived from a change log
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatFix {
    /// `lchown(path, uid, gid)`
    Chown {
        /// Target path
        path: PathBuf,
        /// New owner
        uid: u32,
        /// New group
        gid: u32,
    },
    /// `chmod(path, mode)`
    Chmod {
        /// Target path
        path: PathBuf,
        /// New permission bits
        mode: u32,
    },
}

impl StatFix {
    /// Target path
    pub fn path(&self) -> &Path {
        match self {
            StatFix::Chown { path, .. } | StatFix::Chmod { path, .. } => path,
        }
    }

    /// Perform the fix
    pub fn apply(&self) -> Result<()> {
        match self {
            StatFix::Chown { path, uid, gid } => utils::lchown(path, *uid, *gid),
            StatFix::Chmod { path, mode } => utils::set_permissions(path, *mode),
        }
    }
}

impl fmt::Display for StatFix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatFix::Chown { path, uid, gid } => write!(f, "chown {}:{} {}", uid, gid, path.display()),
            StatFix::Chmod { path, mode } => write!(f, "chmod {:o} {}", mode, path.display()),
        }
    }
}

/// Counts of changes per kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeStats {
    /// Number of overwrite changes
    pub overwrites: usize,
    /// Number of stat changes
    pub stats: usize,
    /// Number of deletions
    pub deletions: usize,
}

impl ChangeStats {
    /// Total number of changes
    pub fn total(&self) -> usize {
        self.overwrites + self.stats + self.deletions
    }
}

/// Ordered list of changes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeLog {
    changes: Vec<Change>,
}

impl ChangeLog {
    /// Create an empty change log
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a change
    pub fn push(&mut self, change: Change) {
        self.changes.push(change);
    }

    /// Number of changes
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Check if there are no changes
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Changes in order
    pub fn iter(&self) -> std::slice::Iter<'_, Change> {
        self.changes.iter()
    }

    /// Keep only changes whose path `pathmap` includes
    pub fn filter(&self, pathmap: &PathMap) -> ChangeLog {
        self.changes
            .iter()
            .filter(|c| pathmap.is_included(c.path()))
            .cloned()
            .collect()
    }

    /// Counts per kind
    pub fn summary(&self) -> ChangeStats {
        let mut stats = ChangeStats::default();
        for change in &self.changes {
            match change.op() {
                ChangeOp::Overwrite => stats.overwrites += 1,
                ChangeOp::Stat => stats.stats += 1,
                ChangeOp::Deleted => stats.deletions += 1,
            }
        }
        stats
    }

    /// Paths whose content has to be shipped with a backup
    pub fn overwrites(&self) -> impl Iterator<Item = &Path> + '_ {
        self.changes
            .iter()
            .filter(|c| c.op() == ChangeOp::Overwrite)
            .map(Change::path)
    }

    /// Deleted paths that should be removed from this system
    ///
    /// Only paths that currently exist are yielded, and a path that is now
    /// a real directory is skipped since it was repurposed rather than
    /// removed. Symbolic links are always yielded. Existence is checked
    /// lazily as the iterator advances.
    // NOTE: a path that is already gone is not yielded. This mirrors the
    // established behavior of the restore pipeline; see DESIGN.md before
    // changing the polarity of the existence check.
    pub fn deleted(&self) -> impl Iterator<Item = &Path> + '_ {
        self.changes
            .iter()
            .filter(|c| c.op() == ChangeOp::Deleted)
            .map(Change::path)
            .filter(|path| utils::lexists(path) && !utils::is_real_dir(path))
    }

    /// Ownership and permission fixes needed to match this log
    ///
    /// Recorded uids and gids are translated through `uidmap` and `gidmap`
    /// (unmapped ids pass through) and compared with the live path. A chown
    /// is yielded when owner or group differ, and for stat changes a chmod
    /// when permission bits differ. Deleted changes and paths that no longer
    /// exist are skipped.
    ///
    /// Overwrite changes whose uid and gid are both unmapped are skipped
    /// without an `lstat`: their content was just extracted with the
    /// recorded ownership, so no chown can be needed.
    pub fn statfixes<'a>(
        &'a self,
        uidmap: &'a IdMap,
        gidmap: &'a IdMap,
    ) -> impl Iterator<Item = StatFix> + 'a {
        self.changes
            .iter()
            .flat_map(move |change| fixes_for(change, uidmap, gidmap, true))
    }

    /// Serialize to the change log text format
    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<()> {
        for change in &self.changes {
            writer.write_all(&change.to_line())?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Parse the change log text format
    pub fn parse(data: &[u8], source_name: &str) -> Result<Self> {
        let mut log = ChangeLog::new();
        for (number, line) in data.split(|&b| b == b'\n').enumerate() {
            if line.is_empty() {
                continue;
            }
            let change = Change::parse(line).map_err(|reason| {
                DeltaError::parse(source_name, number + 1, String::from_utf8_lossy(line), reason)
            })?;
            log.push(change);
        }
        Ok(log)
    }

    /// Atomically write the change log to `path`
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut buffer = Vec::new();
        self.write_to(&mut buffer)?;
        utils::atomic_write(path, &buffer)?;
        debug!("Saved {} changes to {:?}", self.len(), path);
        Ok(())
    }

    /// Load a change log written by [`ChangeLog::save`]
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path)?;
        Self::parse(&data, &path.display().to_string())
    }

    /// Load a change log, keeping only changes `pathmap` includes
    pub fn load_filtered(path: &Path, pathmap: &PathMap) -> Result<Self> {
        Ok(Self::load(path)?.filter(pathmap))
    }

    /// Write the newline separated list of overwritten paths
    pub fn save_olist(&self, path: &Path) -> Result<()> {
        let mut buffer = Vec::new();
        for p in self.overwrites() {
            buffer.extend_from_slice(p.as_os_str().as_bytes());
            buffer.push(b'\n');
        }
        utils::atomic_write(path, &buffer)
    }
}

impl FromIterator<Change> for ChangeLog {
    fn from_iter<T: IntoIterator<Item = Change>>(iter: T) -> Self {
        ChangeLog {
            changes: iter.into_iter().collect(),
        }
    }
}

impl Extend<Change> for ChangeLog {
    fn extend<T: IntoIterator<Item = Change>>(&mut self, iter: T) {
        self.changes.extend(iter);
    }
}

impl<'a> IntoIterator for &'a ChangeLog {
    type Item = &'a Change;
    type IntoIter = std::slice::Iter<'a, Change>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.iter()
    }
}

/// Fixes for a single change; `shortcut` enables the unmapped-overwrite skip
fn fixes_for(change: &Change, uidmap: &IdMap, gidmap: &IdMap, shortcut: bool) -> Vec<StatFix> {
    let (uid, gid, mode) = match change {
        Change::Deleted { .. } => return Vec::new(),
        Change::Overwrite { uid, gid, .. } => {
            if shortcut && !uidmap.contains(*uid) && !gidmap.contains(*gid) {
                return Vec::new();
            }
            (*uid, *gid, None)
        }
        Change::Stat { uid, gid, mode, .. } => (*uid, *gid, Some(*mode)),
    };

    let path = change.path();
    let Ok(metadata) = fs::symlink_metadata(path) else {
        trace!("Skipping statfix for missing path {:?}", path);
        return Vec::new();
    };

    let mut fixes = Vec::new();
    let (target_uid, target_gid) = (uidmap.get(uid), gidmap.get(gid));
    if metadata.uid() != target_uid || metadata.gid() != target_gid {
        fixes.push(StatFix::Chown {
            path: path.to_path_buf(),
            uid: target_uid,
            gid: target_gid,
        });
    }
    if let Some(mode) = mode {
        if utils::permission_bits(metadata.mode()) != utils::permission_bits(mode) {
            fixes.push(StatFix::Chmod {
                path: path.to_path_buf(),
                mode: utils::permission_bits(mode),
            });
        }
    }
    fixes
}

/// Compute what changed between a saved baseline index and the live system
///
/// `limits` scope the walk (see [`PathMap`]). New and edited files become
/// overwrites, attribute-only changes become stat changes, and paths that
/// the baseline holds within scope but the live walk did not find become
/// deletions. Each group is sorted by path.
#[instrument(skip(limits))]
pub fn whatchanged<S: AsRef<str>>(baseline: &Path, limits: &[S]) -> Result<ChangeLog> {
    let pathmap = PathMap::new(limits)?;
    let saved = DirIndex::load(baseline)?;
    whatchanged_since(saved, &pathmap)
}

/// [`whatchanged`] against an index that is already loaded
pub fn whatchanged_since(mut saved: DirIndex, pathmap: &PathMap) -> Result<ChangeLog> {
    let start = Instant::now();
    let live = DirIndex::walk(pathmap)?;
    let diff = saved.diff(&live);

    let mut log = ChangeLog::new();

    let mut overwritten = diff.new;
    overwritten.extend(diff.edited);
    overwritten.sort();
    for path in overwritten {
        if let Some(record) = live.get(&path) {
            log.push(Change::overwrite_from_record(path, record));
        }
    }

    for path in diff.stat {
        if let Some(record) = live.get(&path) {
            log.push(Change::stat_from_record(path, record));
        }
    }

    saved.prune(pathmap);
    let deleted: Vec<PathBuf> = saved
        .paths()
        .filter(|p| !live.contains(p))
        .map(Path::to_path_buf)
        .collect();
    log.extend(deleted.into_iter().map(|path| Change::Deleted { path }));

    let stats = log.summary();
    info!(
        "Detected {} changes ({} overwritten, {} stat, {} deleted) in {:?}",
        stats.total(),
        stats.overwrites,
        stats.stats,
        stats.deletions,
        start.elapsed()
    );
    Ok(log)
}
