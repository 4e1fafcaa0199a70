//! Directory indexes
//!
//! A [`DirIndex`] maps absolute paths to the `lstat` attributes that matter
//! for change detection: raw mode, owner, group, size and mtime (whole
//! seconds). Indexes are built by walking the paths a [`PathMap`] includes
//! and are compared with [`DirIndex::diff`] to classify what changed.
//!
//! ## File format
//!
//! One record per line, sorted by path, tab separated, numbers in lowercase
//! hex without prefix:
//!
//! ```text
//! /etc/hostname	81a4	0	0	7	65f0c2a1
//! ```
//!
//! Paths are written as raw bytes, so non-UTF-8 names survive a round trip.
//! Names containing a tab or a newline cannot be represented and are
//! skipped with a warning when the index is built.

use crate::error::{DeltaError, Result};
use crate::pathmap::PathMap;
use crate::utils;
use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fs;
use std::io::{self, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, instrument, trace, warn};
use walkdir::WalkDir;

const FIELD_COUNT: usize = 6;

/// Attributes recorded for a single path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Record {
    /// Raw `st_mode`, file type bits included
    pub mode: u32,
    /// Owner user id
    pub uid: u32,
    /// Owner group id
    pub gid: u32,
    /// Size in bytes
    pub size: u64,
    /// Modification time in whole seconds since the epoch
    pub mtime: i64,
}

impl Record {
    /// Build a record from `lstat` metadata
    pub fn from_metadata(metadata: &fs::Metadata) -> Self {
        Record {
            mode: metadata.mode(),
            uid: metadata.uid(),
            gid: metadata.gid(),
            size: metadata.size(),
            mtime: metadata.mtime(),
        }
    }

    /// `lstat` a path into a record
    pub fn from_path(path: &Path) -> Result<Self> {
        Ok(Self::from_metadata(&fs::symlink_metadata(path)?))
    }

    /// Whether the record describes a directory
    pub fn is_dir(&self) -> bool {
        utils::is_dir_mode(self.mode)
    }

    /// Whether the record describes a symbolic link
    pub fn is_symlink(&self) -> bool {
        utils::is_symlink_mode(self.mode)
    }

    /// Permission bits of the mode
    pub fn permissions(&self) -> u32 {
        utils::permission_bits(self.mode)
    }

    fn fmt_fields(&self) -> String {
        let mtime = if self.mtime < 0 {
            format!("-{:x}", self.mtime.unsigned_abs())
        } else {
            format!("{:x}", self.mtime)
        };
        format!("{:x}\t{:x}\t{:x}\t{:x}\t{}", self.mode, self.uid, self.gid, self.size, mtime)
    }
}

/// Result of comparing two indexes
///
/// All three lists are sorted by path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexDiff {
    /// Non-directory paths only present in the newer index
    pub new: Vec<PathBuf>,
    /// Non-directory paths whose size or mtime changed
    pub edited: Vec<PathBuf>,
    /// Paths whose mode, owner or group changed, plus new directories
    pub stat: Vec<PathBuf>,
}

impl IndexDiff {
    /// Check if the diff is empty
    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.edited.is_empty() && self.stat.is_empty()
    }
}

/// Persisted mapping of absolute path to [`Record`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirIndex {
    records: BTreeMap<PathBuf, Record>,
}

impl DirIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Walk everything `pathmap` includes and index it
    ///
    /// Each included root is recorded and then visited depth first.
    /// Excluded directories are not descended into and symbolic links are
    /// recorded but never followed. A root that is not a directory is
    /// recorded as a leaf.
    ///
    /// Paths that vanish while the walk is running are skipped.
    #[instrument(skip(pathmap))]
    pub fn walk(pathmap: &PathMap) -> Result<Self> {
        let start = Instant::now();
        let mut index = DirIndex::new();

        for root in pathmap.includes() {
            if !pathmap.is_included(root) || !utils::lexists(root) {
                trace!("Skipping include root {:?}", root);
                continue;
            }

            index.add_path(root)?;
            if !utils::is_real_dir(root) {
                continue;
            }

            let walker = WalkDir::new(root)
                .follow_links(false)
                .min_depth(1)
                .into_iter()
                .filter_entry(|entry| pathmap.is_included(entry.path()));

            for entry in walker {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        let e = DeltaError::from(e);
                        if e.is_vanished() {
                            warn!("Path vanished during walk: {}", e);
                            continue;
                        }
                        return Err(e);
                    }
                };
                index.add_path(entry.path())?;
            }
        }

        debug!(
            "Indexed {} paths in {:?}",
            index.len(),
            start.elapsed()
        );
        Ok(index)
    }

    /// `lstat` a single path into the index
    ///
    /// A path that no longer exists is skipped and `false` is returned.
    pub fn add_path(&mut self, path: &Path) -> Result<bool> {
        let bytes = path.as_os_str().as_bytes();
        if bytes.contains(&b'\t') || bytes.contains(&b'\n') {
            warn!("Skipping path with a tab or newline in its name: {:?}", path);
            return Ok(false);
        }

        match fs::symlink_metadata(path) {
            Ok(metadata) => {
                self.records
                    .insert(path.to_path_buf(), Record::from_metadata(&metadata));
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                trace!("Path vanished before lstat: {:?}", path);
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Insert a record directly
    pub fn insert(&mut self, path: PathBuf, record: Record) {
        self.records.insert(path, record);
    }

    /// Look up the record for a path
    pub fn get(&self, path: &Path) -> Option<&Record> {
        self.records.get(path)
    }

    /// Check if a path is indexed
    pub fn contains(&self, path: &Path) -> bool {
        self.records.contains_key(path)
    }

    /// Number of indexed paths
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if the index is empty
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records in path order
    pub fn iter(&self) -> impl Iterator<Item = (&Path, &Record)> {
        self.records.iter().map(|(p, r)| (p.as_path(), r))
    }

    /// Indexed paths in order
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.records.keys().map(PathBuf::as_path)
    }

    /// Classify how `other` (the newer state) differs from `self`
    ///
    /// - paths only in `other` are `new`, except directories, which are
    ///   `stat` since their content is tracked entry by entry
    /// - non-directories present in both whose size or mtime differ are
    ///   `edited`
    /// - otherwise a differing mode, owner or group makes a path `stat`
    ///
    /// Paths only present in `self` are not reported here; see
    /// [`crate::changes::whatchanged`].
    pub fn diff(&self, other: &DirIndex) -> IndexDiff {
        let mut diff = IndexDiff::default();

        for (path, theirs) in &other.records {
            match self.records.get(path) {
                None => {
                    if theirs.is_dir() {
                        diff.stat.push(path.clone());
                    } else {
                        diff.new.push(path.clone());
                    }
                }
                Some(ours) if ours == theirs => {}
                Some(ours) => {
                    if !theirs.is_dir() && (ours.size != theirs.size || ours.mtime != theirs.mtime) {
                        diff.edited.push(path.clone());
                    } else if ours.mode != theirs.mode || ours.uid != theirs.uid || ours.gid != theirs.gid {
                        diff.stat.push(path.clone());
                    }
                }
            }
        }

        diff
    }

    /// Drop every record `pathmap` does not include
    pub fn prune(&mut self, pathmap: &PathMap) {
        let before = self.records.len();
        self.records.retain(|path, _| pathmap.is_included(path));
        trace!("Pruned {} records", before - self.records.len());
    }

    /// Serialize to the tab separated text format
    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<()> {
        for (path, record) in &self.records {
            writer.write_all(path.as_os_str().as_bytes())?;
            writer.write_all(b"\t")?;
            writer.write_all(record.fmt_fields().as_bytes())?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Parse the tab separated text format
    ///
    /// `source_name` is used in parse errors.
    pub fn parse(data: &[u8], source_name: &str) -> Result<Self> {
        let mut index = DirIndex::new();

        for (number, line) in data.split(|&b| b == b'\n').enumerate() {
            if line.is_empty() {
                continue;
            }
            let line_number = number + 1;
            let bad = |reason: &str| {
                DeltaError::parse(source_name, line_number, String::from_utf8_lossy(line), reason)
            };

            let fields: Vec<&[u8]> = line.split(|&b| b == b'\t').collect();
            if fields.len() != FIELD_COUNT {
                return Err(bad(&format!(
                    "expected {} fields, found {}",
                    FIELD_COUNT,
                    fields.len()
                )));
            }

            let path = PathBuf::from(OsStr::from_bytes(fields[0]));
            if !path.is_absolute() {
                return Err(bad("path is not absolute"));
            }

            let record = Record {
                mode: parse_hex(fields[1]).ok_or_else(|| bad("invalid mode"))?,
                uid: parse_hex(fields[2]).ok_or_else(|| bad("invalid uid"))?,
                gid: parse_hex(fields[3]).ok_or_else(|| bad("invalid gid"))?,
                size: parse_hex(fields[4]).ok_or_else(|| bad("invalid size"))?,
                mtime: parse_hex(fields[5]).ok_or_else(|| bad("invalid mtime"))?,
            };
            index.records.insert(path, record);
        }

        Ok(index)
    }

    /// Atomically write the index to `path`
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut buffer = Vec::new();
        self.write_to(&mut buffer)?;
        utils::atomic_write(path, &buffer)?;
        info!("Saved index of {} paths to {:?}", self.len(), path);
        Ok(())
    }

    /// Load an index written by [`DirIndex::save`]
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path)?;
        let index = Self::parse(&data, &path.display().to_string())?;
        debug!("Loaded index of {} paths from {:?}", index.len(), path);
        Ok(index)
    }
}

/// Numeric types the index stores as hex
trait FromHex: Sized {
    fn from_hex(s: &str) -> Option<Self>;
}

macro_rules! impl_from_hex {
    ($($t:ty),*) => {
        $(impl FromHex for $t {
            fn from_hex(s: &str) -> Option<Self> {
                <$t>::from_str_radix(s, 16).ok()
            }
        })*
    };
}

impl_from_hex!(u32, u64, i64);

fn parse_hex<T: FromHex>(field: &[u8]) -> Option<T> {
    let s = std::str::from_utf8(field).ok()?;
    if s.is_empty() || s.starts_with('+') {
        return None;
    }
    T::from_hex(s)
}
