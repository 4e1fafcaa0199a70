//! Rollback store
//!
//! Before a restore touches anything, it snapshots enough state to undo
//! itself into a side directory:
//!
//! ```text
//! /var/backups/fsdelta-rollback/
//! ├── metadata.json   # When and by which version the store was created
//! ├── fsdelta         # Change log the restore applied
//! ├── dirindex        # Pre-restore index of every path in that log
//! ├── newpkgs         # Packages the restore installed
//! ├── originals/      # Pre-restore files, at their path below /
//! ├── myfs/           # Pre-restore database dump
//! └── etc/            # Pre-restore passwd and group
//!     └── mysql/
//! ```
//!
//! Only one generation is kept: [`Rollback::create`] destroys whatever a
//! previous restore left behind. [`Rollback::rollback`] consumes the store,
//! undoing the database first, then files, then packages, and deletes it.
//! Each phase is best effort; failures are collected as warnings in the
//! returned [`RollbackReport`].

use crate::changes::{ChangeLog, ChangeOp};
use crate::config::Config;
use crate::dirindex::DirIndex;
use crate::error::{DeltaError, Result};
use crate::limits::DbLimits;
use crate::utils;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Instant;
use tracing::{debug, info, instrument, trace, warn};

/// Files of the user database that rollback restores
const ETC_FILES: [&str; 2] = ["passwd", "group"];

/// A database server whose contents can be dumped and restored
pub trait Database {
    /// Dump every database into `dir`
    fn dump_to(&self, dir: &Path) -> Result<()>;

    /// Load the dump in `dir`, limited to what `limits` include
    fn restore_from(&self, dir: &Path, limits: &DbLimits) -> Result<()>;
}

/// The system package manager
pub trait PackageManager {
    /// Names of the installed packages
    fn installed(&self) -> Result<BTreeSet<String>>;

    /// Install `packages`
    fn install(&self, packages: &[String]) -> Result<()>;

    /// Remove `packages` along with their configuration
    fn purge(&self, packages: &[String]) -> Result<()>;
}

/// [`PackageManager`] backed by `dpkg` and `apt-get`
#[derive(Debug, Clone, Copy, Default)]
pub struct Dpkg;

impl Dpkg {
    fn run(tool: &str, command: &mut Command) -> Result<String> {
        debug!("Running {:?}", command);
        let output = command
            .output()
            .map_err(|e| DeltaError::external(tool, e.to_string()))?;
        if !output.status.success() {
            return Err(DeltaError::external(
                tool,
                format!(
                    "{}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl PackageManager for Dpkg {
    fn installed(&self) -> Result<BTreeSet<String>> {
        let stdout = Self::run(
            "dpkg-query",
            Command::new("dpkg-query").args(["-W", "-f=${Package}\t${Status}\n"]),
        )?;
        Ok(stdout
            .lines()
            .filter_map(|line| line.split_once('\t'))
            .filter(|(_, status)| status.ends_with(" installed"))
            .map(|(name, _)| name.to_string())
            .collect())
    }

    fn install(&self, packages: &[String]) -> Result<()> {
        if packages.is_empty() {
            return Ok(());
        }
        Self::run(
            "apt-get",
            Command::new("apt-get")
                .env("DEBIAN_FRONTEND", "noninteractive")
                .args(["install", "-y", "--no-install-recommends"])
                .args(packages),
        )?;
        Ok(())
    }

    fn purge(&self, packages: &[String]) -> Result<()> {
        if packages.is_empty() {
            return Ok(());
        }
        Self::run("dpkg", Command::new("dpkg").arg("--purge").args(packages))?;
        Ok(())
    }
}

/// Relocated pre-restore files, stored at their path below `/`
#[derive(Debug, Clone)]
pub struct Originals {
    root: PathBuf,
}

impl Originals {
    /// Originals stored under `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Originals { root: root.into() }
    }

    /// Where the original of `path` is kept
    pub fn path_for(&self, path: &Path) -> PathBuf {
        self.root.join(utils::strip_root(path))
    }

    /// Move the live `path` into the store
    ///
    /// Returns `false` when there is nothing at `path`.
    pub fn move_in(&self, path: &Path) -> Result<bool> {
        if !utils::lexists(path) {
            return Ok(false);
        }
        let stored = self.path_for(path);
        utils::mkdir_parents(&stored)?;
        utils::remove_any(&stored)?;
        utils::move_path(path, &stored)?;
        trace!("Saved original {:?}", path);
        Ok(true)
    }

    /// Move the stored original of `path` back, replacing whatever is there
    ///
    /// Returns `false` when no original was stored, in which case the live
    /// path is left alone.
    pub fn move_out(&self, path: &Path) -> Result<bool> {
        let stored = self.path_for(path);
        if !utils::lexists(&stored) {
            return Ok(false);
        }
        utils::mkdir_parents(path)?;
        utils::remove_any(path)?;
        utils::move_path(&stored, path)?;
        trace!("Restored original {:?}", path);
        Ok(true)
    }
}

/// Contents of `metadata.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackMetadata {
    /// When the store was created
    pub created_at: DateTime<Utc>,
    /// Version of fsdelta that created it
    pub version: String,
}

/// Lifecycle state of the store on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackState {
    /// No rollback directory
    Absent,
    /// Directory exists but creation did not finish
    Creating,
    /// Created and ready to be populated or consumed
    Populated,
}

/// Outcome of [`Rollback::rollback`]
#[derive(Debug, Clone, Default)]
pub struct RollbackReport {
    /// Whether the database was restored from its snapshot
    pub database_restored: bool,
    /// Originals moved back into place
    pub files_restored: usize,
    /// Paths the restore created that were removed again
    pub files_removed: usize,
    /// Packages purged
    pub packages_purged: Vec<String>,
    /// Time taken in milliseconds
    pub duration_ms: u64,
    /// Failures that did not stop the rollback
    pub warnings: Vec<String>,
}

/// A rollback store
#[derive(Debug)]
pub struct Rollback {
    path: PathBuf,
    fsdelta: PathBuf,
    dirindex: PathBuf,
    newpkgs: PathBuf,
    myfs: PathBuf,
    etc: PathBuf,
    metadata: PathBuf,
    originals: Originals,
    etc_target: PathBuf,
}

impl Rollback {
    fn at(config: &Config) -> Self {
        let path = config.rollback_path.clone();
        Rollback {
            fsdelta: path.join("fsdelta"),
            dirindex: path.join("dirindex"),
            newpkgs: path.join("newpkgs"),
            myfs: path.join("myfs"),
            etc: path.join("etc"),
            metadata: path.join("metadata.json"),
            originals: Originals::new(path.join("originals")),
            etc_target: config.etc_path.clone(),
            path,
        }
    }

    /// State of the store configured in `config`
    pub fn state(config: &Config) -> RollbackState {
        let rollback = Self::at(config);
        if !utils::is_real_dir(&rollback.path) {
            RollbackState::Absent
        } else if !rollback.metadata.exists() {
            RollbackState::Creating
        } else {
            RollbackState::Populated
        }
    }

    /// Create a fresh store, destroying any previous one
    #[instrument(skip(config), fields(path = ?config.rollback_path))]
    pub fn create(config: &Config) -> Result<Self> {
        let rollback = Self::at(config);
        if utils::remove_any(&rollback.path)? {
            info!("Discarded previous rollback state at {:?}", rollback.path);
        }

        fs::create_dir_all(&rollback.path)?;
        utils::set_permissions(&rollback.path, 0o700)?;
        for dir in [
            rollback.etc.clone(),
            rollback.etc.join("mysql"),
            rollback.originals.root.clone(),
            rollback.myfs.clone(),
        ] {
            fs::create_dir(&dir)?;
            utils::set_permissions(&dir, 0o700)?;
        }

        let metadata = RollbackMetadata {
            created_at: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        };
        utils::atomic_write(
            &rollback.metadata,
            serde_json::to_string_pretty(&metadata)?.as_bytes(),
        )?;

        debug!("Created rollback store at {:?}", rollback.path);
        Ok(rollback)
    }

    /// Open the existing store
    ///
    /// # Errors
    ///
    /// [`DeltaError::NothingToRollback`] if there is none.
    pub fn open(config: &Config) -> Result<Self> {
        match Self::state(config) {
            RollbackState::Absent => Err(DeltaError::NothingToRollback(config.rollback_path.clone())),
            RollbackState::Creating => {
                warn!(
                    "Rollback store at {:?} was not fully created",
                    config.rollback_path
                );
                Ok(Self::at(config))
            }
            RollbackState::Populated => Ok(Self::at(config)),
        }
    }

    /// Location of the store
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stored originals
    pub fn originals(&self) -> &Originals {
        &self.originals
    }

    /// Read `metadata.json`
    pub fn metadata(&self) -> Result<RollbackMetadata> {
        Ok(serde_json::from_str(&fs::read_to_string(&self.metadata)?)?)
    }

    /// Snapshot `passwd` and `group`
    ///
    /// Only the first call of a generation copies, so the snapshot keeps
    /// the pre-restore files even after the user merge rewrote them.
    pub fn save_etc(&self) -> Result<()> {
        for name in ETC_FILES {
            let saved = self.etc.join(name);
            let live = self.etc_target.join(name);
            if utils::lexists(&saved) || !utils::lexists(&live) {
                continue;
            }
            fs::copy(&live, &saved)?;
            trace!("Saved {:?}", live);
        }
        Ok(())
    }

    /// Snapshot the database before it is replaced
    #[instrument(skip_all)]
    pub fn save_database(&self, database: &dyn Database) -> Result<()> {
        database.dump_to(&self.myfs)?;
        info!("Saved database snapshot");
        Ok(())
    }

    /// Record the packages a restore is about to install
    pub fn save_new_packages(&self, packages: &[String]) -> Result<()> {
        let mut content = packages.join("\n");
        if !content.is_empty() {
            content.push('\n');
        }
        utils::atomic_write(&self.newpkgs, content.as_bytes())
    }

    /// Snapshot the files `changes` is about to touch
    ///
    /// Stores the change log, an index of every path in it that exists
    /// now, and moves the paths that will be overwritten or deleted into
    /// the originals. A deleted path that is now a real directory is left
    /// in place, matching [`ChangeLog::deleted`].
    #[instrument(skip_all, fields(changes = changes.len()))]
    pub fn save_files(&self, changes: &ChangeLog) -> Result<()> {
        self.save_etc()?;
        changes.save(&self.fsdelta)?;

        let mut index = DirIndex::new();
        let mut moved = 0;
        for change in changes {
            let path = change.path();
            if !index.add_path(path)? {
                continue;
            }
            let destroyed = match change.op() {
                ChangeOp::Overwrite => true,
                ChangeOp::Deleted => !utils::is_real_dir(path),
                ChangeOp::Stat => false,
            };
            if destroyed && self.originals.move_in(path)? {
                moved += 1;
            }
        }
        index.save(&self.dirindex)?;

        info!("Saved {} originals, indexed {} paths", moved, index.len());
        Ok(())
    }

    /// Undo the restore and delete the store
    ///
    /// The database is restored first, then files, then packages are
    /// purged. Collaborators that are `None` skip their phase.
    ///
    /// # Errors
    ///
    /// A failing file phase (e.g. a corrupt saved index) is returned as is
    /// and the store is left on disk. Database and package failures only
    /// add warnings.
    #[instrument(skip_all, fields(path = ?self.path))]
    pub fn rollback(
        self,
        database: Option<&dyn Database>,
        packages: Option<&dyn PackageManager>,
    ) -> Result<RollbackReport> {
        info!("Rolling back restore");
        let start = Instant::now();
        let mut report = RollbackReport::default();

        if let Some(database) = database {
            self.rollback_database(database, &mut report);
        }
        // The store holds the only copies of the originals
        if let Err(e) = self.rollback_files(&mut report) {
            warn!("File rollback failed, keeping {:?}: {}", self.path, e);
            return Err(e);
        }
        if let Some(packages) = packages {
            if let Err(e) = self.rollback_packages(packages, &mut report) {
                warn!("Package rollback failed: {}", e);
                report.warnings.push(format!("Packages: {}", e));
            }
        }

        utils::remove_any(&self.path)?;
        report.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            "Rollback complete: {} restored, {} removed, {} packages purged, {} warnings",
            report.files_restored,
            report.files_removed,
            report.packages_purged.len(),
            report.warnings.len()
        );
        Ok(report)
    }

    fn rollback_database(&self, database: &dyn Database, report: &mut RollbackReport) {
        let has_snapshot = fs::read_dir(&self.myfs)
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false);
        if !has_snapshot {
            debug!("No database snapshot");
            return;
        }

        match database.restore_from(&self.myfs, &DbLimits::default()) {
            Ok(()) => report.database_restored = true,
            Err(e) => {
                warn!("Database rollback failed: {}", e);
                report.warnings.push(format!("Database: {}", e));
            }
        }
    }

    fn rollback_files(&self, report: &mut RollbackReport) -> Result<()> {
        if !self.fsdelta.exists() {
            debug!("No file snapshot");
            return Ok(());
        }
        let changes = ChangeLog::load(&self.fsdelta)?;
        let index = DirIndex::load(&self.dirindex)?;

        for change in &changes {
            let path = change.path();
            let Some(record) = index.get(path) else {
                // Did not exist before the restore
                match utils::remove_any(path) {
                    Ok(true) => report.files_removed += 1,
                    Ok(false) => {}
                    Err(e) => report.warnings.push(format!("Remove {}: {}", path.display(), e)),
                }
                continue;
            };

            if change.op() != ChangeOp::Stat {
                match self.originals.move_out(path) {
                    Ok(true) => report.files_restored += 1,
                    Ok(false) => {
                        trace!("No original for {:?}", path);
                        continue;
                    }
                    Err(e) => {
                        report.warnings.push(format!("Restore {}: {}", path.display(), e));
                        continue;
                    }
                }
            }

            let Ok(metadata) = fs::symlink_metadata(path) else {
                continue;
            };
            if metadata.uid() != record.uid || metadata.gid() != record.gid {
                if let Err(e) = utils::lchown(path, record.uid, record.gid) {
                    report.warnings.push(format!("Chown {}: {}", path.display(), e));
                }
            }
            if !record.is_symlink() && utils::permission_bits(metadata.mode()) != record.permissions() {
                if let Err(e) = utils::set_permissions(path, record.mode) {
                    report.warnings.push(format!("Chmod {}: {}", path.display(), e));
                }
            }
        }

        for name in ETC_FILES {
            let saved = self.etc.join(name);
            if saved.exists() {
                fs::copy(&saved, self.etc_target.join(name))?;
            }
        }
        Ok(())
    }

    fn rollback_packages(&self, manager: &dyn PackageManager, report: &mut RollbackReport) -> Result<()> {
        if !self.newpkgs.exists() {
            return Ok(());
        }
        let content = fs::read_to_string(&self.newpkgs)?;
        let installed = manager.installed()?;
        let purge: Vec<String> = content
            .lines()
            .map(str::trim)
            .filter(|name| !name.is_empty() && installed.contains(*name))
            .map(str::to_string)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        if purge.is_empty() {
            return Ok(());
        }
        manager.purge(&purge)?;
        report.packages_purged = purge;
        Ok(())
    }
}
