//! Restore pipeline
//!
//! A restore replays a backup onto the running system. The backup ships
//! two things: the overlay (the changed files, laid out below `/`) and the
//! extras bundle describing everything else:
//!
//! ```text
//! extras/
//! ├── fsdelta         # Change log of the backup
//! ├── fsdelta-olist   # Paths shipped in the overlay
//! ├── newpkgs         # Packages installed since the profile
//! ├── myfs/           # Database dump
//! └── etc/
//!     ├── passwd
//!     └── group
//! ```
//!
//! [`Restore::run`] applies it in phases: database, packages, users, then
//! files. When rollback is enabled each destructive phase snapshots what
//! it is about to replace into the [`Rollback`] store first.

use crate::changes::ChangeLog;
use crate::config::Config;
use crate::error::Result;
use crate::limits::{DbLimits, Limits};
use crate::overlay::apply_overlay;
use crate::pathmap::PathMap;
use crate::rollback::{Database, PackageManager, Rollback};
use crate::userdb::{self, IdMap};
use crate::utils;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Root the overlay mirrors
const LIVE_ROOT: &str = "/";

/// Layout of an extras bundle
#[derive(Debug, Clone)]
pub struct Extras {
    root: PathBuf,
}

impl Extras {
    /// Extras bundle at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Extras { root: root.into() }
    }

    /// Bundle directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Change log
    pub fn fsdelta(&self) -> PathBuf {
        self.root.join("fsdelta")
    }

    /// Newline separated list of overlay paths
    pub fn fsdelta_olist(&self) -> PathBuf {
        self.root.join("fsdelta-olist")
    }

    /// New packages
    pub fn newpkgs(&self) -> PathBuf {
        self.root.join("newpkgs")
    }

    /// Database dump directory
    pub fn myfs(&self) -> PathBuf {
        self.root.join("myfs")
    }

    /// Backed up `passwd`
    pub fn etc_passwd(&self) -> PathBuf {
        self.root.join("etc/passwd")
    }

    /// Backed up `group`
    pub fn etc_group(&self) -> PathBuf {
        self.root.join("etc/group")
    }

    /// Write a change log and its overlay path list into the bundle
    pub fn save_changes(&self, changes: &ChangeLog) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        changes.save(&self.fsdelta())?;
        changes.save_olist(&self.fsdelta_olist())
    }
}

/// Outcome of a restore
#[derive(Debug, Clone, Default)]
pub struct RestoreReport {
    /// Whether the database was restored
    pub database_restored: bool,
    /// Packages installed
    pub packages_installed: Vec<String>,
    /// Overlay files moved into place
    pub files_applied: usize,
    /// Deleted paths removed
    pub files_deleted: usize,
    /// Ownership and permission fixes applied
    pub statfixes_applied: usize,
    /// Time taken in milliseconds
    pub duration_ms: u64,
    /// Per-path failures that did not stop the restore
    pub warnings: Vec<String>,
}

impl RestoreReport {
    fn absorb(&mut self, other: RestoreReport) {
        self.files_applied += other.files_applied;
        self.files_deleted += other.files_deleted;
        self.statfixes_applied += other.statfixes_applied;
        self.warnings.extend(other.warnings);
    }
}

/// A restore of one backup onto the running system
pub struct Restore<'a> {
    config: &'a Config,
    extras: Extras,
    overlay: PathBuf,
    pathmap: PathMap,
    db_limits: DbLimits,
    rollback: Option<Rollback>,
}

impl<'a> Restore<'a> {
    /// Prepare a restore scoped by `limits`
    ///
    /// When rollback is enabled this creates a fresh rollback store,
    /// discarding the previous one.
    pub fn new(config: &'a Config, extras: Extras, overlay: impl Into<PathBuf>, limits: &Limits) -> Result<Self> {
        let rollback = if config.rollback_enabled {
            Some(Rollback::create(config)?)
        } else {
            None
        };

        Ok(Restore {
            config,
            extras,
            overlay: overlay.into(),
            pathmap: limits.pathmap()?,
            db_limits: limits.db_limits(),
            rollback,
        })
    }

    /// The rollback store, if rollback is enabled
    pub fn rollback(&self) -> Option<&Rollback> {
        self.rollback.as_ref()
    }

    /// Load the database dump
    ///
    /// Returns `false` when the bundle has no dump.
    #[instrument(skip_all)]
    pub fn restore_database(&self, database: &dyn Database) -> Result<bool> {
        let myfs = self.extras.myfs();
        let has_dump = fs::read_dir(&myfs)
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false);
        if !has_dump {
            debug!("No database dump in {:?}", myfs);
            return Ok(false);
        }

        if let Some(rollback) = &self.rollback {
            rollback.save_database(database)?;
        }
        database.restore_from(&myfs, &self.db_limits)?;
        info!("Restored database");
        Ok(true)
    }

    /// Install the packages the backup has and this system lacks
    #[instrument(skip_all)]
    pub fn restore_new_packages(&self, manager: &dyn PackageManager) -> Result<Vec<String>> {
        let newpkgs = self.extras.newpkgs();
        if !newpkgs.exists() {
            return Ok(Vec::new());
        }

        let installed = manager.installed()?;
        let mut packages: Vec<String> = fs::read_to_string(&newpkgs)?
            .lines()
            .map(str::trim)
            .filter(|name| !name.is_empty() && !installed.contains(*name))
            .map(str::to_string)
            .collect();
        packages.sort();
        packages.dedup();

        if packages.is_empty() {
            debug!("All new packages already installed");
            return Ok(packages);
        }
        if let Some(rollback) = &self.rollback {
            rollback.save_new_packages(&packages)?;
        }
        manager.install(&packages)?;
        info!("Installed {} packages", packages.len());
        Ok(packages)
    }

    /// Merge the backed up users and groups into this system's
    ///
    /// Returns the uid and gid maps translating ids recorded in the backup
    /// to ids on this system. Without backed up tables both are empty.
    #[instrument(skip_all)]
    pub fn restore_users(&self) -> Result<(IdMap, IdMap)> {
        let (old_passwd, old_group) = (self.extras.etc_passwd(), self.extras.etc_group());
        if !old_passwd.exists() || !old_group.exists() {
            debug!("No users in backup");
            return Ok((IdMap::new(), IdMap::new()));
        }

        let passwd_path = self.config.etc_path.join("passwd");
        let group_path = self.config.etc_path.join("group");
        let merged = userdb::merge_etc(
            &fs::read_to_string(&old_passwd)?,
            &fs::read_to_string(&old_group)?,
            &fs::read_to_string(&passwd_path)?,
            &fs::read_to_string(&group_path)?,
        )?;

        if let Some(rollback) = &self.rollback {
            rollback.save_etc()?;
        }
        utils::atomic_write(&group_path, merged.group.to_string().as_bytes())?;
        utils::atomic_write(&passwd_path, merged.passwd.to_string().as_bytes())?;

        Ok((merged.uidmap, merged.gidmap))
    }

    /// Apply the overlay and the change log
    ///
    /// Deleted paths are gathered before anything moves, the touched files
    /// are snapshotted for rollback, the overlay is moved into place, the
    /// deletions are carried out and finally ownership and permissions are
    /// fixed through `uidmap` and `gidmap`. Failures for single paths end
    /// up as warnings in the report.
    #[instrument(skip_all)]
    pub fn restore_files(&self, uidmap: &IdMap, gidmap: &IdMap) -> Result<RestoreReport> {
        let start = Instant::now();
        let mut report = RestoreReport::default();

        let changes = ChangeLog::load_filtered(&self.extras.fsdelta(), &self.pathmap)?;
        let deleted: BTreeSet<PathBuf> = changes.deleted().map(Path::to_path_buf).collect();

        if let Some(rollback) = &self.rollback {
            rollback.save_files(&changes)?;
        }

        for (path, outcome) in apply_overlay(&self.overlay, Path::new(LIVE_ROOT), &self.pathmap) {
            match outcome {
                Ok(()) => report.files_applied += 1,
                Err(e) => report.warnings.push(format!("{}: {}", path.display(), e)),
            }
        }

        for path in &deleted {
            match utils::remove_any(path) {
                Ok(true) => report.files_deleted += 1,
                Ok(false) => {
                    // Already moved aside by the rollback snapshot
                    if self.rollback.as_ref().is_some_and(|r| utils::lexists(&r.originals().path_for(path))) {
                        report.files_deleted += 1;
                    }
                }
                Err(e) => {
                    warn!("Failed to remove {:?}: {}", path, e);
                    report.warnings.push(format!("{}: {}", path.display(), e));
                }
            }
        }

        for fix in changes.statfixes(uidmap, gidmap) {
            match fix.apply() {
                Ok(()) => report.statfixes_applied += 1,
                Err(e) => {
                    warn!("Failed to {}: {}", fix, e);
                    report.warnings.push(format!("{}: {}", fix, e));
                }
            }
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            "Restored files: {} applied, {} deleted, {} fixed, {} warnings",
            report.files_applied,
            report.files_deleted,
            report.statfixes_applied,
            report.warnings.len()
        );
        Ok(report)
    }

    /// Run every phase in order
    ///
    /// Collaborators that are `None` skip their phase. A failing database
    /// or package phase is recorded as a warning and the restore goes on.
    #[instrument(skip_all, fields(extras = ?self.extras.root()))]
    pub fn run(
        &self,
        database: Option<&dyn Database>,
        packages: Option<&dyn PackageManager>,
    ) -> Result<RestoreReport> {
        let start = Instant::now();
        let mut report = RestoreReport::default();

        if let Some(database) = database {
            match self.restore_database(database) {
                Ok(restored) => report.database_restored = restored,
                Err(e) if e.is_recoverable() => {
                    warn!("Database restore failed: {}", e);
                    report.warnings.push(format!("Database: {}", e));
                }
                Err(e) => return Err(e),
            }
        }

        if let Some(packages) = packages {
            match self.restore_new_packages(packages) {
                Ok(installed) => report.packages_installed = installed,
                Err(e) if e.is_recoverable() => {
                    warn!("Package install failed: {}", e);
                    report.warnings.push(format!("Packages: {}", e));
                }
                Err(e) => return Err(e),
            }
        }

        let (uidmap, gidmap) = self.restore_users()?;
        report.absorb(self.restore_files(&uidmap, &gidmap)?);

        report.duration_ms = start.elapsed().as_millis() as u64;
        Ok(report)
    }
}
