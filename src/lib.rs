//! # fsdelta - Incremental system snapshots
//!
//! Computes what changed on a machine relative to a known baseline (a
//! profile), and replays those changes onto another machine in a way that
//! can be undone.
//!
//! ## Overview
//!
//! fsdelta is the change-detection and replay engine of a backup system:
//! - Index a directory tree into a compact, persisted [`DirIndex`]
//! - Diff the live system against a baseline index into an ordered
//!   [`ChangeLog`] of overwrites, attribute changes and deletions
//! - Merge `/etc/passwd` and `/etc/group` from two systems, remapping
//!   colliding uids and gids
//! - Move a staged overlay of changed files into place, one file at a time
//! - Snapshot everything a restore destroys so it can be rolled back
//!
//! Archiving and transferring the files, dumping databases, and installing
//! packages are left to collaborators; the [`Database`] and
//! [`PackageManager`] traits mark where they plug in.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use fsdelta::{whatchanged, DirIndex, PathMap};
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Record the baseline once
//! let pathmap = PathMap::new(["/etc", "-/etc/.git"])?;
//! DirIndex::walk(&pathmap)?.save(Path::new("/var/lib/fsdelta/profile/dirindex"))?;
//!
//! // Later: what changed since?
//! let changes = whatchanged(Path::new("/var/lib/fsdelta/profile/dirindex"), &["/etc"])?;
//! for change in &changes {
//!     println!("{}", change);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Restoring
//!
//! ```rust,no_run
//! use fsdelta::{Config, Dpkg, Extras, Restore, Rollback};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::default().with_limits(vec!["/etc".to_string()]);
//! let limits = config.parsed_limits()?;
//!
//! let restore = Restore::new(&config, Extras::new("/tmp/extras"), "/tmp/overlay", &limits)?;
//! let report = restore.run(None, Some(&Dpkg))?;
//! for warning in &report.warnings {
//!     eprintln!("warning: {}", warning);
//! }
//!
//! // Changed our minds
//! Rollback::open(&config)?.rollback(None, Some(&Dpkg))?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Key Concepts
//!
//! ### Limits
//!
//! Limits scope everything: which paths are indexed, which changes a restore
//! applies and which databases it loads. Each is an absolute path (globs
//! allowed) or a `mysql:`/`pgsql:` database limit, `-` prefixed to exclude.
//! As soon as one positive filesystem limit exists, everything not covered
//! by a rule is excluded.
//!
//! ### Change log
//!
//! New and edited files become overwrites, changes to owner, group or mode
//! alone become stat changes, and paths in the baseline that are gone
//! become deletions. Recorded ownership is translated through the uid and
//! gid maps of the user merge when the log is replayed.
//!
//! ### Rollback
//!
//! One generation of rollback state is kept. It holds the originals of
//! every file a restore replaced or deleted, along with the pre-restore
//! database dump, package list and user tables.
//!
//! ## Platform
//!
//! fsdelta manages ownership and permissions of a Unix system and only
//! builds on Unix.
//!
//! ## Module Organization
//!
//! - [`pathmap`]: Include/exclude rules over paths
//! - [`dirindex`]: Directory index and its diff
//! - [`changes`]: Change log, deletions and ownership fixes
//! - [`userdb`]: passwd/group tables and their merge
//! - [`overlay`]: Overlay application
//! - [`rollback`]: Rollback store and collaborator traits
//! - [`restore`]: Restore pipeline
//! - [`limits`]: Limit syntax
//! - [`config`]: Configuration
//! - [`error`]: Error types and handling

// Public API modules
pub mod changes;
pub mod config;
pub mod dirindex;
pub mod error;
pub mod limits;
pub mod overlay;
pub mod pathmap;
pub mod restore;
pub mod rollback;
pub mod userdb;

// Internal modules (not part of public API)
mod utils;

// Re-export main types for convenience
pub use changes::{whatchanged, whatchanged_since, Change, ChangeLog, ChangeOp, ChangeStats, StatFix};
pub use config::Config;
pub use dirindex::{DirIndex, IndexDiff, Record};
pub use error::{DeltaError, Result};
pub use limits::{DbLimits, Limits};
pub use overlay::{apply_overlay, OverlayApplier};
pub use pathmap::PathMap;
pub use restore::{Extras, Restore, RestoreReport};
pub use rollback::{Database, Dpkg, Originals, PackageManager, Rollback, RollbackReport, RollbackState};
pub use userdb::{merge_etc, EtcGroup, EtcPasswd, IdMap, MergedEtc};
