//! Overlay application
//!
//! An overlay is a staged tree whose layout mirrors the live root: the
//! overlay file `<overlay>/etc/hostname` belongs at `<root>/etc/hostname`.
//! [`apply_overlay`] moves every overlay file (and symlink) that the path
//! map includes into place, creating missing parent directories and
//! replacing whatever was at the destination.
//!
//! Application is per file and never stops early: a failure is reported for
//! that destination and the walk continues, so a single bad path cannot
//! leave the rest of the overlay unapplied.
//!
//! ```rust,no_run
//! use fsdelta::{overlay::apply_overlay, PathMap};
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let pathmap = PathMap::new(["/etc", "/srv"])?;
//! for (path, outcome) in apply_overlay(Path::new("/tmp/overlay"), Path::new("/"), &pathmap) {
//!     if let Err(e) = outcome {
//!         eprintln!("{}: {}", path.display(), e);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use crate::error::{DeltaError, Result};
use crate::pathmap::PathMap;
use crate::utils;
use std::path::{Path, PathBuf};
use tracing::{trace, warn};
use walkdir::WalkDir;

/// Lazy iterator over `(destination, outcome)` of each applied overlay file
///
/// Created by [`apply_overlay`].
pub struct OverlayApplier<'a> {
    overlay_root: PathBuf,
    live_root: PathBuf,
    pathmap: &'a PathMap,
    walker: walkdir::IntoIter,
}

/// Move the contents of `overlay_root` onto `live_root`
///
/// Nothing happens until the returned iterator is driven.
pub fn apply_overlay<'a>(overlay_root: &Path, live_root: &Path, pathmap: &'a PathMap) -> OverlayApplier<'a> {
    OverlayApplier {
        overlay_root: overlay_root.to_path_buf(),
        live_root: live_root.to_path_buf(),
        pathmap,
        walker: WalkDir::new(overlay_root)
            .follow_links(false)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter(),
    }
}

impl OverlayApplier<'_> {
    fn destination(&self, source: &Path) -> Result<PathBuf> {
        let relative = source
            .strip_prefix(&self.overlay_root)
            .map_err(|e| DeltaError::internal(format!("{:?}: {}", source, e)))?;
        Ok(self.live_root.join(relative))
    }

    fn place(source: &Path, dest: &Path) -> Result<()> {
        utils::mkdir_parents(dest)?;
        utils::remove_any(dest)?;
        utils::move_path(source, dest)?;
        trace!("Applied {:?}", dest);
        Ok(())
    }
}

impl Iterator for OverlayApplier<'_> {
    type Item = (PathBuf, Result<()>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.walker.next()? {
                Ok(entry) => entry,
                Err(e) => {
                    let source = e.path().map(Path::to_path_buf).unwrap_or_else(|| self.overlay_root.clone());
                    let dest = self.destination(&source).unwrap_or(source);
                    warn!("Failed to read overlay entry {:?}: {}", dest, e);
                    return Some((dest, Err(e.into())));
                }
            };

            if entry.file_type().is_dir() {
                continue;
            }

            let dest = match self.destination(entry.path()) {
                Ok(dest) => dest,
                Err(e) => return Some((entry.path().to_path_buf(), Err(e))),
            };
            if !self.pathmap.is_included(&dest) {
                trace!("Skipping overlay path outside limits: {:?}", dest);
                continue;
            }

            let outcome = Self::place(entry.path(), &dest);
            if let Err(e) = &outcome {
                warn!("Failed to apply {:?}: {}", dest, e);
            }
            return Some((dest, outcome));
        }
    }
}
