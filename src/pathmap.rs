//! Include/exclude path maps
//!
//! A [`PathMap`] is built from an ordered list of path limits. Each limit is
//! an absolute path, optionally prefixed with `-` to exclude it, and
//! optionally containing glob characters (`*`, `?`, `[...]`). Globs are
//! expanded against the filesystem once, at construction; a glob that
//! matches nothing contributes nothing.
//!
//! Lookups walk from the queried path up through its ancestors and return
//! the sign of the first rule found. When no rule covers a path the map's
//! default applies: everything is included unless at least one positive
//! rule exists, in which case everything not covered is excluded.
//!
//! ```rust
//! use fsdelta::PathMap;
//! use std::path::Path;
//!
//! let map = PathMap::new(["/etc", "-/etc/.git"]).unwrap();
//! assert!(map.is_included(Path::new("/etc/passwd")));
//! assert!(!map.is_included(Path::new("/etc/.git/config")));
//! assert!(!map.is_included(Path::new("/var/lib")));
//! ```

use crate::error::{DeltaError, Result};
use crate::utils;
use globset::GlobBuilder;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};
use walkdir::WalkDir;

/// Longest-prefix include/exclude decision over absolute paths
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathMap {
    /// path -> included
    rules: BTreeMap<PathBuf, bool>,
    /// Answer for paths no rule covers
    default: bool,
}

impl PathMap {
    /// Build a map from limit strings such as `/etc` or `-/var/log/*.gz`
    ///
    /// When the same path appears twice with different signs the later limit
    /// wins.
    ///
    /// # Errors
    ///
    /// - [`DeltaError::NotAbsolute`] for a relative path
    /// - [`DeltaError::InvalidLimit`] for an empty limit
    /// - [`DeltaError::InvalidPattern`] for a glob that does not compile
    pub fn new<I, S>(limits: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut rules = BTreeMap::new();

        for limit in limits {
            let limit = limit.as_ref().trim();
            let (include, pattern) = match limit.strip_prefix('-') {
                Some(rest) => (false, rest),
                None => (true, limit),
            };
            if pattern.is_empty() {
                return Err(DeltaError::InvalidLimit(limit.to_string()));
            }

            for path in expand(pattern)? {
                if let Some(previous) = rules.insert(path.clone(), include) {
                    if previous != include {
                        debug!("Limit for {:?} overrides an earlier limit with the opposite sign", path);
                    }
                }
            }
        }

        let default = !rules.values().any(|&include| include);
        Ok(PathMap { rules, default })
    }

    /// Whether `path` is included
    ///
    /// Relative paths are never included.
    pub fn is_included(&self, path: &Path) -> bool {
        let Ok(path) = utils::normalize(path) else {
            return false;
        };

        for ancestor in path.ancestors() {
            if let Some(&include) = self.rules.get(ancestor) {
                return include;
            }
        }
        self.default
    }

    /// Paths with a positive rule
    pub fn includes(&self) -> impl Iterator<Item = &Path> {
        self.rules
            .iter()
            .filter(|(_, &include)| include)
            .map(|(path, _)| path.as_path())
    }

    /// Paths with a negative rule
    pub fn excludes(&self) -> impl Iterator<Item = &Path> {
        self.rules
            .iter()
            .filter(|(_, &include)| !include)
            .map(|(path, _)| path.as_path())
    }

    /// Inclusion answer for paths no rule covers
    pub fn default_included(&self) -> bool {
        self.default
    }

    /// True when the map has no rules at all
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

fn needs_glob(s: &str) -> bool {
    s.contains(['*', '?', '[', ']'])
}

/// Expand one limit pattern into the concrete paths it names
fn expand(pattern: &str) -> Result<Vec<PathBuf>> {
    let path = Path::new(pattern);
    if !path.is_absolute() {
        return Err(DeltaError::NotAbsolute(path.to_path_buf()));
    }
    if !needs_glob(pattern) {
        return Ok(vec![utils::normalize(path)?]);
    }

    // Walk from the deepest literal directory, down as many levels as the
    // pattern has remaining components.
    let mut base = PathBuf::from("/");
    let mut depth = 0;
    let mut globbing = false;
    for component in utils::strip_root(path).iter() {
        if globbing || needs_glob(&component.to_string_lossy()) {
            globbing = true;
            depth += 1;
        } else {
            base.push(component);
        }
    }

    let matcher = GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map_err(|e| DeltaError::InvalidPattern(format!("{}: {}", pattern, e)))?
        .compile_matcher();

    let mut matches = Vec::new();
    for entry in WalkDir::new(&base)
        .follow_links(false)
        .min_depth(depth)
        .max_depth(depth)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if matcher.is_match(entry.path()) {
            matches.push(utils::normalize(entry.path())?);
        }
    }
    matches.sort();

    trace!("Glob {:?} expanded to {} paths", pattern, matches.len());
    Ok(matches)
}
