//! Limit syntax
//!
//! Limits scope what a backup covers. They come from configuration files
//! and the command line as whitespace separated tokens:
//!
//! ```text
//! # filesystem limits
//! /etc /srv/www      # include
//! -/etc/.git         # exclude
//! /home/*/.ssh       # globs expand when the path map is built
//!
//! # database limits
//! mysql:wordpress
//! -mysql:wordpress/wp_sessions
//! pgsql:-analytics
//! ```
//!
//! A `#` starts a comment that runs to the end of the line. Database limits
//! are prefixed `mysql:` or `pgsql:` and name a database or `db/table`;
//! the `-` exclusion sign may appear before the prefix or after it. Every
//! other token must be an absolute path.

use crate::error::{DeltaError, Result};
use crate::pathmap::PathMap;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

const DB_PREFIXES: [&str; 2] = ["mysql:", "pgsql:"];

/// Parsed limits, split by what they apply to
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Limits {
    /// Filesystem limits, e.g. `/etc` or `-/etc/.git`
    pub fs: Vec<String>,
    /// Database limits without their prefix, e.g. `wordpress` or `-db/table`
    pub db: Vec<String>,
}

impl Limits {
    /// Parse limit text
    ///
    /// # Errors
    ///
    /// [`DeltaError::InvalidLimit`] for a token that is neither an absolute
    /// path nor a database limit.
    pub fn parse(text: &str) -> Result<Self> {
        let mut limits = Limits::default();

        for line in text.lines() {
            let line = match line.find('#') {
                Some(i) => &line[..i],
                None => line,
            };
            for token in line.split_whitespace() {
                limits.push(token)?;
            }
        }

        Ok(limits)
    }

    /// Parse the limits file at `path`
    pub fn load(path: &Path) -> Result<Self> {
        Self::parse(&fs::read_to_string(path)?)
    }

    /// Build limits from individual tokens (e.g. command line arguments)
    pub fn from_tokens<I, S>(tokens: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut limits = Limits::default();
        for token in tokens {
            limits.push(token.as_ref())?;
        }
        Ok(limits)
    }

    fn push(&mut self, token: &str) -> Result<()> {
        let (negated, body) = match token.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, token),
        };

        if let Some(db) = DB_PREFIXES.iter().find_map(|prefix| body.strip_prefix(prefix)) {
            let (negated, db) = match db.strip_prefix('-') {
                Some(rest) => (true, rest),
                None => (negated, db),
            };
            if db.is_empty() || db.starts_with('/') || db.split('/').count() > 2 {
                return Err(DeltaError::InvalidLimit(token.to_string()));
            }
            self.db.push(if negated { format!("-{}", db) } else { db.to_string() });
            return Ok(());
        }

        if !body.starts_with('/') {
            return Err(DeltaError::InvalidLimit(token.to_string()));
        }
        self.fs.push(token.to_string());
        Ok(())
    }

    /// Path map of the filesystem limits
    pub fn pathmap(&self) -> Result<PathMap> {
        PathMap::new(&self.fs)
    }

    /// Database limits as queryable rules
    pub fn db_limits(&self) -> DbLimits {
        DbLimits::new(&self.db)
    }
}

/// Include/exclude rules over databases and their tables
///
/// Rules are `db` or `db/table`, `-` prefixed to exclude. As with path
/// limits, any positive rule turns the default from include to exclude.
/// The default value includes everything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbLimits {
    default: bool,
    databases: HashMap<String, bool>,
    tables: HashMap<(String, String), bool>,
}

impl Default for DbLimits {
    fn default() -> Self {
        DbLimits {
            default: true,
            databases: HashMap::new(),
            tables: HashMap::new(),
        }
    }
}

impl DbLimits {
    /// Build rules from limit strings
    pub fn new<I, S>(limits: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut rules = DbLimits::default();

        for limit in limits {
            let limit = limit.as_ref();
            let (include, body) = match limit.strip_prefix('-') {
                Some(rest) => (false, rest),
                None => (true, limit),
            };
            if include {
                rules.default = false;
            }

            match body.split_once('/') {
                Some((db, table)) => {
                    rules.tables.insert((db.to_string(), table.to_string()), include);
                }
                None => {
                    rules.databases.insert(body.to_string(), include);
                }
            }
        }

        rules
    }

    /// Whether any part of `database` is included
    ///
    /// A database rule decides directly. Without one, a positive rule for
    /// one of its tables includes the database.
    pub fn contains_database(&self, database: &str) -> bool {
        if let Some(&include) = self.databases.get(database) {
            return include;
        }
        let has_table_rule = self
            .tables
            .iter()
            .any(|((db, _), &include)| db == database && include);
        has_table_rule || self.default
    }

    /// Whether `table` of `database` is included
    ///
    /// A table rule wins over its database rule.
    pub fn contains_table(&self, database: &str, table: &str) -> bool {
        if let Some(&include) = self
            .tables
            .get(&(database.to_string(), table.to_string()))
        {
            return include;
        }
        self.databases
            .get(database)
            .copied()
            .unwrap_or(self.default)
    }
}
