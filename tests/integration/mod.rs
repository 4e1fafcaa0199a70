//! Integration tests for fsdelta
//!
//! Drives randomly generated trees through the full backup, restore and
//! rollback cycle and checks the tree ends up where it should.

use ::fsdelta::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use walkdir::WalkDir;

/// Content and permission bits of every file and symlink below a root
pub type TreeState = BTreeMap<PathBuf, (Vec<u8>, u32)>;

/// A scratch system: a live tree plus the places a backup and restore need
pub struct SystemHarness {
    pub temp_dir: TempDir,
    pub root: PathBuf,
    pub rng: StdRng,
}

impl SystemHarness {
    /// Create a harness with an empty live tree
    pub fn new(seed: u64) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("root");
        fs::create_dir_all(&root).unwrap();
        let etc = temp_dir.path().join("sysetc");
        fs::create_dir_all(&etc).unwrap();
        fs::write(etc.join("passwd"), "root:x:0:0:root:/root:/bin/sh\n").unwrap();
        fs::write(etc.join("group"), "root:x:0:\n").unwrap();

        Self {
            temp_dir,
            root,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.temp_dir.path().join(name)
    }

    pub fn limits(&self) -> Limits {
        Limits::from_tokens([self.root.display().to_string()]).unwrap()
    }

    pub fn config(&self) -> Config {
        Config::default()
            .with_rollback_path(self.path("rollback"))
            .with_etc_path(self.path("sysetc"))
    }

    /// Populate the tree with a few directories of files
    pub fn generate(&mut self, dirs: usize, files_per_dir: usize) {
        for d in 0..dirs {
            let dir = self.root.join(format!("dir{}", d));
            fs::create_dir_all(&dir).unwrap();
            for f in 0..files_per_dir {
                let len = self.rng.random_range(1..200);
                let content: Vec<u8> = (0..len).map(|_| self.rng.random()).collect();
                let path = dir.join(format!("file{}.conf", f));
                fs::write(&path, content).unwrap();
                fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
            }
        }
        std::os::unix::fs::symlink("dir0/file0.conf", self.root.join("link")).unwrap();
    }

    /// Apply random edits; every edit changes size so it is detectable
    /// within the same second
    pub fn mutate(&mut self, count: usize) {
        let files: Vec<PathBuf> = self
            .files()
            .into_iter()
            .filter(|p| !p.ends_with("link"))
            .collect();

        for i in 0..count {
            match self.rng.random_range(0..4) {
                0 => {
                    let path = self.root.join(format!("new{}/added{}.conf", i % 2, i));
                    fs::create_dir_all(path.parent().unwrap()).unwrap();
                    fs::write(&path, format!("added {}", i)).unwrap();
                }
                1 if !files.is_empty() => {
                    let path = &files[self.rng.random_range(0..files.len())];
                    if path.exists() {
                        let mut content = fs::read(path).unwrap();
                        content.extend_from_slice(b"\nedited");
                        fs::write(path, content).unwrap();
                    }
                }
                2 if !files.is_empty() => {
                    let path = &files[self.rng.random_range(0..files.len())];
                    let _ = fs::remove_file(path);
                }
                _ if !files.is_empty() => {
                    let path = &files[self.rng.random_range(0..files.len())];
                    if path.exists() {
                        fs::set_permissions(path, fs::Permissions::from_mode(0o600)).unwrap();
                    }
                }
                _ => {}
            }
        }
    }

    /// Files and symlinks below the root
    pub fn files(&self) -> Vec<PathBuf> {
        WalkDir::new(&self.root)
            .min_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| !e.file_type().is_dir())
            .map(|e| e.path().to_path_buf())
            .collect()
    }

    /// Snapshot of the tree's files
    pub fn state(&self) -> TreeState {
        self.files()
            .into_iter()
            .map(|path| {
                let metadata = fs::symlink_metadata(&path).unwrap();
                let content = if metadata.file_type().is_symlink() {
                    fs::read_link(&path).unwrap().into_os_string().into_encoded_bytes()
                } else {
                    fs::read(&path).unwrap()
                };
                let relative = path.strip_prefix(&self.root).unwrap().to_path_buf();
                (relative, (content, metadata.permissions().mode() & 0o7777))
            })
            .collect()
    }

    /// Replace the live tree with a copy of `source`
    pub fn reset_from(&self, source: &Path) {
        fs::remove_dir_all(&self.root).unwrap();
        for entry in WalkDir::new(source).into_iter().filter_map(|e| e.ok()) {
            let target = self.root.join(entry.path().strip_prefix(source).unwrap());
            let file_type = entry.file_type();
            if file_type.is_dir() {
                fs::create_dir_all(&target).unwrap();
            } else if file_type.is_symlink() {
                std::os::unix::fs::symlink(fs::read_link(entry.path()).unwrap(), &target).unwrap();
            } else {
                fs::copy(entry.path(), &target).unwrap();
            }
        }
    }

    /// Copy the live tree to `dest`
    pub fn copy_to(&self, dest: &Path) {
        for entry in WalkDir::new(&self.root).into_iter().filter_map(|e| e.ok()) {
            let target = dest.join(entry.path().strip_prefix(&self.root).unwrap());
            let file_type = entry.file_type();
            if file_type.is_dir() {
                fs::create_dir_all(&target).unwrap();
            } else if file_type.is_symlink() {
                std::os::unix::fs::symlink(fs::read_link(entry.path()).unwrap(), &target).unwrap();
            } else {
                fs::copy(entry.path(), &target).unwrap();
            }
        }
    }

    /// Stage the files a change log overwrites into an overlay
    pub fn stage_overlay(&self, changes: &ChangeLog, overlay: &Path) {
        for path in changes.overwrites() {
            let staged = overlay.join(path.strip_prefix("/").unwrap());
            fs::create_dir_all(staged.parent().unwrap()).unwrap();
            let metadata = fs::symlink_metadata(path).unwrap();
            if metadata.file_type().is_symlink() {
                std::os::unix::fs::symlink(fs::read_link(path).unwrap(), &staged).unwrap();
            } else {
                fs::copy(path, &staged).unwrap();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn append(path: &Path, extra: &[u8]) {
        let mut content = fs::read(path).unwrap();
        content.extend_from_slice(extra);
        fs::write(path, content).unwrap();
    }

    fn full_cycle(seed: u64) -> anyhow::Result<()> {
        let mut harness = SystemHarness::new(seed);
        harness.generate(3, 4);

        let limits = harness.limits();
        let baseline = harness.path("dirindex");
        DirIndex::walk(&limits.pathmap()?)?.save(&baseline)?;
        let pristine = harness.path("pristine");
        harness.copy_to(&pristine);
        let before = harness.state();

        harness.mutate(8);
        let after = harness.state();

        let changes = whatchanged(&baseline, &limits.fs)?;
        let overlay = harness.path("overlay");
        harness.stage_overlay(&changes, &overlay);
        let extras = Extras::new(harness.path("extras"));
        extras.save_changes(&changes)?;

        // The target is at the baseline
        harness.reset_from(&pristine);
        anyhow::ensure!(harness.state() == before, "reset failed for seed {}", seed);

        let config = harness.config();
        let restore = Restore::new(&config, extras, &overlay, &limits)?;
        let report = restore.run(None, None)?;
        assert!(report.warnings.is_empty(), "{:?}", report.warnings);
        assert_eq!(harness.state(), after, "seed {}", seed);

        let report = Rollback::open(&config)?.rollback(None, None)?;
        assert!(report.warnings.is_empty(), "{:?}", report.warnings);
        assert_eq!(harness.state(), before, "seed {}", seed);
        Ok(())
    }

    #[test]
    #[traced_test]
    fn test_restore_reproduces_changed_tree() {
        for seed in [1, 7, 42, 1234] {
            full_cycle(seed).unwrap();
        }
    }

    #[test]
    fn test_change_classification() {
        let mut harness = SystemHarness::new(0);
        harness.generate(1, 3);
        let limits = harness.limits();
        let baseline = harness.path("dirindex");
        DirIndex::walk(&limits.pathmap().unwrap()).unwrap().save(&baseline).unwrap();

        let dir = harness.root.join("dir0");
        append(&dir.join("file0.conf"), b"rewritten");
        fs::set_permissions(dir.join("file1.conf"), fs::Permissions::from_mode(0o600)).unwrap();
        fs::remove_file(dir.join("file2.conf")).unwrap();
        fs::create_dir(harness.root.join("fresh")).unwrap();
        fs::write(harness.root.join("fresh/one"), "1").unwrap();

        let changes = whatchanged(&baseline, &limits.fs).unwrap();
        let lines: Vec<String> = changes.iter().map(|c| format!("{}:{}", c.op().code(), c.path().strip_prefix(&harness.root).unwrap().display())).collect();

        assert_eq!(
            lines,
            vec![
                "o:dir0/file0.conf",
                "o:fresh/one",
                "s:dir0/file1.conf",
                "s:fresh",
                "d:dir0/file2.conf",
            ]
        );
        match changes.iter().find(|c| c.path().ends_with("file1.conf")) {
            Some(Change::Stat { mode, .. }) => assert_eq!(*mode, 0o600),
            other => panic!("expected a stat change, got {:?}", other),
        }
    }

    #[test]
    fn test_excluded_subtree_is_invisible() {
        let mut harness = SystemHarness::new(3);
        harness.generate(2, 2);
        let tokens = vec![
            harness.root.display().to_string(),
            format!("-{}", harness.root.join("dir1").display()),
        ];
        let baseline = harness.path("dirindex");
        let index = DirIndex::walk(&PathMap::new(&tokens).unwrap()).unwrap();
        assert!(index.paths().all(|p| !p.starts_with(harness.root.join("dir1"))));
        index.save(&baseline).unwrap();

        fs::remove_dir_all(harness.root.join("dir1")).unwrap();
        append(&harness.root.join("dir0/file0.conf"), b"changed");

        let changes = whatchanged(&baseline, &tokens).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes.summary().overwrites, 1);
    }

    #[test]
    fn test_restore_remaps_ownership_records() {
        let mut harness = SystemHarness::new(5);
        harness.generate(1, 1);
        let file = harness.root.join("dir0/file0.conf");
        let (uid, gid) = {
            use std::os::unix::fs::MetadataExt;
            let m = fs::metadata(&file).unwrap();
            (m.uid(), m.gid())
        };

        // Recorded under other ids that the merge maps back onto ours
        let log: ChangeLog = vec![Change::Stat {
            path: file.clone(),
            uid: uid + 1,
            gid: gid + 1,
            mode: 0o640,
        }]
        .into_iter()
        .collect();
        let uidmap: IdMap = [(uid + 1, uid)].into_iter().collect();
        let gidmap: IdMap = [(gid + 1, gid)].into_iter().collect();

        let fixes: Vec<StatFix> = log.statfixes(&uidmap, &gidmap).collect();
        assert_eq!(fixes, vec![StatFix::Chmod { path: file.clone(), mode: 0o640 }]);
        for fix in &fixes {
            fix.apply().unwrap();
        }
        assert_eq!(harness.state()[Path::new("dir0/file0.conf")].1, 0o640);
    }
}
