//! Main test module for fsdelta
//!
//! This module includes all test suites:
//! - Integration tests for full backup, restore and rollback cycles
//! - Property-based tests for invariants
//! - Edge cases of the persisted formats and the filesystem walk

pub mod integration;
pub mod property;

#[cfg(test)]
mod edge_cases {
    use ::fsdelta::*;
    use std::fs;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    #[test]
    fn test_malformed_index_names_line() {
        let data = b"/etc/passwd\t81a4\t0\t0\t5a\t0\n/etc/group\t81a4\t0\n";
        match DirIndex::parse(data, "dirindex") {
            Err(DeltaError::Parse { source_name, line_number, line, .. }) => {
                assert_eq!(source_name, "dirindex");
                assert_eq!(line_number, 2);
                assert!(line.starts_with("/etc/group"));
            }
            other => panic!("expected a parse error, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_change_code_rejected() {
        let err = ChangeLog::parse(b"o\t/etc/a\t0\t0\nx\t/etc/b\n", "fsdelta").unwrap_err();
        assert!(matches!(err, DeltaError::Parse { line_number: 2, .. }));
    }

    #[test]
    fn test_relative_limit_rejected() {
        assert!(matches!(PathMap::new(["etc"]), Err(DeltaError::NotAbsolute(_))));
        assert!(matches!(Limits::parse("etc # relative"), Err(DeltaError::InvalidLimit(_))));
    }

    #[test]
    fn test_glob_without_matches_is_empty() {
        let temp = TempDir::new().unwrap();
        let pattern = format!("{}/*.nothing", temp.path().display());
        let map = PathMap::new([pattern]).unwrap();
        assert!(map.is_empty());
        assert!(map.default_included());
    }

    #[test]
    fn test_glob_expands_to_existing_paths() {
        let temp = TempDir::new().unwrap();
        for name in ["a.log", "b.log", "c.txt"] {
            fs::write(temp.path().join(name), "").unwrap();
        }
        let map = PathMap::new([
            temp.path().display().to_string(),
            format!("-{}/*.log", temp.path().display()),
        ])
        .unwrap();

        assert!(!map.is_included(&temp.path().join("a.log")));
        assert!(!map.is_included(&temp.path().join("b.log")));
        assert!(map.is_included(&temp.path().join("c.txt")));
        // Created after the map was built
        assert!(map.is_included(&temp.path().join("d.log")));
    }

    #[test]
    fn test_symlinks_are_leaves() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("root");
        let outside = temp.path().join("outside");
        fs::create_dir_all(&root).unwrap();
        fs::create_dir_all(&outside).unwrap();
        fs::write(outside.join("secret"), "s").unwrap();
        std::os::unix::fs::symlink(&outside, root.join("link")).unwrap();

        let index = DirIndex::walk(&PathMap::new([root.display().to_string()]).unwrap()).unwrap();
        let paths: Vec<&Path> = index.paths().collect();
        assert_eq!(paths, vec![root.as_path(), root.join("link").as_path()]);
    }

    #[test]
    fn test_empty_change_log_restores_nothing() {
        let temp = TempDir::new().unwrap();
        let extras = Extras::new(temp.path().join("extras"));
        extras.save_changes(&ChangeLog::new()).unwrap();
        fs::create_dir_all(temp.path().join("overlay")).unwrap();
        fs::create_dir_all(temp.path().join("etc")).unwrap();

        let config = Config::default()
            .with_rollback(false)
            .with_etc_path(temp.path().join("etc"));
        let limits = Limits::from_tokens([temp.path().join("root").display().to_string()]).unwrap();
        let restore = Restore::new(&config, extras, temp.path().join("overlay"), &limits).unwrap();
        let report = restore.restore_files(&IdMap::new(), &IdMap::new()).unwrap();

        assert_eq!(report.files_applied + report.files_deleted + report.statfixes_applied, 0);
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_rollback_without_state() {
        let temp = TempDir::new().unwrap();
        let config = Config::default().with_rollback_path(temp.path().join("none"));
        let err = Rollback::open(&config).unwrap_err();
        assert!(err.user_message().to_lowercase().contains("nothing to rollback"));
    }

    #[test]
    fn test_ids_exhausted() {
        let used: std::collections::BTreeSet<u32> = (1..65534).collect();
        let err = userdb::new_id(&used, 5).unwrap_err();
        assert!(matches!(err, DeltaError::IdsExhausted { based_on: 5 }));
    }

    #[test]
    fn test_move_out_without_original() {
        let temp = TempDir::new().unwrap();
        let originals = Originals::new(temp.path().join("originals"));
        let live: PathBuf = temp.path().join("live.conf");
        fs::write(&live, "current").unwrap();

        assert!(!originals.move_out(&live).unwrap());
        assert_eq!(fs::read_to_string(&live).unwrap(), "current");
    }
}
