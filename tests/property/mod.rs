//! Property-based testing for fsdelta
//!
//! Uses proptest to verify invariants of path maps, the user database
//! merge, the persisted formats and the ownership fixes.

use ::fsdelta::*;
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Absolute paths below `/p` built from a tiny alphabet, so rules and
/// queries overlap often
fn rule_path_strategy() -> impl Strategy<Value = PathBuf> {
    prop::collection::vec(prop_oneof![Just("a"), Just("b"), Just("c")], 0..3).prop_map(|parts| {
        let mut path = PathBuf::from("/p");
        for part in parts {
            path.push(part);
        }
        path
    })
}

fn rules_strategy() -> impl Strategy<Value = Vec<(PathBuf, bool)>> {
    prop::collection::vec((rule_path_strategy(), any::<bool>()), 0..6)
}

fn limit_tokens(rules: &[(PathBuf, bool)]) -> Vec<String> {
    rules
        .iter()
        .map(|(path, include)| {
            if *include {
                path.display().to_string()
            } else {
                format!("-{}", path.display())
            }
        })
        .collect()
}

/// Nearest rule on the path or its ancestors, else the default
fn reference_is_included(rules: &[(PathBuf, bool)], path: &Path) -> bool {
    let effective: BTreeMap<&Path, bool> = rules.iter().map(|(p, inc)| (p.as_path(), *inc)).collect();
    let default = !effective.values().any(|&inc| inc);
    path.ancestors()
        .find_map(|ancestor| effective.get(ancestor).copied())
        .unwrap_or(default)
}

/// Index paths: anything but tab, newline and NUL, below `/`
fn index_path_strategy() -> impl Strategy<Value = PathBuf> {
    prop::collection::vec("[a-zA-Z0-9 _#é-][a-zA-Z0-9 ._#é-]{0,11}", 1..5).prop_map(|parts| {
        let mut path = PathBuf::from("/");
        for part in parts {
            path.push(part);
        }
        path
    })
}

fn record_strategy() -> impl Strategy<Value = Record> {
    (any::<u32>(), any::<u32>(), any::<u32>(), any::<u64>(), any::<i64>()).prop_map(
        |(mode, uid, gid, size, mtime)| Record {
            mode,
            uid,
            gid,
            size,
            mtime,
        },
    )
}

fn change_strategy() -> impl Strategy<Value = Change> {
    prop_oneof![
        (index_path_strategy(), any::<u32>(), any::<u32>())
            .prop_map(|(path, uid, gid)| Change::Overwrite { path, uid, gid }),
        (index_path_strategy(), any::<u32>(), any::<u32>(), 0u32..0o10000)
            .prop_map(|(path, uid, gid, mode)| Change::Stat { path, uid, gid, mode }),
        index_path_strategy().prop_map(|path| Change::Deleted { path }),
    ]
}

/// Account tables as `(name, id)` pairs with unique names and unique ids
fn accounts_strategy() -> impl Strategy<Value = Vec<(String, u32)>> {
    prop::collection::btree_map("[a-f]{1,3}", prop_oneof![0u32..120, 990u32..1010], 0..10).prop_map(|accounts| {
        let mut seen = BTreeSet::new();
        accounts
            .into_iter()
            .filter(|(_, id)| seen.insert(*id))
            .collect()
    })
}

fn passwd_text(accounts: &[(String, u32)]) -> String {
    accounts
        .iter()
        .map(|(name, id)| format!("{}:x:{}:{}::/home/{}:/bin/sh\n", name, id, id, name))
        .collect()
}

fn group_text(accounts: &[(String, u32)]) -> String {
    accounts.iter().map(|(name, id)| format!("{}:x:{}:\n", name, id)).collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_pathmap_nearest_rule_wins(rules in rules_strategy(), query in rule_path_strategy(), leaf in "[a-z]{1,4}") {
        let map = PathMap::new(limit_tokens(&rules)).unwrap();
        for path in [query.clone(), query.join(&leaf)] {
            prop_assert_eq!(map.is_included(&path), reference_is_included(&rules, &path), "{:?}", path);
        }
    }

    #[test]
    fn prop_pathmap_exclude_never_includes(rules in rules_strategy(), excluded in rule_path_strategy(), query in rule_path_strategy()) {
        let before = PathMap::new(limit_tokens(&rules)).unwrap();
        let mut more = rules.clone();
        more.push((excluded.clone(), false));
        let after = PathMap::new(limit_tokens(&more)).unwrap();

        // Adding an exclude can only take paths away, except where it
        // removes the last positive rule and flips the default
        if after.default_included() == before.default_included() && !before.is_included(&query) {
            prop_assert!(!after.is_included(&query));
        }
        prop_assert!(!after.is_included(&excluded));
    }

    #[test]
    fn prop_merge_with_itself_is_identity(accounts in accounts_strategy()) {
        let table = EtcPasswd::parse(&passwd_text(&accounts)).unwrap();
        let (merged, idmap) = EtcPasswd::merge(&table, &table).unwrap();
        prop_assert_eq!(merged.to_string(), table.to_string());
        prop_assert!(idmap.is_empty());
    }

    #[test]
    fn prop_merged_ids_are_distinct(old in accounts_strategy(), new in accounts_strategy()) {
        let old = EtcGroup::parse(&group_text(&old)).unwrap();
        let new = EtcGroup::parse(&group_text(&new)).unwrap();
        let (merged, idmap) = EtcGroup::merge(&old, &new).unwrap();

        prop_assert_eq!(merged.ids().len(), merged.len());
        for (from, to) in idmap.iter() {
            prop_assert_ne!(from, to);
        }
        for entity in new.iter() {
            prop_assert_eq!(merged.get(entity.name()).map(|e| e.id()), Some(entity.id()));
        }
    }

    #[test]
    fn prop_merge_etc_remaps_passwd_groups(old in accounts_strategy(), new in accounts_strategy()) {
        let merged = merge_etc(&passwd_text(&old), &group_text(&old), &passwd_text(&new), &group_text(&new)).unwrap();
        let gids = merged.group.ids();
        for entity in merged.passwd.iter() {
            let gid: u32 = entity.fields()[3].parse().unwrap();
            prop_assert!(gids.contains(&gid), "{} has dangling gid {}", entity.name(), gid);
        }
    }

    #[test]
    fn prop_index_text_roundtrip(records in prop::collection::btree_map(index_path_strategy(), record_strategy(), 0..20)) {
        let mut index = DirIndex::new();
        for (path, record) in records {
            index.insert(path, record);
        }
        let mut buffer = Vec::new();
        index.write_to(&mut buffer).unwrap();
        prop_assert_eq!(DirIndex::parse(&buffer, "generated").unwrap(), index);
    }

    #[test]
    fn prop_changelog_text_roundtrip(changes in prop::collection::vec(change_strategy(), 0..20)) {
        let log: ChangeLog = changes.into_iter().collect();
        let mut buffer = Vec::new();
        log.write_to(&mut buffer).unwrap();
        prop_assert_eq!(ChangeLog::parse(&buffer, "generated").unwrap(), log);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Skipping overwrites with unmapped ids yields the same chowns as
    /// checking every path
    #[test]
    fn prop_statfix_shortcut_matches_full_check(
        kinds in prop::collection::vec((any::<bool>(), 0u32..0o1000), 1..8),
        uid_offsets in prop::collection::btree_map(0u32..3, 0u32..3, 0..3),
        gid_offsets in prop::collection::btree_map(0u32..3, 0u32..3, 0..3),
    ) {
        let temp = TempDir::new().unwrap();
        let probe = temp.path().join("probe");
        fs::write(&probe, "").unwrap();
        let metadata = fs::symlink_metadata(&probe).unwrap();
        let (uid, gid) = (metadata.uid(), metadata.gid());

        // Overlay files carry their recorded owner, which is ours
        let mut log = ChangeLog::new();
        for (i, (is_stat, mode)) in kinds.iter().enumerate() {
            let path = temp.path().join(format!("f{}", i));
            fs::write(&path, "x").unwrap();
            log.push(if *is_stat {
                Change::Stat { path, uid, gid, mode: *mode }
            } else {
                Change::Overwrite { path, uid, gid }
            });
        }
        log.push(Change::Deleted { path: temp.path().join("f0") });

        let uidmap: IdMap = uid_offsets.iter().map(|(&a, &b)| (uid + a, uid + b)).collect();
        let gidmap: IdMap = gid_offsets.iter().map(|(&a, &b)| (gid + a, gid + b)).collect();

        let chowns: Vec<StatFix> = log
            .statfixes(&uidmap, &gidmap)
            .filter(|fix| matches!(fix, StatFix::Chown { .. }))
            .collect();

        let mut expected = Vec::new();
        for change in &log {
            let Some((u, g)) = change.owner() else { continue };
            let live = fs::symlink_metadata(change.path()).unwrap();
            let (target_uid, target_gid) = (uidmap.get(u), gidmap.get(g));
            if live.uid() != target_uid || live.gid() != target_gid {
                expected.push(StatFix::Chown {
                    path: change.path().to_path_buf(),
                    uid: target_uid,
                    gid: target_gid,
                });
            }
        }
        prop_assert_eq!(chowns, expected);
    }
}
