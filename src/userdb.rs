//! User and group database merging
//!
//! When a backup from one system is restored onto another, the same account
//! name can have a different numeric id on each side, and the same id can
//! belong to unrelated accounts. [`EtcGroup::merge`] and [`EtcPasswd::merge`]
//! reconcile an OLD table (from the backup) with a NEW table (the live
//! system) and produce an [`IdMap`] of old id to new id that is later used to
//! fix ownership of restored files.
//!
//! Groups are merged first; the group id field of every OLD passwd entry is
//! rewritten through the resulting gid map before users are merged. Use
//! [`merge_etc`] to get that ordering right.

use crate::error::{DeltaError, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::marker::PhantomData;
use tracing::{debug, info};

/// Old id to new id, transparent for ids it does not contain
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdMap(BTreeMap<u32, u32>);

impl IdMap {
    /// Create an empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `old` becomes `new`
    pub fn insert(&mut self, old: u32, new: u32) {
        self.0.insert(old, new);
    }

    /// Map an id, passing unmapped ids through unchanged
    pub fn get(&self, id: u32) -> u32 {
        self.0.get(&id).copied().unwrap_or(id)
    }

    /// Check if `id` has a mapping
    pub fn contains(&self, id: u32) -> bool {
        self.0.contains_key(&id)
    }

    /// Number of mappings
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if the map is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Mappings ordered by old id
    pub fn iter(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.0.iter().map(|(&k, &v)| (k, v))
    }
}

impl FromIterator<(u32, u32)> for IdMap {
    fn from_iter<T: IntoIterator<Item = (u32, u32)>>(iter: T) -> Self {
        IdMap(iter.into_iter().collect())
    }
}

/// Layout of a colon separated account table
pub trait TableKind {
    /// Name used in parse errors
    const NAME: &'static str;
    /// Index of the numeric id field
    const ID_FIELD: usize;
    /// Minimum number of fields per line
    const MIN_FIELDS: usize;
}

/// `/etc/passwd` layout: `name:x:uid:gid:gecos:home:shell`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Passwd;

/// `/etc/group` layout: `name:x:gid:members`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Group;

impl TableKind for Passwd {
    const NAME: &'static str = "passwd";
    const ID_FIELD: usize = 2;
    const MIN_FIELDS: usize = 4;
}

impl TableKind for Group {
    const NAME: &'static str = "group";
    const ID_FIELD: usize = 2;
    const MIN_FIELDS: usize = 3;
}

const PASSWD_GID_FIELD: usize = 3;

/// One account: the raw fields of its line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    fields: Vec<String>,
    id: u32,
}

impl Entity {
    /// Account name
    pub fn name(&self) -> &str {
        &self.fields[0]
    }

    /// Numeric id
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Raw fields
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    fn set_field_id(&mut self, index: usize, id: u32) {
        self.fields[index] = id.to_string();
    }
}

/// Name-keyed account table of some [`TableKind`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table<K> {
    entities: BTreeMap<String, Entity>,
    kind: PhantomData<K>,
}

/// `/etc/passwd` table
pub type EtcPasswd = Table<Passwd>;

/// `/etc/group` table
pub type EtcGroup = Table<Group>;

impl<K> Default for Table<K> {
    fn default() -> Self {
        Table {
            entities: BTreeMap::new(),
            kind: PhantomData,
        }
    }
}

impl<K: TableKind> Table<K> {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the colon separated text format
    ///
    /// Blank lines are skipped. Every other line needs at least the fields of
    /// its layout and a numeric id.
    pub fn parse(text: &str) -> Result<Self> {
        let mut table = Self::new();

        for (number, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let bad = |reason: &str| DeltaError::parse(K::NAME, number + 1, line, reason);

            let fields: Vec<String> = line.split(':').map(str::to_string).collect();
            if fields.len() < K::MIN_FIELDS {
                return Err(bad(&format!(
                    "expected at least {} fields, found {}",
                    K::MIN_FIELDS,
                    fields.len()
                )));
            }
            if fields[0].is_empty() {
                return Err(bad("empty name"));
            }
            let id = fields[K::ID_FIELD]
                .parse::<u32>()
                .map_err(|_| bad("invalid id"))?;

            table.insert(Entity { fields, id });
        }

        Ok(table)
    }

    /// Add or replace an entity
    pub fn insert(&mut self, entity: Entity) {
        self.entities.insert(entity.name().to_string(), entity);
    }

    /// Look up an entity by name
    pub fn get(&self, name: &str) -> Option<&Entity> {
        self.entities.get(name)
    }

    /// Number of entities
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Check if the table is empty
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Entities ordered by name
    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    /// Every id in use
    pub fn ids(&self) -> BTreeSet<u32> {
        self.entities.values().map(Entity::id).collect()
    }

    fn set_id(entity: &mut Entity, id: u32) {
        entity.id = id;
        entity.set_field_id(K::ID_FIELD, id);
    }

    /// Merge `old` (from a backup) into `new` (the live system)
    ///
    /// For every name in either table:
    ///
    /// - in both: OLD's fields are kept with NEW's id
    /// - only in NEW: kept as is
    /// - only in OLD: kept as is, unless OLD's id is taken in NEW, in which
    ///   case a fresh id in the same band is allocated
    ///
    /// The returned map holds an entry for every id that changed. Names are
    /// processed in sorted order so allocation is deterministic.
    ///
    /// # Errors
    ///
    /// [`DeltaError::IdsExhausted`] if no free id is left.
    pub fn merge(old: &Self, new: &Self) -> Result<(Self, IdMap)> {
        let mut merged = Self::new();
        let mut idmap = IdMap::new();

        let new_ids = new.ids();
        let mut used: BTreeSet<u32> = old.ids().union(&new_ids).copied().collect();

        let names: BTreeSet<&String> = old.entities.keys().chain(new.entities.keys()).collect();
        for name in names {
            match (old.entities.get(name), new.entities.get(name)) {
                (Some(old_ent), Some(new_ent)) => {
                    let mut entity = old_ent.clone();
                    if old_ent.id != new_ent.id {
                        Self::set_id(&mut entity, new_ent.id);
                        idmap.insert(old_ent.id, new_ent.id);
                    }
                    merged.insert(entity);
                }
                (None, Some(new_ent)) => merged.insert(new_ent.clone()),
                (Some(old_ent), None) => {
                    let mut entity = old_ent.clone();
                    if new_ids.contains(&old_ent.id) {
                        let id = new_id(&used, old_ent.id)?;
                        debug!("{} {:?}: id {} collides, allocated {}", K::NAME, name, old_ent.id, id);
                        used.insert(id);
                        Self::set_id(&mut entity, id);
                        idmap.insert(old_ent.id, id);
                    }
                    merged.insert(entity);
                }
                (None, None) => unreachable!("name comes from one of the tables"),
            }
        }

        Ok((merged, idmap))
    }
}

impl EtcPasswd {
    /// Rewrite every entry's primary group id through `gidmap`
    pub fn fixgids(&mut self, gidmap: &IdMap) {
        for entity in self.entities.values_mut() {
            if let Ok(gid) = entity.fields[PASSWD_GID_FIELD].parse::<u32>() {
                if gidmap.contains(gid) {
                    entity.set_field_id(PASSWD_GID_FIELD, gidmap.get(gid));
                }
            }
        }
    }
}

/// Lines sorted by id, then name, each terminated by a newline
impl<K: TableKind> fmt::Display for Table<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut entities: Vec<&Entity> = self.entities.values().collect();
        entities.sort_by(|a, b| a.id.cmp(&b.id).then_with(|| a.name().cmp(b.name())));
        for entity in entities {
            writeln!(f, "{}", entity.fields.join(":"))?;
        }
        Ok(())
    }
}

/// Pick the first id not in `used`, in the band `based_on` belongs to
///
/// Bands are system ids `[1, 100)`, `[100, 1000)` and user ids
/// `[1000, 65534)`. When the band is full the user band is tried.
pub fn new_id(used: &BTreeSet<u32>, based_on: u32) -> Result<u32> {
    let band = if based_on < 100 {
        1..100
    } else if based_on < 1000 {
        100..1000
    } else {
        1000..65534
    };

    band.chain(1000..65534)
        .find(|id| !used.contains(id))
        .ok_or(DeltaError::IdsExhausted { based_on })
}

/// Result of [`merge_etc`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedEtc {
    /// Merged passwd table
    pub passwd: EtcPasswd,
    /// Merged group table
    pub group: EtcGroup,
    /// Old uid to new uid
    pub uidmap: IdMap,
    /// Old gid to new gid
    pub gidmap: IdMap,
}

/// Merge OLD passwd/group texts into NEW ones, groups first
pub fn merge_etc(
    old_passwd: &str,
    old_group: &str,
    new_passwd: &str,
    new_group: &str,
) -> Result<MergedEtc> {
    let old_group = EtcGroup::parse(old_group)?;
    let new_group = EtcGroup::parse(new_group)?;
    let (group, gidmap) = EtcGroup::merge(&old_group, &new_group)?;

    let mut old_passwd = EtcPasswd::parse(old_passwd)?;
    old_passwd.fixgids(&gidmap);
    let new_passwd = EtcPasswd::parse(new_passwd)?;
    let (passwd, uidmap) = EtcPasswd::merge(&old_passwd, &new_passwd)?;

    info!(
        "Merged {} users and {} groups ({} uids and {} gids remapped)",
        passwd.len(),
        group.len(),
        uidmap.len(),
        gidmap.len()
    );

    Ok(MergedEtc {
        passwd,
        group,
        uidmap,
        gidmap,
    })
}
