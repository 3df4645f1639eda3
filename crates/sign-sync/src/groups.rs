//! Per-run interning of Sign group names.
//!
//! A group name may carry a qualifier naming the secondary organization it
//! belongs to (`sec::Sign Group`). Names are compared case-insensitively, so
//! `Sign Group 1` and `sign group 1` intern to the same [`GroupKey`], while an
//! unqualified group and a qualified one with the same base name stay distinct.

use std::collections::HashMap;
use std::fmt;
use std::sync::{PoisonError, RwLock};

use signsync_core::config::{PRIMARY_ORG, QUALIFIER_SEPARATOR};

/// Canonical identity of a Sign group within one synchronization run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupKey(u32);

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group#{}", self.0)
    }
}

/// What a [`GroupKey`] stands for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupEntry {
    /// Base name as first seen (case preserved).
    pub name: String,
    /// Lower-cased qualifier; `None` for groups of the primary org.
    pub qualifier: Option<String>,
}

impl GroupEntry {
    /// Whether this group belongs to the given org.
    pub fn belongs_to(&self, org_name: &str) -> bool {
        match &self.qualifier {
            Some(qualifier) => qualifier.eq_ignore_ascii_case(org_name),
            None => org_name == PRIMARY_ORG,
        }
    }
}

#[derive(Debug, Default)]
struct Interner {
    keys: HashMap<(String, Option<String>), GroupKey>,
    entries: Vec<GroupEntry>,
}

/// Append-only name → key table, scoped to one run.
#[derive(Debug, Default)]
pub struct GroupKeyRegistry {
    inner: RwLock<Interner>,
}

/// Split `qualifier::Name` into its base name and normalized qualifier.
///
/// The qualifier `primary` is the same as no qualifier.
pub fn split_group_name(raw: &str) -> (&str, Option<String>) {
    match raw.split_once(QUALIFIER_SEPARATOR) {
        Some((qualifier, name)) => (name.trim(), normalize_qualifier(Some(qualifier))),
        None => (raw.trim(), None),
    }
}

fn normalize_qualifier(qualifier: Option<&str>) -> Option<String> {
    qualifier
        .map(|q| q.trim().to_lowercase())
        .filter(|q| !q.is_empty() && q != PRIMARY_ORG)
}

impl GroupKeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a raw group name, possibly of the form `qualifier::Name`.
    pub fn create(&self, raw: &str) -> GroupKey {
        let (name, qualifier) = split_group_name(raw);
        self.intern(name, qualifier)
    }

    /// Intern a base name for an explicit org qualifier.
    pub fn create_qualified(&self, name: &str, qualifier: Option<&str>) -> GroupKey {
        self.intern(name.trim(), normalize_qualifier(qualifier))
    }

    /// Key of the group named `name` in `org_name`.
    pub fn create_for_org(&self, name: &str, org_name: &str) -> GroupKey {
        self.create_qualified(name, Some(org_name))
    }

    fn intern(&self, name: &str, qualifier: Option<String>) -> GroupKey {
        let identity = (name.to_lowercase(), qualifier);
        if let Some(key) = self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys
            .get(&identity)
        {
            return *key;
        }

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(key) = inner.keys.get(&identity) {
            return *key;
        }
        let key = GroupKey(inner.entries.len() as u32);
        inner.entries.push(GroupEntry {
            name: name.to_string(),
            qualifier: identity.1.clone(),
        });
        inner.keys.insert(identity, key);
        key
    }

    pub fn entry(&self, key: GroupKey) -> Option<GroupEntry> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .get(key.0 as usize)
            .cloned()
    }

    /// Display name of a key, or its numeric form if it was never interned here.
    pub fn name(&self, key: GroupKey) -> String {
        self.entry(key)
            .map(|entry| entry.name)
            .unwrap_or_else(|| key.to_string())
    }

    pub fn belongs_to(&self, key: GroupKey, org_name: &str) -> bool {
        self.entry(key)
            .is_some_and(|entry| entry.belongs_to(org_name))
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every interned name.
    pub fn reset(&self) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.keys.clear();
        inner.entries.clear();
    }
}
