//! Directory group → Sign group mapping.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use signsync_core::config::UserManagementRule;
use signsync_core::models::directory::DirectoryUser;

use crate::groups::{GroupKey, GroupKeyRegistry};

pub const ACCOUNT_ADMIN_ROLE: &str = "ACCOUNT_ADMIN";
pub const GROUP_ADMIN_ROLE: &str = "GROUP_ADMIN";
pub const NORMAL_USER_ROLE: &str = "NORMAL_USER";

/// Everything one directory group grants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMappingRule {
    pub directory_group: String,
    /// Lower wins.
    pub priority: i64,
    /// Position of the first config entry for this directory group.
    pub order: usize,
    pub roles: BTreeSet<String>,
    /// Target groups in configured order.
    pub groups: Vec<GroupKey>,
}

/// The resolved mapping for one directory user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupResolution {
    pub matched_groups: BTreeSet<GroupKey>,
    pub is_account_admin: bool,
    pub is_group_admin: bool,
    /// Subset of target groups the user administers.
    pub admin_groups: BTreeSet<GroupKey>,
}

/// Compute a user's target groups and admin flags from their directory groups.
///
/// Directory group names are matched exactly. A user matching no rule
/// resolves to an empty group set.
pub fn resolve_group_mappings(
    directory_groups: &[String],
    group_mapping: &HashMap<String, GroupMappingRule>,
    account_admin_groups: &[String],
    group_admin_mapping: &HashMap<String, BTreeSet<GroupKey>>,
) -> GroupResolution {
    let mut resolution = GroupResolution::default();

    for group in directory_groups {
        if let Some(rule) = group_mapping.get(group) {
            resolution.matched_groups.extend(rule.groups.iter().copied());
        }
        if let Some(admin) = group_admin_mapping.get(group) {
            resolution.admin_groups.extend(admin.iter().copied());
        }
    }

    resolution.is_account_admin = directory_groups
        .iter()
        .any(|group| account_admin_groups.contains(group));
    resolution.is_group_admin = !resolution.admin_groups.is_empty();
    resolution
}

/// All configured mapping rules, indexed for resolution.
#[derive(Debug, Clone, Default)]
pub struct MappingTable {
    pub group_mapping: HashMap<String, GroupMappingRule>,
    pub account_admin_groups: Vec<String>,
    pub group_admin_mapping: HashMap<String, BTreeSet<GroupKey>>,
}

impl MappingTable {
    /// Build the table from `[[user_management]]` entries.
    ///
    /// Entries for the same directory group are merged: target groups and
    /// roles are unioned and the lowest priority is kept.
    pub fn from_config(rules: &[UserManagementRule], registry: &GroupKeyRegistry) -> Self {
        let mut table = Self::default();

        for (order, rule) in rules.iter().enumerate() {
            let keys: Vec<GroupKey> = rule
                .sign_groups
                .iter()
                .map(|name| registry.create(name))
                .collect();
            let priority = rule.priority.unwrap_or(order as i64);

            let entry = table
                .group_mapping
                .entry(rule.directory_group.clone())
                .or_insert_with(|| GroupMappingRule {
                    directory_group: rule.directory_group.clone(),
                    priority,
                    order,
                    roles: BTreeSet::new(),
                    groups: Vec::new(),
                });
            entry.priority = entry.priority.min(priority);
            for key in &keys {
                if !entry.groups.contains(key) {
                    entry.groups.push(*key);
                }
            }

            if rule.account_admin {
                entry.roles.insert(ACCOUNT_ADMIN_ROLE.to_string());
            }
            if rule.group_admin {
                entry.roles.insert(GROUP_ADMIN_ROLE.to_string());
                table
                    .group_admin_mapping
                    .entry(rule.directory_group.clone())
                    .or_default()
                    .extend(keys.iter().copied());
            }
        }

        let account_admin_groups: Vec<String> = table
            .sorted_rules()
            .into_iter()
            .filter(|rule| rule.roles.contains(ACCOUNT_ADMIN_ROLE))
            .map(|rule| rule.directory_group.clone())
            .collect();
        table.account_admin_groups = account_admin_groups;
        table
    }

    pub fn resolve(&self, directory_groups: &[String]) -> GroupResolution {
        resolve_group_mappings(
            directory_groups,
            &self.group_mapping,
            &self.account_admin_groups,
            &self.group_admin_mapping,
        )
    }

    /// All rules, highest precedence first.
    pub fn sorted_rules(&self) -> Vec<&GroupMappingRule> {
        let mut rules: Vec<&GroupMappingRule> = self.group_mapping.values().collect();
        rules.sort_by_key(|rule| (rule.priority, rule.order));
        rules
    }

    /// Rules matched by the given directory groups, highest precedence first.
    pub fn matching_rules(&self, directory_groups: &[String]) -> Vec<&GroupMappingRule> {
        self.sorted_rules()
            .into_iter()
            .filter(|rule| directory_groups.contains(&rule.directory_group))
            .collect()
    }
}

/// Picks the primary group for a user in user-management-groups mode.
pub trait PrimaryGroupResolver: Send + Sync {
    fn resolve_primary_group(
        &self,
        desired_groups: &BTreeSet<GroupKey>,
        directory_user: &DirectoryUser,
    ) -> Option<GroupKey>;
}

/// Chooses the first desired group of the highest-precedence matching rule.
pub struct PriorityPrimaryGroupResolver {
    table: Arc<MappingTable>,
}

impl PriorityPrimaryGroupResolver {
    pub fn new(table: Arc<MappingTable>) -> Self {
        Self { table }
    }
}

impl PrimaryGroupResolver for PriorityPrimaryGroupResolver {
    fn resolve_primary_group(
        &self,
        desired_groups: &BTreeSet<GroupKey>,
        directory_user: &DirectoryUser,
    ) -> Option<GroupKey> {
        self.table
            .matching_rules(&directory_user.groups)
            .into_iter()
            .flat_map(|rule| rule.groups.iter())
            .find(|key| desired_groups.contains(key))
            .copied()
    }
}
