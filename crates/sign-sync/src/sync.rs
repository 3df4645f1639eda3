//! Directory → Sign synchronization engine.
//!
//! One pass reads the directory once, then for every configured Sign org:
//! creates missing mapped groups, reconciles each matched user's account
//! role and group memberships, creates directory users missing in Sign, and
//! applies the sign-only user policy to the rest.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt::Display;
use std::sync::Arc;

use signsync_core::config::{SignOnlyUserAction, SyncOptions};
use signsync_core::connectors::DirectoryConnector;
use signsync_core::error::{Result, SignSyncError};
use signsync_core::models::directory::DirectoryUser;
use tracing::{debug, error, info, warn};

use crate::batch::BatchReport;
use crate::connector::SignConnector;
use crate::groups::{GroupKey, GroupKeyRegistry};
use crate::mapping::{
    GroupResolution, MappingTable, PrimaryGroupResolver, PriorityPrimaryGroupResolver,
};
use crate::models::{
    account_roles_for, DetailedUserInfo, GroupInfo, SignUser, UserCreationInfo, UserGroupInfo,
    UserGroupsInfo,
};
use crate::policy::{find_default_group, plan_sign_only_user};

/// Summary of a completed sync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub users_created: i64,
    pub users_role_updated: i64,
    pub users_groups_updated: i64,
    pub users_deactivated: i64,
    pub sign_only_users: i64,
    pub groups_created: u32,
    pub errors: i64,
    pub error_details: Option<String>,
    pub dry_run: bool,
}

/// A directory user and what the mapping grants them.
#[derive(Debug, Clone)]
pub struct DesiredUser {
    pub user: DirectoryUser,
    pub resolution: GroupResolution,
}

/// Target state of one membership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMembershipState {
    /// Group id of an existing membership; `None` for a new one.
    pub id: Option<String>,
    pub is_group_admin: bool,
    /// `None` leaves the primary flag to Sign.
    pub is_primary_group: Option<bool>,
}

#[derive(Debug, Default)]
struct UserChanges {
    user_update: Option<DetailedUserInfo>,
    groups_update: Option<UserGroupsInfo>,
}

/// What the engine knows about one Sign org during a pass.
#[derive(Debug, Default)]
pub(crate) struct OrgState {
    groups: HashMap<GroupKey, GroupInfo>,
    keys_by_group_id: HashMap<String, GroupKey>,
    default_group: Option<GroupInfo>,
    /// Keyed by lower-cased email.
    sign_only_users: BTreeMap<String, DetailedUserInfo>,
    /// Current memberships, keyed by user id.
    user_groups: HashMap<String, Vec<UserGroupInfo>>,
}

impl OrgState {
    fn add_group(&mut self, key: GroupKey, group: GroupInfo) {
        self.keys_by_group_id.insert(group.group_id.clone(), key);
        self.groups.insert(key, group);
    }

    fn membership_list(
        &self,
        memberships: &BTreeMap<GroupKey, GroupMembershipState>,
    ) -> Vec<UserGroupInfo> {
        memberships
            .iter()
            .filter_map(|(key, state)| {
                let id = state
                    .id
                    .clone()
                    .or_else(|| self.groups.get(key).map(|g| g.group_id.clone()))?;
                Some(UserGroupInfo::new(
                    &id,
                    state.is_group_admin,
                    state.is_primary_group,
                ))
            })
            .collect()
    }
}

/// Synchronizes directory users into one or more Sign orgs.
pub struct SignSyncEngine {
    options: SyncOptions,
    registry: Arc<GroupKeyRegistry>,
    mapping: Arc<MappingTable>,
    resolver: Box<dyn PrimaryGroupResolver>,
    directory_user_by_user_key: HashMap<String, DesiredUser>,
    orgs: HashMap<String, OrgState>,
    users_created: BTreeSet<String>,
    summary: SyncSummary,
}

impl SignSyncEngine {
    pub fn new(
        options: SyncOptions,
        registry: Arc<GroupKeyRegistry>,
        mapping: Arc<MappingTable>,
    ) -> Self {
        let resolver = Box::new(PriorityPrimaryGroupResolver::new(mapping.clone()));
        Self {
            options,
            registry,
            mapping,
            resolver,
            directory_user_by_user_key: HashMap::new(),
            orgs: HashMap::new(),
            users_created: BTreeSet::new(),
            summary: SyncSummary::default(),
        }
    }

    /// Replace the primary group resolver used in user-management-groups mode.
    pub fn with_primary_group_resolver(mut self, resolver: Box<dyn PrimaryGroupResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Directory users indexed by lower-cased key.
    pub fn directory_users(&self) -> &HashMap<String, DesiredUser> {
        &self.directory_user_by_user_key
    }

    /// Emails of users created during the last pass.
    pub fn users_created(&self) -> &BTreeSet<String> {
        &self.users_created
    }

    /// Run one pass. A failing org is recorded and the next org still runs.
    pub async fn run(
        &mut self,
        directory: &dyn DirectoryConnector,
        connectors: &[(String, Box<dyn SignConnector>)],
        dry_run: bool,
    ) -> Result<SyncSummary> {
        self.summary = SyncSummary {
            dry_run,
            ..Default::default()
        };
        self.orgs.clear();
        self.users_created.clear();
        info!(dry_run, orgs = connectors.len(), "starting Sign sync");

        self.read_desired_user_groups(directory).await?;

        for (org_name, connector) in connectors {
            if let Err(e) = self.sync_org(org_name, connector.as_ref()).await {
                error!(org = %org_name, error = %e, "Sign org sync failed");
                record_error(&mut self.summary, org_name, &e);
            }
        }

        info!(
            users_created = self.summary.users_created,
            users_role_updated = self.summary.users_role_updated,
            users_groups_updated = self.summary.users_groups_updated,
            users_deactivated = self.summary.users_deactivated,
            sign_only_users = self.summary.sign_only_users,
            groups_created = self.summary.groups_created,
            errors = self.summary.errors,
            dry_run,
            "Sign sync complete"
        );
        Ok(self.summary.clone())
    }

    /// Key used to match a directory user against Sign, `None` if unusable.
    pub fn get_directory_user_key(user: &DirectoryUser) -> Option<String> {
        user.user_key().map(str::to_string)
    }

    /// Load directory users and resolve their mapped groups and roles.
    pub async fn read_desired_user_groups(
        &mut self,
        directory: &dyn DirectoryConnector,
    ) -> Result<()> {
        let users = directory.load_users().await?;
        self.directory_user_by_user_key.clear();

        for user in users {
            let Some(key) = Self::get_directory_user_key(&user) else {
                warn!(source = directory.source_name(), "directory user has no email, skipping");
                continue;
            };
            let resolution = self.mapping.resolve(&user.groups);
            self.directory_user_by_user_key
                .insert(key.to_lowercase(), DesiredUser { user, resolution });
        }

        info!(
            source = directory.source_name(),
            count = self.directory_user_by_user_key.len(),
            "read directory users"
        );
        Ok(())
    }

    /// Whether the user maps to at least one group of `org_name`.
    pub fn should_sync(&self, desired: &DesiredUser, org_name: &str) -> bool {
        desired
            .resolution
            .matched_groups
            .iter()
            .any(|key| self.registry.belongs_to(*key, org_name))
    }

    /// Every mapped target group of `org_name`, in rule precedence order.
    pub fn groups_for_org(&self, org_name: &str) -> Vec<GroupKey> {
        let mut seen = HashSet::new();
        self.mapping
            .sorted_rules()
            .into_iter()
            .flat_map(|rule| rule.groups.iter().copied())
            .filter(|key| self.registry.belongs_to(*key, org_name))
            .filter(|key| seen.insert(*key))
            .collect()
    }

    fn org_groups(&self, keys: &BTreeSet<GroupKey>, org_name: &str) -> BTreeSet<GroupKey> {
        keys.iter()
            .copied()
            .filter(|key| self.registry.belongs_to(*key, org_name))
            .collect()
    }

    async fn sync_org(&mut self, org_name: &str, connector: &dyn SignConnector) -> Result<()> {
        let dry_run = self.summary.dry_run;
        info!(org = org_name, label = connector.org_label(), "syncing Sign org");

        let mut state = OrgState::default();
        let remote_groups = connector.get_groups().await?;
        state.default_group = find_default_group(remote_groups.values()).cloned();
        for group in remote_groups.into_values() {
            let key = self.registry.create_for_org(&group.group_name, org_name);
            state.add_group(key, group);
        }

        for key in self.groups_for_org(org_name) {
            if state.groups.contains_key(&key) {
                continue;
            }
            let name = self.registry.name(key);
            if dry_run {
                info!(org = org_name, group = %name, "would create Sign group");
                self.summary.groups_created += 1;
                continue;
            }
            match connector.create_group(&name).await {
                Ok(group) => {
                    self.summary.groups_created += 1;
                    state.add_group(key, group);
                }
                Err(e) => record_error(&mut self.summary, &format!("group '{name}'"), &e),
            }
        }

        let fetched = connector.get_users().await?;
        for failure in &fetched.failures {
            let id = failure.email.as_deref().unwrap_or(&failure.user_id);
            record_error(&mut self.summary, id, &failure.error);
        }
        let unfetched = fetched.unfetched_emails();
        let create_users = self.options.create_users && !fetched.has_unidentified_failures();
        if self.options.create_users && !create_users {
            warn!(org = org_name, "Sign user listing is incomplete, not creating users");
        }
        let sign_users = fetched.users;
        let mut emails: Vec<&String> = sign_users.keys().collect();
        emails.sort();

        let mut user_updates = Vec::new();
        let mut group_updates = Vec::new();
        for email in emails {
            let sign_user = &sign_users[email];
            state
                .user_groups
                .insert(sign_user.info.id.clone(), sign_user.groups.clone());

            let desired = match self.directory_user_by_user_key.get(email) {
                Some(desired) if self.should_sync(desired, org_name) => desired,
                _ => {
                    state
                        .sign_only_users
                        .insert(email.clone(), sign_user.info.clone());
                    continue;
                }
            };

            match self.reconcile_user(org_name, &state, desired, sign_user) {
                Ok(changes) => {
                    if let Some(user) = changes.user_update {
                        user_updates.push(user);
                    }
                    if let Some(groups) = changes.groups_update {
                        group_updates.push((sign_user.info.id.clone(), groups));
                    }
                }
                Err(e) => {
                    error!(org = org_name, email = %email, error = %e, "cannot reconcile Sign user");
                    record_error(&mut self.summary, email, &e);
                }
            }
        }

        if create_users {
            let mut missing: Vec<&String> = self
                .directory_user_by_user_key
                .keys()
                .filter(|key| !sign_users.contains_key(*key) && !unfetched.contains(*key))
                .collect();
            missing.sort();

            for key in missing {
                let desired = &self.directory_user_by_user_key[key];
                if !self.should_sync(desired, org_name) {
                    continue;
                }
                match self
                    .insert_new_user(org_name, connector, &state, desired, dry_run)
                    .await
                {
                    Ok(created) => {
                        self.summary.users_created += 1;
                        self.users_created.insert(key.clone());
                        if let Some(update) = created {
                            group_updates.push(update);
                        }
                    }
                    Err(e) => {
                        error!(org = org_name, email = %key, error = %e, "cannot create Sign user");
                        record_error(&mut self.summary, key, &e);
                    }
                }
            }
        }

        if dry_run {
            for user in &user_updates {
                info!(org = org_name, email = %user.email, is_account_admin = user.is_account_admin, "would update Sign user role");
            }
            for (user_id, groups) in &group_updates {
                info!(org = org_name, user_id = %user_id, groups = groups.group_info_list.len(), "would update Sign user groups");
            }
            self.summary.users_role_updated += user_updates.len() as i64;
            self.summary.users_groups_updated += group_updates.len() as i64;
        } else {
            let report = connector.update_users(&user_updates).await?;
            let updated = fold_report(&mut self.summary, &report);
            self.summary.users_role_updated += updated;

            let report = connector.update_user_groups(&group_updates).await?;
            let updated = fold_report(&mut self.summary, &report);
            self.summary.users_groups_updated += updated;
        }

        self.orgs.insert(org_name.to_string(), state);
        self.handle_sign_only_users(connector, org_name).await
    }

    /// Work out the role and membership changes for a user present on both sides.
    fn reconcile_user(
        &self,
        org_name: &str,
        state: &OrgState,
        desired: &DesiredUser,
        sign_user: &SignUser,
    ) -> Result<UserChanges> {
        let user_key = desired.user.user_key().unwrap_or(&sign_user.info.email);
        let desired_groups = self.org_groups(&desired.resolution.matched_groups, org_name);
        let admin_groups: BTreeSet<GroupKey> = self
            .org_groups(&desired.resolution.admin_groups, org_name)
            .intersection(&desired_groups)
            .copied()
            .collect();

        let mut assigned_groups = HashMap::new();
        for membership in &sign_user.groups {
            match state.keys_by_group_id.get(&membership.id) {
                Some(key) => {
                    assigned_groups.insert(*key, membership.clone());
                }
                None => debug!(org = org_name, group_id = %membership.id, "membership in unknown group"),
            }
        }

        let memberships = self.resolve_primary_group_and_group_admin_state(
            self.options.umg,
            BTreeMap::new(),
            &assigned_groups,
            &desired_groups,
            &admin_groups,
            &desired.user,
            user_key,
        )?;
        let group_info_list = state.membership_list(&memberships);
        self.check_primary_group(&group_info_list, user_key)?;

        let mut changes = UserChanges::default();
        if !memberships_match(&sign_user.groups, &group_info_list) {
            changes.groups_update = Some(UserGroupsInfo { group_info_list });
        }

        let is_account_admin = desired.resolution.is_account_admin;
        let resolved_roles = account_roles_for(is_account_admin);
        if !roles_match(&resolved_roles, &sign_user.info.account_roles()) {
            let mut user = sign_user.info.clone();
            user.set_account_admin(is_account_admin);
            changes.user_update = Some(user);
        }
        Ok(changes)
    }

    /// Decide the membership state for each desired group.
    ///
    /// In user-management-groups mode exactly one desired group is marked
    /// primary, chosen by the primary group resolver; failing to find one is
    /// a resolution error naming `user_key`. Otherwise existing memberships
    /// keep their primary flag and new ones leave it unset. Assigned groups
    /// that are not desired are left out of the result.
    #[allow(clippy::too_many_arguments)]
    pub fn resolve_primary_group_and_group_admin_state(
        &self,
        is_umg: bool,
        mut groups_to_update: BTreeMap<GroupKey, GroupMembershipState>,
        assigned_groups: &HashMap<GroupKey, UserGroupInfo>,
        desired_groups: &BTreeSet<GroupKey>,
        admin_groups: &BTreeSet<GroupKey>,
        directory_user: &DirectoryUser,
        user_key: &str,
    ) -> Result<BTreeMap<GroupKey, GroupMembershipState>> {
        let primary_group = if is_umg {
            let primary = self
                .resolver
                .resolve_primary_group(desired_groups, directory_user)
                .filter(|key| desired_groups.contains(key))
                .ok_or_else(|| {
                    SignSyncError::Resolution(format!(
                        "Can't identify a primary group for user '{user_key}'"
                    ))
                })?;
            Some(primary)
        } else {
            None
        };

        for key in desired_groups {
            let is_group_admin = admin_groups.contains(key);
            let state = match assigned_groups.get(key) {
                Some(current) => GroupMembershipState {
                    id: Some(current.id.clone()),
                    is_group_admin,
                    is_primary_group: match primary_group {
                        Some(primary) => Some(primary == *key),
                        None => current.is_primary_group,
                    },
                },
                None => GroupMembershipState {
                    id: None,
                    is_group_admin,
                    is_primary_group: primary_group.map(|primary| primary == *key),
                },
            };
            groups_to_update.insert(*key, state);
        }
        Ok(groups_to_update)
    }

    /// In user-management-groups mode the submitted list must carry exactly
    /// one primary membership. A resolved primary group that has no Sign id
    /// (its creation failed) leaves none.
    fn check_primary_group(&self, group_info_list: &[UserGroupInfo], user_key: &str) -> Result<()> {
        if !self.options.umg || self.summary.dry_run {
            return Ok(());
        }
        let primaries = group_info_list
            .iter()
            .filter(|membership| membership.is_primary_group == Some(true))
            .count();
        if primaries == 1 {
            Ok(())
        } else {
            Err(SignSyncError::Resolution(format!(
                "Can't identify a primary group for user '{user_key}'"
            )))
        }
    }

    /// Create a directory user missing in Sign.
    ///
    /// Returns the membership update for the new user, or `None` in dry-run.
    async fn insert_new_user(
        &self,
        org_name: &str,
        connector: &dyn SignConnector,
        state: &OrgState,
        desired: &DesiredUser,
        dry_run: bool,
    ) -> Result<Option<(String, UserGroupsInfo)>> {
        let email = desired.user.user_key().unwrap_or_default().to_string();
        let desired_groups = self.org_groups(&desired.resolution.matched_groups, org_name);
        let admin_groups = self.org_groups(&desired.resolution.admin_groups, org_name);

        let memberships = self.resolve_primary_group_and_group_admin_state(
            self.options.umg,
            BTreeMap::new(),
            &HashMap::new(),
            &desired_groups,
            &admin_groups,
            &desired.user,
            &email,
        )?;
        let groups = UserGroupsInfo {
            group_info_list: state.membership_list(&memberships),
        };
        self.check_primary_group(&groups.group_info_list, &email)?;

        if dry_run {
            info!(org = org_name, email = %email, groups = groups.group_info_list.len(), "would create Sign user");
            return Ok(None);
        }

        let user_id = connector
            .insert_user(&UserCreationInfo {
                email: email.clone(),
                first_name: desired.user.first_name.clone(),
                last_name: desired.user.last_name.clone(),
                is_account_admin: desired.resolution.is_account_admin,
            })
            .await?;
        Ok(Some((user_id, groups)))
    }

    /// Apply the sign-only user policy to the users collected for `org_name`.
    ///
    /// The user and group update calls are always issued, with empty lists
    /// when nothing qualifies. Deactivation is only called for the
    /// `deactivate` policy. Nothing is applied when the number of sign-only
    /// users exceeds the configured limit.
    pub async fn handle_sign_only_users(
        &mut self,
        connector: &dyn SignConnector,
        org_name: &str,
    ) -> Result<()> {
        let action = self.options.sign_only_user_action;
        let dry_run = self.summary.dry_run;
        let state = self.orgs.entry(org_name.to_string()).or_default();
        let count = state.sign_only_users.len();
        self.summary.sign_only_users += count as i64;

        let mut user_updates = Vec::new();
        let mut group_updates = Vec::new();
        let mut deactivations = Vec::new();

        if count > self.options.sign_only_limit {
            error!(
                org = org_name,
                count,
                limit = self.options.sign_only_limit,
                action = ?action,
                "too many sign-only users, policy not applied"
            );
        } else {
            info!(org = org_name, count, action = ?action, "handling sign-only users");
            for (email, user) in &state.sign_only_users {
                let memberships = state
                    .user_groups
                    .get(&user.id)
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                match plan_sign_only_user(action, user, memberships, state.default_group.as_ref()) {
                    Ok(plan) => {
                        if let Some(update) = plan.user_update {
                            user_updates.push(update);
                        }
                        if let Some(groups) = plan.groups_update {
                            group_updates.push((user.id.clone(), groups));
                        }
                        if plan.deactivate {
                            deactivations.push(user.id.clone());
                        }
                    }
                    Err(e) => record_error(&mut self.summary, email, &e),
                }
            }
        }

        if dry_run {
            self.summary.users_role_updated += user_updates.len() as i64;
            self.summary.users_groups_updated += group_updates.len() as i64;
            self.summary.users_deactivated += deactivations.len() as i64;
            return Ok(());
        }

        let report = connector.update_users(&user_updates).await?;
        let updated = fold_report(&mut self.summary, &report);
        self.summary.users_role_updated += updated;

        let report = connector.update_user_groups(&group_updates).await?;
        let updated = fold_report(&mut self.summary, &report);
        self.summary.users_groups_updated += updated;

        if action == SignOnlyUserAction::Deactivate {
            let report = connector.deactivate_users(&deactivations).await?;
            let deactivated = fold_report(&mut self.summary, &report);
            self.summary.users_deactivated += deactivated;
        }
        Ok(())
    }
}

/// Compare role tags as sets. Case matters.
pub fn roles_match<A: AsRef<str>, B: AsRef<str>>(resolved_roles: &[A], sign_roles: &[B]) -> bool {
    let resolved: HashSet<&str> = resolved_roles.iter().map(|role| role.as_ref()).collect();
    let sign: HashSet<&str> = sign_roles.iter().map(|role| role.as_ref()).collect();
    resolved == sign
}

/// Whether applying `desired` would leave `current` unchanged.
///
/// An unset primary flag in `desired` matches any current value.
fn memberships_match(current: &[UserGroupInfo], desired: &[UserGroupInfo]) -> bool {
    if current.len() != desired.len() {
        return false;
    }
    let current: HashMap<&str, &UserGroupInfo> =
        current.iter().map(|m| (m.id.as_str(), m)).collect();
    desired.iter().all(|want| match current.get(want.id.as_str()) {
        Some(have) => {
            have.is_group_admin == want.is_group_admin
                && want
                    .is_primary_group
                    .map_or(true, |primary| have.is_primary_group.unwrap_or(false) == primary)
        }
        None => false,
    })
}

fn record_error(summary: &mut SyncSummary, id: &str, error: &dyn Display) {
    summary.errors += 1;
    if summary.error_details.is_none() {
        summary.error_details = Some(String::new());
    }
    if let Some(ref mut details) = summary.error_details {
        details.push_str(&format!("{id}: {error}\n"));
    }
}

/// Record a bulk call's failures and return how many records succeeded.
fn fold_report(summary: &mut SyncSummary, report: &BatchReport) -> i64 {
    for failure in &report.failures {
        record_error(summary, &failure.id, &failure.error);
    }
    report.succeeded as i64
}
