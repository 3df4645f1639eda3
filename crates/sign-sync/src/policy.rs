//! Handling of Sign users that are absent from the directory.

use signsync_core::config::SignOnlyUserAction;
use signsync_core::error::{Result, SignSyncError};

use crate::models::{DetailedUserInfo, GroupInfo, UserGroupInfo, UserGroupsInfo};

/// Group name Sign gives the default group when none is flagged.
pub const DEFAULT_GROUP_NAME: &str = "default group";

/// Remote changes for one sign-only user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignOnlyPlan {
    pub user_update: Option<DetailedUserInfo>,
    pub groups_update: Option<UserGroupsInfo>,
    pub deactivate: bool,
}

/// The org's default group: the one flagged as default, else the one named
/// "Default Group".
pub fn find_default_group<'a, I>(groups: I) -> Option<&'a GroupInfo>
where
    I: IntoIterator<Item = &'a GroupInfo>,
{
    let mut by_name = None;
    for group in groups {
        if group.is_default_group {
            return Some(group);
        }
        if by_name.is_none() && group.group_name.eq_ignore_ascii_case(DEFAULT_GROUP_NAME) {
            by_name = Some(group);
        }
    }
    by_name
}

/// Decide what `action` does to `user`.
///
/// `memberships` are the user's current groups. Actions that move the user
/// into the default group fail when the org has none.
pub fn plan_sign_only_user(
    action: SignOnlyUserAction,
    user: &DetailedUserInfo,
    memberships: &[UserGroupInfo],
    default_group: Option<&GroupInfo>,
) -> Result<SignOnlyPlan> {
    let mut plan = SignOnlyPlan::default();
    match action {
        SignOnlyUserAction::Exclude => {}
        SignOnlyUserAction::Deactivate => plan.deactivate = true,
        SignOnlyUserAction::Reset => {
            plan.user_update = Some(without_account_admin(user));
            plan.groups_update = Some(default_membership(user, default_group)?);
        }
        SignOnlyUserAction::RemoveRoles => {
            plan.user_update = Some(without_account_admin(user));
            plan.groups_update = Some(UserGroupsInfo {
                group_info_list: memberships
                    .iter()
                    .map(|membership| UserGroupInfo {
                        is_group_admin: false,
                        ..membership.clone()
                    })
                    .collect(),
            });
        }
        SignOnlyUserAction::RemoveGroups => {
            plan.groups_update = Some(default_membership(user, default_group)?);
        }
    }
    Ok(plan)
}

fn without_account_admin(user: &DetailedUserInfo) -> DetailedUserInfo {
    let mut updated = user.clone();
    updated.set_account_admin(false);
    updated
}

fn default_membership(
    user: &DetailedUserInfo,
    default_group: Option<&GroupInfo>,
) -> Result<UserGroupsInfo> {
    let group = default_group.ok_or_else(|| {
        SignSyncError::Sync(format!(
            "no default group to move sign-only user '{}' into",
            user.email
        ))
    })?;
    Ok(UserGroupsInfo {
        group_info_list: vec![UserGroupInfo::new(&group.group_id, false, Some(true))],
    })
}
