//! Sign REST API request/response structs.
//!
//! Field names follow the v6 API; v5 spellings are accepted as aliases.

use serde::{Deserialize, Serialize};

use crate::mapping::{ACCOUNT_ADMIN_ROLE, GROUP_ADMIN_ROLE, NORMAL_USER_ROLE};

pub const ACTIVE_STATUS: &str = "ACTIVE";
pub const INACTIVE_STATUS: &str = "INACTIVE";

/// Cursor block returned by paginated list endpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// Response of the base URI discovery endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct BaseUris {
    #[serde(alias = "apiAccessPoint")]
    pub api_access_point: String,
}

/// Reference to a user in `GET users`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRef {
    #[serde(alias = "userId")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsersInfo {
    #[serde(default)]
    pub user_info_list: Vec<UserRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<PageInfo>,
}

/// Full user record from `GET users/<id>`; also the `PUT users/<id>` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailedUserInfo {
    #[serde(default, alias = "userId")]
    pub id: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default)]
    pub is_account_admin: bool,
    #[serde(default, alias = "userStatus", skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<String>>,
}

impl DetailedUserInfo {
    pub fn is_active(&self) -> bool {
        self.status.as_deref() == Some(ACTIVE_STATUS)
    }

    /// Account-level role tags. Group-admin is tracked per membership and
    /// left out; with no account tag left the admin flag decides.
    pub fn account_roles(&self) -> Vec<String> {
        let roles: Vec<String> = self
            .roles
            .iter()
            .flatten()
            .filter(|role| role.as_str() != GROUP_ADMIN_ROLE)
            .cloned()
            .collect();
        if roles.is_empty() {
            account_roles_for(self.is_account_admin)
        } else {
            roles
        }
    }

    /// Set the account-admin flag. Only the account tag in `roles` is
    /// swapped; other tags such as `GROUP_ADMIN` stay.
    pub fn set_account_admin(&mut self, is_account_admin: bool) {
        self.is_account_admin = is_account_admin;
        if let Some(roles) = self.roles.as_mut() {
            roles.retain(|role| role != ACCOUNT_ADMIN_ROLE && role != NORMAL_USER_ROLE);
            let mut updated = account_roles_for(is_account_admin);
            updated.append(roles);
            *roles = updated;
        }
    }
}

/// Role tags for the account-admin flag.
pub fn account_roles_for(is_account_admin: bool) -> Vec<String> {
    if is_account_admin {
        vec![ACCOUNT_ADMIN_ROLE.to_string()]
    } else {
        vec![NORMAL_USER_ROLE.to_string()]
    }
}

/// Body of `POST users`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserCreationInfo {
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default)]
    pub is_account_admin: bool,
}

/// Response of `POST users` and `POST groups`.
#[derive(Debug, Clone, Deserialize)]
pub struct CreatedId {
    #[serde(alias = "userId", alias = "groupId")]
    pub id: String,
}

/// A group as listed by `GET groups`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupInfo {
    #[serde(alias = "id")]
    pub group_id: String,
    pub group_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_date: Option<String>,
    #[serde(default)]
    pub is_default_group: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupsInfo {
    #[serde(default)]
    pub group_info_list: Vec<GroupInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<PageInfo>,
}

/// Body of `POST groups`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupCreationInfo {
    pub group_name: String,
}

/// One of a user's group memberships.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserGroupInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub is_group_admin: bool,
    /// Left unset when the primary group is not managed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_primary_group: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl UserGroupInfo {
    pub fn new(id: &str, is_group_admin: bool, is_primary_group: Option<bool>) -> Self {
        Self {
            id: id.to_string(),
            name: None,
            is_group_admin,
            is_primary_group,
            status: None,
        }
    }
}

/// Body and response of `users/<id>/groups`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserGroupsInfo {
    #[serde(default)]
    pub group_info_list: Vec<UserGroupInfo>,
}

/// Body of `PUT users/<id>/state`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserStateInfo {
    pub state: String,
}

/// A Sign user together with its group memberships.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignUser {
    pub info: DetailedUserInfo,
    pub groups: Vec<UserGroupInfo>,
}
