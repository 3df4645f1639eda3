use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use signsync_core::error::{Result, SignSyncError};

use crate::batch::BatchReport;
use crate::models::{DetailedUserInfo, GroupInfo, SignUser, UserCreationInfo, UserGroupsInfo};

/// A user whose details could not be retrieved.
#[derive(Debug)]
pub struct FetchFailure {
    pub user_id: String,
    /// Email from the user listing, when Sign returned one.
    pub email: Option<String>,
    pub error: SignSyncError,
}

/// Outcome of a bulk user fetch.
#[derive(Debug, Default)]
pub struct FetchedUsers {
    /// Active users other than the admin account, keyed by lower-cased email.
    pub users: HashMap<String, SignUser>,
    pub failures: Vec<FetchFailure>,
}

impl FetchedUsers {
    pub fn new(users: HashMap<String, SignUser>) -> Self {
        Self {
            users,
            failures: Vec::new(),
        }
    }

    /// Lower-cased emails of users that exist in Sign but could not be fetched.
    pub fn unfetched_emails(&self) -> BTreeSet<String> {
        self.failures
            .iter()
            .filter_map(|failure| failure.email.as_deref())
            .map(str::to_lowercase)
            .collect()
    }

    /// Whether some failed user has no known email.
    pub fn has_unidentified_failures(&self) -> bool {
        self.failures.iter().any(|failure| failure.email.is_none())
    }
}

/// Operations the sync engine needs from one Sign organization.
///
/// Bulk calls return once every record has been processed; a failed record
/// is reported in the [`BatchReport`] rather than aborting the call.
#[async_trait]
pub trait SignConnector: Send + Sync {
    /// Label used to scope log output.
    fn org_label(&self) -> &str;

    /// All groups, keyed by lower-cased group name.
    async fn get_groups(&self) -> Result<HashMap<String, GroupInfo>>;

    async fn create_group(&self, name: &str) -> Result<GroupInfo>;

    /// Every listed user; per-user fetch failures are returned, not raised.
    async fn get_users(&self) -> Result<FetchedUsers>;

    /// Create a user and return its id.
    async fn insert_user(&self, user: &UserCreationInfo) -> Result<String>;

    async fn update_users(&self, users: &[DetailedUserInfo]) -> Result<BatchReport>;

    /// Replace group memberships, per user id.
    async fn update_user_groups(&self, updates: &[(String, UserGroupsInfo)]) -> Result<BatchReport>;

    async fn deactivate_users(&self, user_ids: &[String]) -> Result<BatchReport>;
}
