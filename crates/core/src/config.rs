//! TOML-based configuration system for signsync.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SignSyncError};

/// Name of the organization that owns unqualified Sign groups.
pub const PRIMARY_ORG: &str = "primary";

/// Separator between a group qualifier and the group name (`sec::Group`).
pub const QUALIFIER_SEPARATOR: &str = "::";

/// Top-level configuration, deserialized from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SignSyncConfig {
    #[serde(default)]
    pub sync: SyncOptions,
    #[serde(default)]
    pub user_management: Vec<UserManagementRule>,
    pub orgs: BTreeMap<String, SignOrgConfig>,
    pub directory: DirectoryConfig,
}

/// Options that control a synchronization pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncOptions {
    /// Sign account uses user-management groups (one primary group per user).
    #[serde(default)]
    pub umg: bool,
    #[serde(default = "default_true")]
    pub create_users: bool,
    #[serde(default)]
    pub sign_only_user_action: SignOnlyUserAction,
    #[serde(default = "default_sign_only_limit")]
    pub sign_only_limit: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            umg: false,
            create_users: true,
            sign_only_user_action: SignOnlyUserAction::default(),
            sign_only_limit: default_sign_only_limit(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_sign_only_limit() -> usize {
    200
}

/// What to do with Sign users that are not present in the directory.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SignOnlyUserAction {
    #[default]
    Exclude,
    Deactivate,
    Reset,
    RemoveRoles,
    RemoveGroups,
}

/// One directory group → Sign group mapping entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserManagementRule {
    pub directory_group: String,
    /// Target Sign groups. `qualifier::Name` targets the org named `qualifier`.
    #[serde(default)]
    pub sign_groups: Vec<String>,
    #[serde(default)]
    pub account_admin: bool,
    #[serde(default)]
    pub group_admin: bool,
    /// Lower wins. Defaults to the entry's position in the file.
    #[serde(default)]
    pub priority: Option<i64>,
}

/// Sign REST API version.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ApiVersion {
    V5,
    #[default]
    V6,
}

impl ApiVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::V5 => "v5",
            Self::V6 => "v6",
        }
    }
}

/// Connection settings for one Sign organization.
///
/// `host`, `key` and `admin_email` are optional here so that a missing value
/// is reported as a configuration error naming the key rather than a TOML
/// parse error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SignOrgConfig {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub admin_email: Option<String>,
    /// Only used to scope log output.
    #[serde(default)]
    pub console_org: Option<String>,
    #[serde(default)]
    pub api_version: ApiVersion,
    #[serde(default = "default_request_concurrency")]
    pub request_concurrency: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for SignOrgConfig {
    fn default() -> Self {
        Self {
            host: None,
            key: None,
            admin_email: None,
            console_org: None,
            api_version: ApiVersion::default(),
            request_concurrency: default_request_concurrency(),
            batch_size: default_batch_size(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_request_concurrency() -> usize {
    1
}

fn default_batch_size() -> usize {
    10_000
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_max_retries() -> u32 {
    3
}

impl SignOrgConfig {
    /// Return the first required key that is missing or empty.
    pub fn missing_required_key(&self) -> Option<&'static str> {
        [
            ("host", &self.host),
            ("key", &self.key),
            ("admin_email", &self.admin_email),
        ]
        .into_iter()
        .find(|(_, value)| value.as_deref().map_or(true, str::is_empty))
        .map(|(name, _)| name)
    }

    /// Fail with a configuration error if a required key is missing.
    pub fn require_keys(&self) -> Result<()> {
        match self.missing_required_key() {
            Some(key) => Err(SignSyncError::Config(format!(
                "Key '{key}' must be specified for all Sign orgs"
            ))),
            None => Ok(()),
        }
    }
}

/// CSV directory source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DirectoryConfig {
    pub path: String,
    #[serde(default = "default_group_delimiter")]
    pub group_delimiter: char,
}

fn default_group_delimiter() -> char {
    ','
}

impl SignSyncConfig {
    /// Load configuration from a TOML file at the given path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| SignSyncError::Config(format!("failed to parse config: {e}")))
    }

    /// Validate the configuration, returning an error for invalid combinations.
    pub fn validate(&self) -> Result<()> {
        if !self.orgs.contains_key(PRIMARY_ORG) {
            return Err(SignSyncError::Config(format!(
                "orgs.{PRIMARY_ORG} must be configured"
            )));
        }

        for (name, org) in &self.orgs {
            if let Some(key) = org.missing_required_key() {
                return Err(SignSyncError::Config(format!(
                    "orgs.{name}: Key '{key}' must be specified for all Sign orgs"
                )));
            }
            if org.request_concurrency == 0 {
                return Err(SignSyncError::Config(format!(
                    "orgs.{name}.request_concurrency must be at least 1"
                )));
            }
            if org.batch_size == 0 {
                return Err(SignSyncError::Config(format!(
                    "orgs.{name}.batch_size must be at least 1"
                )));
            }
        }

        for (index, rule) in self.user_management.iter().enumerate() {
            if rule.directory_group.trim().is_empty() {
                return Err(SignSyncError::Config(format!(
                    "user_management[{index}].directory_group must not be empty"
                )));
            }
            for group in &rule.sign_groups {
                if let Some((qualifier, _)) = group.split_once(QUALIFIER_SEPARATOR) {
                    let qualifier = qualifier.trim();
                    if !qualifier.is_empty()
                        && !self.orgs.keys().any(|org| org.eq_ignore_ascii_case(qualifier))
                    {
                        return Err(SignSyncError::Config(format!(
                            "user_management[{index}]: sign group '{group}' refers to unknown org '{qualifier}'"
                        )));
                    }
                }
            }
        }

        if self.directory.path.is_empty() {
            return Err(SignSyncError::Config(
                "directory.path must not be empty".into(),
            ));
        }

        Ok(())
    }
}
