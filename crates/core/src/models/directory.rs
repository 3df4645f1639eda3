use serde::{Deserialize, Serialize};

/// A user read from the source directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DirectoryUser {
    /// Users without an email cannot be matched against Sign and are skipped.
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    /// Directory group names, case preserved.
    #[serde(default)]
    pub groups: Vec<String>,
}

impl DirectoryUser {
    pub fn new(email: &str, groups: &[&str]) -> Self {
        Self {
            email: Some(email.to_string()),
            first_name: None,
            last_name: None,
            groups: groups.iter().map(|g| g.to_string()).collect(),
        }
    }

    /// The key used to match this user against Sign, if any.
    pub fn user_key(&self) -> Option<&str> {
        self.email
            .as_deref()
            .map(str::trim)
            .filter(|email| !email.is_empty())
    }
}
