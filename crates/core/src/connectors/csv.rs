//! CSV directory source.
//!
//! Expected header: `email,firstname,lastname,groups`. The `groups` column
//! holds the user's directory groups joined by the configured delimiter.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, warn};

use crate::config::DirectoryConfig;
use crate::error::{Result, SignSyncError};
use crate::models::directory::DirectoryUser;

use super::DirectoryConnector;

#[derive(Debug, Deserialize)]
struct UserCsvRow {
    #[serde(default)]
    email: String,
    #[serde(default)]
    firstname: String,
    #[serde(default)]
    lastname: String,
    #[serde(default)]
    groups: String,
}

impl UserCsvRow {
    fn to_model(&self, delimiter: char) -> DirectoryUser {
        DirectoryUser {
            email: non_empty(&self.email),
            first_name: non_empty(&self.firstname),
            last_name: non_empty(&self.lastname),
            groups: self
                .groups
                .split(delimiter)
                .map(str::trim)
                .filter(|g| !g.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// Reads directory users from a single CSV file.
pub struct CsvDirectoryConnector {
    path: PathBuf,
    group_delimiter: char,
}

impl CsvDirectoryConnector {
    pub fn new(path: &Path, group_delimiter: char) -> Self {
        Self {
            path: path.to_path_buf(),
            group_delimiter,
        }
    }

    pub fn from_config(config: &DirectoryConfig) -> Self {
        Self::new(Path::new(&config.path), config.group_delimiter)
    }

    fn read_users(&self) -> Result<Vec<DirectoryUser>> {
        if !self.path.is_file() {
            return Err(SignSyncError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("directory file not found: {}", self.path.display()),
            )));
        }

        let mut rdr = csv::Reader::from_path(&self.path)
            .map_err(|e| SignSyncError::Directory(format!("cannot open CSV: {e}")))?;

        let mut users = Vec::new();
        for (line, result) in rdr.deserialize::<UserCsvRow>().enumerate() {
            let row = result.map_err(|e| {
                SignSyncError::Serialization(format!(
                    "CSV parse error in {}: {e}",
                    self.path.display()
                ))
            })?;
            let user = row.to_model(self.group_delimiter);
            if user.user_key().is_none() {
                warn!(row = line + 2, "directory row has no email, skipping");
                continue;
            }
            users.push(user);
        }

        info!(count = users.len(), path = %self.path.display(), "loaded directory users");
        Ok(users)
    }
}

#[async_trait]
impl DirectoryConnector for CsvDirectoryConnector {
    async fn load_users(&self) -> Result<Vec<DirectoryUser>> {
        self.read_users()
    }

    fn source_name(&self) -> &str {
        "csv"
    }
}
