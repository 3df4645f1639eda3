pub mod csv;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::directory::DirectoryUser;

/// Trait for directory source implementations.
#[async_trait]
pub trait DirectoryConnector: Send + Sync {
    /// Load every user together with their directory group names.
    async fn load_users(&self) -> Result<Vec<DirectoryUser>>;
    fn source_name(&self) -> &str;
}
