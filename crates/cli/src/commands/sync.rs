use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use signsync_core::config::{SignSyncConfig, PRIMARY_ORG};
use signsync_core::connectors::csv::CsvDirectoryConnector;
use signsync_core::connectors::DirectoryConnector;
use signsync_sign::client::SignClient;
use signsync_sign::connector::SignConnector;
use signsync_sign::groups::GroupKeyRegistry;
use signsync_sign::mapping::MappingTable;
use signsync_sign::sync::SignSyncEngine;
use tracing::{error, info};

/// Run the `sync` command: read the directory and sync every configured Sign org.
pub async fn run(config_path: &str, dry_run: bool) -> anyhow::Result<()> {
    let config = SignSyncConfig::load(Path::new(config_path))?;
    config.validate()?;

    info!("Loaded configuration from {}", config_path);

    let registry = Arc::new(GroupKeyRegistry::new());
    let mapping = Arc::new(MappingTable::from_config(&config.user_management, &registry));
    let directory = CsvDirectoryConnector::from_config(&config.directory);
    let connectors = build_connectors(&config)?;

    if dry_run {
        println!("Dry run mode - no changes will be applied");
    }
    println!(
        "Starting sync from {} into {} Sign org(s)...",
        directory.source_name(),
        connectors.len()
    );
    let start = Instant::now();

    let mut engine = SignSyncEngine::new(config.sync.clone(), registry, mapping);
    match engine.run(&directory, &connectors, dry_run).await {
        Ok(summary) => {
            let duration = start.elapsed();
            println!("Sync completed in {:.1}s", duration.as_secs_f64());
            println!("  Users created:        {}", summary.users_created);
            println!("  Roles updated:        {}", summary.users_role_updated);
            println!("  Groups updated:       {}", summary.users_groups_updated);
            println!("  Users deactivated:    {}", summary.users_deactivated);
            println!("  Sign-only users:      {}", summary.sign_only_users);
            println!("  Groups created:       {}", summary.groups_created);
            if summary.errors > 0 {
                println!("  Errors:               {}", summary.errors);
                if let Some(details) = &summary.error_details {
                    for line in details.lines() {
                        println!("    {line}");
                    }
                }
            }
        }
        Err(e) => {
            error!("Sync failed: {e}");
            println!("Sync failed: {e}");
            return Err(e.into());
        }
    }

    Ok(())
}

/// One client per configured org, the primary org first.
fn build_connectors(
    config: &SignSyncConfig,
) -> anyhow::Result<Vec<(String, Box<dyn SignConnector>)>> {
    let mut names: Vec<&String> = config.orgs.keys().collect();
    names.sort_by_key(|name| name.as_str() != PRIMARY_ORG);

    let mut connectors: Vec<(String, Box<dyn SignConnector>)> = Vec::with_capacity(names.len());
    for name in names {
        let client = SignClient::new(&config.orgs[name])
            .map_err(|e| anyhow::anyhow!("orgs.{name}: {e}"))?;
        connectors.push((name.clone(), Box::new(client)));
    }
    Ok(connectors)
}
