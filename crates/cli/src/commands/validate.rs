use std::path::Path;

use signsync_core::config::SignSyncConfig;
use tracing::info;

/// Run the `validate` command: load the configuration and check it.
pub fn run(config_path: &str) -> anyhow::Result<()> {
    let config = SignSyncConfig::load(Path::new(config_path))?;
    config.validate()?;

    info!("Loaded configuration from {}", config_path);

    println!("Configuration OK");
    println!("  Sign orgs:      {}", config.orgs.len());
    println!("  Mapping rules:  {}", config.user_management.len());
    println!("  Directory:      {}", config.directory.path);
    println!(
        "  Sign-only:      {:?} (limit {})",
        config.sync.sign_only_user_action, config.sync.sign_only_limit
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn valid_config_passes() {
        let file = write_config(
            r#"
[[user_management]]
directory_group = "Sign Users"
sign_groups = ["Sign Group 1"]

[orgs.primary]
host = "api.na2.adobesign.com"
key = "integration-key"
admin_email = "admin@example.com"

[directory]
path = "users.csv"
"#,
        );
        run(file.path().to_str().unwrap()).unwrap();
    }

    #[test]
    fn missing_key_fails() {
        let file = write_config(
            r#"
[orgs.primary]
host = "api.na2.adobesign.com"
admin_email = "admin@example.com"

[directory]
path = "users.csv"
"#,
        );
        let err = run(file.path().to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains("Key 'key' must be specified"));
    }

    #[test]
    fn missing_file_fails() {
        assert!(run("/nonexistent/signsync.toml").is_err());
    }
}
