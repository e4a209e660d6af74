//! Configuration file management for sibyl.
//!
//! Provides a TOML-based config file at `~/.config/sibyl/config.toml` and
//! a resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use sibyl_db::config::DbConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    #[serde(default)]
    pub redis: RedisSection,
    #[serde(default)]
    pub sandbox: SandboxSection,
    #[serde(default)]
    pub backup: BackupSection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RedisSection {
    pub url: String,
}

impl Default for RedisSection {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/1".to_owned(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SandboxSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub k8s_required: bool,
    pub namespace: Option<String>,
    pub image: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BackupSection {
    pub dir: String,
}

impl Default for BackupSection {
    fn default() -> Self {
        Self {
            dir: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("sibyl")
                .join("backups")
                .to_string_lossy()
                .into_owned(),
        }
    }
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the sibyl config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/sibyl` or `~/.config/sibyl`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("sibyl");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("sibyl")
}

/// Return the path to the sibyl config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct SibylConfig {
    pub db_config: DbConfig,
    pub redis_url: String,
    pub sandbox: SandboxSection,
    pub backup_dir: PathBuf,
}

impl SibylConfig {
    /// Resolve configuration: CLI flag > env var > config file > default.
    pub fn resolve(cli_db_url: Option<&str>) -> Result<Self> {
        let file = load_config().ok();

        let database_url = cli_db_url
            .map(str::to_owned)
            .or_else(|| std::env::var("SIBYL_DATABASE_URL").ok())
            .or_else(|| file.as_ref().map(|f| f.database.url.clone()))
            .unwrap_or_else(|| DbConfig::DEFAULT_URL.to_owned());

        let redis_url = std::env::var("SIBYL_REDIS_URL")
            .ok()
            .or_else(|| file.as_ref().map(|f| f.redis.url.clone()))
            .unwrap_or_else(|| RedisSection::default().url);

        let sandbox = file
            .as_ref()
            .map(|f| SandboxSection {
                enabled: f.sandbox.enabled,
                k8s_required: f.sandbox.k8s_required,
                namespace: f.sandbox.namespace.clone(),
                image: f.sandbox.image.clone(),
            })
            .unwrap_or_default();

        let backup_dir = file
            .map(|f| PathBuf::from(f.backup.dir))
            .unwrap_or_else(|| PathBuf::from(BackupSection::default().dir));

        Ok(Self {
            db_config: DbConfig::new(database_url),
            redis_url,
            sandbox,
            backup_dir,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_file_roundtrip() {
        let config = ConfigFile {
            database: DatabaseSection {
                url: "postgresql://localhost:5432/sibyl".to_owned(),
            },
            redis: RedisSection::default(),
            sandbox: SandboxSection::default(),
            backup: BackupSection::default(),
        };
        let text = toml::to_string_pretty(&config).unwrap();
        let back: ConfigFile = toml::from_str(&text).unwrap();
        assert_eq!(back.database.url, config.database.url);
        assert_eq!(back.redis.url, config.redis.url);
        assert!(!back.sandbox.enabled);
    }

    #[test]
    fn minimal_config_parses_with_defaults() {
        let text = "[database]\nurl = \"postgresql://h:5432/db\"\n";
        let config: ConfigFile = toml::from_str(text).unwrap();
        assert_eq!(config.redis.url, "redis://127.0.0.1:6379/1");
        assert!(!config.sandbox.enabled);
    }
}
