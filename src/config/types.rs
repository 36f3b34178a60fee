//! Configuration types and structures.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub staging: StagingConfig,

    #[serde(default)]
    pub load: LoadConfig,
}

/// Production database settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the production SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("project-import/projects.db")
}

/// Staging schema settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingConfig {
    /// Directory holding staging schema files.
    #[serde(default = "default_staging_dir")]
    pub dir: PathBuf,

    /// Name prefix identifying staging schemas (default: `import_staging_`).
    #[serde(default = "default_staging_prefix")]
    pub prefix: String,

    /// Age after which a populated staging schema counts as orphaned (default: 3600).
    #[serde(default = "default_orphan_max_age_secs")]
    pub orphan_max_age_secs: u64,

    /// Dumps larger than this produce a warning (default: 100 MiB).
    #[serde(default = "default_large_dump_warn_bytes")]
    pub large_dump_warn_bytes: u64,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            dir: default_staging_dir(),
            prefix: default_staging_prefix(),
            orphan_max_age_secs: default_orphan_max_age_secs(),
            large_dump_warn_bytes: default_large_dump_warn_bytes(),
        }
    }
}

fn default_staging_dir() -> PathBuf {
    PathBuf::from("project-import/staging")
}

fn default_staging_prefix() -> String {
    "import_staging_".to_string()
}

fn default_orphan_max_age_secs() -> u64 {
    3600 // 1 hour
}

fn default_large_dump_warn_bytes() -> u64 {
    100 * 1024 * 1024
}

/// Defaults for load calls.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadConfig {
    /// Create global fields referenced by imported templates when missing locally.
    #[serde(default)]
    pub include_global_fields: bool,
}

impl Config {
    /// Load configuration from file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Ensure the database directory exists.
    pub fn ensure_db_dir(&self) -> Result<()> {
        if let Some(parent) = self.database.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.staging.prefix, "import_staging_");
        assert_eq!(config.staging.orphan_max_age_secs, 3600);
        assert_eq!(config.staging.large_dump_warn_bytes, 104_857_600);
        assert!(!config.load.include_global_fields);
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let config: Config = serde_yaml::from_str(
            "staging:\n  prefix: tmp_stage_\nload:\n  include_global_fields: true\n",
        )
        .unwrap();
        assert_eq!(config.staging.prefix, "tmp_stage_");
        assert_eq!(config.staging.orphan_max_age_secs, 3600);
        assert!(config.load.include_global_fields);
        assert_eq!(config.database.path, PathBuf::from("project-import/projects.db"));
    }
}
