//! blocksync configuration file parsing (.blocksync.toml)

use std::path::Path;

/// blocksync project configuration
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
pub struct BlocksyncConfig {
    /// Gitignore-style patterns excluded from indexing on both sides
    pub exclude: Vec<String>,

    /// Tracker settings
    #[serde(default)]
    pub track: TrackConfig,
}

/// Tracker configuration
#[derive(Debug, serde::Deserialize)]
#[serde(default)]
pub struct TrackConfig {
    /// Seconds between periodic re-indexes
    pub interval_secs: u64,
}

impl Default for TrackConfig {
    fn default() -> Self {
        Self { interval_secs: 60 }
    }
}

/// Config file name
pub const CONFIG_FILE: &str = ".blocksync.toml";

impl BlocksyncConfig {
    /// Load config from a tree root.
    ///
    /// Returns default config if .blocksync.toml doesn't exist.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be parsed.
    pub fn load(root: &Path) -> color_eyre::Result<Self> {
        let config_path = root.join(CONFIG_FILE);
        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
exclude = ["*.tmp", "target/"]

[track]
interval_secs = 15
"#;

        let config: BlocksyncConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.exclude, vec!["*.tmp", "target/"]);
        assert_eq!(config.track.interval_secs, 15);
    }

    #[test]
    fn test_parse_empty_config() {
        let config: BlocksyncConfig = toml::from_str("").unwrap();
        assert!(config.exclude.is_empty());
        assert_eq!(config.track.interval_secs, 60);
    }

    #[test]
    fn test_load_missing_file_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = BlocksyncConfig::load(dir.path()).unwrap();
        assert!(config.exclude.is_empty());
    }
}
