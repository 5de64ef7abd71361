//! Configuration management for driftreg

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::registration::RegistrationParams;
use crate::sequence::SequenceConfig;
use crate::tracker::TrackerConfig;
use crate::warp::WarpConfig;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Where the frames live and how they are backed up
    #[serde(default)]
    pub sequence: SequenceConfig,

    /// Reference frame, range, direction and feature points
    #[serde(default)]
    pub registration: RegistrationParams,

    #[serde(default)]
    pub tracker: TrackerConfig,

    #[serde(default)]
    pub warp: WarpConfig,
}

impl Config {
    /// Load configuration from a file, or create default if it doesn't exist
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {:?}", path))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config from {:?}", path))?;
            tracing::info!("Loaded configuration from {:?}", path);
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            tracing::info!("Created default configuration at {:?}", path);
            Ok(config)
        }
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory {:?}", parent))?;
        }

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved configuration to {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registration::{Direction, Point};
    use crate::warp::Backend;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.registration.reference_frame, 0);
        assert_eq!(config.registration.direction, Direction::Forward);
        assert!(config.registration.points.is_empty());
        assert_eq!(config.tracker.patch_size, 32);
        assert_eq!(config.warp.backend, Backend::Auto);
        assert_eq!(config.sequence.backup_dir, "original");
    }

    #[test]
    fn test_create_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("driftreg.toml");

        let created = Config::load_or_create(&path).unwrap();
        assert!(path.exists());

        let loaded = Config::load_or_create(&path).unwrap();
        assert_eq!(loaded.tracker.patch_size, created.tracker.patch_size);
        assert_eq!(loaded.registration.end_frame, None);
    }

    #[test]
    fn test_partial_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("driftreg.toml");
        std::fs::write(
            &path,
            r#"
[registration]
reference_frame = 4
end_frame = 9
direction = "both"
points = [{ x = 10.0, y = 12.5 }, { x = 30.0, y = 12.5 }]

[warp]
backend = "cpu"
"#,
        )
        .unwrap();

        let config = Config::load_or_create(&path).unwrap();
        assert_eq!(config.registration.reference_frame, 4);
        assert_eq!(config.registration.end_frame, Some(9));
        assert_eq!(config.registration.direction, Direction::Both);
        assert_eq!(config.registration.points[1], Point::new(30.0, 12.5));
        assert_eq!(config.warp.backend, Backend::Cpu);
        assert_eq!(config.tracker.patch_size, 32);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("driftreg.toml");
        std::fs::write(&path, "[registration\nreference_frame = ").unwrap();
        assert!(Config::load_or_create(&path).is_err());
    }
}
