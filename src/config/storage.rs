//! Configuration Storage
//!
//! Handles reading/writing the pool configuration file.
//! Config location: ~/.oxideterm on macOS/Linux, %APPDATA%\OxideTerm on Windows

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::pool::PoolConfig;

/// Configuration storage errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to determine config directory")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid pool config: {0}")]
    Invalid(String),
}

impl serde::Serialize for ConfigError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Get the OxideTerm configuration directory
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    #[cfg(windows)]
    {
        if let Some(app_data) = dirs::config_dir() {
            return Ok(app_data.join("OxideTerm"));
        }
        dirs::home_dir()
            .map(|home| home.join(".oxideterm"))
            .ok_or(ConfigError::NoConfigDir)
    }

    #[cfg(not(windows))]
    {
        dirs::home_dir()
            .map(|home| home.join(".oxideterm"))
            .ok_or(ConfigError::NoConfigDir)
    }
}

/// Get the pool config file path
pub fn pool_config_file() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("pool.json"))
}

/// Load pool config from `path`
///
/// A missing file yields defaults; fields absent from the file take their
/// defaults as well.
pub async fn load_pool_config(path: &Path) -> Result<PoolConfig, ConfigError> {
    let content = match fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("Pool config {:?} not found, using defaults", path);
            return Ok(PoolConfig::default());
        }
        Err(e) => return Err(e.into()),
    };

    let config: PoolConfig = serde_json::from_str(&content)?;
    config.validate().map_err(ConfigError::Invalid)?;
    info!("Loaded pool config from {:?}", path);
    Ok(config)
}

/// Save pool config to `path` (atomic: write temp file then rename)
pub async fn save_pool_config(path: &Path, config: &PoolConfig) -> Result<(), ConfigError> {
    config.validate().map_err(ConfigError::Invalid)?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let json = serde_json::to_string_pretty(config)?;
    let tmp = path.with_extension("json.tmp");
    let mut file = fs::File::create(&tmp).await?;
    file.write_all(json.as_bytes()).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&tmp, path).await?;

    info!("Saved pool config to {:?}", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_pool_config(&dir.path().join("nope.json")).await.unwrap();
        assert_eq!(config, PoolConfig::default());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("pool.json");

        let config = PoolConfig {
            heartbeat_interval_secs: 7,
            reconnect_max_attempts: 9,
            ..Default::default()
        };
        save_pool_config(&path, &config).await.unwrap();

        let loaded = load_pool_config(&path).await.unwrap();
        assert_eq!(loaded, config);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.json");
        tokio::fs::write(&path, r#"{ "reconnect_backoff_ms": [] }"#)
            .await
            .unwrap();

        let err = load_pool_config(&path).await.unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_garbage_is_json_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.json");
        tokio::fs::write(&path, "not json").await.unwrap();

        let err = load_pool_config(&path).await.unwrap_err();
        assert!(matches!(err, ConfigError::Json(_)));
    }
}
