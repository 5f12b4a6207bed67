//! Engine configuration loader.
//!
//! Reads `config.toml` from the data directory (`~/.panefleet/` by default)
//! and deserializes it into [`EngineConfig`]. Falls back to defaults when the
//! file is missing or malformed.

use std::path::{Path, PathBuf};

use panefleet_types::config::EngineConfig;

/// Directory name under the home directory.
const DATA_DIR_NAME: &str = ".panefleet";

/// `~/.panefleet`, or `./.panefleet` when no home directory is known.
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DATA_DIR_NAME)
}

/// Load engine configuration from `{data_dir}/config.toml`.
///
/// - Missing file: [`EngineConfig::default()`].
/// - Unreadable or malformed file: logs a warning and returns the default.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!("Failed to parse {}: {err}, using defaults", config_path.display());
            EngineConfig::default()
        }
    }
}

/// Directory scanned for workflows: the configured one (relative paths are
/// taken from `data_dir`), else `{data_dir}/workflows`.
pub fn workflows_dir(config: &EngineConfig, data_dir: &Path) -> PathBuf {
    match &config.workflows_dir {
        Some(dir) if dir.is_relative() => data_dir.join(dir),
        Some(dir) => dir.clone(),
        None => data_dir.join("workflows"),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.session, "default");
        assert!(config.workers.is_empty());
    }

    #[tokio::test]
    async fn valid_toml_is_parsed() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join("config.toml"),
            r#"
session = "fleet"
poll_interval = "250ms"

[[workers]]
id = "1"
agent_type = "claude"
command = "cat"
"#,
        )
        .await
        .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.session, "fleet");
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.workers.len(), 1);
        assert_eq!(config.workers[0].command, "cat");
    }

    #[tokio::test]
    async fn invalid_toml_returns_default() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join("config.toml"), "this is not { valid toml !!!")
            .await
            .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.session, "default");
    }

    #[test]
    fn workflows_dir_resolution() {
        let data = Path::new("/data");
        let mut config = EngineConfig::default();
        assert_eq!(workflows_dir(&config, data), PathBuf::from("/data/workflows"));
        config.workflows_dir = Some(PathBuf::from("flows"));
        assert_eq!(workflows_dir(&config, data), PathBuf::from("/data/flows"));
        config.workflows_dir = Some(PathBuf::from("/srv/flows"));
        assert_eq!(workflows_dir(&config, data), PathBuf::from("/srv/flows"));
    }

    #[test]
    fn default_data_dir_ends_with_name() {
        assert!(default_data_dir().ends_with(".panefleet"));
    }
}
