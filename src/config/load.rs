use std::fs;
use std::path::{Path, PathBuf};

use super::env::apply_env_overrides;
use super::{Config, ConfigError};

pub fn config_path() -> PathBuf {
    crate::paths::config_dir().join("tmbus.toml")
}

/// Read and validate a config file, then apply environment overrides.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut config: Config = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source: Box::new(source),
    })?;
    apply_env_overrides(&mut config);
    config.finalize()?;
    Ok(config)
}

/// Load the config at `path`, or defaults when there is none.
///
/// A config that exists but cannot be used is an error; only a missing file
/// falls back to defaults.
pub fn load_or_default(path: &Path) -> Result<Config, ConfigError> {
    if path.exists() {
        return load(path);
    }
    tracing::debug!(path = %path.display(), "no config file; using defaults");
    let mut config = Config::default();
    apply_env_overrides(&mut config);
    config.finalize()?;
    Ok(config)
}

pub fn write_config(path: &Path, config: &Config) -> Result<(), ConfigError> {
    let dir = path.parent().ok_or_else(|| ConfigError::Invalid {
        field: "path".into(),
        reason: format!("{} has no parent directory", path.display()),
    })?;
    fs::create_dir_all(dir).map_err(|source| ConfigError::Write {
        path: dir.to_path_buf(),
        source,
    })?;
    let contents = toml::to_string_pretty(config).map_err(|e| ConfigError::Render(Box::new(e)))?;

    let write_err = |source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };
    let temp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
    fs::write(temp.path(), contents.as_bytes()).map_err(write_err)?;
    temp.persist(path).map_err(|e| write_err(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::{LogFormat, LogRotation, ResourceConfig};
    use crate::tm::LogDurability;

    #[test]
    fn config_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tmbus.toml");
        let mut config = Config::default();
        config.transport.frame_bytes = 1024;
        config.limits.max_cache_messages = 12;
        config.transaction.log = Some(dir.path().join("trans.db"));
        config.transaction.durability = LogDurability::Cache;
        config.transaction.timeout_ms = Some(30_000);
        config.transaction.default.key = Some("sqlite".into());
        config.transaction.resources.push(ResourceConfig {
            name: "orders".into(),
            openinfo: "db=orders".into(),
            instances: Some(3),
            ..ResourceConfig::default()
        });
        config.logging.stdout_format = LogFormat::Json;
        config.logging.file.rotation = LogRotation::Hourly;

        write_config(&path, &config).unwrap();
        let loaded = load(&path).unwrap();

        assert_eq!(loaded.transport.frame_bytes, 1024);
        assert_eq!(loaded.limits.max_cache_messages, 12);
        assert_eq!(loaded.transaction.durability, LogDurability::Cache);
        assert_eq!(loaded.transaction.timeout_ms, Some(30_000));
        assert_eq!(loaded.transaction.resources.len(), 1);
        assert_eq!(
            loaded.transaction.resources[0].key.as_deref(),
            Some("sqlite")
        );
        assert_eq!(loaded.logging.stdout_format, LogFormat::Json);
        assert_eq!(loaded.logging.file.rotation, LogRotation::Hourly);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tmbus.toml");
        fs::write(
            &path,
            r#"
[transaction.default]
key = "db2"
instances = 2

[[transaction.resources]]
name = "ledger"
openinfo = "db=ledger"

[[transaction.resources]]
name = "audit"
key = "sqlite"
instances = 1
"#,
        )
        .unwrap();

        let config = load(&path).unwrap();
        assert_eq!(config.transport.frame_bytes, 4096);
        assert_eq!(config.transport.queue_capacity, 256);
        let resources = &config.transaction.resources;
        assert_eq!(resources[0].key.as_deref(), Some("db2"));
        assert_eq!(resources[0].instances, Some(2));
        assert_eq!(resources[1].key.as_deref(), Some("sqlite"));
        assert_eq!(resources[1].instances, Some(1));
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tmbus.toml");
        fs::write(&path, "[transport\nframe_bytes = ").unwrap();
        assert!(matches!(load(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert!(config.transaction.resources.is_empty());
    }
}
