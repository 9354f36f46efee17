//! Config loading, validation and environment overrides.

mod env;
mod load;
mod schema;

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::core::ResourceId;
use crate::error::{Effect, Transience};
use crate::tm::ProxyConfig;
use crate::transport::HEADER_LEN;

pub use env::apply_env_overrides;
pub use load::{config_path, load, load_or_default, write_config};
pub use schema::{
    Config, FileLoggingConfig, LogFormat, LogRotation, LoggingConfig, ResourceConfig,
    ResourceDefaults, TransactionConfig, TransportConfig,
};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: Box<toml::de::Error>,
    },
    #[error("failed to render config: {0}")]
    Render(Box<toml::ser::Error>),
    #[error("failed to write {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {field}: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    pub fn transience(&self) -> Transience {
        match self {
            ConfigError::Read { .. } | ConfigError::Write { .. } => Transience::Unknown,
            ConfigError::Parse { .. } | ConfigError::Render(_) | ConfigError::Invalid { .. } => {
                Transience::Permanent
            }
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            ConfigError::Write { .. } => Effect::Unknown,
            _ => Effect::None,
        }
    }
}

fn invalid(field: impl Into<String>, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field: field.into(),
        reason: reason.into(),
    }
}

impl Config {
    /// Fill resource entries from `[transaction.default]` and check the result.
    pub fn finalize(&mut self) -> Result<(), ConfigError> {
        if self.transport.frame_bytes <= HEADER_LEN {
            return Err(invalid(
                "transport.frame_bytes",
                format!(
                    "{} leaves no room for payload after a {HEADER_LEN} byte header",
                    self.transport.frame_bytes
                ),
            ));
        }
        if self.transport.queue_capacity == 0 {
            return Err(invalid("transport.queue_capacity", "must be at least 1"));
        }

        let defaults = self.transaction.default.clone();
        let mut names = BTreeSet::new();
        for (idx, resource) in self.transaction.resources.iter_mut().enumerate() {
            let field = format!("transaction.resources[{idx}]");
            if resource.name.trim().is_empty() {
                return Err(invalid(format!("{field}.name"), "must not be empty"));
            }
            if !names.insert(resource.name.clone()) {
                return Err(invalid(
                    format!("{field}.name"),
                    format!("`{}` is configured twice", resource.name),
                ));
            }
            if resource.key.is_none() {
                resource.key = defaults.key.clone();
            }
            if resource.key.as_deref().is_none_or(|k| k.trim().is_empty()) {
                return Err(invalid(
                    format!("{field}.key"),
                    format!("`{}` has no key and there is no default", resource.name),
                ));
            }
            if resource.instances.is_none() {
                resource.instances = Some(defaults.instances);
            }
        }
        Ok(())
    }

    /// Resource proxies in file order, numbered from 1.
    pub fn proxies(&self) -> Result<Vec<ProxyConfig>, ConfigError> {
        let defaults = &self.transaction.default;
        self.transaction
            .resources
            .iter()
            .enumerate()
            .map(|(idx, resource)| {
                let raw = i32::try_from(idx + 1)
                    .map_err(|_| invalid("transaction.resources", "too many resources"))?;
                let id = ResourceId::new(raw)
                    .map_err(|err| invalid("transaction.resources", err.to_string()))?;
                Ok(ProxyConfig {
                    id,
                    name: resource.name.clone(),
                    key: resource
                        .key
                        .clone()
                        .or_else(|| defaults.key.clone())
                        .unwrap_or_default(),
                    openinfo: resource.openinfo.clone(),
                    closeinfo: resource.closeinfo.clone(),
                    instances: resource.instances.unwrap_or(defaults.instances),
                    note: resource.note.clone(),
                })
            })
            .collect()
    }

    pub fn log_path(&self) -> PathBuf {
        self.transaction
            .log
            .clone()
            .unwrap_or_else(|| crate::paths::data_dir().join("transaction.log"))
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.transaction.timeout_ms.map(Duration::from_millis)
    }
}
