use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::core::Limits;
use crate::tm::LogDurability;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub transport: TransportConfig,
    pub limits: Limits,
    pub transaction: TransactionConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Size of one transport frame, header included.
    pub frame_bytes: usize,
    /// Segments a local queue holds before writers block.
    pub queue_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            frame_bytes: 4096,
            queue_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    /// Path of the sqlite log; defaults to `transaction.log` in the data dir.
    pub log: Option<PathBuf>,
    pub durability: LogDurability,
    /// Timeout for transactions that do not carry their own.
    pub timeout_ms: Option<u64>,
    pub default: ResourceDefaults,
    pub resources: Vec<ResourceConfig>,
}

/// Values a resource entry inherits when it leaves them out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceDefaults {
    pub key: Option<String>,
    pub instances: usize,
}

impl Default for ResourceDefaults {
    fn default() -> Self {
        Self {
            key: None,
            instances: 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    pub name: String,
    pub key: Option<String>,
    pub openinfo: String,
    pub closeinfo: String,
    pub instances: Option<usize>,
    pub note: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Tree,
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogRotation {
    Daily,
    Hourly,
    Minutely,
    Never,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub stdout: bool,
    pub stdout_format: LogFormat,
    pub filter: Option<String>,
    pub file: FileLoggingConfig,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            stdout: true,
            stdout_format: LogFormat::Compact,
            filter: None,
            file: FileLoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileLoggingConfig {
    pub enabled: bool,
    pub dir: Option<PathBuf>,
    pub format: LogFormat,
    pub rotation: LogRotation,
    pub retention_max_age_days: Option<u64>,
    pub retention_max_files: Option<usize>,
}

impl Default for FileLoggingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: None,
            format: LogFormat::Json,
            rotation: LogRotation::Daily,
            retention_max_age_days: Some(7),
            retention_max_files: Some(10),
        }
    }
}
