//! XDG directory helpers for config, data and log locations.

use std::cell::RefCell;
use std::path::PathBuf;

/// Base directory for persistent data (transaction log).
///
/// Uses `TMBUS_DATA_DIR` if set, otherwise `$XDG_DATA_HOME/tmbus` or
/// `~/.local/share/tmbus`.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = thread_local_data_dir_override() {
        return dir;
    }

    if let Some(dir) = env_dir("TMBUS_DATA_DIR") {
        return dir;
    }

    env_dir("XDG_DATA_HOME")
        .or_else(dirs::data_dir)
        .unwrap_or_else(|| home().join(".local").join("share"))
        .join("tmbus")
}

/// Base directory for configuration files.
///
/// Uses `TMBUS_CONFIG_DIR` if set, otherwise `$XDG_CONFIG_HOME/tmbus` or
/// `~/.config/tmbus`.
pub fn config_dir() -> PathBuf {
    if let Some(dir) = env_dir("TMBUS_CONFIG_DIR") {
        return dir;
    }

    env_dir("XDG_CONFIG_HOME")
        .or_else(dirs::config_dir)
        .unwrap_or_else(|| home().join(".config"))
        .join("tmbus")
}

/// Default directory for rolling log files.
pub fn log_dir() -> PathBuf {
    data_dir().join("logs")
}

fn home() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp"))
}

fn env_dir(key: &str) -> Option<PathBuf> {
    std::env::var(key)
        .ok()
        .filter(|dir| !dir.trim().is_empty())
        .map(PathBuf::from)
}

#[doc(hidden)]
pub struct DataDirOverride {
    prev: Option<PathBuf>,
}

impl DataDirOverride {
    pub fn new(path: Option<PathBuf>) -> Self {
        let prev = DATA_DIR_OVERRIDE.with(|cell| cell.replace(path));
        Self { prev }
    }
}

impl Drop for DataDirOverride {
    fn drop(&mut self) {
        let prev = self.prev.take();
        DATA_DIR_OVERRIDE.with(|cell| {
            cell.replace(prev);
        });
    }
}

/// Point `data_dir` at `path` on this thread until the guard drops.
#[doc(hidden)]
pub fn override_data_dir_for_tests(path: Option<PathBuf>) -> DataDirOverride {
    DataDirOverride::new(path)
}

fn thread_local_data_dir_override() -> Option<PathBuf> {
    DATA_DIR_OVERRIDE.with(|cell| cell.borrow().clone())
}

thread_local! {
    static DATA_DIR_OVERRIDE: RefCell<Option<PathBuf>> = const { RefCell::new(None) };
}
