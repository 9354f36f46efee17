//! Subscriber setup: stdout and rolling file layers over one `EnvFilter`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

use crate::config::{FileLoggingConfig, LogFormat, LogRotation, LoggingConfig};
use crate::paths;

const LOG_FILE_PREFIX: &str = "tmbus.log";
const FILTER_ENV: &str = "TMBUS_LOG";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

#[derive(Clone, Debug, Default)]
pub struct TelemetryConfig {
    /// 0 = errors, 1 = info, 2+ = debug. Used when no filter is configured.
    pub verbosity: u8,
    pub logging: LoggingConfig,
}

impl TelemetryConfig {
    pub fn new(verbosity: u8, logging: LoggingConfig) -> Self {
        Self { verbosity, logging }
    }
}

/// Keeps the non-blocking file writers alive; drop it last.
pub struct TelemetryGuard {
    _guards: Vec<tracing_appender::non_blocking::WorkerGuard>,
}

/// Install the global subscriber. Fails quietly (with a stderr note) when one
/// is already installed, so tests and embedders can call it repeatedly.
pub fn init(config: TelemetryConfig) -> TelemetryGuard {
    let filter = build_filter(config.verbosity, config.logging.filter.as_deref());

    let mut guards = Vec::new();
    let mut layers: Vec<BoxedLayer> = Vec::new();
    if config.logging.stdout {
        layers.push(format_layer(
            config.logging.stdout_format,
            std::io::stderr,
            true,
        ));
    }

    let mut notes = Vec::new();
    if config.logging.file.enabled {
        let dir = config
            .logging
            .file
            .dir
            .clone()
            .unwrap_or_else(paths::log_dir);
        match fs::create_dir_all(&dir) {
            Ok(()) => {
                let retention = RetentionLimits::from_file_config(&config.logging.file);
                if retention.is_enabled() {
                    match prune_logs(&dir, LOG_FILE_PREFIX, retention, SystemTime::now()) {
                        Ok(removed) if removed > 0 => {
                            notes.push(format!("pruned {removed} old log files"));
                        }
                        Ok(_) => {}
                        Err(err) => notes.push(format!("log retention failed: {err}")),
                    }
                }
                let (layer, guard) = file_layer(&config.logging.file, &dir);
                layers.push(layer);
                guards.push(guard);
            }
            Err(err) => notes.push(format!("log dir {} unusable: {err}", dir.display())),
        }
    }
    layers.push(Box::new(filter));

    if let Err(err) = Registry::default().with(layers).try_init() {
        eprintln!("tmbus: tracing subscriber already installed: {err}");
    }
    for note in notes {
        tracing::warn!("{note}");
    }

    TelemetryGuard { _guards: guards }
}

/// `TMBUS_LOG` wins; otherwise the configured filter; otherwise verbosity.
fn build_filter(verbosity: u8, configured: Option<&str>) -> EnvFilter {
    let builder = EnvFilter::builder()
        .with_default_directive(level_from_verbosity(verbosity).into())
        .with_env_var(FILTER_ENV);
    let from_env = std::env::var(FILTER_ENV)
        .ok()
        .filter(|raw| !raw.trim().is_empty());
    match (from_env, configured) {
        (None, Some(directives)) => builder.parse_lossy(directives),
        _ => builder.from_env_lossy(),
    }
}

fn level_from_verbosity(verbosity: u8) -> tracing::metadata::LevelFilter {
    match verbosity {
        0 => tracing::metadata::LevelFilter::ERROR,
        1 => tracing::metadata::LevelFilter::INFO,
        _ => tracing::metadata::LevelFilter::DEBUG,
    }
}

fn format_layer<W>(format: LogFormat, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    match format {
        LogFormat::Tree => Box::new(
            tracing_tree::HierarchicalLayer::new(2)
                .with_ansi(ansi)
                .with_writer(writer),
        ),
        LogFormat::Pretty => Box::new(
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_writer(writer)
                .with_ansi(ansi)
                .with_target(true)
                .with_thread_names(true),
        ),
        LogFormat::Compact => Box::new(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(writer)
                .with_ansi(ansi)
                .with_target(true)
                .with_thread_names(true),
        ),
        LogFormat::Json => Box::new(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_target(true)
                .with_thread_names(true)
                .with_current_span(true)
                .with_span_list(true),
        ),
    }
}

fn file_layer(
    config: &FileLoggingConfig,
    dir: &Path,
) -> (BoxedLayer, tracing_appender::non_blocking::WorkerGuard) {
    let rotation = match config.rotation {
        LogRotation::Daily => tracing_appender::rolling::Rotation::DAILY,
        LogRotation::Hourly => tracing_appender::rolling::Rotation::HOURLY,
        LogRotation::Minutely => tracing_appender::rolling::Rotation::MINUTELY,
        LogRotation::Never => tracing_appender::rolling::Rotation::NEVER,
    };
    let appender =
        tracing_appender::rolling::RollingFileAppender::new(rotation, dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    (format_layer(config.format, writer, false), guard)
}

#[derive(Clone, Copy, Debug, Default)]
struct RetentionLimits {
    max_age: Option<Duration>,
    max_files: Option<usize>,
}

impl RetentionLimits {
    fn from_file_config(config: &FileLoggingConfig) -> Self {
        Self {
            max_age: config
                .retention_max_age_days
                .map(|days| Duration::from_secs(days.saturating_mul(24 * 60 * 60))),
            max_files: config.retention_max_files,
        }
    }

    fn is_enabled(&self) -> bool {
        self.max_age.is_some() || self.max_files.is_some()
    }
}

/// Remove rotated files past the retention limits. Returns how many went.
fn prune_logs(
    dir: &Path,
    prefix: &str,
    retention: RetentionLimits,
    now: SystemTime,
) -> std::io::Result<usize> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        let is_log = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(prefix));
        if is_log && meta.is_file() {
            files.push((entry.path(), meta.modified().unwrap_or(now)));
        }
    }

    let doomed = select_expired(files, retention, now);
    let mut removed = 0;
    for path in doomed {
        match fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(err) => tracing::debug!(path = %path.display(), "log prune failed: {err}"),
        }
    }
    Ok(removed)
}

fn select_expired(
    mut files: Vec<(PathBuf, SystemTime)>,
    retention: RetentionLimits,
    now: SystemTime,
) -> Vec<PathBuf> {
    let mut doomed = Vec::new();
    if let Some(max_age) = retention.max_age {
        files.retain(|(path, modified)| {
            let age = now.duration_since(*modified).unwrap_or(Duration::ZERO);
            if age > max_age {
                doomed.push(path.clone());
                false
            } else {
                true
            }
        });
    }
    if let Some(max_files) = retention.max_files
        && files.len() > max_files
    {
        files.sort_by_key(|(_, modified)| *modified);
        let excess = files.len() - max_files;
        doomed.extend(files.drain(..excess).map(|(path, _)| path));
    }
    doomed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retention_drops_old_then_surplus_files() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(10_000);
        let files = vec![
            (PathBuf::from("tmbus.log.1"), now - Duration::from_secs(9_000)),
            (PathBuf::from("tmbus.log.2"), now - Duration::from_secs(500)),
            (PathBuf::from("tmbus.log.3"), now - Duration::from_secs(40)),
            (PathBuf::from("tmbus.log.4"), now - Duration::from_secs(5)),
        ];
        let retention = RetentionLimits {
            max_age: Some(Duration::from_secs(1_000)),
            max_files: Some(2),
        };

        let doomed = select_expired(files, retention, now);
        assert_eq!(
            doomed,
            vec![PathBuf::from("tmbus.log.1"), PathBuf::from("tmbus.log.2")]
        );
    }

    #[test]
    fn prune_only_touches_prefixed_files() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["tmbus.log.a", "tmbus.log.b", "tmbus.log.c", "other.txt"] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }
        let retention = RetentionLimits {
            max_age: None,
            max_files: Some(1),
        };

        let removed = prune_logs(dir.path(), LOG_FILE_PREFIX, retention, SystemTime::now()).unwrap();
        assert_eq!(removed, 2);
        assert!(dir.path().join("other.txt").exists());
        let left = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(LOG_FILE_PREFIX))
            .count();
        assert_eq!(left, 1);
    }

    #[test]
    fn init_opens_rolling_file_in_configured_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut logging = LoggingConfig {
            stdout: false,
            filter: Some("tmbus=debug".into()),
            ..LoggingConfig::default()
        };
        logging.file.enabled = true;
        logging.file.dir = Some(dir.path().join("logs"));
        logging.file.rotation = LogRotation::Never;

        let guard = init(TelemetryConfig::new(1, logging));
        tracing::info!(target: "tmbus", "telemetry test event");
        drop(guard);

        let files: Vec<_> = fs::read_dir(dir.path().join("logs"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(LOG_FILE_PREFIX))
            .collect();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn verbosity_maps_to_levels() {
        use tracing::metadata::LevelFilter;
        assert_eq!(level_from_verbosity(0), LevelFilter::ERROR);
        assert_eq!(level_from_verbosity(1), LevelFilter::INFO);
        assert_eq!(level_from_verbosity(7), LevelFilter::DEBUG);
    }
}
