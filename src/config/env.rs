use std::path::PathBuf;

use super::Config;

/// Apply `TMBUS_*` environment overrides. Invalid values are warned about
/// and ignored.
pub fn apply_env_overrides(config: &mut Config) {
    apply_env_overrides_from(config, |key| std::env::var(key).ok());
}

pub(crate) fn apply_env_overrides_from(
    config: &mut Config,
    lookup: impl Fn(&str) -> Option<String>,
) {
    let value = |key: &str| {
        lookup(key)
            .map(|raw| raw.trim().to_string())
            .filter(|raw| !raw.is_empty())
    };

    if let Some(raw) = value("TMBUS_TRANSACTION_LOG") {
        config.transaction.log = Some(PathBuf::from(raw));
    }

    if let Some(raw) = value("TMBUS_FRAME_BYTES") {
        match raw.parse::<usize>() {
            Ok(frame_bytes) => config.transport.frame_bytes = frame_bytes,
            Err(err) => tracing::warn!("invalid TMBUS_FRAME_BYTES, ignoring: {err}"),
        }
    }

    if let Some(raw) = value("TMBUS_LOG_FILTER") {
        config.logging.filter = Some(raw);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;

    fn apply(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        let mut config = Config::default();
        apply_env_overrides_from(&mut config, |key| vars.get(key).cloned());
        config
    }

    #[test]
    fn env_overrides_apply() {
        let config = apply(&[
            ("TMBUS_TRANSACTION_LOG", "/var/lib/tmbus/trans.db"),
            ("TMBUS_FRAME_BYTES", " 8192 "),
            ("TMBUS_LOG_FILTER", "tmbus=debug"),
        ]);
        assert_eq!(
            config.transaction.log,
            Some(PathBuf::from("/var/lib/tmbus/trans.db"))
        );
        assert_eq!(config.transport.frame_bytes, 8192);
        assert_eq!(config.logging.filter.as_deref(), Some("tmbus=debug"));
    }

    #[test]
    fn invalid_or_blank_values_are_ignored() {
        let config = apply(&[("TMBUS_FRAME_BYTES", "lots"), ("TMBUS_TRANSACTION_LOG", "  ")]);
        assert_eq!(config.transport.frame_bytes, 4096);
        assert_eq!(config.transaction.log, None);
    }
}
