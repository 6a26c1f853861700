use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::FixedOffset;

use crate::clock::utc_offset;
use crate::persistence::PersistenceConfig;
use crate::routes::DEFAULT_IDLE_TIMEOUT;

/// Service settings, read from the environment (after `.env`).
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    /// Root for per-learner progress files.
    pub data_dir: PathBuf,
    /// Enables the remote progress endpoint.
    pub database_url: Option<String>,
    /// Base URL of the remote progress endpoint to replicate to.
    pub sync_url: Option<String>,
    /// Curriculum manifest (file, or directory holding `curriculum.json`).
    /// Built-in curriculum when unset.
    pub curriculum_path: Option<PathBuf>,
    pub learner_offset: FixedOffset,
    pub persistence: PersistenceConfig,
    /// Learner sessions unused this long are closed.
    pub session_idle: Duration,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| get(key).filter(|s| !s.trim().is_empty());

        let defaults = PersistenceConfig::default();
        let persistence = PersistenceConfig {
            debounce: setting(&get, "SYNC_DEBOUNCE_MS").map(Duration::from_millis).unwrap_or(defaults.debounce),
            max_attempts: setting::<u32>(&get, "SYNC_MAX_ATTEMPTS").filter(|n| *n > 0).unwrap_or(defaults.max_attempts),
            retry_base: setting(&get, "SYNC_RETRY_BASE_MS").map(Duration::from_millis).unwrap_or(defaults.retry_base),
            storage_key: defaults.storage_key,
        };

        let learner_offset = setting(&get, "LEARNER_UTC_OFFSET_MINUTES")
            .and_then(|minutes: i32| FixedOffset::east_opt(minutes.saturating_mul(60)))
            .unwrap_or_else(utc_offset);

        Self {
            port: setting(&get, "PORT").unwrap_or(8081),
            data_dir: non_empty("DATA_DIR").map(PathBuf::from).unwrap_or_else(|| "./data".into()),
            database_url: non_empty("DATABASE_URL"),
            sync_url: non_empty("SYNC_URL"),
            curriculum_path: non_empty("CURRICULUM_PATH").map(PathBuf::from),
            learner_offset,
            persistence,
            session_idle: setting::<u64>(&get, "SESSION_IDLE_MINUTES")
                .filter(|m| *m > 0)
                .map(|m| Duration::from_secs(m.saturating_mul(60)))
                .unwrap_or(DEFAULT_IDLE_TIMEOUT),
        }
    }
}

fn setting<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = get(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable setting");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> AppConfig {
        let vars: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        AppConfig::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn defaults_without_env() {
        let c = config(&[]);
        assert_eq!(c.port, 8081);
        assert_eq!(c.data_dir, PathBuf::from("./data"));
        assert!(c.database_url.is_none() && c.sync_url.is_none());
        assert_eq!(c.persistence, PersistenceConfig::default());
        assert_eq!(c.learner_offset, utc_offset());
        assert_eq!(c.session_idle, Duration::from_secs(30 * 60));
    }

    #[test]
    fn reads_overrides_and_skips_garbage() {
        let c = config(&[
            ("PORT", "9000"),
            ("SYNC_DEBOUNCE_MS", "250"),
            ("SYNC_MAX_ATTEMPTS", "nope"),
            ("SYNC_URL", "http://remote:8081"),
            ("DATABASE_URL", "  "),
            ("LEARNER_UTC_OFFSET_MINUTES", "-300"),
            ("SESSION_IDLE_MINUTES", "5"),
        ]);
        assert_eq!(c.port, 9000);
        assert_eq!(c.persistence.debounce, Duration::from_millis(250));
        assert_eq!(c.persistence.max_attempts, 3);
        assert_eq!(c.sync_url.as_deref(), Some("http://remote:8081"));
        assert!(c.database_url.is_none());
        assert_eq!(c.learner_offset, FixedOffset::west_opt(5 * 3600).unwrap());
        assert_eq!(c.session_idle, Duration::from_secs(300));
    }
}
