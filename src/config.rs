//! Configuration types.
//!
//! Everything is read from environment variables. Unset values take the
//! defaults below; values that are set but unparseable are errors.

use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Pipeline run configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// libSQL file holding the ledger (and local tickets).
    pub db_path: PathBuf,
    /// Classifier calls in flight per run.
    pub concurrency: usize,
    /// Bound on every collaborator call (source, model, store, sink).
    pub call_timeout: Duration,
    /// Body characters sent to the classifier.
    pub body_limit: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/support-pipeline.db"),
            concurrency: 4,
            call_timeout: Duration::from_secs(30),
            body_limit: 500,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let concurrency = non_zero(
            "SUPPORT_CONCURRENCY",
            parse_env("SUPPORT_CONCURRENCY", defaults.concurrency)?,
        )?;
        let timeout_secs = non_zero(
            "SUPPORT_CALL_TIMEOUT_SECS",
            parse_env("SUPPORT_CALL_TIMEOUT_SECS", defaults.call_timeout.as_secs())?,
        )?;
        Ok(Self {
            db_path: env_string("SUPPORT_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            concurrency,
            call_timeout: Duration::from_secs(timeout_secs),
            body_limit: parse_env("SUPPORT_BODY_LIMIT", defaults.body_limit)?,
        })
    }
}

/// Daily trigger configuration.
#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub enabled: bool,
    /// Cron expression with a leading seconds field.
    pub expression: String,
    /// How far back a scheduled run reaches.
    pub window_hours: u32,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            expression: "0 0 9 * * *".to_string(),
            window_hours: 24,
        }
    }
}

impl ScheduleConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            enabled: parse_env("SUPPORT_SCHEDULE_ENABLED", defaults.enabled)?,
            expression: env_string("SUPPORT_SCHEDULE").unwrap_or(defaults.expression),
            window_hours: parse_env("SUPPORT_WINDOW_HOURS", defaults.window_hours)?,
        })
    }
}

/// Digest formatting configuration.
#[derive(Debug, Clone)]
pub struct DigestConfig {
    /// Urgent open tickets listed in the digest.
    pub top_n: usize,
}

impl Default for DigestConfig {
    fn default() -> Self {
        Self { top_n: 5 }
    }
}

impl DigestConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            top_n: parse_env("SUPPORT_DIGEST_TOP_N", Self::default().top_n)?,
        })
    }
}

/// HTTP surface and process-level settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Directory for a daily rolling log file, if any.
    pub log_dir: Option<PathBuf>,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            port: parse_env("PORT", 5000)?,
            log_dir: env_string("SUPPORT_LOG_DIR").map(PathBuf::from),
        })
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// A set, non-blank environment variable.
pub(crate) fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse an environment variable, falling back to `default` when unset.
pub(crate) fn parse_env<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match env_string(key) {
        None => Ok(default),
        Some(raw) => parse_value(key, &raw),
    }
}

/// Reject a zero count or duration.
fn non_zero<T: Default + PartialEq>(key: &str, value: T) -> Result<T, ConfigError> {
    if value == T::default() {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be at least 1".into(),
        });
    }
    Ok(value)
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("'{raw}': {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let p = PipelineConfig::default();
        assert_eq!(p.concurrency, 4);
        assert_eq!(p.call_timeout, Duration::from_secs(30));
        assert_eq!(p.body_limit, 500);

        let s = ScheduleConfig::default();
        assert!(s.enabled);
        assert_eq!(s.expression, "0 0 9 * * *");
        assert_eq!(s.window_hours, 24);

        assert_eq!(DigestConfig::default().top_n, 5);
    }

    #[test]
    fn parse_value_reports_key_and_input() {
        let err = parse_value::<u32>("SUPPORT_WINDOW_HOURS", "lots").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("SUPPORT_WINDOW_HOURS"));
        assert!(msg.contains("lots"));

        assert_eq!(parse_value::<bool>("X", "false").unwrap(), false);
        assert_eq!(parse_value::<u16>("PORT", "8080").unwrap(), 8080);
    }

    #[test]
    fn zero_concurrency_and_timeout_are_rejected() {
        let err = non_zero("SUPPORT_CALL_TIMEOUT_SECS", 0u64).unwrap_err();
        assert!(err.to_string().contains("SUPPORT_CALL_TIMEOUT_SECS"));
        assert!(non_zero("SUPPORT_CONCURRENCY", 0usize).is_err());
        assert_eq!(non_zero("SUPPORT_CALL_TIMEOUT_SECS", 30u64).unwrap(), 30);
    }

    #[test]
    fn blank_variable_reads_as_unset() {
        // SAFETY: no other test touches this variable.
        unsafe { std::env::set_var("SUPPORT_TEST_BLANK_VARIABLE", "   ") };
        assert_eq!(env_string("SUPPORT_TEST_BLANK_VARIABLE"), None);
        let v: u64 = parse_env("SUPPORT_TEST_BLANK_VARIABLE", 30).unwrap();
        assert_eq!(v, 30);
    }

    #[test]
    fn unset_variable_takes_default() {
        let v: usize = parse_env("SUPPORT_TEST_SURELY_UNSET_VARIABLE", 7).unwrap();
        assert_eq!(v, 7);
    }
}
