//! Engine configuration.
//!
//! Loaded from a TOML or JSON file, then overridden from `BACKSYNC_*`
//! environment variables.

use std::path::Path;
use std::time::Duration;

use backsync_core::{Error, Result};
use serde::{Deserialize, Serialize};

use crate::context::DEFAULT_CALL_TIMEOUT;
use crate::probe::ProbeConfig;
use crate::retry::RetryConfig;

/// Prefix of every environment override.
pub const ENV_PREFIX: &str = "BACKSYNC_";

const DEFAULT_CONVERGENCE_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_DELETE_TIMEOUT: Duration = Duration::from_secs(240);

/// Tunables for a [`Reconciler`](crate::Reconciler).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Backoff for transient failures of remote calls.
    pub retry: RetryConfig,

    /// Backoff for verification probes.
    pub probe: ProbeConfig,

    /// Upper bound for a single remote call.
    #[serde(with = "duration_secs")]
    pub call_timeout: Duration,

    /// Budget for post-apply verification.
    #[serde(with = "duration_secs")]
    pub convergence_timeout: Duration,

    /// Budget for a deleted resource to disappear.
    #[serde(with = "duration_secs")]
    pub delete_timeout: Duration,

    /// Probe until the remote matches after every insert or update.
    pub verify_after_apply: bool,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            probe: ProbeConfig::default(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            convergence_timeout: DEFAULT_CONVERGENCE_TIMEOUT,
            delete_timeout: DEFAULT_DELETE_TIMEOUT,
            verify_after_apply: true,
        }
    }
}

impl ReconcilerConfig {
    /// Set the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set the probe policy.
    #[must_use]
    pub fn with_probe(mut self, probe: ProbeConfig) -> Self {
        self.probe = probe;
        self
    }

    /// Set the per-call timeout.
    #[must_use]
    pub const fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Set the verification budget.
    #[must_use]
    pub const fn with_convergence_timeout(mut self, timeout: Duration) -> Self {
        self.convergence_timeout = timeout;
        self
    }

    /// Set the delete budget.
    #[must_use]
    pub const fn with_delete_timeout(mut self, timeout: Duration) -> Self {
        self.delete_timeout = timeout;
        self
    }

    /// Enable or disable post-apply verification.
    #[must_use]
    pub const fn with_verify_after_apply(mut self, verify: bool) -> Self {
        self.verify_after_apply = verify;
        self
    }

    /// Load configuration from a file, JSON or TOML by extension.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, does not parse, or holds
    /// invalid values.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::file_read_failed(path, e.to_string()))?;

        let config: Self = if path.extension().is_some_and(|e| e == "json") {
            serde_json::from_str(&content)?
        } else {
            toml::from_str(&content)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a set variable does not parse.
    pub fn from_env() -> Result<Self> {
        Self::default().apply_env()
    }

    /// Defaults overridden from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if a present value does not parse.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        Self::default().apply_lookup(lookup)
    }

    /// Apply overrides from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a set variable does not parse.
    pub fn apply_env(self) -> Result<Self> {
        self.apply_lookup(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any `BACKSYNC_*` key lookup.
    ///
    /// Recognised keys (without prefix): `CALL_TIMEOUT_SECS`,
    /// `CONVERGENCE_TIMEOUT_SECS`, `DELETE_TIMEOUT_SECS`,
    /// `VERIFY_AFTER_APPLY`, `RETRY_MAX_ATTEMPTS`, `RETRY_INITIAL_DELAY_MS`,
    /// `RETRY_MAX_DELAY_MS`, `PROBE_INITIAL_INTERVAL_MS`,
    /// `PROBE_MAX_INTERVAL_MS`, `PROBE_MAX_CONSECUTIVE_FAILURES`.
    ///
    /// # Errors
    ///
    /// Returns an error if a present value does not parse or the result is
    /// invalid.
    pub fn apply_lookup<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        if let Some(secs) = env.parse::<u64>("CALL_TIMEOUT_SECS")? {
            self.call_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env.parse::<u64>("CONVERGENCE_TIMEOUT_SECS")? {
            self.convergence_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env.parse::<u64>("DELETE_TIMEOUT_SECS")? {
            self.delete_timeout = Duration::from_secs(secs);
        }
        if let Some(verify) = env.flag("VERIFY_AFTER_APPLY")? {
            self.verify_after_apply = verify;
        }
        if let Some(attempts) = env.parse::<u32>("RETRY_MAX_ATTEMPTS")? {
            self.retry.max_attempts = attempts;
        }
        if let Some(ms) = env.parse::<u64>("RETRY_INITIAL_DELAY_MS")? {
            self.retry.initial_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env.parse::<u64>("RETRY_MAX_DELAY_MS")? {
            self.retry.max_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env.parse::<u64>("PROBE_INITIAL_INTERVAL_MS")? {
            self.probe.initial_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env.parse::<u64>("PROBE_MAX_INTERVAL_MS")? {
            self.probe.max_interval = Duration::from_millis(ms);
        }
        if let Some(failures) = env.parse::<u32>("PROBE_MAX_CONSECUTIVE_FAILURES")? {
            self.probe.max_consecutive_failures = failures;
        }

        self.validate()?;
        Ok(self)
    }

    /// Reject values the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming the first offending key.
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(Error::invalid_config("retry.max_attempts", "must be at least 1"));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(Error::invalid_config(
                "retry.backoff_multiplier",
                "must be at least 1.0",
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return Err(Error::invalid_config(
                "retry.jitter_factor",
                "must be between 0.0 and 1.0",
            ));
        }
        if self.probe.multiplier < 1.0 {
            return Err(Error::invalid_config("probe.multiplier", "must be at least 1.0"));
        }
        if self.probe.max_consecutive_failures == 0 {
            return Err(Error::invalid_config(
                "probe.max_consecutive_failures",
                "must be at least 1",
            ));
        }
        if self.call_timeout.is_zero() {
            return Err(Error::invalid_config("call_timeout", "must be positive"));
        }
        Ok(())
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<(String, String)> {
        let full = format!("{ENV_PREFIX}{key}");
        (self.lookup)(&full).map(|value| (full, value))
    }

    fn parse<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(key)
            .map(|(full, value)| {
                value
                    .trim()
                    .parse()
                    .map_err(|e| Error::invalid_config(full, format!("'{value}': {e}")))
            })
            .transpose()
    }

    fn flag(&self, key: &str) -> Result<Option<bool>> {
        self.get(key)
            .map(|(full, value)| match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(Error::invalid_config(full, format!("'{value}' is not a boolean"))),
            })
            .transpose()
    }
}

/// Serde helper: `Duration` as whole seconds.
pub mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Serde helper: `Duration` as whole milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]
    #![allow(clippy::panic)]

    use std::collections::HashMap;
    use std::io::Write;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = ReconcilerConfig::default();
        assert_eq!(config.call_timeout, Duration::from_secs(30));
        assert!(config.verify_after_apply);
        assert_eq!(config.retry.max_attempts, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r"
            call_timeout = 5
            delete_timeout = 60
            verify_after_apply = false

            [retry]
            max_attempts = 2
            initial_delay = 50

            [probe]
            max_consecutive_failures = 3
            "
        )
        .unwrap();

        let config = ReconcilerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.call_timeout, Duration::from_secs(5));
        assert_eq!(config.delete_timeout, Duration::from_secs(60));
        assert!(!config.verify_after_apply);
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.initial_delay, Duration::from_millis(50));
        assert_eq!(config.retry.max_delay, Duration::from_secs(10));
        assert_eq!(config.probe.max_consecutive_failures, 3);
        assert_eq!(config.convergence_timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_from_json_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"convergence_timeout": 15, "retry": {{"jitter_factor": 0.0}}}}"#)
            .unwrap();

        let config = ReconcilerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.convergence_timeout, Duration::from_secs(15));
        assert!(config.retry.jitter_factor.abs() < f64::EPSILON);
    }

    #[test]
    fn test_from_file_rejects_invalid_values() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[retry]\nmax_attempts = 0").unwrap();

        let err = ReconcilerConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { ref key, .. } if key == "retry.max_attempts"));
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let err = ReconcilerConfig::from_file(Path::new("/nonexistent/backsync.toml")).unwrap_err();
        assert!(matches!(err, Error::FileReadFailed { .. }));
    }

    #[test]
    fn test_env_overrides() {
        let config = ReconcilerConfig::from_lookup(lookup(&[
            ("BACKSYNC_CALL_TIMEOUT_SECS", "7"),
            ("BACKSYNC_VERIFY_AFTER_APPLY", "off"),
            ("BACKSYNC_RETRY_MAX_ATTEMPTS", "9"),
            ("BACKSYNC_PROBE_INITIAL_INTERVAL_MS", "25"),
        ]))
        .unwrap();

        assert_eq!(config.call_timeout, Duration::from_secs(7));
        assert!(!config.verify_after_apply);
        assert_eq!(config.retry.max_attempts, 9);
        assert_eq!(config.probe.initial_interval, Duration::from_millis(25));
    }

    #[test]
    fn test_env_overrides_keep_file_values() {
        let config = ReconcilerConfig::default()
            .with_delete_timeout(Duration::from_secs(9))
            .apply_lookup(lookup(&[("BACKSYNC_RETRY_MAX_DELAY_MS", "500")]))
            .unwrap();
        assert_eq!(config.delete_timeout, Duration::from_secs(9));
        assert_eq!(config.retry.max_delay, Duration::from_millis(500));
    }

    #[test]
    fn test_env_rejects_garbage() {
        let err = ReconcilerConfig::from_lookup(lookup(&[("BACKSYNC_DELETE_TIMEOUT_SECS", "soon")]))
            .unwrap_err();
        assert!(err.to_string().contains("BACKSYNC_DELETE_TIMEOUT_SECS"));
    }
}
