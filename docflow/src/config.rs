//! Runtime configuration.
//!
//! Loaded from TOML; every section and field is optional and falls back to
//! the defaults below. A handful of operational knobs can be overridden from
//! the environment:
//!
//! | Variable                     | Field                  |
//! |------------------------------|------------------------|
//! | `DOCFLOW_LOG_FILTER`         | `logging.filter`       |
//! | `DOCFLOW_LOG_FORMAT`         | `logging.format`       |
//! | `DOCFLOW_WORKER_CONCURRENCY` | `worker.concurrency`   |

use crate::errors::DocflowError;
use crate::pipeline::{BackoffSchedule, StageRetryPolicy};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default deadline for an awaited signal (24 hours).
pub const DEFAULT_CALLBACK_TIMEOUT_SECS: u64 = 24 * 60 * 60;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DocflowConfig {
    /// Background worker settings.
    pub worker: WorkerConfig,
    /// Baseline orchestrator settings.
    pub orchestrator: OrchestratorConfig,
    /// Durable workflow engine settings.
    pub workflow: WorkflowConfig,
    /// Outbound notification settings.
    pub notifications: NotificationConfig,
    /// Log output settings.
    pub logging: LoggingConfig,
}

/// Background worker settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Messages processed concurrently.
    pub concurrency: usize,
    /// Idle poll interval.
    pub poll_interval_ms: u64,
    /// Lifetime of an unrenewed dispatch lease before another worker may take
    /// over. Running work renews its lease every third of this.
    pub lease_ttl_secs: u64,
    /// Messages taken from the queue per poll.
    pub batch_size: usize,
    /// Delay before a message that hit a transient error (suspended tenant,
    /// unreachable store) is handled again.
    pub defer_delay_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval_ms: 250,
            lease_ttl_secs: 300,
            batch_size: 16,
            defer_delay_secs: 30,
        }
    }
}

impl WorkerConfig {
    /// Idle poll interval.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Dispatch lease lifetime.
    #[must_use]
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    /// Delay before a deferred message runs again.
    #[must_use]
    pub fn defer_delay(&self) -> Duration {
        Duration::from_secs(self.defer_delay_secs)
    }
}

/// Baseline orchestrator settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Delays between job-level attempts, in seconds.
    pub backoff: BackoffSchedule,
    /// Attempts per stage used when a campaign does not set its own.
    pub default_max_attempts: u32,
    /// Per-invocation timeout when a stage does not set its own.
    pub stage_timeout_secs: Option<u64>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffSchedule::job_default(),
            default_max_attempts: 3,
            stage_timeout_secs: None,
        }
    }
}

impl OrchestratorConfig {
    /// Default per-invocation timeout.
    #[must_use]
    pub fn stage_timeout(&self) -> Option<Duration> {
        self.stage_timeout_secs.map(Duration::from_secs)
    }
}

/// Durable workflow engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Deadline for an awaited signal when neither the stage nor the
    /// outcome sets one.
    pub callback_timeout_secs: u64,
    /// In-place retry policy for stages that do not declare one.
    pub stage_retry: StageRetryPolicy,
    /// Per-invocation timeout when a stage does not set its own.
    pub stage_timeout_secs: Option<u64>,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            callback_timeout_secs: DEFAULT_CALLBACK_TIMEOUT_SECS,
            stage_retry: StageRetryPolicy::none(),
            stage_timeout_secs: None,
        }
    }
}

impl WorkflowConfig {
    /// Default signal deadline.
    #[must_use]
    pub fn callback_timeout(&self) -> Duration {
        Duration::from_secs(self.callback_timeout_secs)
    }

    /// Default per-invocation timeout.
    #[must_use]
    pub fn stage_timeout(&self) -> Option<Duration> {
        self.stage_timeout_secs.map(Duration::from_secs)
    }
}

/// Outbound notification settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Per-request timeout.
    pub request_timeout_secs: u64,
    /// Total delivery attempts, including the first.
    pub max_attempts: u32,
    /// Delays between attempts, in seconds.
    pub backoff: BackoffSchedule,
    /// `User-Agent` sent with every request.
    pub user_agent: String,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 10,
            max_attempts: 3,
            backoff: BackoffSchedule::notification_default(),
            user_agent: concat!("docflow/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl NotificationConfig {
    /// Per-request timeout.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Log line format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = DocflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(DocflowError::Config(format!("unknown log format '{other}'"))),
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `info,docflow=debug`.
    pub filter: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl DocflowConfig {
    /// Parses a TOML document.
    ///
    /// # Errors
    ///
    /// [`DocflowError::Config`] on malformed TOML or invalid values.
    pub fn from_toml_str(contents: &str) -> Result<Self, DocflowError> {
        let config: Self = toml::from_str(contents)
            .map_err(|e| DocflowError::Config(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a TOML file and applies environment overrides.
    ///
    /// A missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// [`DocflowError::Config`] if the file cannot be read or parsed, or an
    /// override is invalid.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DocflowError> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path).map_err(|e| {
                DocflowError::Config(format!("failed to read {}: {e}", path.display()))
            })?;
            Self::from_toml_str(&contents)?
        } else {
            Self::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Applies overrides looked up by variable name.
    ///
    /// # Errors
    ///
    /// [`DocflowError::Config`] if an override cannot be parsed.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), DocflowError> {
        if let Some(filter) = lookup("DOCFLOW_LOG_FILTER") {
            self.logging.filter = filter;
        }
        if let Some(format) = lookup("DOCFLOW_LOG_FORMAT") {
            self.logging.format = format.parse()?;
        }
        if let Some(concurrency) = lookup("DOCFLOW_WORKER_CONCURRENCY") {
            self.worker.concurrency = concurrency.trim().parse().map_err(|_| {
                DocflowError::Config(format!("DOCFLOW_WORKER_CONCURRENCY is not a number: '{concurrency}'"))
            })?;
        }
        Ok(())
    }

    /// Checks the values that would make the engines misbehave.
    ///
    /// # Errors
    ///
    /// [`DocflowError::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<(), DocflowError> {
        let fail = |msg: &str| Err(DocflowError::Config(msg.to_string()));

        if self.worker.concurrency == 0 {
            return fail("worker.concurrency must be at least 1");
        }
        if self.worker.batch_size == 0 {
            return fail("worker.batch_size must be at least 1");
        }
        if self.orchestrator.backoff.is_empty() {
            return fail("orchestrator.backoff must not be empty");
        }
        if self.orchestrator.default_max_attempts == 0 {
            return fail("orchestrator.default_max_attempts must be at least 1");
        }
        if self.workflow.callback_timeout_secs == 0 {
            return fail("workflow.callback_timeout_secs must be positive");
        }
        if self.workflow.stage_retry.max_attempts == 0 {
            return fail("workflow.stage_retry.max_attempts must be at least 1");
        }
        if self.notifications.max_attempts == 0 {
            return fail("notifications.max_attempts must be at least 1");
        }
        if self.notifications.backoff.is_empty() {
            return fail("notifications.backoff must not be empty");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = DocflowConfig::default();
        assert_eq!(config.orchestrator.backoff.as_secs(), &[60, 300, 900]);
        assert_eq!(config.notifications.backoff.as_secs(), &[60, 120, 240]);
        assert_eq!(config.notifications.max_attempts, 3);
        assert_eq!(config.workflow.callback_timeout(), Duration::from_secs(86_400));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = DocflowConfig::from_toml_str(
            r#"
            [worker]
            concurrency = 8

            [orchestrator]
            backoff = [1, 2]

            [logging]
            format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(config.worker.concurrency, 8);
        assert_eq!(config.worker.poll_interval_ms, 250);
        assert_eq!(config.orchestrator.backoff.as_secs(), &[1, 2]);
        assert_eq!(config.orchestrator.default_max_attempts, 3);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let err = DocflowConfig::from_toml_str("[worker]\nconcurrency = 0\n").unwrap_err();
        assert!(err.to_string().contains("worker.concurrency"));

        let err = DocflowConfig::from_toml_str("[notifications]\nbackoff = []\n").unwrap_err();
        assert!(err.to_string().contains("notifications.backoff"));

        assert!(DocflowConfig::from_toml_str("worker = 3").is_err());
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("DOCFLOW_LOG_FILTER", "debug"),
            ("DOCFLOW_LOG_FORMAT", "JSON"),
            ("DOCFLOW_WORKER_CONCURRENCY", "12"),
        ]
        .into_iter()
        .collect();

        let mut config = DocflowConfig::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| (*v).to_string()))
            .unwrap();

        assert_eq!(config.logging.filter, "debug");
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.worker.concurrency, 12);
    }

    #[test]
    fn test_bad_override() {
        let mut config = DocflowConfig::default();
        let result = config.apply_overrides(|key| {
            (key == "DOCFLOW_WORKER_CONCURRENCY").then(|| "many".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[workflow]\ncallback_timeout_secs = 5").unwrap();

        let config = DocflowConfig::load(file.path()).unwrap();
        assert_eq!(config.workflow.callback_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = DocflowConfig::load(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.worker.batch_size, 16);
    }
}
