//! Configuration system for pullsub.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::core::flow_control::FlowControlSettings;
use crate::error::ValidationError;
use crate::types::validation::validate_subscription_name;

/// Lower bound of any ack deadline the service accepts.
pub const MIN_STREAM_ACK_DEADLINE: Duration = Duration::from_secs(10);
/// Upper bound of any ack deadline the service accepts.
pub const MAX_STREAM_ACK_DEADLINE: Duration = Duration::from_secs(600);
/// Stream ack deadline used when no per extension maximum is configured.
pub const DEFAULT_STREAM_ACK_DEADLINE: Duration = Duration::from_secs(60);
/// How long before a lease runs out it gets extended.
pub const ACK_EXPIRATION_PADDING: Duration = Duration::from_secs(5);
/// Default total time a message lease is extended for.
pub const DEFAULT_MAX_ACK_EXTENSION_PERIOD: Duration = Duration::from_secs(60 * 60);
/// Minimum extension when exactly once delivery is enabled and no minimum is configured.
pub const DEFAULT_MIN_ACK_DEADLINE_EXTENSION_EXACTLY_ONCE: Duration = Duration::from_secs(60);
/// Interval between flushes of pending acks, nacks and receipts.
pub const PENDING_ACKS_SEND_DELAY: Duration = Duration::from_millis(100);
/// Time kept back from a bounded shutdown to send the final nacks.
pub const FINAL_NACK_TIMEOUT: Duration = Duration::from_secs(1);
/// Largest configurable lease duration, in seconds. Deadlines travel as 32-bit seconds.
pub const MAX_CONFIGURED_DURATION_SECS: u64 = i32::MAX as u64;

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriberConfig {
    /// Full subscription name, `projects/{project}/subscriptions/{subscription}`.
    pub subscription: String,
    /// Client side flow control.
    pub flow_control: FlowControlSettings,
    /// Keep flow control limits out of the stream request.
    pub use_legacy_flow_control: bool,
    /// Total time a message lease is extended for, in seconds. Zero disables extension.
    pub max_ack_extension_period_secs: u64,
    /// Lower bound of a single lease extension, in seconds.
    pub min_duration_per_ack_extension_secs: Option<u64>,
    /// Upper bound of a single lease extension, in seconds.
    pub max_duration_per_ack_extension_secs: Option<u64>,
    /// Number of streaming connections.
    pub parallel_pull_count: usize,
    /// Hand ack response futures to the receiver.
    pub ack_response_enabled: bool,
    /// Shutdown behavior.
    pub shutdown: ShutdownSettings,
    /// Retry policy for acknowledge and modify deadline requests.
    pub retry: RetrySettings,
    /// Logging configuration.
    pub logging: LoggingConfig,
}

/// How outstanding messages are handled when the subscriber stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownMode {
    /// Stop delivering and wait for outstanding messages to be acked or nacked.
    #[default]
    WaitForProcessing,
    /// Stop delivering and nack every outstanding message.
    NackImmediately,
}

/// Shutdown settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownSettings {
    /// Shutdown mode.
    pub mode: ShutdownMode,
    /// Timeout in milliseconds. Negative waits indefinitely, zero shuts down at once.
    pub timeout_ms: i64,
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self {
            mode: ShutdownMode::WaitForProcessing,
            timeout_ms: -1,
        }
    }
}

impl ShutdownSettings {
    /// Wait for processing, for at most `timeout` when one is given.
    pub fn wait_for_processing(timeout: Option<Duration>) -> Self {
        Self {
            mode: ShutdownMode::WaitForProcessing,
            timeout_ms: timeout.map_or(-1, |t| t.as_millis() as i64),
        }
    }

    /// Nack outstanding messages right away.
    pub fn nack_immediately(timeout: Duration) -> Self {
        Self {
            mode: ShutdownMode::NackImmediately,
            timeout_ms: timeout.as_millis() as i64,
        }
    }

    /// The timeout, or `None` to wait indefinitely.
    pub fn timeout(&self) -> Option<Duration> {
        u64::try_from(self.timeout_ms).ok().map(Duration::from_millis)
    }
}

/// Retry policy for control RPCs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Attempts per ack id, including the first.
    pub max_attempts: u32,
    /// Backoff before the first retry, in milliseconds.
    pub initial_backoff_ms: u64,
    /// Upper bound of the backoff, in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 10_000,
        }
    }
}

impl RetrySettings {
    /// Backoff before retry number `attempt` (0 based): `min(initial * 2^attempt, max)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let millis = self
            .initial_backoff_ms
            .saturating_mul(2_u64.saturating_pow(attempt))
            .min(self.max_backoff_ms);
        Duration::from_millis(millis)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level.
    pub level: String,
    /// Log format (text or json).
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

/// Log format enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text format.
    #[default]
    Text,
    /// JSON format.
    Json,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            subscription: String::new(),
            flow_control: FlowControlSettings::default(),
            use_legacy_flow_control: false,
            max_ack_extension_period_secs: DEFAULT_MAX_ACK_EXTENSION_PERIOD.as_secs(),
            min_duration_per_ack_extension_secs: None,
            max_duration_per_ack_extension_secs: None,
            parallel_pull_count: 1,
            ack_response_enabled: false,
            shutdown: ShutdownSettings::default(),
            retry: RetrySettings::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl SubscriberConfig {
    /// Default configuration for a subscription.
    pub fn new(subscription: impl Into<String>) -> Self {
        Self {
            subscription: subscription.into(),
            ..Default::default()
        }
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(contents: &str) -> crate::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Render the configuration as TOML.
    pub fn to_toml(&self) -> crate::Result<String> {
        toml::to_string_pretty(self).map_err(|e| crate::Error::Config(e.to_string()))
    }

    /// Total time a message lease is extended for.
    pub fn max_ack_extension_period(&self) -> Duration {
        Duration::from_secs(self.max_ack_extension_period_secs)
    }

    /// Configured lower bound of a single extension.
    pub fn min_duration_per_ack_extension(&self) -> Option<Duration> {
        self.min_duration_per_ack_extension_secs.map(Duration::from_secs)
    }

    /// Configured upper bound of a single extension.
    pub fn max_duration_per_ack_extension(&self) -> Option<Duration> {
        self.max_duration_per_ack_extension_secs.map(Duration::from_secs)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> crate::Result<()> {
        validate_subscription_name(&self.subscription)?;

        if self.parallel_pull_count == 0 {
            return Err(ValidationError::InvalidParameter {
                name: "parallel_pull_count".to_string(),
                reason: "must be at least 1".to_string(),
            }
            .into());
        }

        let durations = [
            ("max_ack_extension_period_secs", Some(self.max_ack_extension_period_secs)),
            (
                "min_duration_per_ack_extension_secs",
                self.min_duration_per_ack_extension_secs,
            ),
            (
                "max_duration_per_ack_extension_secs",
                self.max_duration_per_ack_extension_secs,
            ),
        ];
        for (name, secs) in durations {
            if let Some(secs) = secs.filter(|s| *s > MAX_CONFIGURED_DURATION_SECS) {
                return Err(ValidationError::InvalidDuration {
                    name: name.to_string(),
                    reason: format!(
                        "{} exceeds the maximum of {} seconds",
                        secs, MAX_CONFIGURED_DURATION_SECS
                    ),
                }
                .into());
            }
        }

        if let (Some(min), Some(max)) = (
            self.min_duration_per_ack_extension_secs,
            self.max_duration_per_ack_extension_secs,
        ) {
            if min > max {
                return Err(ValidationError::InvalidDuration {
                    name: "min_duration_per_ack_extension_secs".to_string(),
                    reason: format!("{} is greater than the maximum {}", min, max),
                }
                .into());
            }
        }

        if self.flow_control.max_outstanding_element_count == Some(0)
            || self.flow_control.max_outstanding_request_bytes == Some(0)
        {
            return Err(ValidationError::InvalidParameter {
                name: "flow_control".to_string(),
                reason: "limits must be positive or unset".to_string(),
            }
            .into());
        }

        if self.retry.max_attempts == 0 {
            return Err(ValidationError::InvalidParameter {
                name: "retry.max_attempts".to_string(),
                reason: "must be at least 1".to_string(),
            }
            .into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::flow_control::LimitExceededBehavior;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = SubscriberConfig::new("projects/p/subscriptions/sub");
        assert_eq!(config.parallel_pull_count, 1);
        assert_eq!(config.max_ack_extension_period(), Duration::from_secs(3600));
        assert_eq!(config.flow_control.max_outstanding_element_count, Some(1000));
        assert_eq!(config.shutdown.mode, ShutdownMode::WaitForProcessing);
        assert_eq!(config.shutdown.timeout(), None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_shutdown_timeout_semantics() {
        assert_eq!(ShutdownSettings::nack_immediately(Duration::ZERO).timeout(), Some(Duration::ZERO));
        assert_eq!(
            ShutdownSettings::wait_for_processing(Some(Duration::from_secs(3))).timeout(),
            Some(Duration::from_secs(3))
        );
        assert_eq!(ShutdownSettings::wait_for_processing(None).timeout(), None);
    }

    #[test]
    fn test_retry_backoff_is_capped() {
        let retry = RetrySettings::default();
        assert_eq!(retry.backoff(0), Duration::from_millis(100));
        assert_eq!(retry.backoff(1), Duration::from_millis(200));
        assert_eq!(retry.backoff(3), Duration::from_millis(800));
        assert_eq!(retry.backoff(20), Duration::from_millis(10_000));
    }

    #[test]
    fn test_validation_rejects_bad_settings() {
        let mut config = SubscriberConfig::new("bad");
        assert!(config.validate().is_err());

        config.subscription = "projects/p/subscriptions/sub".to_string();
        config.parallel_pull_count = 0;
        assert!(config.validate().is_err());

        config.parallel_pull_count = 2;
        config.min_duration_per_ack_extension_secs = Some(120);
        config.max_duration_per_ack_extension_secs = Some(30);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_oversized_durations() {
        let mut config = SubscriberConfig::new("projects/p/subscriptions/sub");
        config.max_ack_extension_period_secs = u64::MAX;
        assert!(matches!(
            config.validate(),
            Err(crate::Error::Validation(ValidationError::InvalidDuration { .. }))
        ));

        config.max_ack_extension_period_secs = MAX_CONFIGURED_DURATION_SECS;
        assert!(config.validate().is_ok());

        config.max_duration_per_ack_extension_secs = Some(MAX_CONFIGURED_DURATION_SECS + 1);
        assert!(config.validate().is_err());

        config.max_duration_per_ack_extension_secs = None;
        config.min_duration_per_ack_extension_secs = Some(u64::MAX);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
subscription = "projects/p/subscriptions/from-file"
parallel_pull_count = 3

[flow_control]
max_outstanding_element_count = 50
limit_exceeded_behavior = "block"

[shutdown]
mode = "nack_immediately"
timeout_ms = 0
"#
        )
        .unwrap();

        let config = SubscriberConfig::from_file(file.path()).unwrap();
        assert_eq!(config.subscription, "projects/p/subscriptions/from-file");
        assert_eq!(config.parallel_pull_count, 3);
        assert_eq!(config.flow_control.max_outstanding_element_count, Some(50));
        assert_eq!(config.flow_control.max_outstanding_request_bytes, Some(100 * 1024 * 1024));
        assert_eq!(config.flow_control.limit_exceeded_behavior, LimitExceededBehavior::Block);
        assert_eq!(config.shutdown.mode, ShutdownMode::NackImmediately);
        assert_eq!(config.retry, RetrySettings::default());
        config.validate().unwrap();
    }

    #[test]
    fn test_toml_round_trip_of_defaults() {
        let config = SubscriberConfig::new("projects/p/subscriptions/sub");
        let text = config.to_toml().unwrap();
        let parsed = SubscriberConfig::from_toml(&text).unwrap();
        assert_eq!(parsed.subscription, config.subscription);
        assert_eq!(parsed.shutdown, config.shutdown);
    }
}
