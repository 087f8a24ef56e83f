use crate::protocol::{ConnectionProperties, PresenceUpdate};
use std::fmt;
use std::time::Duration;

/// Default REST base URL (API v10)
pub const DEFAULT_API_BASE: &str = "https://discord.com/api/v10";

/// Default gateway protocol version
pub const DEFAULT_GATEWAY_VERSION: u8 = 10;

/// Configuration for a gateway cluster
#[derive(Clone)]
pub struct ClusterConfig {
    /// Bot token sent in Identify/Resume
    pub token: String,
    /// Gateway intents bitmask
    pub intents: u64,
    /// Upper bound on identify concurrency (the platform value is used if lower)
    pub max_concurrency: Option<u32>,
    /// Gateway protocol version (`v` query parameter)
    pub gateway_version: u8,
    /// Member count above which guilds are sent without offline members
    pub large_threshold: u32,
    /// Client properties sent in Identify
    pub properties: ConnectionProperties,
    /// Initial presence sent in Identify
    pub presence: Option<PresenceUpdate>,
    /// Connection-related settings
    pub connection: ConnectionConfig,
    /// Backoff settings for failed connection cycles
    pub backoff: BackoffConfig,
    /// Heartbeat settings
    pub heartbeat: HeartbeatConfig,
    /// Minimum spacing between identify batches
    pub startup_window: Duration,
    /// Lower bound of the random wait after an invalid session
    pub invalid_session_min_delay: Duration,
    /// Upper bound of the random wait after an invalid session
    pub invalid_session_max_delay: Duration,
}

impl fmt::Debug for ClusterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterConfig")
            .field("token", &"[redacted]")
            .field("intents", &self.intents)
            .field("max_concurrency", &self.max_concurrency)
            .field("gateway_version", &self.gateway_version)
            .field("large_threshold", &self.large_threshold)
            .field("properties", &self.properties)
            .field("presence", &self.presence)
            .field("connection", &self.connection)
            .field("backoff", &self.backoff)
            .field("heartbeat", &self.heartbeat)
            .field("startup_window", &self.startup_window)
            .field("invalid_session_min_delay", &self.invalid_session_min_delay)
            .field("invalid_session_max_delay", &self.invalid_session_max_delay)
            .finish()
    }
}

impl ClusterConfig {
    /// Create a new builder for configuration
    pub fn builder(token: impl Into<String>) -> ClusterConfigBuilder {
        ClusterConfigBuilder {
            config: ClusterConfig {
                token: token.into(),
                intents: 0,
                max_concurrency: None,
                gateway_version: DEFAULT_GATEWAY_VERSION,
                large_threshold: 50,
                properties: ConnectionProperties::default(),
                presence: None,
                connection: ConnectionConfig::default(),
                backoff: BackoffConfig::default(),
                heartbeat: HeartbeatConfig::default(),
                // 5s identify window plus a guard band
                startup_window: Duration::from_millis(5500),
                invalid_session_min_delay: Duration::from_secs(1),
                invalid_session_max_delay: Duration::from_secs(5),
            },
        }
    }
}

/// Builder for ClusterConfig
#[derive(Debug, Clone)]
pub struct ClusterConfigBuilder {
    config: ClusterConfig,
}

impl ClusterConfigBuilder {
    /// Set the gateway intents bitmask
    pub fn intents(mut self, intents: u64) -> Self {
        self.config.intents = intents;
        self
    }

    /// Cap identify concurrency below the platform-recommended value
    pub fn max_concurrency(mut self, max: u32) -> Self {
        self.config.max_concurrency = Some(max);
        self
    }

    /// Set the gateway protocol version
    pub fn gateway_version(mut self, version: u8) -> Self {
        self.config.gateway_version = version;
        self
    }

    /// Set the large guild threshold
    pub fn large_threshold(mut self, threshold: u32) -> Self {
        self.config.large_threshold = threshold;
        self
    }

    /// Set the client properties sent in Identify
    pub fn properties(mut self, properties: ConnectionProperties) -> Self {
        self.config.properties = properties;
        self
    }

    /// Set the presence sent in Identify
    pub fn presence(mut self, presence: PresenceUpdate) -> Self {
        self.config.presence = Some(presence);
        self
    }

    /// Set connection configuration
    pub fn connection(mut self, config: ConnectionConfig) -> Self {
        self.config.connection = config;
        self
    }

    /// Set backoff configuration
    pub fn backoff(mut self, config: BackoffConfig) -> Self {
        self.config.backoff = config;
        self
    }

    /// Set heartbeat configuration
    pub fn heartbeat(mut self, config: HeartbeatConfig) -> Self {
        self.config.heartbeat = config;
        self
    }

    /// Set the identify batch window
    pub fn startup_window(mut self, window: Duration) -> Self {
        self.config.startup_window = window;
        self
    }

    /// Set the random wait range applied after an invalid session
    pub fn invalid_session_delay(mut self, min: Duration, max: Duration) -> Self {
        self.config.invalid_session_min_delay = min;
        self.config.invalid_session_max_delay = max;
        self
    }

    /// Build the configuration with validation.
    ///
    /// Returns an error for invalid configurations (e.g., empty token).
    pub fn build(self) -> Result<ClusterConfig, ConfigError> {
        if self.config.token.trim().is_empty() {
            return Err(ConfigError::MissingToken);
        }

        self.config.backoff.validate()?;

        if let Some(0) = self.config.max_concurrency {
            return Err(ConfigError::InvalidConcurrency(
                "max_concurrency cannot be 0".to_string(),
            ));
        }

        if self.config.heartbeat.poll_interval.is_zero() {
            return Err(ConfigError::InvalidHeartbeat(
                "poll_interval must be > 0".to_string(),
            ));
        }

        if self.config.invalid_session_min_delay > self.config.invalid_session_max_delay {
            return Err(ConfigError::InvalidDelay(
                "invalid_session_min_delay must be <= invalid_session_max_delay".to_string(),
            ));
        }

        Ok(self.config)
    }
}

/// Configuration for the REST client
#[derive(Clone)]
pub struct RestConfig {
    /// Bot token; a `Bot ` prefix is added when missing
    pub token: String,
    /// Versioned API base URL, without a trailing slash
    pub base_url: String,
    /// User-Agent header value
    pub user_agent: String,
    /// Bound on the total latency of one call, retries included
    pub timeout: Duration,
    /// How many times a call waits out an exhausted bucket before failing
    pub max_ratelimit_retries: u32,
}

impl fmt::Debug for RestConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestConfig")
            .field("token", &"[redacted]")
            .field("base_url", &self.base_url)
            .field("user_agent", &self.user_agent)
            .field("timeout", &self.timeout)
            .field("max_ratelimit_retries", &self.max_ratelimit_retries)
            .finish()
    }
}

impl RestConfig {
    /// Create a new builder for configuration
    pub fn builder(token: impl Into<String>) -> RestConfigBuilder {
        RestConfigBuilder {
            config: RestConfig {
                token: token.into(),
                base_url: DEFAULT_API_BASE.to_string(),
                user_agent: format!(
                    "DiscordBot (gateway-cluster, {})",
                    env!("CARGO_PKG_VERSION")
                ),
                timeout: Duration::from_secs(10),
                max_ratelimit_retries: 3,
            },
        }
    }
}

/// Builder for RestConfig
#[derive(Debug, Clone)]
pub struct RestConfigBuilder {
    config: RestConfig,
}

impl RestConfigBuilder {
    /// Set the API base URL
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.config.base_url = url.into();
        self
    }

    /// Set the User-Agent header
    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.config.user_agent = agent.into();
        self
    }

    /// Set the total-call timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Set the bucket-exhaustion retry cap
    pub fn max_ratelimit_retries(mut self, retries: u32) -> Self {
        self.config.max_ratelimit_retries = retries;
        self
    }

    /// Build the configuration with validation.
    pub fn build(mut self) -> Result<RestConfig, ConfigError> {
        if self.config.token.trim().is_empty() {
            return Err(ConfigError::MissingToken);
        }

        url::Url::parse(&self.config.base_url)
            .map_err(|e| ConfigError::InvalidUrl(format!("{}: {}", self.config.base_url, e)))?;

        if self.config.timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout("timeout must be > 0".to_string()));
        }

        while self.config.base_url.ends_with('/') {
            self.config.base_url.pop();
        }

        Ok(self.config)
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// No token configured
    #[error("A bot token is required")]
    MissingToken,
    /// Token contains characters not allowed in a header
    #[error("Token is not a valid header value")]
    InvalidToken,
    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    /// Invalid backoff configuration
    #[error("Invalid backoff configuration: {0}")]
    InvalidBackoff(String),
    /// Invalid heartbeat configuration
    #[error("Invalid heartbeat configuration: {0}")]
    InvalidHeartbeat(String),
    /// Invalid concurrency limit
    #[error("Invalid concurrency: {0}")]
    InvalidConcurrency(String),
    /// Invalid delay range
    #[error("Invalid delay: {0}")]
    InvalidDelay(String),
    /// Invalid timeout
    #[error("Invalid timeout: {0}")]
    InvalidTimeout(String),
}

/// Connection-related configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Timeout for establishing a connection (TCP, TLS and WebSocket handshake)
    pub connect_timeout: Duration,
    /// Upper bound on a close handshake before the socket is dropped
    pub disconnect_timeout: Duration,
    /// Low-latency mode: disable panic protection for event handlers.
    /// When enabled, handler panics will crash the shard task.
    pub low_latency_mode: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            disconnect_timeout: Duration::from_secs(5),
            low_latency_mode: false, // Safe by default
        }
    }
}

/// Backoff configuration for connection cycles that never reach Open
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Initial delay before the first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (typically 2.0)
    pub multiplier: f64,
    /// Whether to add random jitter to delays
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true, // Full jitter
        }
    }
}

impl BackoffConfig {
    /// Calculate the delay for a given attempt number (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay = self.initial_delay.as_millis() as f64
            * self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let capped_delay = base_delay.min(self.max_delay.as_millis() as f64);

        if self.jitter {
            // Full jitter: random value between 0 and capped_delay
            let jittered = rand::random::<f64>() * capped_delay;
            Duration::from_millis(jittered as u64)
        } else {
            Duration::from_millis(capped_delay as u64)
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_delay < self.initial_delay {
            return Err(ConfigError::InvalidBackoff(
                "max_delay must be >= initial_delay".to_string(),
            ));
        }

        if self.multiplier <= 0.0 {
            return Err(ConfigError::InvalidBackoff(
                "multiplier must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Heartbeat configuration
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// How often a shard checks whether a heartbeat is due
    pub poll_interval: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_until_cap() {
        let config = BackoffConfig {
            jitter: false,
            ..BackoffConfig::default()
        };

        let delays: Vec<u64> = (0..8)
            .map(|attempt| config.delay_for_attempt(attempt).as_millis() as u64)
            .collect();
        assert_eq!(delays, [500, 1000, 2000, 4000, 8000, 16000, 30000, 30000]);
        assert_eq!(config.delay_for_attempt(u32::MAX), config.max_delay);
    }

    #[test]
    fn test_backoff_jitter_stays_under_cap() {
        let config = BackoffConfig::default();

        for attempt in 0..12 {
            let ceiling = config.max_delay.min(Duration::from_millis(500 << attempt.min(10)));
            assert!(config.delay_for_attempt(attempt) <= ceiling);
        }
    }

    #[test]
    fn test_cluster_config_defaults() {
        let config = ClusterConfig::builder("token")
            .intents(1 << 9)
            .build()
            .expect("valid config");

        assert_eq!(config.intents, 1 << 9);
        assert_eq!(config.gateway_version, 10);
        assert_eq!(config.large_threshold, 50);
        assert_eq!(config.startup_window, Duration::from_millis(5500));
        assert_eq!(config.invalid_session_min_delay, Duration::from_secs(1));
        assert_eq!(config.invalid_session_max_delay, Duration::from_secs(5));
    }

    #[test]
    fn test_cluster_config_rejects_bad_values() {
        assert!(matches!(
            ClusterConfig::builder("  ").build(),
            Err(ConfigError::MissingToken)
        ));
        assert!(ClusterConfig::builder("t").max_concurrency(0).build().is_err());
        assert!(ClusterConfig::builder("t")
            .invalid_session_delay(Duration::from_secs(5), Duration::from_secs(1))
            .build()
            .is_err());
    }

    #[test]
    fn test_token_is_redacted_in_debug() {
        let config = ClusterConfig::builder("secret-token").build().expect("valid config");
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("secret-token"));

        let rest = RestConfig::builder("secret-token").build().expect("valid config");
        assert!(!format!("{:?}", rest).contains("secret-token"));
    }

    #[test]
    fn test_rest_config_trims_base_url() {
        let config = RestConfig::builder("t")
            .base_url("http://localhost:8080/api/v10/")
            .build()
            .expect("valid config");

        assert_eq!(config.base_url, "http://localhost:8080/api/v10");
        assert_eq!(config.timeout, Duration::from_secs(10));
        assert_eq!(config.max_ratelimit_retries, 3);
    }

    #[test]
    fn test_rest_config_rejects_invalid_url() {
        assert!(RestConfig::builder("t").base_url("not a url").build().is_err());
    }
}
