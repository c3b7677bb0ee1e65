use std::collections::BTreeMap;
use std::time::Duration;

use rand::Rng;

use crate::naming::Naming;

/// Configuration for a storage adapter
#[derive(Debug, Clone)]
pub struct GridFsConfig {
    /// How each upload is named
    pub naming: Naming,

    /// Retry policy for failed connection attempts
    pub reconnect: ReconnectPolicy,

    /// What to do with uploads that arrive before the handle is ready
    pub queue_policy: QueuePolicy,

    /// Start resolving the handle at construction instead of on first use
    pub connect_eagerly: bool,
}

impl Default for GridFsConfig {
    fn default() -> Self {
        Self {
            naming: Naming::Default,
            reconnect: ReconnectPolicy::default(),
            queue_policy: QueuePolicy::Buffer,
            connect_eagerly: true,
        }
    }
}

impl GridFsConfig {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the naming strategy
    pub fn with_naming(mut self, naming: Naming) -> Self {
        self.naming = naming;
        self
    }

    /// Set the reconnect policy
    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Reject uploads immediately while not connected
    pub fn fail_fast(mut self) -> Self {
        self.queue_policy = QueuePolicy::FailFast;
        self
    }

    /// Defer connecting until the first upload or `ready()` call
    pub fn connect_lazily(mut self) -> Self {
        self.connect_eagerly = false;
        self
    }
}

/// Handling of uploads submitted while the handle is not ready
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueuePolicy {
    /// Hold uploads and replay them in arrival order once connected
    #[default]
    Buffer,
    /// Fail uploads with a connection error
    FailFast,
}

/// Bounded retries for connection attempts
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub enabled: bool,

    /// Total attempts, including the first one
    pub max_attempts: u32,

    pub base_backoff: Duration,
    pub max_backoff: Duration,

    /// Add up to a quarter of the computed delay at random
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            max_attempts: 1,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl ReconnectPolicy {
    /// A single attempt, failure is terminal
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Retry up to `max_attempts` attempts in total
    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            enabled: true,
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.base_backoff = base;
        self.max_backoff = max.max(base);
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Whether another attempt may follow attempt number `attempt` (1-based)
    pub fn allows_retry_after(&self, attempt: u32) -> bool {
        self.enabled && attempt < self.max_attempts
    }

    /// Delay before the attempt following `attempt`, exponential and capped
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self
            .base_backoff
            .saturating_mul(2_u32.pow(exp))
            .min(self.max_backoff);

        if self.jitter && !delay.is_zero() {
            let extra = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 4);
            delay + Duration::from_millis(extra)
        } else {
            delay
        }
    }
}

/// Raw parameters for opening a store connection. Interpreted by the connector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    pub url: String,
    pub database: Option<String>,
    pub options: BTreeMap<String, String>,
}

impl ConnectionParams {
    pub fn new<S: Into<String>>(url: S) -> Self {
        Self {
            url: url.into(),
            database: None,
            options: BTreeMap::new(),
        }
    }

    /// Read `GRIDFS_URL` and the optional `GRIDFS_DATABASE`
    pub fn from_env() -> Option<Self> {
        let url = std::env::var("GRIDFS_URL").ok()?;
        let mut params = Self::new(url);
        params.database = std::env::var("GRIDFS_DATABASE").ok();
        Some(params)
    }

    pub fn with_database<S: Into<String>>(mut self, database: S) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn with_option<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GridFsConfig::default();
        assert_eq!(config.queue_policy, QueuePolicy::Buffer);
        assert!(config.connect_eagerly);
        assert!(!config.reconnect.enabled);
        assert!(!config.reconnect.allows_retry_after(1));
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = ReconnectPolicy::attempts(10)
            .with_backoff(Duration::from_millis(100), Duration::from_millis(500))
            .without_jitter();

        assert_eq!(policy.backoff_for(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(400));
        assert_eq!(policy.backoff_for(4), Duration::from_millis(500));
        assert_eq!(policy.backoff_for(40), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_within_a_quarter() {
        let policy = ReconnectPolicy::attempts(3)
            .with_backoff(Duration::from_millis(400), Duration::from_secs(1));

        for _ in 0..50 {
            let delay = policy.backoff_for(1);
            assert!(delay >= Duration::from_millis(400));
            assert!(delay <= Duration::from_millis(500));
        }
    }

    #[test]
    fn test_retry_budget() {
        let policy = ReconnectPolicy::attempts(3);
        assert!(policy.allows_retry_after(1));
        assert!(policy.allows_retry_after(2));
        assert!(!policy.allows_retry_after(3));
    }
}
