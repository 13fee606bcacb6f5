use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use envconfig::Envconfig;
use thiserror::Error;

use crate::retry::RetryPolicy;

pub const DEFAULT_AMQP_PORT: u16 = 5672;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("at least one broker must be configured")]
    NoBrokers,
    #[error("invalid broker address '{0}', expected host[:port]")]
    InvalidBroker(String),
    #[error("thread_pool_size must be a positive integer")]
    EmptyThreadPool,
    #[error("initial_connect_attempts must be at least 1")]
    NoConnectAttempts,
    #[error("reconnect_min_backoff_ms must be greater than zero")]
    ZeroBackoff,
    #[error("reconnect_min_backoff_ms ({min}) is greater than reconnect_max_backoff_ms ({max})")]
    InvertedBackoff { min: u64, max: u64 },
    #[error("reconnect_backoff_coefficient must be at least 1")]
    InvalidCoefficient,
}

/// A single broker endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Broker {
    pub host: String,
    pub port: u16,
}

impl Broker {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_owned(),
            port,
        }
    }
}

impl fmt::Display for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Broker {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || ConfigError::InvalidBroker(s.to_owned());
        let (host, port) = match s.rsplit_once(':') {
            Some((host, port)) => (host, port.parse::<u16>().map_err(|_| invalid())?),
            None => (s, DEFAULT_AMQP_PORT),
        };
        if host.is_empty() || host.contains('/') {
            return Err(invalid());
        }
        Ok(Broker::new(host, port))
    }
}

/// Comma separated list of brokers, tried round-robin on each connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerList(pub Vec<Broker>);

impl BrokerList {
    /// Broker to use for a zero-based attempt number.
    pub fn for_attempt(&self, attempt: u32) -> Option<&Broker> {
        if self.0.is_empty() {
            return None;
        }
        self.0.get(attempt as usize % self.0.len())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromStr for BrokerList {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let brokers = s
            .split(',')
            .filter(|part| !part.trim().is_empty())
            .map(Broker::from_str)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(BrokerList(brokers))
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct RmqConfig {
    #[envconfig(from = "RMQ_BROKERS", default = "localhost:5672")]
    pub brokers: BrokerList,

    #[envconfig(from = "RMQ_USER_NAME", default = "guest")]
    pub user_name: String,

    #[envconfig(from = "RMQ_PASSWORD", default = "guest")]
    pub password: String,

    #[envconfig(from = "RMQ_VIRTUAL_HOST", default = "/")]
    pub virtual_host: String,

    #[envconfig(from = "RMQ_SECURE", default = "false")]
    pub secure: bool,

    #[envconfig(from = "RMQ_CONNECTION_NAME", default = "rabbitmq-actors")]
    pub connection_name: String,

    #[envconfig(from = "RMQ_THREAD_POOL_SIZE", default = "10")]
    pub thread_pool_size: usize,

    #[envconfig(from = "RMQ_INITIAL_CONNECT_ATTEMPTS", default = "3")]
    pub initial_connect_attempts: u32,

    #[envconfig(from = "RMQ_CONNECT_TIMEOUT_MS", default = "5000")]
    pub connect_timeout_ms: u64,

    #[envconfig(from = "RMQ_HEARTBEAT_SECS", default = "30")]
    pub heartbeat_secs: u16,

    #[envconfig(from = "RMQ_RECONNECT_MIN_BACKOFF_MS", default = "500")]
    pub reconnect_min_backoff_ms: u64,

    #[envconfig(from = "RMQ_RECONNECT_MAX_BACKOFF_MS", default = "30000")]
    pub reconnect_max_backoff_ms: u64,

    #[envconfig(from = "RMQ_RECONNECT_BACKOFF_COEFFICIENT", default = "2")]
    pub reconnect_backoff_coefficient: u32,

    #[envconfig(from = "RMQ_RECONNECT_JITTER", default = "true")]
    pub reconnect_jitter: bool,

    // Unset means we never give up, backoff stays capped at reconnect_max_backoff_ms
    #[envconfig(from = "RMQ_RECONNECT_MAX_ATTEMPTS")]
    pub reconnect_max_attempts: Option<u32>,

    #[envconfig(from = "RMQ_SHUTDOWN_GRACE_PERIOD_MS", default = "10000")]
    pub shutdown_grace_period_ms: u64,
}

impl Default for RmqConfig {
    fn default() -> Self {
        Self {
            brokers: BrokerList(vec![Broker::new("localhost", DEFAULT_AMQP_PORT)]),
            user_name: "guest".to_owned(),
            password: "guest".to_owned(),
            virtual_host: "/".to_owned(),
            secure: false,
            connection_name: "rabbitmq-actors".to_owned(),
            thread_pool_size: 10,
            initial_connect_attempts: 3,
            connect_timeout_ms: 5000,
            heartbeat_secs: 30,
            reconnect_min_backoff_ms: 500,
            reconnect_max_backoff_ms: 30000,
            reconnect_backoff_coefficient: 2,
            reconnect_jitter: true,
            reconnect_max_attempts: None,
            shutdown_grace_period_ms: 10000,
        }
    }
}

impl RmqConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.brokers.is_empty() {
            return Err(ConfigError::NoBrokers);
        }
        if self.thread_pool_size == 0 {
            return Err(ConfigError::EmptyThreadPool);
        }
        if self.initial_connect_attempts == 0 {
            return Err(ConfigError::NoConnectAttempts);
        }
        if self.reconnect_min_backoff_ms == 0 {
            return Err(ConfigError::ZeroBackoff);
        }
        if self.reconnect_min_backoff_ms > self.reconnect_max_backoff_ms {
            return Err(ConfigError::InvertedBackoff {
                min: self.reconnect_min_backoff_ms,
                max: self.reconnect_max_backoff_ms,
            });
        }
        if self.reconnect_backoff_coefficient == 0 {
            return Err(ConfigError::InvalidCoefficient);
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_period_ms)
    }

    /// Backoff used between initial connection attempts and between reconnects.
    pub fn retry_policy(&self) -> RetryPolicy {
        let mut builder = RetryPolicy::build(
            self.reconnect_backoff_coefficient,
            Duration::from_millis(self.reconnect_min_backoff_ms),
        )
        .maximum_interval(Duration::from_millis(self.reconnect_max_backoff_ms))
        .jitter(self.reconnect_jitter);
        if let Some(attempts) = self.reconnect_max_attempts {
            builder = builder.maximum_attempts(attempts);
        }
        builder.provide()
    }
}

/// Settings of the `rmq-actors` host binary, wrapping the connection settings.
#[derive(Envconfig, Clone, Debug)]
pub struct HostConfig {
    #[envconfig(nested = true)]
    pub rmq: RmqConfig,

    // Prometheus scrape port, no exporter is installed when unset
    #[envconfig(from = "METRICS_PORT")]
    pub metrics_port: Option<u16>,

    #[envconfig(from = "HEALTH_PROBE_INTERVAL_SECS", default = "15")]
    pub health_probe_interval_secs: u64,
}

impl HostConfig {
    pub fn health_probe_interval(&self) -> Duration {
        Duration::from_secs(self.health_probe_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_parses_broker_list() {
        let brokers: BrokerList = "rmq-0:5673, rmq-1 ,rmq-2:5674,".parse().unwrap();
        assert_eq!(
            brokers.0,
            vec![
                Broker::new("rmq-0", 5673),
                Broker::new("rmq-1", DEFAULT_AMQP_PORT),
                Broker::new("rmq-2", 5674),
            ]
        );
        assert_eq!(brokers.for_attempt(0), Some(&Broker::new("rmq-0", 5673)));
        assert_eq!(brokers.for_attempt(4), Some(&Broker::new("rmq-1", 5672)));
    }

    #[test]
    fn test_rejects_bad_broker() {
        assert_eq!(
            "rmq-0:notaport".parse::<BrokerList>(),
            Err(ConfigError::InvalidBroker("rmq-0:notaport".to_string()))
        );
        assert!(":5672".parse::<Broker>().is_err());
    }

    #[test]
    fn test_loads_from_env_map() {
        let env = HashMap::from([
            ("RMQ_BROKERS".to_string(), "a:1,b:2".to_string()),
            ("RMQ_THREAD_POOL_SIZE".to_string(), "4".to_string()),
            ("RMQ_RECONNECT_MAX_ATTEMPTS".to_string(), "7".to_string()),
        ]);
        let config = RmqConfig::init_from_hashmap(&env).unwrap();

        assert_eq!(config.brokers.len(), 2);
        assert_eq!(config.thread_pool_size, 4);
        assert_eq!(config.reconnect_max_attempts, Some(7));
        assert_eq!(config.user_name, "guest");
        assert_eq!(config.virtual_host, "/");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_defaults_match_env_defaults() {
        let config = RmqConfig::init_from_hashmap(&HashMap::new()).unwrap();
        let default = RmqConfig::default();

        assert_eq!(config.brokers, default.brokers);
        assert_eq!(config.thread_pool_size, default.thread_pool_size);
        assert_eq!(config.reconnect_max_attempts, None);
        assert_eq!(config.shutdown_grace_period(), default.shutdown_grace_period());
    }

    #[test]
    fn test_host_config_nests_rmq_config() {
        let env = HashMap::from([
            ("RMQ_BROKERS".to_string(), "rmq-0".to_string()),
            ("METRICS_PORT".to_string(), "9102".to_string()),
        ]);
        let config = HostConfig::init_from_hashmap(&env).unwrap();

        assert_eq!(config.rmq.brokers.0, vec![Broker::new("rmq-0", 5672)]);
        assert_eq!(config.metrics_port, Some(9102));
        assert_eq!(config.health_probe_interval(), Duration::from_secs(15));
    }

    #[test]
    fn test_validation() {
        let valid = RmqConfig::default();
        assert!(valid.validate().is_ok());

        let config = RmqConfig {
            thread_pool_size: 0,
            ..RmqConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::EmptyThreadPool));

        let config = RmqConfig {
            brokers: BrokerList(vec![]),
            ..RmqConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::NoBrokers));

        let config = RmqConfig {
            reconnect_min_backoff_ms: 10,
            reconnect_max_backoff_ms: 5,
            ..RmqConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvertedBackoff { min: 10, max: 5 })
        );

        let config = RmqConfig {
            initial_connect_attempts: 0,
            ..RmqConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::NoConnectAttempts));
    }

    #[test]
    fn test_retry_policy_follows_config() {
        let config = RmqConfig {
            reconnect_min_backoff_ms: 100,
            reconnect_max_backoff_ms: 300,
            reconnect_jitter: false,
            reconnect_max_attempts: Some(3),
            ..RmqConfig::default()
        };
        let policy = config.retry_policy();

        assert_eq!(policy.retry_interval(1), Duration::from_millis(100));
        assert_eq!(policy.retry_interval(2), Duration::from_millis(200));
        assert_eq!(policy.retry_interval(3), Duration::from_millis(300));
        assert!(policy.allows_attempt(3));
        assert!(!policy.allows_attempt(4));
    }
}
