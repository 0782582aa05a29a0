use std::str::FromStr;
use std::time;

use envconfig::Envconfig;
use queue_consumer::{BackoffConfig, SubscriberConfig};

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    #[envconfig(from = "QUEUE_URL")]
    pub queue_url: NonEmptyString,

    /// Overrides the SQS endpoint, e.g. to point at a local emulator.
    #[envconfig(from = "SQS_ENDPOINT_URL")]
    pub sqs_endpoint_url: Option<NonEmptyString>,

    #[envconfig(from = "MAX_MESSAGES_PER_BATCH", default = "10")]
    pub max_messages_per_batch: u32,

    #[envconfig(from = "WAIT_TIME_SECONDS", default = "10")]
    pub wait_time_seconds: u64,

    #[envconfig(from = "VISIBILITY_TIMEOUT_SECONDS", default = "30")]
    pub visibility_timeout_seconds: u64,

    #[envconfig(from = "NUM_CONSUMERS", default = "3")]
    pub num_consumers: usize,

    #[envconfig(nested = true)]
    pub backoff: BackoffEnvConfig,

    /// 0 leaves message handlers unbounded.
    #[envconfig(from = "MAX_CONCURRENT_HANDLERS", default = "0")]
    pub max_concurrent_handlers: usize,

    /// Terminate on the first receive error instead of logging it and retrying.
    #[envconfig(from = "FAIL_ON_TRANSPORT_ERROR", default = "true")]
    pub fail_on_transport_error: bool,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn subscriber_config(&self) -> SubscriberConfig {
        SubscriberConfig::new(self.queue_url.as_str())
            .max_messages_per_batch(self.max_messages_per_batch)
            .wait_time(time::Duration::from_secs(self.wait_time_seconds))
            .visibility_timeout(time::Duration::from_secs(self.visibility_timeout_seconds))
            .num_consumers(self.num_consumers)
            .backoff(self.backoff.backoff_config())
    }

    pub fn max_concurrent_handlers(&self) -> Option<usize> {
        (self.max_concurrent_handlers > 0).then_some(self.max_concurrent_handlers)
    }
}

#[derive(Envconfig, Clone)]
pub struct BackoffEnvConfig {
    #[envconfig(from = "BACKOFF_MIN", default = "1000")]
    pub min: EnvMsDuration,

    #[envconfig(from = "BACKOFF_MAX", default = "30000")]
    pub max: EnvMsDuration,

    #[envconfig(from = "BACKOFF_FACTOR", default = "1.0")]
    pub factor: f64,

    #[envconfig(from = "BACKOFF_JITTER", default = "true")]
    pub jitter: bool,
}

impl BackoffEnvConfig {
    pub fn backoff_config(&self) -> BackoffConfig {
        BackoffConfig {
            min: self.min.0,
            max: self.max.0,
            factor: self.factor,
            jitter: self.jitter,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(vars: &[(&str, &str)]) -> HashMap<String, String> {
        vars.iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = Config::init_from_hashmap(&env(&[("QUEUE_URL", "http://sqs/jobs")])).unwrap();

        assert_eq!(config.bind(), "0.0.0.0:3302");
        assert!(config.sqs_endpoint_url.is_none());
        assert!(config.fail_on_transport_error);
        assert_eq!(config.max_concurrent_handlers(), None);

        let subscriber = config.subscriber_config();
        assert_eq!(subscriber.queue_url, "http://sqs/jobs");
        assert_eq!(subscriber.max_messages_per_batch, 10);
        assert_eq!(subscriber.wait_time, time::Duration::from_secs(10));
        assert_eq!(subscriber.visibility_timeout, time::Duration::from_secs(30));
        assert_eq!(subscriber.num_consumers, 3);
        assert_eq!(subscriber.backoff, BackoffConfig::default());
    }

    #[test]
    fn test_overrides() {
        let config = Config::init_from_hashmap(&env(&[
            ("QUEUE_URL", "http://sqs/jobs"),
            ("SQS_ENDPOINT_URL", "http://localhost:4566"),
            ("NUM_CONSUMERS", "8"),
            ("BACKOFF_MIN", "250"),
            ("BACKOFF_MAX", "4000"),
            ("BACKOFF_FACTOR", "2"),
            ("BACKOFF_JITTER", "false"),
            ("MAX_CONCURRENT_HANDLERS", "16"),
            ("FAIL_ON_TRANSPORT_ERROR", "false"),
        ]))
        .unwrap();

        assert_eq!(
            config.sqs_endpoint_url.as_ref().map(NonEmptyString::as_str),
            Some("http://localhost:4566")
        );
        assert_eq!(config.max_concurrent_handlers(), Some(16));
        assert!(!config.fail_on_transport_error);

        let subscriber = config.subscriber_config();
        assert_eq!(subscriber.num_consumers, 8);
        assert_eq!(
            subscriber.backoff,
            BackoffConfig {
                min: time::Duration::from_millis(250),
                max: time::Duration::from_secs(4),
                factor: 2.0,
                jitter: false,
            }
        );
    }

    #[test]
    fn test_queue_url_is_required() {
        assert!(Config::init_from_hashmap(&env(&[])).is_err());
        assert!(Config::init_from_hashmap(&env(&[("QUEUE_URL", "")])).is_err());
    }
}
