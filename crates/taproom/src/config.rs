//! Worker configuration.

use crate::backoff::BackoffPolicy;
use crate::context::WorkerIdentity;
use crate::dispatcher::DispatcherConfig;
use crate::error::{TaproomError, TaproomResult};
use crate::protocol::{queue_key, QueueKind};
use std::time::Duration;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// System served by this worker
    pub system: String,

    /// Concrete system version
    pub version: String,

    /// Instance name
    pub instance: String,

    /// Namespace the system is registered in
    pub namespace: String,

    /// Redis connection URL
    pub redis_url: String,

    /// Consumer group shared by all workers of this instance
    pub consumer_group: String,

    /// Base URL of the request API; `None` keeps requests in memory
    pub api_url: Option<String>,

    /// Per-call timeout for the request API
    pub api_timeout: Duration,

    /// Commands executing at once
    pub max_concurrent: usize,

    /// Accepted commands waiting for a pool slot
    pub queue_capacity: usize,

    /// How long a single broker read blocks
    pub block_timeout: Duration,

    /// Reconnect and status publishing retries
    pub backoff: BackoffPolicy,
}

impl WorkerConfig {
    /// Defaults overridden by `TAPROOM_*` and `REDIS_URL` environment
    /// variables.
    ///
    /// Unparseable numbers fall back to the default; numbers too large for
    /// their field are a [`TaproomError::Config`].
    pub fn new(system: impl Into<String>, version: impl Into<String>) -> TaproomResult<Self> {
        Self::from_lookup(system, version, |key| std::env::var(key).ok())
    }

    /// Like [`new`](Self::new) with an explicit variable lookup.
    pub fn from_lookup(
        system: impl Into<String>,
        version: impl Into<String>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> TaproomResult<Self> {
        let parsed = |key: &str| lookup(key).and_then(|v| v.parse::<u64>().ok());

        let defaults = BackoffPolicy::default();
        let backoff = BackoffPolicy::new(
            parsed("TAPROOM_STARTING_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.starting_timeout),
            parsed("TAPROOM_MAX_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.max_timeout),
            parsed("TAPROOM_MAX_ATTEMPTS")
                .map(|n| narrow("TAPROOM_MAX_ATTEMPTS", n))
                .transpose()?
                .unwrap_or(defaults.max_attempts),
        );
        let pool = DispatcherConfig::default();

        Ok(Self {
            system: system.into(),
            version: version.into(),
            instance: lookup("TAPROOM_INSTANCE").unwrap_or_else(|| "default".to_string()),
            namespace: lookup("TAPROOM_NAMESPACE").unwrap_or_else(|| "default".to_string()),
            redis_url: lookup("REDIS_URL").unwrap_or_else(|| "redis://127.0.0.1:6379".to_string()),
            consumer_group: lookup("TAPROOM_CONSUMER_GROUP")
                .unwrap_or_else(|| "taproom".to_string()),
            api_url: lookup("TAPROOM_API_URL"),
            api_timeout: Duration::from_secs(parsed("TAPROOM_API_TIMEOUT_SECS").unwrap_or(10)),
            max_concurrent: parsed("TAPROOM_MAX_CONCURRENT")
                .map(|n| narrow("TAPROOM_MAX_CONCURRENT", n))
                .transpose()?
                .unwrap_or(pool.max_concurrent),
            queue_capacity: parsed("TAPROOM_QUEUE_CAPACITY")
                .map(|n| narrow("TAPROOM_QUEUE_CAPACITY", n))
                .transpose()?
                .unwrap_or(pool.queue_capacity),
            block_timeout: Duration::from_millis(parsed("TAPROOM_BLOCK_MS").unwrap_or(1000)),
            backoff,
        })
    }

    pub fn validate(&self) -> TaproomResult<()> {
        for (field, value) in [
            ("system", &self.system),
            ("version", &self.version),
            ("instance", &self.instance),
            ("namespace", &self.namespace),
        ] {
            if value.trim().is_empty() {
                return Err(TaproomError::Config(format!("{field} must not be empty")));
            }
        }
        if self.version == crate::request::LATEST_VERSION {
            return Err(TaproomError::Config(
                "a worker must run a concrete version, not 'latest'".to_string(),
            ));
        }
        if self.block_timeout.is_zero() {
            return Err(TaproomError::Config(
                "block_timeout must be positive".to_string(),
            ));
        }
        self.dispatcher_config().validate()?;
        self.backoff.validate()
    }

    pub fn identity(&self) -> WorkerIdentity {
        WorkerIdentity::new(&self.system, &self.version, &self.instance, &self.namespace)
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            max_concurrent: self.max_concurrent,
            queue_capacity: self.queue_capacity,
        }
    }

    pub fn request_queue(&self) -> String {
        queue_key(&self.identity().target(), QueueKind::Request)
    }

    pub fn admin_queue(&self) -> String {
        queue_key(&self.identity().target(), QueueKind::Admin)
    }
}

fn narrow<T: TryFrom<u64>>(key: &str, value: u64) -> TaproomResult<T> {
    T::try_from(value).map_err(|_| TaproomError::Config(format!("{key}={value} is out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::from_lookup("echo", "1.0.0", lookup(&[])).unwrap();
        assert_eq!(config.instance, "default");
        assert_eq!(config.namespace, "default");
        assert_eq!(config.redis_url, "redis://127.0.0.1:6379");
        assert_eq!(config.max_concurrent, 5);
        assert_eq!(config.backoff, BackoffPolicy::default());
        assert!(config.api_url.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_environment_overrides() {
        let config = WorkerConfig::from_lookup(
            "echo",
            "1.0.0",
            lookup(&[
                ("TAPROOM_INSTANCE", "i2"),
                ("TAPROOM_MAX_CONCURRENT", "1"),
                ("TAPROOM_MAX_ATTEMPTS", "2"),
                ("TAPROOM_BLOCK_MS", "250"),
                ("REDIS_URL", "redis://redis:6379"),
            ]),
        )
        .unwrap();
        assert_eq!(config.instance, "i2");
        assert_eq!(config.max_concurrent, 1);
        assert_eq!(config.backoff.max_attempts, 2);
        assert_eq!(config.block_timeout, Duration::from_millis(250));
        assert_eq!(config.redis_url, "redis://redis:6379");
        assert_eq!(config.request_queue(), "taproom:default:echo:1.0.0:i2:request");
        assert_eq!(config.admin_queue(), "taproom:default:echo:1.0.0:i2:admin");
    }

    #[test]
    fn test_unparseable_numbers_fall_back() {
        let config =
            WorkerConfig::from_lookup("echo", "1.0.0", lookup(&[("TAPROOM_MAX_CONCURRENT", "lots")]))
                .unwrap();
        assert_eq!(config.max_concurrent, 5);
    }

    #[test]
    fn test_out_of_range_numbers_are_rejected() {
        let err = WorkerConfig::from_lookup(
            "echo",
            "1.0.0",
            lookup(&[("TAPROOM_MAX_ATTEMPTS", "4294967296")]),
        )
        .unwrap_err();
        assert!(matches!(err, TaproomError::Config(ref m) if m.contains("TAPROOM_MAX_ATTEMPTS")));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = WorkerConfig::from_lookup("echo", "latest", lookup(&[])).unwrap();
        assert!(config.validate().is_err());

        config.version = "1.0.0".into();
        config.max_concurrent = 0;
        assert!(config.validate().is_err());
    }
}
