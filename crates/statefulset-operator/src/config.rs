//! Operator configuration.
//!
//! Configuration is loaded from environment variables, falling back to
//! defaults when a variable is unset.

use crate::error::OperatorError;
use std::env;
use std::time::Duration;

/// Environment variable holding the operation timeout in milliseconds.
pub const ENV_OPERATION_TIMEOUT_MS: &str = "STS_OPERATOR_OPERATION_TIMEOUT_MS";
/// Environment variable holding the readiness poll interval in milliseconds.
pub const ENV_POLL_INTERVAL_MS: &str = "STS_OPERATOR_POLL_INTERVAL_MS";
/// Environment variable holding the number of concurrent worker pool jobs.
pub const ENV_WORKER_POOL_SIZE: &str = "STS_OPERATOR_WORKER_POOL_SIZE";

/// Default deadline for every wait (5 minutes).
pub const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 300_000;
/// Default readiness / deletion poll interval.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
/// Default worker pool name.
pub const DEFAULT_WORKER_POOL_NAME: &str = "kubernetes-ops-pool";
/// Default worker pool size.
pub const DEFAULT_WORKER_POOL_SIZE: usize = 10;

/// Tunables for a [`StatefulSetOperator`](crate::StatefulSetOperator) instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorConfig {
    /// Hard deadline for every readiness and deletion wait
    pub operation_timeout: Duration,
    /// Interval between readiness / deletion polls
    pub poll_interval: Duration,
    /// Name of the worker pool used for deletes (appears in logs)
    pub worker_pool_name: String,
    /// Maximum number of deletes in flight at once
    pub worker_pool_size: usize,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_millis(DEFAULT_OPERATION_TIMEOUT_MS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            worker_pool_name: DEFAULT_WORKER_POOL_NAME.to_string(),
            worker_pool_size: DEFAULT_WORKER_POOL_SIZE,
        }
    }
}

impl OperatorConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, OperatorError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, OperatorError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let operation_timeout = match lookup(ENV_OPERATION_TIMEOUT_MS) {
            Some(value) => Duration::from_millis(parse_u64(ENV_OPERATION_TIMEOUT_MS, &value)?),
            None => defaults.operation_timeout,
        };
        let poll_interval = match lookup(ENV_POLL_INTERVAL_MS) {
            Some(value) => Duration::from_millis(parse_u64(ENV_POLL_INTERVAL_MS, &value)?),
            None => defaults.poll_interval,
        };
        let worker_pool_size = match lookup(ENV_WORKER_POOL_SIZE) {
            Some(value) => {
                let size = value.trim().parse::<usize>().map_err(|e| {
                    OperatorError::InvalidConfig(format!("{ENV_WORKER_POOL_SIZE}={value}: {e}"))
                })?;
                if size == 0 {
                    return Err(OperatorError::InvalidConfig(format!(
                        "{ENV_WORKER_POOL_SIZE} must be at least 1"
                    )));
                }
                size
            }
            None => defaults.worker_pool_size,
        };

        if poll_interval.is_zero() {
            return Err(OperatorError::InvalidConfig(format!(
                "{ENV_POLL_INTERVAL_MS} must be greater than 0"
            )));
        }

        Ok(Self {
            operation_timeout,
            poll_interval,
            worker_pool_name: defaults.worker_pool_name,
            worker_pool_size,
        })
    }

    /// Builder-style override of the operation timeout.
    #[must_use]
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Builder-style override of the poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

fn parse_u64(key: &str, value: &str) -> Result<u64, OperatorError> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|e| OperatorError::InvalidConfig(format!("{key}={value}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = OperatorConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config, OperatorConfig::default());
        assert_eq!(config.operation_timeout, Duration::from_secs(300));
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.worker_pool_name, "kubernetes-ops-pool");
    }

    #[test]
    fn test_overrides() {
        let config = OperatorConfig::from_lookup(lookup_from(&[
            (ENV_OPERATION_TIMEOUT_MS, "60000"),
            (ENV_POLL_INTERVAL_MS, " 250 "),
            (ENV_WORKER_POOL_SIZE, "4"),
        ]))
        .unwrap();
        assert_eq!(config.operation_timeout, Duration::from_secs(60));
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.worker_pool_size, 4);
    }

    #[test]
    fn test_malformed_timeout_rejected() {
        let result = OperatorConfig::from_lookup(lookup_from(&[(ENV_OPERATION_TIMEOUT_MS, "soon")]));
        assert!(matches!(result, Err(OperatorError::InvalidConfig(_))));
    }

    #[test]
    fn test_zero_pool_size_rejected() {
        let result = OperatorConfig::from_lookup(lookup_from(&[(ENV_WORKER_POOL_SIZE, "0")]));
        assert!(matches!(result, Err(OperatorError::InvalidConfig(_))));
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let result = OperatorConfig::from_lookup(lookup_from(&[(ENV_POLL_INTERVAL_MS, "0")]));
        assert!(matches!(result, Err(OperatorError::InvalidConfig(_))));
    }
}
