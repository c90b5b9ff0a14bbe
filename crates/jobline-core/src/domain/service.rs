//! Auxiliary service descriptors and their health-check policies.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_HEALTH_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_HEALTH_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_HEALTH_RETRIES: u32 = 5;

/// How readiness of a service is probed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Probe {
    /// Run a command inside the service container; exit 0 means ready.
    Exec { command: Vec<String> },
    /// Open a TCP connection to `localhost:port`.
    Tcp { port: u16 },
    /// GET the URL; any 2xx means ready.
    Http { url: String },
}

impl Probe {
    pub fn describe(&self) -> String {
        match self {
            Probe::Exec { command } => format!("exec `{}`", command.join(" ")),
            Probe::Tcp { port } => format!("tcp localhost:{port}"),
            Probe::Http { url } => format!("http {url}"),
        }
    }
}

fn default_interval() -> u64 {
    DEFAULT_HEALTH_INTERVAL_SECS
}

fn default_timeout() -> u64 {
    DEFAULT_HEALTH_TIMEOUT_SECS
}

fn default_retries() -> u32 {
    DEFAULT_HEALTH_RETRIES
}

/// Polling policy for a readiness probe.
///
/// The service is given `retries` attempts, each preceded by `interval`
/// and bounded by `timeout`, so the longest wait is `retries × interval`
/// plus probe time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckPolicy {
    pub probe: Probe,
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_retries")]
    pub retries: u32,
}

impl HealthCheckPolicy {
    /// Policy with the default 10s / 5s / 5 polling parameters.
    pub fn new(probe: Probe) -> Self {
        Self {
            probe,
            interval_secs: DEFAULT_HEALTH_INTERVAL_SECS,
            timeout_secs: DEFAULT_HEALTH_TIMEOUT_SECS,
            retries: DEFAULT_HEALTH_RETRIES,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Upper bound on time spent waiting between attempts.
    pub fn max_wait(&self) -> Duration {
        self.interval() * self.retries
    }
}

/// A network service the job needs for its lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Port published on `localhost` (same port inside the container).
    pub port: u16,
    #[serde(default)]
    pub health_check: Option<HealthCheckPolicy>,
}

impl ServiceDescriptor {
    pub fn new(name: impl Into<String>, image: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            env: BTreeMap::new(),
            port,
            health_check: None,
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_health_check(mut self, policy: HealthCheckPolicy) -> Self {
        self.health_check = Some(policy);
        self
    }

    /// Effective readiness gate.
    ///
    /// Services without an explicit health check still get one: a TCP
    /// connect to their published port with default polling.
    pub fn readiness(&self) -> HealthCheckPolicy {
        self.health_check
            .clone()
            .unwrap_or_else(|| HealthCheckPolicy::new(Probe::Tcp { port: self.port }))
    }

    /// `localhost:<port>` address of the service.
    pub fn address(&self) -> String {
        format!("localhost:{}", self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_waits_fifty_seconds() {
        let policy = HealthCheckPolicy::new(Probe::Tcp { port: 5432 });
        assert_eq!(policy.max_wait(), Duration::from_secs(50));
        assert_eq!(policy.timeout(), Duration::from_secs(5));
    }

    #[test]
    fn missing_health_check_falls_back_to_tcp() {
        let svc = ServiceDescriptor::new("search", "elasticsearch:7.10.1", 9200);
        assert_eq!(svc.readiness().probe, Probe::Tcp { port: 9200 });
    }

    #[test]
    fn explicit_health_check_wins() {
        let probe = Probe::Exec {
            command: vec!["redis-cli".to_string(), "ping".to_string()],
        };
        let svc = ServiceDescriptor::new("redis", "redis", 6379)
            .with_health_check(HealthCheckPolicy::new(probe.clone()));
        assert_eq!(svc.readiness().probe, probe);
    }

    #[test]
    fn policy_yaml_defaults() {
        let yaml = "probe:\n  type: tcp\n  port: 6379\n";
        let policy: HealthCheckPolicy = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(policy.interval_secs, 10);
        assert_eq!(policy.timeout_secs, 5);
        assert_eq!(policy.retries, 5);
    }
}
