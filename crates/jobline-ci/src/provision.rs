//! Service provisioning: start containers, gate each on its readiness probe,
//! tear everything down at job end.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use jobline_core::domain::service::{HealthCheckPolicy, Probe, ServiceDescriptor};
use jobline_core::METRICS;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("service {service} failed to start: {reason}")]
    StartFailed { service: String, reason: String },

    #[error("service {service} not ready after {attempts} attempt(s): {last_error}")]
    Unhealthy {
        service: String,
        attempts: u32,
        last_error: String,
    },

    #[error("container runtime error: {0}")]
    Runtime(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A running service instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceHandle {
    pub name: String,
    pub container_id: String,
    pub host: String,
    pub port: u16,
}

/// Starts, execs into and stops service containers.
#[async_trait]
pub trait ServiceRuntime: Send + Sync {
    async fn start(&self, service: &ServiceDescriptor) -> Result<ServiceHandle, ProvisionError>;

    /// Run `command` inside the service; returns its exit code.
    async fn exec(&self, handle: &ServiceHandle, command: &[String]) -> Result<i32, ProvisionError>;

    async fn stop(&self, handle: &ServiceHandle) -> Result<(), ProvisionError>;
}

/// Drives the `docker` CLI.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    binary: String,
    /// Container name prefix; keeps concurrent jobs apart.
    prefix: String,
}

impl DockerRuntime {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            binary: "docker".to_string(),
            prefix: prefix.into(),
        }
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    fn container_name(&self, service: &str) -> String {
        format!("{}-{}", self.prefix, service)
    }

    fn run_args(&self, service: &ServiceDescriptor) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--detach".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            self.container_name(&service.name),
            "--publish".to_string(),
            format!("{0}:{0}", service.port),
        ];
        for (key, value) in &service.env {
            args.push("--env".to_string());
            args.push(format!("{key}={value}"));
        }
        args.push(service.image.clone());
        args
    }

    async fn docker(&self, args: &[String]) -> Result<std::process::Output, ProvisionError> {
        Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ProvisionError::Runtime(format!("failed to run {}: {e}", self.binary)))
    }
}

#[async_trait]
impl ServiceRuntime for DockerRuntime {
    async fn start(&self, service: &ServiceDescriptor) -> Result<ServiceHandle, ProvisionError> {
        let output = self.docker(&self.run_args(service)).await?;
        if !output.status.success() {
            return Err(ProvisionError::StartFailed {
                service: service.name.clone(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(ServiceHandle {
            name: service.name.clone(),
            container_id,
            host: "localhost".to_string(),
            port: service.port,
        })
    }

    async fn exec(&self, handle: &ServiceHandle, command: &[String]) -> Result<i32, ProvisionError> {
        let mut args = vec!["exec".to_string(), handle.container_id.clone()];
        args.extend(command.iter().cloned());
        let output = self.docker(&args).await?;
        Ok(output.status.code().unwrap_or(-1))
    }

    async fn stop(&self, handle: &ServiceHandle) -> Result<(), ProvisionError> {
        let args = vec![
            "rm".to_string(),
            "--force".to_string(),
            handle.container_id.clone(),
        ];
        let output = self.docker(&args).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(ProvisionError::Runtime(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }
}

/// Runs one readiness probe attempt.
#[async_trait]
pub trait ProbeRunner: Send + Sync {
    async fn probe(&self, handle: &ServiceHandle, probe: &Probe) -> Result<(), String>;
}

/// Exec probes go through the runtime, TCP probes connect directly, HTTP
/// probes expect a 2xx.
pub struct DefaultProbeRunner {
    runtime: Arc<dyn ServiceRuntime>,
    http: reqwest::Client,
}

impl DefaultProbeRunner {
    pub fn new(runtime: Arc<dyn ServiceRuntime>) -> Self {
        Self {
            runtime,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ProbeRunner for DefaultProbeRunner {
    async fn probe(&self, handle: &ServiceHandle, probe: &Probe) -> Result<(), String> {
        match probe {
            Probe::Exec { command } => match self.runtime.exec(handle, command).await {
                Ok(0) => Ok(()),
                Ok(code) => Err(format!("`{}` exited with {code}", command.join(" "))),
                Err(e) => Err(e.to_string()),
            },
            Probe::Tcp { port } => tokio::net::TcpStream::connect((handle.host.as_str(), *port))
                .await
                .map(|_| ())
                .map_err(|e| format!("connect {}:{port}: {e}", handle.host)),
            Probe::Http { url } => {
                let response = self.http.get(url).send().await.map_err(|e| e.to_string())?;
                if response.status().is_success() {
                    Ok(())
                } else {
                    Err(format!("GET {url} returned {}", response.status()))
                }
            }
        }
    }
}

/// Readiness result of one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceReadiness {
    pub service: String,
    pub healthy: bool,
    pub attempts: u32,
    pub waited_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Every container started for a job, recorded the moment `start` returns.
///
/// Clones share the same set, so the handles survive a provisioning pass
/// that is dropped mid-gate (global timeout) and can still be torn down.
#[derive(Clone)]
pub struct StartedServices {
    runtime: Arc<dyn ServiceRuntime>,
    handles: Arc<Mutex<Vec<ServiceHandle>>>,
}

impl StartedServices {
    pub fn new(runtime: Arc<dyn ServiceRuntime>) -> Self {
        Self {
            runtime,
            handles: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// The guarded value is a plain list, so a poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, Vec<ServiceHandle>> {
        self.handles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, handle: ServiceHandle) {
        self.lock().push(handle);
    }

    pub fn handles(&self) -> Vec<ServiceHandle> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Stop every recorded service. Errors are logged and returned, never
    /// raised. The set is drained, so a second call stops nothing.
    pub async fn teardown(&self) -> Vec<String> {
        let handles = std::mem::take(&mut *self.lock());
        let mut errors = Vec::new();
        for handle in &handles {
            match self.runtime.stop(handle).await {
                Ok(()) => debug!(service = %handle.name, "service stopped"),
                Err(e) => {
                    warn!(service = %handle.name, error = %e, "failed to stop service");
                    errors.push(format!("{}: {e}", handle.name));
                }
            }
        }
        errors
    }
}

/// Outcome of a completed provisioning pass. Must be torn down at job end.
pub struct ProvisionedServices {
    started: StartedServices,
    readiness: Vec<ServiceReadiness>,
}

impl std::fmt::Debug for ProvisionedServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisionedServices")
            .field("started", &self.started.len())
            .field("readiness", &self.readiness)
            .finish()
    }
}

impl ProvisionedServices {
    pub fn handles(&self) -> Vec<ServiceHandle> {
        self.started.handles()
    }

    pub fn readiness(&self) -> &[ServiceReadiness] {
        &self.readiness
    }

    pub fn all_healthy(&self) -> bool {
        self.readiness.iter().all(|r| r.healthy)
    }

    pub async fn teardown(self) -> Vec<String> {
        self.started.teardown().await
    }
}

/// Provisioning aborted the job; `services` holds whatever did start.
#[derive(Error)]
#[error("{error}")]
pub struct ProvisionFailure {
    pub error: ProvisionError,
    pub services: ProvisionedServices,
}

impl std::fmt::Debug for ProvisionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisionFailure")
            .field("error", &self.error)
            .field("started", &self.services.started.len())
            .finish()
    }
}

/// Provisions the services of one job. Every container it starts is added
/// to [`Provisioner::started`].
pub struct Provisioner {
    prober: Arc<dyn ProbeRunner>,
    started: StartedServices,
}

impl Provisioner {
    pub fn new(runtime: Arc<dyn ServiceRuntime>, prober: Arc<dyn ProbeRunner>) -> Self {
        Self {
            prober,
            started: StartedServices::new(runtime),
        }
    }

    /// Shared view of the containers started so far.
    pub fn started(&self) -> StartedServices {
        self.started.clone()
    }

    /// Start every service concurrently and gate each on its own readiness
    /// probe. Fails if any service fails to start or exhausts its retries.
    pub async fn provision_all(
        &self,
        services: &[ServiceDescriptor],
    ) -> Result<ProvisionedServices, ProvisionFailure> {
        let results = join_all(services.iter().map(|svc| self.start_and_gate(svc))).await;

        let mut readiness = Vec::with_capacity(results.len());
        let mut first_error = None;
        for (ready, error) in results {
            readiness.push(ready);
            if first_error.is_none() {
                first_error = error;
            }
        }

        let provisioned = ProvisionedServices {
            started: self.started.clone(),
            readiness,
        };
        match first_error {
            None => Ok(provisioned),
            Some(error) => Err(ProvisionFailure {
                error,
                services: provisioned,
            }),
        }
    }

    async fn start_and_gate(
        &self,
        service: &ServiceDescriptor,
    ) -> (ServiceReadiness, Option<ProvisionError>) {
        let started = Instant::now();
        let handle = match self.started.runtime.start(service).await {
            Ok(handle) => handle,
            Err(e) => {
                let readiness = ServiceReadiness {
                    service: service.name.clone(),
                    healthy: false,
                    attempts: 0,
                    waited_ms: 0,
                    error: Some(e.to_string()),
                };
                jobline_core::obs::emit_service_unhealthy(&service.name, 0, &e.to_string());
                return (readiness, Some(e));
            }
        };
        info!(service = %service.name, container = %handle.container_id, "service started");
        self.started.record(handle.clone());

        let policy = service.readiness();
        let gate = wait_until_ready(self.prober.as_ref(), &handle, &policy).await;
        let waited_ms = started.elapsed().as_millis() as u64;

        match gate {
            Ok(attempts) => {
                jobline_core::obs::emit_service_healthy(&service.name, attempts);
                let readiness = ServiceReadiness {
                    service: service.name.clone(),
                    healthy: true,
                    attempts,
                    waited_ms,
                    error: None,
                };
                (readiness, None)
            }
            Err((attempts, last_error)) => {
                jobline_core::obs::emit_service_unhealthy(&service.name, attempts, &last_error);
                let readiness = ServiceReadiness {
                    service: service.name.clone(),
                    healthy: false,
                    attempts,
                    waited_ms,
                    error: Some(last_error.clone()),
                };
                let error = ProvisionError::Unhealthy {
                    service: service.name.clone(),
                    attempts,
                    last_error,
                };
                (readiness, Some(error))
            }
        }
    }
}

/// Poll `policy.probe` until it succeeds or the retries run out.
///
/// Each attempt waits `interval`, then probes with a `timeout` bound.
/// Returns the number of attempts used, or the attempt count with the last
/// probe error.
pub async fn wait_until_ready(
    prober: &dyn ProbeRunner,
    handle: &ServiceHandle,
    policy: &HealthCheckPolicy,
) -> Result<u32, (u32, String)> {
    let mut last_error = "no probe attempts configured".to_string();
    for attempt in 1..=policy.retries {
        tokio::time::sleep(policy.interval()).await;
        METRICS.inc_probes();
        match tokio::time::timeout(policy.timeout(), prober.probe(handle, &policy.probe)).await {
            Ok(Ok(())) => return Ok(attempt),
            Ok(Err(e)) => last_error = e,
            Err(_) => {
                last_error = format!(
                    "{} timed out after {}s",
                    policy.probe.describe(),
                    policy.timeout_secs
                )
            }
        }
        debug!(
            service = %handle.name,
            attempt,
            retries = policy.retries,
            error = %last_error,
            "readiness probe failed"
        );
    }
    Err((policy.retries, last_error))
}
