//! Worker provisioning.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::WorkerLaunchConfig;
use crate::error::{ConfigError, InfraError};
use crate::fleet::{FormatPair, WorkerDescriptor, WorkerId};
use crate::process::{Framing, ProcessLaunch, WorkerControl, WorkerProcessController};

/// Everything needed to start an equivalent worker.
#[derive(Debug, Clone, Default)]
pub struct WorkerSpec {
    pub name_prefix: String,
    pub program: String,
    pub args: Vec<String>,
    pub supported_formats: Vec<FormatPair>,
    pub max_parallel: u32,
    pub framing: Framing,
}

impl WorkerSpec {
    pub fn from_config(config: &WorkerLaunchConfig) -> Result<Self, ConfigError> {
        let supported_formats =
            FormatPair::parse_list(&config.formats).map_err(|message| ConfigError::InvalidValue {
                key: "CONVERT_FLEET_WORKER_FORMATS".to_string(),
                message,
            })?;
        Ok(Self {
            name_prefix: "worker".to_string(),
            program: config.program.clone(),
            args: config.args.clone(),
            supported_formats,
            max_parallel: config.max_parallel,
            framing: config.framing,
        })
    }
}

/// A freshly started worker, ready to be registered.
pub struct ProvisionedWorker {
    pub descriptor: WorkerDescriptor,
    pub control: Arc<dyn WorkerControl>,
}

/// Starts and releases workers.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn request_workers(
        &self,
        count: usize,
        spec: &WorkerSpec,
    ) -> Result<Vec<ProvisionedWorker>, InfraError>;

    /// Free whatever backs a worker that has left the fleet.
    async fn release_worker(&self, id: WorkerId) -> Result<(), InfraError>;
}

/// Runs workers as local child processes.
pub struct LocalProcessProvisioner {
    command_timeout: Duration,
    started: AtomicU64,
}

impl LocalProcessProvisioner {
    pub fn new(command_timeout: Duration) -> Self {
        Self {
            command_timeout,
            started: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl Provisioner for LocalProcessProvisioner {
    async fn request_workers(
        &self,
        count: usize,
        spec: &WorkerSpec,
    ) -> Result<Vec<ProvisionedWorker>, InfraError> {
        let launch = ProcessLaunch {
            program: spec.program.clone(),
            args: spec.args.clone(),
            framing: spec.framing,
            command_timeout: self.command_timeout,
        };

        let mut workers = Vec::with_capacity(count);
        for _ in 0..count {
            let id = Uuid::new_v4();
            let controller = WorkerProcessController::start(id, &launch)
                .map_err(|e| InfraError::ProvisionerFailed(e.to_string()))?;
            let seq = self.started.fetch_add(1, Ordering::Relaxed) + 1;
            let descriptor = WorkerDescriptor::new(
                id,
                format!("{}-{seq}", spec.name_prefix),
                controller.channel_ref(),
                spec.supported_formats.clone(),
                spec.max_parallel,
            );
            workers.push(ProvisionedWorker {
                descriptor,
                control: Arc::new(controller),
            });
        }
        info!(count, program = %spec.program, "Provisioned workers");
        Ok(workers)
    }

    async fn release_worker(&self, id: WorkerId) -> Result<(), InfraError> {
        // The controller owns the child; dropping it reaps the process.
        debug!(worker_id = %id, "Released local worker");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_from_config_parses_formats() {
        let config = WorkerLaunchConfig {
            formats: "step|igs>obj|fbx".into(),
            ..WorkerLaunchConfig::default()
        };
        let spec = WorkerSpec::from_config(&config).unwrap();
        assert_eq!(spec.supported_formats.len(), 1);
        assert_eq!(spec.max_parallel, config.max_parallel);

        let bad = WorkerLaunchConfig {
            formats: "obj".into(),
            ..WorkerLaunchConfig::default()
        };
        assert!(WorkerSpec::from_config(&bad).is_err());
    }

    #[tokio::test]
    async fn missing_program_fails_to_provision() {
        let provisioner = LocalProcessProvisioner::new(Duration::from_secs(1));
        let spec = WorkerSpec {
            program: "/nonexistent/convert-worker".into(),
            max_parallel: 1,
            ..WorkerSpec::default()
        };
        let err = provisioner.request_workers(1, &spec).await.err().unwrap();
        assert!(matches!(err, InfraError::ProvisionerFailed(_)));
    }
}
