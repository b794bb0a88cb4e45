//! Shared handles for lifecycle operations

use crate::catalog::ServiceCatalog;
use crate::config::KeelConfig;
use crate::error::Result;
use crate::launcher::ServiceLauncher;
use crate::lock::LockManager;
use crate::paths::KeelPaths;
use crate::runtime::ContainerRuntime;
use crate::state::VersionPointer;
use std::sync::Arc;
use std::time::Duration;

/// Everything an operation needs to touch the stack
#[derive(Clone)]
pub struct StackContext {
    pub paths: KeelPaths,
    pub config: KeelConfig,
    pub runtime: Arc<dyn ContainerRuntime>,
    poll_interval: Duration,
}

impl StackContext {
    pub fn new(paths: KeelPaths, config: KeelConfig, runtime: Arc<dyn ContainerRuntime>) -> Self {
        let poll_interval = config.health.poll_interval();
        Self {
            paths,
            config,
            runtime,
            poll_interval,
        }
    }

    /// Override the health poll interval (tests poll in milliseconds)
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn locks(&self) -> LockManager {
        LockManager::new(&self.paths.locks_dir())
    }

    /// Service catalog of the deployed version
    pub fn catalog(&self) -> Result<ServiceCatalog> {
        ServiceCatalog::load(&self.paths.services_file())
    }

    pub fn launcher(&self) -> ServiceLauncher {
        ServiceLauncher::new(self.runtime.clone(), self.poll_interval)
    }

    pub fn current_version(&self) -> Result<Option<String>> {
        VersionPointer::read(&self.paths.version_file())
    }
}
