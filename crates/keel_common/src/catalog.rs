//! Service catalog
//!
//! Each release ships a `services.toml` next to its deployment files, so the
//! service set always follows the deployed version. Criticality is declared
//! per service here and resolved once; call sites never infer it from names.

use crate::error::{KeelError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Static description of one managed service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub name: String,
    /// Dependency rank, lower tiers start first
    pub tier: u32,
    pub critical: bool,
    pub health_timeout: Duration,
    pub stop_grace: Duration,
}

impl ServiceDescriptor {
    pub fn new(name: &str, tier: u32, critical: bool) -> Self {
        Self {
            name: name.to_string(),
            tier,
            critical,
            health_timeout: Duration::from_secs(60),
            stop_grace: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.health_timeout = timeout;
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }
}

/// Ephemeral datastore instance used for test restores
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EphemeralRestore {
    /// Image to run
    pub image: String,
    /// Command that reads a dump on stdin
    pub restore_command: Vec<String>,
    /// Command that prints the restored record count
    pub count_command: Vec<String>,
}

/// A datastore component that gets dumped into backups
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatastoreComponent {
    pub name: String,
    /// Service the dump/restore commands run in
    pub service: String,
    /// Writes a dump to stdout
    pub dump_command: Vec<String>,
    /// Reads a dump from stdin
    pub restore_command: Vec<String>,
    #[serde(default)]
    pub ephemeral: Option<EphemeralRestore>,
}

/// A data-migration hook run after a successful launch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationHook {
    pub name: String,
    pub service: String,
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ServiceEntry {
    name: String,
    tier: u32,
    #[serde(default = "default_critical")]
    critical: bool,
    #[serde(default = "default_health_timeout")]
    health_timeout_secs: u64,
    #[serde(default = "default_stop_grace")]
    stop_grace_secs: u64,
}

fn default_critical() -> bool {
    true
}

fn default_health_timeout() -> u64 {
    60
}

fn default_stop_grace() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
struct CatalogFile {
    #[serde(default, rename = "service")]
    services: Vec<ServiceEntry>,
    #[serde(default, rename = "datastore")]
    datastores: Vec<DatastoreComponent>,
    #[serde(default, rename = "migration")]
    migrations: Vec<MigrationHook>,
}

/// The complete, validated service set of one version
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceCatalog {
    pub services: Vec<ServiceDescriptor>,
    pub datastores: Vec<DatastoreComponent>,
    pub migrations: Vec<MigrationHook>,
}

impl ServiceCatalog {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(KeelError::validation(format!(
                "service catalog {} not found",
                path.display()
            )));
        }
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let file: CatalogFile = toml::from_str(content)?;
        let services = file
            .services
            .into_iter()
            .map(|entry| ServiceDescriptor {
                name: entry.name,
                tier: entry.tier,
                critical: entry.critical,
                health_timeout: Duration::from_secs(entry.health_timeout_secs),
                stop_grace: Duration::from_secs(entry.stop_grace_secs),
            })
            .collect();
        let catalog = Self {
            services,
            datastores: file.datastores,
            migrations: file.migrations,
        };
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn from_services(services: Vec<ServiceDescriptor>) -> Self {
        Self {
            services,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.services.is_empty() {
            return Err(KeelError::validation("service catalog declares no services"));
        }

        let mut names = HashSet::new();
        for service in &self.services {
            if service.name.trim().is_empty() {
                return Err(KeelError::validation("service with empty name"));
            }
            if !names.insert(service.name.as_str()) {
                return Err(KeelError::validation(format!(
                    "service '{}' declared twice",
                    service.name
                )));
            }
            if service.health_timeout.is_zero() {
                return Err(KeelError::validation(format!(
                    "service '{}' has a zero health timeout",
                    service.name
                )));
            }
        }

        let mut components = HashSet::new();
        for store in &self.datastores {
            if !names.contains(store.service.as_str()) {
                return Err(KeelError::validation(format!(
                    "datastore '{}' references unknown service '{}'",
                    store.name, store.service
                )));
            }
            if !components.insert(store.name.as_str()) {
                return Err(KeelError::validation(format!(
                    "datastore '{}' declared twice",
                    store.name
                )));
            }
            if store.dump_command.is_empty() || store.restore_command.is_empty() {
                return Err(KeelError::validation(format!(
                    "datastore '{}' needs dump_command and restore_command",
                    store.name
                )));
            }
        }

        for hook in &self.migrations {
            if !names.contains(hook.service.as_str()) {
                return Err(KeelError::validation(format!(
                    "migration '{}' references unknown service '{}'",
                    hook.name, hook.service
                )));
            }
            if hook.command.is_empty() {
                return Err(KeelError::validation(format!(
                    "migration '{}' has an empty command",
                    hook.name
                )));
            }
        }

        Ok(())
    }

    /// Services grouped by tier, lowest first
    pub fn tiers(&self) -> Vec<(u32, Vec<ServiceDescriptor>)> {
        partition_tiers(&self.services)
    }

    pub fn service(&self, name: &str) -> Option<&ServiceDescriptor> {
        self.services.iter().find(|s| s.name == name)
    }

    pub fn service_names(&self) -> Vec<String> {
        self.services.iter().map(|s| s.name.clone()).collect()
    }

    /// Stop order: non-critical services first, then the rest from the highest tier down
    pub fn stop_order(&self) -> (Vec<ServiceDescriptor>, Vec<ServiceDescriptor>) {
        let (mut non_critical, mut critical): (Vec<_>, Vec<_>) =
            self.services.iter().cloned().partition(|s| !s.critical);
        non_critical.sort_by(|a, b| b.tier.cmp(&a.tier));
        critical.sort_by(|a, b| b.tier.cmp(&a.tier));
        (non_critical, critical)
    }

    /// Cap every health timeout (used by `update --timeout`)
    pub fn cap_health_timeouts(&mut self, cap: Duration) {
        for service in &mut self.services {
            service.health_timeout = service.health_timeout.min(cap);
        }
    }

    /// Services hosting a datastore
    pub fn datastore_services(&self) -> HashSet<&str> {
        self.datastores.iter().map(|d| d.service.as_str()).collect()
    }
}

/// Group descriptors by tier, lowest first; order inside a tier is preserved
pub fn partition_tiers(services: &[ServiceDescriptor]) -> Vec<(u32, Vec<ServiceDescriptor>)> {
    let mut tiers: BTreeMap<u32, Vec<ServiceDescriptor>> = BTreeMap::new();
    for service in services {
        tiers.entry(service.tier).or_default().push(service.clone());
    }
    tiers.into_iter().collect()
}
