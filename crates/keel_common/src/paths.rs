//! Filesystem layout for a Keel deployment
//!
//! Every on-disk location the orchestrator touches is owned here. Production
//! code uses `KeelPaths::new()`; tests and the `--root` flag re-root the whole
//! tree with `KeelPaths::with_root()`.

use std::path::{Path, PathBuf};

/// Deployment directory (compose files, services.toml)
pub const DEPLOY_DIR: &str = "/opt/keel/deploy";

/// Live environment file
pub const ENV_FILE: &str = "/opt/keel/deploy/.env";

/// Environment template shipped with each release
pub const ENV_TEMPLATE_FILE: &str = "/opt/keel/deploy/env.template";

/// Keel state directory
pub const STATE_DIR: &str = "/var/lib/keel";

/// TLS material supplied by the certificate provider
pub const TLS_DIR: &str = "/etc/keel/tls";

/// Secrets generated at install time
pub const SECRETS_DIR: &str = "/etc/keel/secrets";

/// Operator configuration
pub const CONFIG_FILE: &str = "/etc/keel/config.toml";

/// Service catalog file name inside the deployment directory
pub const SERVICES_FILE: &str = "services.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeelPaths {
    pub deploy_dir: PathBuf,
    pub env_file: PathBuf,
    pub env_template: PathBuf,
    pub state_dir: PathBuf,
    pub tls_dir: PathBuf,
    pub secrets_dir: PathBuf,
    pub config_file: PathBuf,
}

impl Default for KeelPaths {
    fn default() -> Self {
        Self::new()
    }
}

impl KeelPaths {
    /// System paths
    pub fn new() -> Self {
        Self {
            deploy_dir: PathBuf::from(DEPLOY_DIR),
            env_file: PathBuf::from(ENV_FILE),
            env_template: PathBuf::from(ENV_TEMPLATE_FILE),
            state_dir: PathBuf::from(STATE_DIR),
            tls_dir: PathBuf::from(TLS_DIR),
            secrets_dir: PathBuf::from(SECRETS_DIR),
            config_file: PathBuf::from(CONFIG_FILE),
        }
    }

    /// Same layout re-rooted under `root` (for testing)
    pub fn with_root(root: &Path) -> Self {
        let reroot = |p: &str| root.join(p.trim_start_matches('/'));
        Self {
            deploy_dir: reroot(DEPLOY_DIR),
            env_file: reroot(ENV_FILE),
            env_template: reroot(ENV_TEMPLATE_FILE),
            state_dir: reroot(STATE_DIR),
            tls_dir: reroot(TLS_DIR),
            secrets_dir: reroot(SECRETS_DIR),
            config_file: reroot(CONFIG_FILE),
        }
    }

    pub fn services_file(&self) -> PathBuf {
        self.deploy_dir.join(SERVICES_FILE)
    }

    /// Live version pointer
    pub fn version_file(&self) -> PathBuf {
        self.state_dir.join("version")
    }

    pub fn install_state_file(&self) -> PathBuf {
        self.state_dir.join("install_state.json")
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.state_dir.join("checkpoints")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.state_dir.join("locks")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.state_dir.join("backups")
    }

    /// Files displaced by an update's deployment-file copy
    pub fn side_archives_dir(&self) -> PathBuf {
        self.state_dir.join("update_side_archives")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.state_dir.join("staging")
    }

    pub fn tls_cert(&self) -> PathBuf {
        self.tls_dir.join("server.crt")
    }

    pub fn tls_key(&self) -> PathBuf {
        self.tls_dir.join("server.key")
    }

    /// Directories the orchestrator creates at install time
    pub fn managed_dirs(&self) -> Vec<PathBuf> {
        vec![
            self.deploy_dir.clone(),
            self.state_dir.clone(),
            self.checkpoints_dir(),
            self.locks_dir(),
            self.logs_dir(),
            self.backups_dir(),
            self.side_archives_dir(),
            self.staging_dir(),
            self.tls_dir.clone(),
            self.secrets_dir.clone(),
        ]
    }
}
