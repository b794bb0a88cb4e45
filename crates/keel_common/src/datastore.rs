//! Datastore dump/restore through the container runtime
//!
//! Commands come from the `[[datastore]]` entries of the service catalog and
//! run inside the datastore's service (or a throwaway instance for test
//! restores). Dumps travel over stdout, restores over stdin.

use crate::catalog::DatastoreComponent;
use crate::error::{KeelError, Result};
use crate::runtime::ContainerRuntime;
use tracing::{debug, info};

pub struct DatastoreCli<'a> {
    runtime: &'a dyn ContainerRuntime,
}

impl<'a> DatastoreCli<'a> {
    pub fn new(runtime: &'a dyn ContainerRuntime) -> Self {
        Self { runtime }
    }

    /// Structured dump of one component
    pub fn dump(&self, component: &DatastoreComponent) -> Result<Vec<u8>> {
        info!("Dumping {} from {}", component.name, component.service);
        let output = self.runtime.exec(&component.service, &component.dump_command, None)?;
        if !output.success() {
            return Err(KeelError::runtime(format!(
                "dump of {} failed ({}): {}",
                component.name,
                output.exit_code,
                output.stderr_lossy()
            )));
        }
        if output.stdout.is_empty() {
            return Err(KeelError::runtime(format!("dump of {} produced no data", component.name)));
        }
        debug!("Dump of {} is {} bytes", component.name, output.stdout.len());
        Ok(output.stdout)
    }

    /// Load a dump into the running datastore
    pub fn restore(&self, component: &DatastoreComponent, dump: &[u8]) -> Result<()> {
        info!("Restoring {} into {}", component.name, component.service);
        let output = self
            .runtime
            .exec(&component.service, &component.restore_command, Some(dump))?;
        if !output.success() {
            return Err(KeelError::runtime(format!(
                "restore of {} failed ({}): {}",
                component.name,
                output.exit_code,
                output.stderr_lossy()
            )));
        }
        Ok(())
    }

    /// Restore into an ephemeral instance and count the restored records
    pub fn test_restore(&self, component: &DatastoreComponent, dump: &[u8]) -> Result<u64> {
        let Some(ephemeral) = &component.ephemeral else {
            return Err(KeelError::validation(format!(
                "datastore {} has no ephemeral restore configuration",
                component.name
            )));
        };

        let script = format!(
            "{} && {}",
            shell_join(&ephemeral.restore_command),
            shell_join(&ephemeral.count_command)
        );
        let command = vec!["sh".to_string(), "-c".to_string(), script];
        let output = self.runtime.run_ephemeral(&ephemeral.image, &command, Some(dump))?;
        if !output.success() {
            return Err(KeelError::runtime(format!(
                "test restore of {} failed ({}): {}",
                component.name,
                output.exit_code,
                output.stderr_lossy()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let count = stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .and_then(|line| line.parse::<u64>().ok())
            .ok_or_else(|| {
                KeelError::runtime(format!(
                    "test restore of {} did not report a record count",
                    component.name
                ))
            })?;
        info!("Test restore of {} recovered {} record(s)", component.name, count);
        Ok(count)
    }
}

/// Quote arguments for `sh -c`
fn shell_join(args: &[String]) -> String {
    args.iter()
        .map(|arg| {
            if !arg.is_empty()
                && arg
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | '=' | ':' | ','))
            {
                arg.clone()
            } else {
                format!("'{}'", arg.replace('\'', "'\\''"))
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::EphemeralRestore;
    use crate::runtime::ExecOutput;
    use crate::testing::ScriptedRuntime;

    fn component() -> DatastoreComponent {
        DatastoreComponent {
            name: "postgres".to_string(),
            service: "db".to_string(),
            dump_command: vec!["pg_dump".to_string()],
            restore_command: vec!["psql".to_string()],
            ephemeral: Some(EphemeralRestore {
                image: "postgres:16".to_string(),
                restore_command: vec!["psql".to_string(), "-q".to_string()],
                count_command: vec!["psql".to_string(), "-c".to_string(), "select count(*)".to_string()],
            }),
        }
    }

    #[test]
    fn test_shell_join_quotes() {
        let args = vec!["psql".to_string(), "-c".to_string(), "select 'x'".to_string()];
        assert_eq!(shell_join(&args), "psql -c 'select '\\''x'\\'''");
    }

    #[test]
    fn test_dump_requires_output() {
        let runtime = ScriptedRuntime::new();
        runtime.mark_running(&["db"]);
        let cli = DatastoreCli::new(&runtime);
        assert!(cli.dump(&component()).is_err());

        runtime.set_exec_output(
            "db",
            "pg_dump",
            ExecOutput {
                stdout: b"COPY users".to_vec(),
                ..Default::default()
            },
        );
        assert_eq!(cli.dump(&component()).unwrap(), b"COPY users");
    }

    #[test]
    fn test_restore_feeds_stdin() {
        let runtime = ScriptedRuntime::new();
        runtime.mark_running(&["db"]);
        DatastoreCli::new(&runtime).restore(&component(), b"dump").unwrap();
        let fed = runtime.exec_stdin();
        assert_eq!(fed.len(), 1);
        assert_eq!(fed[0].2, b"dump");
    }

    #[test]
    fn test_test_restore_parses_count() {
        let runtime = ScriptedRuntime::new();
        runtime.set_ephemeral_output(
            "sh",
            ExecOutput {
                stdout: b"restored\n 42 \n".to_vec(),
                ..Default::default()
            },
        );
        assert_eq!(DatastoreCli::new(&runtime).test_restore(&component(), b"d").unwrap(), 42);
    }

    #[test]
    fn test_test_restore_without_config_is_validation() {
        let runtime = ScriptedRuntime::new();
        let mut plain = component();
        plain.ephemeral = None;
        assert_eq!(
            DatastoreCli::new(&runtime).test_restore(&plain, b"d").unwrap_err().exit_code(),
            3
        );
    }
}
