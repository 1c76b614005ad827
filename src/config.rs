//! Configuration for the orchestrator
//!
//! All configuration is explicit and threaded through components by value.
//! Nothing below the CLI edge reads environment variables or ambient state;
//! the binary resolves the config file and operator token once and hands the
//! results down.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::service::ServiceSpec;
use crate::{Error, Result};

/// Connection parameters for the secret backend.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL of the backend, e.g. `http://127.0.0.1:8200`
    pub addr: String,
    /// TCP connect timeout in seconds
    pub connect_timeout_secs: u64,
    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            addr: "http://127.0.0.1:8200".to_string(),
            connect_timeout_secs: 5,
            request_timeout_secs: 30,
        }
    }
}

impl BackendConfig {
    /// Connect timeout as a [`Duration`]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Request timeout as a [`Duration`]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Certificate issuance and renewal policy.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct CertPolicy {
    /// Requested leaf TTL in hours
    pub ttl_hours: u32,
    /// Days-remaining at or below which a renewal pass reissues
    pub renew_threshold_days: i64,
}

impl Default for CertPolicy {
    fn default() -> Self {
        Self {
            ttl_hours: crate::DEFAULT_CERT_TTL_HOURS,
            renew_threshold_days: crate::DEFAULT_RENEW_THRESHOLD_DAYS,
        }
    }
}

/// Expiration monitor thresholds.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct MonitorPolicy {
    /// Days-remaining below which status is WARNING
    pub warning_days: i64,
    /// Days-remaining below which status is CRITICAL
    pub critical_days: i64,
}

impl Default for MonitorPolicy {
    fn default() -> Self {
        Self {
            warning_days: crate::DEFAULT_WARNING_DAYS,
            critical_days: crate::DEFAULT_CRITICAL_DAYS,
        }
    }
}

/// Bootstrap engine knobs.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct BootstrapPolicy {
    /// Regenerate secret-ids even when credential files already exist.
    ///
    /// Default is off: rerunning bootstrap must be idempotent and leave
    /// working credentials alone.
    pub refresh_credentials: bool,
    /// Concurrent credential generations during the fan-out phase
    pub parallelism: usize,
}

impl Default for BootstrapPolicy {
    fn default() -> Self {
        Self {
            refresh_credentials: false,
            parallelism: crate::DEFAULT_PARALLELISM,
        }
    }
}

/// Disaster-recovery knobs.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct RecoveryPolicy {
    /// Deadline for the container runtime to answer basic commands
    pub runtime_ready_timeout_secs: u64,
    /// Deadline for each service container to report healthy
    pub service_ready_timeout_secs: u64,
    /// Container name prefix used by the runtime, e.g. `devstack`
    pub container_prefix: String,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            runtime_ready_timeout_secs: 120,
            service_ready_timeout_secs: 180,
            container_prefix: "stack".to_string(),
        }
    }
}

/// Periodic-execution knobs for generated schedule entries.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulePolicy {
    /// Hour of day (0-23) for the daily renewal check
    pub renew_hour: u8,
    /// Hour of day (0-23) for the weekly status report
    pub report_hour: u8,
    /// Log file appended to by scheduled runs
    pub log_file: PathBuf,
}

impl Default for SchedulePolicy {
    fn default() -> Self {
        Self {
            renew_hour: 3,
            report_hour: 8,
            log_file: PathBuf::from("/var/log/warden.log"),
        }
    }
}

/// Top-level configuration, deserialized from a YAML file.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Config {
    /// Secret backend connection parameters
    #[serde(default)]
    pub backend: BackendConfig,
    /// Root directory for all state written by the orchestrator
    pub base_dir: PathBuf,
    /// Directory that backup bundles are read from
    pub backup_dir: PathBuf,
    /// Directory holding per-service policy documents (`<name>.hcl`)
    pub policy_dir: PathBuf,
    /// Environment file recreated during recovery
    #[serde(default)]
    pub env_file: Option<PathBuf>,
    /// Template the environment file is synthesized from when the backup
    /// bundle has no saved copy
    #[serde(default)]
    pub env_template: Option<PathBuf>,
    /// Certificate issuance and renewal policy
    #[serde(default)]
    pub certs: CertPolicy,
    /// Expiration monitor thresholds
    #[serde(default)]
    pub monitor: MonitorPolicy,
    /// Bootstrap engine knobs
    #[serde(default)]
    pub bootstrap: BootstrapPolicy,
    /// Disaster-recovery knobs
    #[serde(default)]
    pub recovery: RecoveryPolicy,
    /// Schedule entry knobs
    #[serde(default)]
    pub schedule: SchedulePolicy,
    /// The service registry
    pub services: Vec<ServiceSpec>,
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::io(format!("reading config {}", path.display()), e))?;
        let config: Config = serde_yaml::from_str(&raw)
            .map_err(|e| Error::config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.services.is_empty() {
            return Err(Error::config("services list is empty"));
        }

        let mut seen = std::collections::HashSet::new();
        for spec in &self.services {
            if spec.name.is_empty() {
                return Err(Error::config("service with empty name"));
            }
            if !seen.insert(spec.name.as_str()) {
                return Err(Error::config(format!("duplicate service '{}'", spec.name)));
            }
            if spec.role.secret_id_num_uses == 0 {
                warn!(
                    service = %spec.name,
                    "secret_id_num_uses is 0 (unlimited); credential reuse will not be capped"
                );
            }
            if spec.restore_command.is_some() && spec.snapshot.is_none() {
                return Err(Error::config(format!(
                    "service '{}' has a restore_command but no snapshot filename",
                    spec.name
                )));
            }
        }

        if self.monitor.critical_days > self.monitor.warning_days {
            return Err(Error::config(format!(
                "monitor critical_days ({}) exceeds warning_days ({})",
                self.monitor.critical_days, self.monitor.warning_days
            )));
        }
        if self.bootstrap.parallelism == 0 {
            return Err(Error::config("bootstrap parallelism must be at least 1"));
        }
        if self.certs.ttl_hours == 0 {
            return Err(Error::config("certs ttl_hours must be at least 1"));
        }
        if self.schedule.renew_hour > 23 || self.schedule.report_hour > 23 {
            return Err(Error::config("schedule hours must be 0-23"));
        }

        Ok(())
    }

    /// Look up a service by name.
    pub fn service(&self, name: &str) -> Result<&ServiceSpec> {
        self.services
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| Error::config(format!("unknown service '{name}'")))
    }

    /// Directory holding per-service AppRole credential files
    pub fn approle_dir(&self) -> PathBuf {
        self.base_dir.join("approles")
    }

    /// Credential directory for one service
    pub fn service_approle_dir(&self, name: &str) -> PathBuf {
        self.approle_dir().join(name)
    }

    /// Directory holding per-service certificate material
    pub fn certs_dir(&self) -> PathBuf {
        self.base_dir.join("certs")
    }

    /// Certificate directory for one service
    pub fn service_cert_dir(&self, name: &str) -> PathBuf {
        self.certs_dir().join(name)
    }

    /// Directory holding the CA chain
    pub fn ca_dir(&self) -> PathBuf {
        self.base_dir.join("ca")
    }

    /// File holding unseal material, restored from backup bundles
    pub fn keys_file(&self) -> PathBuf {
        self.base_dir.join("keys")
    }

    /// File holding the operator root credential
    pub fn root_token_file(&self) -> PathBuf {
        self.base_dir.join("root-token")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> String {
        r#"
base_dir: /var/lib/warden
backup_dir: /var/backups/warden
policy_dir: /etc/warden/policies
services:
  - name: postgres
    family: combined
    hostnames: [postgres.internal]
    stateful: true
    snapshot: postgres.sql
    restore_command: [psql, -U, admin]
  - name: redis
"#
        .to_string()
    }

    #[test]
    fn loads_minimal_config_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warden.yaml");
        std::fs::write(&path, minimal_yaml()).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.services.len(), 2);
        assert_eq!(config.backend.addr, "http://127.0.0.1:8200");
        assert_eq!(config.certs.ttl_hours, 8760);
        assert_eq!(config.certs.renew_threshold_days, 30);
        assert_eq!(config.monitor.warning_days, 30);
        assert_eq!(config.monitor.critical_days, 7);
        assert!(!config.bootstrap.refresh_credentials);
        assert_eq!(
            config.service_approle_dir("postgres"),
            PathBuf::from("/var/lib/warden/approles/postgres")
        );
    }

    #[test]
    fn rejects_empty_service_list() {
        let config: Config = serde_yaml::from_str(
            "base_dir: /a\nbackup_dir: /b\npolicy_dir: /c\nservices: []\n",
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("services list is empty"));
    }

    #[test]
    fn rejects_duplicate_service_names() {
        let config: Config = serde_yaml::from_str(
            "base_dir: /a\nbackup_dir: /b\npolicy_dir: /c\nservices:\n  - name: x\n  - name: x\n",
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate service 'x'"));
    }

    #[test]
    fn rejects_inverted_monitor_thresholds() {
        let mut config: Config = serde_yaml::from_str(
            "base_dir: /a\nbackup_dir: /b\npolicy_dir: /c\nservices:\n  - name: x\n",
        )
        .unwrap();
        config.monitor.warning_days = 5;
        config.monitor.critical_days = 10;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("critical_days"));
    }

    #[test]
    fn rejects_restore_command_without_snapshot() {
        let config: Config = serde_yaml::from_str(
            r#"
base_dir: /a
backup_dir: /b
policy_dir: /c
services:
  - name: x
    restore_command: [cat]
"#,
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("restore_command"));
    }

    #[test]
    fn unknown_service_lookup_is_an_error() {
        let config: Config = serde_yaml::from_str(
            "base_dir: /a\nbackup_dir: /b\npolicy_dir: /c\nservices:\n  - name: x\n",
        )
        .unwrap();
        assert!(config.service("x").is_ok());
        assert!(config.service("y").is_err());
    }
}
