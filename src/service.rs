//! Service registry types
//!
//! Each managed service is described once in configuration and never mutated
//! afterwards: its name keys everything else (policy name, AppRole name, PKI
//! role, certificate directory). The registry is fixed at setup time.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Certificate file-layout family.
///
/// Services within one family share an on-disk certificate format, so layout
/// dispatch is keyed by family rather than by individual service name.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceFamily {
    /// The canonical `server.crt` / `server.key` / `ca.crt` triad only
    #[default]
    Canonical,
    /// Additionally a single combined cert+key PEM (`<service>.pem`)
    Combined,
    /// Additionally `<service>-cert.pem` / `<service>-key.pem` pair
    SuffixPair,
}

/// Role configuration applied when the service's AppRole is created.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct RoleConfig {
    /// TTL of tokens issued by login
    pub token_ttl: String,
    /// Maximum TTL tokens can be renewed to
    pub token_max_ttl: String,
    /// Validity window of generated secret-id credentials
    pub secret_id_ttl: String,
    /// Use-count cap for each secret-id; zero means unlimited.
    ///
    /// Unlimited-use bearer credentials are a deliberate security trade-off,
    /// so zero is accepted but flagged at config validation.
    pub secret_id_num_uses: u32,
}

impl Default for RoleConfig {
    fn default() -> Self {
        Self {
            token_ttl: "1h".to_string(),
            token_max_ttl: "4h".to_string(),
            secret_id_ttl: crate::DEFAULT_SECRET_ID_TTL.to_string(),
            secret_id_num_uses: crate::DEFAULT_SECRET_ID_NUM_USES,
        }
    }
}

/// One service entry in the registry, as written in the config file.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ServiceSpec {
    /// Service name; unique key for policies, roles, and directories
    pub name: String,
    /// Certificate layout family
    #[serde(default)]
    pub family: ServiceFamily,
    /// Hostname SANs for issued certificates (first entry is the CN)
    #[serde(default)]
    pub hostnames: Vec<String>,
    /// IP SANs for issued certificates
    #[serde(default)]
    pub ip_sans: Vec<String>,
    /// AppRole configuration
    #[serde(default)]
    pub role: RoleConfig,
    /// PKI role certificates are issued under; defaults to the service
    /// name. Each service's issuing role constrains which names it may
    /// request.
    #[serde(default)]
    pub pki_role: Option<String>,
    /// Whether the service owns data that backup bundles may snapshot
    #[serde(default)]
    pub stateful: bool,
    /// Snapshot filename inside a backup bundle's `snapshots/` directory
    #[serde(default)]
    pub snapshot: Option<String>,
    /// Command run inside the service container with the snapshot on stdin
    #[serde(default)]
    pub restore_command: Option<Vec<String>>,
}

impl ServiceSpec {
    /// Common name used when requesting a certificate for this service
    pub fn common_name(&self) -> &str {
        self.hostnames.first().map(String::as_str).unwrap_or(&self.name)
    }

    /// Path of this service's own secret in the KV store
    pub fn secret_path(&self) -> String {
        format!("secret/{}", self.name)
    }

    /// PKI role this service's certificates are issued under
    pub fn pki_role(&self) -> &str {
        self.pki_role.as_deref().unwrap_or(&self.name)
    }
}

/// A service plus its loaded access-policy document.
///
/// Immutable once loaded; created during bootstrap configuration loading.
#[derive(Clone, Debug)]
pub struct ServiceIdentity {
    /// Registry entry for this service
    pub spec: ServiceSpec,
    /// Policy document text uploaded to the backend
    pub policy: String,
}

impl ServiceIdentity {
    /// Load a service identity by reading its policy document from disk.
    ///
    /// The policy file must live at `<policy_dir>/<name>.hcl`.
    pub fn load(spec: &ServiceSpec, policy_dir: &Path) -> Result<Self> {
        let path = spec.policy_path(policy_dir);
        let policy = std::fs::read_to_string(&path)
            .map_err(|e| Error::io(format!("reading policy {}", path.display()), e))?;
        Ok(Self {
            spec: spec.clone(),
            policy,
        })
    }

    /// Service name
    pub fn name(&self) -> &str {
        &self.spec.name
    }
}

impl ServiceSpec {
    /// Path of this service's policy document on disk
    pub fn policy_path(&self, policy_dir: &Path) -> std::path::PathBuf {
        policy_dir.join(format!("{}.hcl", self.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> ServiceSpec {
        ServiceSpec {
            name: name.to_string(),
            family: ServiceFamily::Canonical,
            hostnames: vec![],
            ip_sans: vec![],
            role: RoleConfig::default(),
            pki_role: None,
            stateful: false,
            snapshot: None,
            restore_command: None,
        }
    }

    #[test]
    fn common_name_prefers_first_hostname() {
        let mut s = spec("postgres");
        assert_eq!(s.common_name(), "postgres");

        s.hostnames = vec!["postgres.internal".into(), "db.internal".into()];
        assert_eq!(s.common_name(), "postgres.internal");
    }

    #[test]
    fn role_defaults_use_a_finite_secret_id_cap() {
        let role = RoleConfig::default();
        assert_eq!(role.secret_id_ttl, "720h");
        assert_ne!(role.secret_id_num_uses, 0);
    }

    #[test]
    fn identity_load_fails_on_missing_policy() {
        let dir = tempfile::tempdir().unwrap();
        let err = ServiceIdentity::load(&spec("alpha"), dir.path()).unwrap_err();
        assert!(err.to_string().contains("alpha.hcl"));
    }

    #[test]
    fn identity_load_reads_policy_text() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("alpha.hcl"),
            "path \"secret/data/alpha\" { capabilities = [\"read\"] }",
        )
        .unwrap();

        let identity = ServiceIdentity::load(&spec("alpha"), dir.path()).unwrap();
        assert!(identity.policy.contains("secret/data/alpha"));
        assert_eq!(identity.name(), "alpha");
    }
}
