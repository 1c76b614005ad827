//! AppRole bootstrap engine
//!
//! Provisions least-privilege backend access for every service in the
//! registry: enables the AppRole auth method, uploads one policy and one role
//! per service, generates credential pairs onto disk, then proves each
//! credential can authenticate and read only its own secret.
//!
//! The engine is idempotent (reruns leave working credentials alone unless
//! refresh is requested) and transactional: any failure after the first
//! mutation rolls back everything it manages before the error surfaces.
//! Prerequisite failures happen before any mutation and never roll back.

use std::path::Path;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use crate::backend::{Backend, BackendError};
use crate::config::Config;
use crate::fsutil;
use crate::service::ServiceIdentity;
use crate::{Error, Result, SECRET_DIR_MODE, SECRET_FILE_MODE};

/// A role-id / secret-id pair persisted for one service.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AppRoleCredential {
    /// Stable role identifier
    pub role_id: String,
    /// One-time-issued authentication secret
    pub secret_id: String,
}

impl AppRoleCredential {
    /// True when both credential files exist in `dir`.
    pub fn exists(dir: &Path) -> bool {
        dir.join("role-id").is_file() && dir.join("secret-id").is_file()
    }

    /// Write both credential files with owner-only permissions.
    pub fn persist(&self, dir: &Path) -> Result<()> {
        fsutil::ensure_dir_with_mode(dir, SECRET_DIR_MODE)?;
        fsutil::write_file_with_mode(&dir.join("role-id"), self.role_id.as_bytes(), SECRET_FILE_MODE)?;
        fsutil::write_file_with_mode(
            &dir.join("secret-id"),
            self.secret_id.as_bytes(),
            SECRET_FILE_MODE,
        )
    }

    /// Load a previously persisted pair.
    pub fn load(dir: &Path) -> Result<Self> {
        let read = |name: &str| -> Result<String> {
            let path = dir.join(name);
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| Error::io(format!("reading {}", path.display()), e))?;
            Ok(raw.trim().to_string())
        };
        Ok(Self {
            role_id: read("role-id")?,
            secret_id: read("secret-id")?,
        })
    }
}

/// What the credential fan-out did for one service.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum CredentialOutcome {
    Generated,
    Reused,
}

/// Summary of a completed bootstrap run.
#[derive(Clone, Debug)]
pub struct BootstrapReport {
    /// Services in the registry
    pub services: usize,
    /// Credential pairs newly generated this run
    pub generated: usize,
    /// Credential pairs left in place from a previous run
    pub reused: usize,
    /// Wall-clock duration of the run
    pub elapsed: std::time::Duration,
}

/// The bootstrap engine. Generic over [`Backend`] so tests can substitute
/// an in-memory implementation.
pub struct BootstrapEngine<B: Backend> {
    backend: B,
    config: Config,
    token: String,
}

impl<B: Backend> BootstrapEngine<B> {
    /// Create an engine bound to a backend, config, and operator token.
    pub fn new(backend: B, config: Config, token: String) -> Self {
        Self {
            backend,
            config,
            token,
        }
    }

    /// Run the full bootstrap sequence.
    ///
    /// On any error after the prerequisite phase the engine rolls back all
    /// managed state before returning the original error.
    pub async fn run(&self) -> Result<BootstrapReport> {
        let start = Instant::now();
        let identities = self.check_prerequisites().await?;
        info!(services = identities.len(), "prerequisites satisfied, starting bootstrap");

        match self.provision(&identities).await {
            Ok((generated, reused)) => {
                let report = BootstrapReport {
                    services: identities.len(),
                    generated,
                    reused,
                    elapsed: start.elapsed(),
                };
                info!(
                    services = report.services,
                    generated = report.generated,
                    reused = report.reused,
                    elapsed = ?report.elapsed,
                    "bootstrap complete"
                );
                Ok(report)
            }
            Err(e) => {
                warn!(error = %e, "bootstrap failed after mutations, rolling back");
                if let Err(rollback_err) = self.rollback().await {
                    warn!(error = %rollback_err, "rollback itself failed; state may be partial");
                }
                Err(e)
            }
        }
    }

    /// Verify everything bootstrap needs before touching any state.
    ///
    /// Returns the loaded service identities so the mutating phase never
    /// re-reads policy files.
    async fn check_prerequisites(&self) -> Result<Vec<ServiceIdentity>> {
        if self.token.is_empty() {
            return Err(Error::prerequisite("no operator token provided"));
        }

        let healthy = self
            .backend
            .health()
            .await
            .map_err(|e| Error::prerequisite(format!("backend health check failed: {e}")))?;
        if !healthy {
            return Err(Error::prerequisite("backend is not healthy"));
        }

        let mut identities = Vec::with_capacity(self.config.services.len());
        for spec in &self.config.services {
            let identity = ServiceIdentity::load(spec, &self.config.policy_dir)
                .map_err(|e| Error::prerequisite(e.to_string()))?;
            identities.push(identity);
        }
        Ok(identities)
    }

    /// The mutating phase: auth method, policies, roles, credentials, then
    /// verification. Caller handles rollback on error.
    async fn provision(&self, identities: &[ServiceIdentity]) -> Result<(usize, usize)> {
        self.enable_role_auth().await?;

        for identity in identities {
            self.backend
                .write_policy(&self.token, identity.name(), &identity.policy)
                .await?;
        }
        for identity in identities {
            self.backend
                .create_role(&self.token, identity.name(), &identity.spec.role)
                .await?;
            debug!(service = %identity.name(), "policy and role in place");
        }

        let outcomes = self.generate_all_credentials(identities).await?;
        let generated = outcomes
            .iter()
            .filter(|o| **o == CredentialOutcome::Generated)
            .count();
        let reused = outcomes.len() - generated;

        for identity in identities {
            self.seed_service_secret(identity).await?;
        }
        for identity in identities {
            self.test_authentication(identity).await?;
        }
        self.verify_isolation(identities).await?;

        Ok((generated, reused))
    }

    async fn enable_role_auth(&self) -> Result<()> {
        match self.backend.enable_approle(&self.token).await {
            Ok(()) => {
                info!("approle auth method enabled");
                Ok(())
            }
            Err(BackendError::Conflict(_)) => {
                debug!("approle auth method already enabled");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Generate (or reuse) credential pairs for all services with bounded
    /// concurrency, aggregating every failure instead of stopping at the
    /// first.
    async fn generate_all_credentials(
        &self,
        identities: &[ServiceIdentity],
    ) -> Result<Vec<CredentialOutcome>> {
        let results: Vec<Result<CredentialOutcome>> = stream::iter(identities)
            .map(|identity| self.provision_credential(identity))
            .buffer_unordered(self.config.bootstrap.parallelism)
            .collect()
            .await;

        let mut outcomes = Vec::with_capacity(results.len());
        let mut errors = Vec::new();
        for result in results {
            match result {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => errors.push(e),
            }
        }

        if errors.is_empty() {
            Ok(outcomes)
        } else if errors.len() == 1 {
            Err(errors.swap_remove(0))
        } else {
            Err(Error::Aggregate(errors))
        }
    }

    async fn provision_credential(&self, identity: &ServiceIdentity) -> Result<CredentialOutcome> {
        let name = identity.name();
        let dir = self.config.service_approle_dir(name);

        if AppRoleCredential::exists(&dir) && !self.config.bootstrap.refresh_credentials {
            debug!(service = %name, "credential files already present, leaving in place");
            return Ok(CredentialOutcome::Reused);
        }

        let role_id = self.backend.read_role_id(&self.token, name).await?;
        let secret_id = self.backend.generate_secret_id(&self.token, name).await?;
        let credential = AppRoleCredential { role_id, secret_id };
        credential.persist(&dir)?;
        info!(service = %name, "credential pair generated");
        Ok(CredentialOutcome::Generated)
    }

    /// Write the service's own secret only when nothing exists at its path.
    /// Existing secrets are operator data and are never overwritten.
    async fn seed_service_secret(&self, identity: &ServiceIdentity) -> Result<()> {
        let path = identity.spec.secret_path();
        match self.backend.read_secret(&self.token, &path).await {
            Ok(_) => {
                debug!(service = %identity.name(), "secret already present, not seeding");
                Ok(())
            }
            Err(BackendError::NotFound(_)) => {
                let mut data = std::collections::BTreeMap::new();
                data.insert(
                    "service".to_string(),
                    serde_json::Value::String(identity.name().to_string()),
                );
                data.insert(
                    "bootstrapped_at".to_string(),
                    serde_json::Value::String(chrono::Utc::now().to_rfc3339()),
                );
                self.backend.write_secret(&self.token, &path, &data).await?;
                debug!(service = %identity.name(), "seeded initial secret");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Prove the generated credential can log in and read its own secret.
    async fn test_authentication(&self, identity: &ServiceIdentity) -> Result<()> {
        let name = identity.name();
        let credential = AppRoleCredential::load(&self.config.service_approle_dir(name))?;

        let token = self
            .backend
            .login(&credential.role_id, &credential.secret_id)
            .await
            .map_err(|e| Error::Authentication {
                service: name.to_string(),
                message: e.to_string(),
            })?;

        self.backend
            .read_secret(&token, &identity.spec.secret_path())
            .await
            .map_err(|e| Error::Authentication {
                service: name.to_string(),
                message: format!("could not read own secret: {e}"),
            })?;

        debug!(service = %name, "authentication test passed");
        Ok(())
    }

    /// Prove no service credential can read another service's secret.
    ///
    /// Every ordered pair is checked. A successful cross-read is a fatal
    /// isolation violation; a rejection from the backend is the expected
    /// outcome.
    async fn verify_isolation(&self, identities: &[ServiceIdentity]) -> Result<()> {
        for reader in identities {
            let credential =
                AppRoleCredential::load(&self.config.service_approle_dir(reader.name()))?;
            let token = self
                .backend
                .login(&credential.role_id, &credential.secret_id)
                .await
                .map_err(|e| Error::Authentication {
                    service: reader.name().to_string(),
                    message: e.to_string(),
                })?;

            for target in identities {
                if reader.name() == target.name() {
                    continue;
                }
                match self
                    .backend
                    .read_secret(&token, &target.spec.secret_path())
                    .await
                {
                    Ok(_) => {
                        return Err(Error::Isolation {
                            service: reader.name().to_string(),
                            target: target.name().to_string(),
                        });
                    }
                    Err(BackendError::Unauthenticated(_)) => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        info!(services = identities.len(), "pairwise isolation verified");
        Ok(())
    }

    /// Remove everything bootstrap manages: auth method, roles, policies,
    /// and on-disk credential files. Entities that are already gone are
    /// skipped, so rollback is safe to run against partial state.
    pub async fn rollback(&self) -> Result<()> {
        info!("rolling back bootstrap state");

        match self.backend.disable_approle(&self.token).await {
            Ok(()) | Err(BackendError::NotFound(_)) => {}
            Err(e) => warn!(error = %e, "could not disable approle auth"),
        }

        for spec in &self.config.services {
            match self.backend.delete_role(&self.token, &spec.name).await {
                Ok(()) | Err(BackendError::NotFound(_)) => {}
                Err(e) => warn!(service = %spec.name, error = %e, "could not delete role"),
            }
            match self.backend.delete_policy(&self.token, &spec.name).await {
                Ok(()) | Err(BackendError::NotFound(_)) => {}
                Err(e) => warn!(service = %spec.name, error = %e, "could not delete policy"),
            }
        }

        let approle_dir = self.config.approle_dir();
        if approle_dir.exists() {
            std::fs::remove_dir_all(&approle_dir)
                .map_err(|e| Error::io(format!("removing {}", approle_dir.display()), e))?;
        }

        info!("rollback complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet};
    // Shadows the crate-wide alias: trait impls below name their error type.
    use std::result::Result;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::backend::{IssueRequest, IssuedCertificate};
    use crate::service::RoleConfig;

    /// In-memory backend that models the real API's state transitions.
    #[derive(Default)]
    struct MemState {
        auth_enabled: bool,
        policies: BTreeMap<String, String>,
        roles: BTreeSet<String>,
        secrets: BTreeMap<String, BTreeMap<String, serde_json::Value>>,
        secret_id_counter: u32,
        /// Mutating calls in arrival order, for ordering assertions
        ops: Vec<String>,
        /// Operation name that should fail, for fault injection
        fail_on: Option<String>,
        /// When set, every service token can read every secret
        leaky: bool,
    }

    #[derive(Default)]
    struct MemBackend {
        state: Mutex<MemState>,
    }

    impl MemBackend {
        fn failing_on(op: &str) -> Self {
            let backend = Self::default();
            backend.state.lock().unwrap().fail_on = Some(op.to_string());
            backend
        }

        fn leaky() -> Self {
            let backend = Self::default();
            backend.state.lock().unwrap().leaky = true;
            backend
        }

        fn check_fail(state: &MemState, op: &str) -> Result<(), BackendError> {
            if state.fail_on.as_deref() == Some(op) {
                return Err(BackendError::Server {
                    status: 500,
                    message: format!("injected failure in {op}"),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Backend for MemBackend {
        async fn health(&self) -> Result<bool, BackendError> {
            Ok(true)
        }

        async fn login(&self, role_id: &str, secret_id: &str) -> Result<String, BackendError> {
            let state = self.state.lock().unwrap();
            let service = role_id
                .strip_prefix("rid-")
                .ok_or_else(|| BackendError::Unauthenticated("unknown role-id".into()))?;
            if !secret_id.starts_with("sid-") {
                return Err(BackendError::Unauthenticated("bad secret-id".into()));
            }
            if !state.roles.contains(service) {
                return Err(BackendError::Unauthenticated("role deleted".into()));
            }
            Ok(format!("tok-{service}"))
        }

        async fn read_secret(
            &self,
            token: &str,
            path: &str,
        ) -> Result<BTreeMap<String, serde_json::Value>, BackendError> {
            let state = self.state.lock().unwrap();
            if let Some(service) = token.strip_prefix("tok-") {
                let own = format!("secret/{service}");
                if path != own && !state.leaky {
                    return Err(BackendError::Unauthenticated(format!(
                        "token for {service} denied on {path}"
                    )));
                }
            } else if token != "root" {
                return Err(BackendError::Unauthenticated("bad token".into()));
            }
            state
                .secrets
                .get(path)
                .cloned()
                .ok_or_else(|| BackendError::NotFound(path.to_string()))
        }

        async fn write_secret(
            &self,
            _token: &str,
            path: &str,
            data: &BTreeMap<String, serde_json::Value>,
        ) -> Result<(), BackendError> {
            let mut state = self.state.lock().unwrap();
            state.secrets.insert(path.to_string(), data.clone());
            Ok(())
        }

        async fn issue_certificate(
            &self,
            _token: &str,
            _role: &str,
            _request: &IssueRequest,
        ) -> Result<IssuedCertificate, BackendError> {
            unimplemented!("not exercised by bootstrap")
        }

        async fn read_ca_chain(&self) -> Result<String, BackendError> {
            unimplemented!("not exercised by bootstrap")
        }

        async fn enable_approle(&self, _token: &str) -> Result<(), BackendError> {
            let mut state = self.state.lock().unwrap();
            Self::check_fail(&state, "enable_approle")?;
            if state.auth_enabled {
                return Err(BackendError::Conflict("already enabled".into()));
            }
            state.auth_enabled = true;
            Ok(())
        }

        async fn disable_approle(&self, _token: &str) -> Result<(), BackendError> {
            let mut state = self.state.lock().unwrap();
            state.auth_enabled = false;
            Ok(())
        }

        async fn write_policy(
            &self,
            _token: &str,
            name: &str,
            document: &str,
        ) -> Result<(), BackendError> {
            let mut state = self.state.lock().unwrap();
            Self::check_fail(&state, "write_policy")?;
            state.policies.insert(name.to_string(), document.to_string());
            state.ops.push(format!("policy:{name}"));
            Ok(())
        }

        async fn delete_policy(&self, _token: &str, name: &str) -> Result<(), BackendError> {
            let mut state = self.state.lock().unwrap();
            if state.policies.remove(name).is_none() {
                return Err(BackendError::NotFound(name.to_string()));
            }
            Ok(())
        }

        async fn create_role(
            &self,
            _token: &str,
            name: &str,
            _config: &RoleConfig,
        ) -> Result<(), BackendError> {
            let mut state = self.state.lock().unwrap();
            if state.fail_on.as_deref() == Some(name) {
                return Err(BackendError::Server {
                    status: 500,
                    message: format!("injected failure creating role {name}"),
                });
            }
            Self::check_fail(&state, "create_role")?;
            state.roles.insert(name.to_string());
            state.ops.push(format!("role:{name}"));
            Ok(())
        }

        async fn delete_role(&self, _token: &str, name: &str) -> Result<(), BackendError> {
            let mut state = self.state.lock().unwrap();
            if !state.roles.remove(name) {
                return Err(BackendError::NotFound(name.to_string()));
            }
            Ok(())
        }

        async fn read_role_id(&self, _token: &str, name: &str) -> Result<String, BackendError> {
            let state = self.state.lock().unwrap();
            if !state.roles.contains(name) {
                return Err(BackendError::NotFound(name.to_string()));
            }
            Ok(format!("rid-{name}"))
        }

        async fn generate_secret_id(
            &self,
            _token: &str,
            name: &str,
        ) -> Result<String, BackendError> {
            let mut state = self.state.lock().unwrap();
            if !state.roles.contains(name) {
                return Err(BackendError::NotFound(name.to_string()));
            }
            state.secret_id_counter += 1;
            Ok(format!("sid-{}-{}", name, state.secret_id_counter))
        }
    }

    fn test_config(base: &Path, policy_dir: &Path) -> Config {
        let yaml = format!(
            r#"
base_dir: {}
backup_dir: {}
policy_dir: {}
services:
  - name: alpha
  - name: beta
"#,
            base.display(),
            base.join("backups").display(),
            policy_dir.display(),
        );
        serde_yaml::from_str(&yaml).unwrap()
    }

    fn write_policies(policy_dir: &Path, names: &[&str]) {
        std::fs::create_dir_all(policy_dir).unwrap();
        for name in names {
            std::fs::write(
                policy_dir.join(format!("{name}.hcl")),
                format!("path \"secret/{name}\" {{ capabilities = [\"read\"] }}"),
            )
            .unwrap();
        }
    }

    #[tokio::test]
    async fn bootstrap_provisions_policies_roles_and_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let policy_dir = dir.path().join("policies");
        write_policies(&policy_dir, &["alpha", "beta"]);
        let config = test_config(dir.path(), &policy_dir);

        let engine = BootstrapEngine::new(MemBackend::default(), config.clone(), "root".into());
        let report = engine.run().await.unwrap();

        assert_eq!(report.services, 2);
        assert_eq!(report.generated, 2);
        assert_eq!(report.reused, 0);

        let state = engine.backend.state.lock().unwrap();
        assert!(state.auth_enabled);
        assert!(state.policies.contains_key("alpha"));
        assert!(state.roles.contains("beta"));
        drop(state);

        let cred = AppRoleCredential::load(&config.service_approle_dir("alpha")).unwrap();
        assert_eq!(cred.role_id, "rid-alpha");
        assert!(cred.secret_id.starts_with("sid-alpha"));

        #[cfg(unix)]
        {
            assert_eq!(
                crate::fsutil::file_mode(&config.service_approle_dir("alpha")),
                Some(0o700)
            );
            assert_eq!(
                crate::fsutil::file_mode(&config.service_approle_dir("alpha").join("secret-id")),
                Some(0o600)
            );
        }
    }

    #[tokio::test]
    async fn all_policies_are_uploaded_before_any_role() {
        let dir = tempfile::tempdir().unwrap();
        let policy_dir = dir.path().join("policies");
        write_policies(&policy_dir, &["alpha", "beta"]);
        let config = test_config(dir.path(), &policy_dir);

        let engine = BootstrapEngine::new(MemBackend::default(), config, "root".into());
        engine.run().await.unwrap();

        let state = engine.backend.state.lock().unwrap();
        let last_policy = state
            .ops
            .iter()
            .rposition(|op| op.starts_with("policy:"))
            .unwrap();
        let first_role = state
            .ops
            .iter()
            .position(|op| op.starts_with("role:"))
            .unwrap();
        assert!(last_policy < first_role, "ops: {:?}", state.ops);
    }

    #[tokio::test]
    async fn rerun_reuses_existing_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let policy_dir = dir.path().join("policies");
        write_policies(&policy_dir, &["alpha", "beta"]);
        let config = test_config(dir.path(), &policy_dir);

        let engine = BootstrapEngine::new(MemBackend::default(), config.clone(), "root".into());
        engine.run().await.unwrap();
        let before =
            std::fs::read_to_string(config.service_approle_dir("alpha").join("secret-id")).unwrap();

        let report = engine.run().await.unwrap();
        assert_eq!(report.generated, 0);
        assert_eq!(report.reused, 2);
        let after =
            std::fs::read_to_string(config.service_approle_dir("alpha").join("secret-id")).unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn refresh_regenerates_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let policy_dir = dir.path().join("policies");
        write_policies(&policy_dir, &["alpha", "beta"]);
        let mut config = test_config(dir.path(), &policy_dir);

        let engine =
            BootstrapEngine::new(MemBackend::default(), config.clone(), "root".into());
        engine.run().await.unwrap();
        let before =
            std::fs::read_to_string(config.service_approle_dir("alpha").join("secret-id")).unwrap();

        config.bootstrap.refresh_credentials = true;
        let engine = BootstrapEngine::new(engine.backend, config.clone(), "root".into());
        let report = engine.run().await.unwrap();
        assert_eq!(report.generated, 2);
        let after =
            std::fs::read_to_string(config.service_approle_dir("alpha").join("secret-id")).unwrap();
        assert_ne!(before, after);
    }

    #[tokio::test]
    async fn missing_policy_file_fails_before_any_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let policy_dir = dir.path().join("policies");
        write_policies(&policy_dir, &["alpha"]); // beta's policy is missing
        let config = test_config(dir.path(), &policy_dir);

        let engine = BootstrapEngine::new(MemBackend::default(), config.clone(), "root".into());
        let err = engine.run().await.unwrap_err();
        assert!(err.is_prerequisite());

        let state = engine.backend.state.lock().unwrap();
        assert!(!state.auth_enabled);
        assert!(state.policies.is_empty());
        assert!(!config.approle_dir().exists());
    }

    #[tokio::test]
    async fn empty_token_fails_before_any_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let policy_dir = dir.path().join("policies");
        write_policies(&policy_dir, &["alpha", "beta"]);
        let config = test_config(dir.path(), &policy_dir);

        let engine = BootstrapEngine::new(MemBackend::default(), config, String::new());
        let err = engine.run().await.unwrap_err();
        assert!(err.is_prerequisite());
        assert!(!engine.backend.state.lock().unwrap().auth_enabled);
    }

    #[tokio::test]
    async fn mid_run_failure_rolls_back_everything() {
        let dir = tempfile::tempdir().unwrap();
        let policy_dir = dir.path().join("policies");
        write_policies(&policy_dir, &["alpha", "beta"]);
        let config = test_config(dir.path(), &policy_dir);

        // Role creation for beta fails after alpha's policy and role exist.
        let engine =
            BootstrapEngine::new(MemBackend::failing_on("beta"), config.clone(), "root".into());
        let err = engine.run().await.unwrap_err();
        assert!(!err.is_prerequisite());
        assert!(err.to_string().contains("injected failure"));

        let state = engine.backend.state.lock().unwrap();
        assert!(!state.auth_enabled);
        assert!(state.policies.is_empty());
        assert!(state.roles.is_empty());
        drop(state);
        assert!(!config.approle_dir().exists());
    }

    #[tokio::test]
    async fn isolation_violation_is_fatal_and_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let policy_dir = dir.path().join("policies");
        write_policies(&policy_dir, &["alpha", "beta"]);
        let config = test_config(dir.path(), &policy_dir);

        let engine = BootstrapEngine::new(MemBackend::leaky(), config.clone(), "root".into());
        let err = engine.run().await.unwrap_err();
        match err {
            Error::Isolation { service, target } => {
                assert_ne!(service, target);
            }
            other => panic!("expected isolation violation, got {other}"),
        }
        assert!(!config.approle_dir().exists());
        assert!(engine.backend.state.lock().unwrap().roles.is_empty());
    }

    #[tokio::test]
    async fn existing_secrets_are_never_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let policy_dir = dir.path().join("policies");
        write_policies(&policy_dir, &["alpha", "beta"]);
        let config = test_config(dir.path(), &policy_dir);

        let backend = MemBackend::default();
        let mut data = BTreeMap::new();
        data.insert(
            "password".to_string(),
            serde_json::Value::String("operator-set".into()),
        );
        backend
            .state
            .lock()
            .unwrap()
            .secrets
            .insert("secret/alpha".to_string(), data);

        let engine = BootstrapEngine::new(backend, config, "root".into());
        engine.run().await.unwrap();

        let state = engine.backend.state.lock().unwrap();
        let alpha = state.secrets.get("secret/alpha").unwrap();
        assert_eq!(
            alpha.get("password").unwrap(),
            &serde_json::Value::String("operator-set".into())
        );
        // Beta had no secret, so it was seeded.
        assert!(state.secrets.contains_key("secret/beta"));
    }

    #[tokio::test]
    async fn rollback_tolerates_absent_state() {
        let dir = tempfile::tempdir().unwrap();
        let policy_dir = dir.path().join("policies");
        write_policies(&policy_dir, &["alpha", "beta"]);
        let config = test_config(dir.path(), &policy_dir);

        let engine = BootstrapEngine::new(MemBackend::default(), config, "root".into());
        // Nothing was ever provisioned; rollback must still succeed.
        engine.rollback().await.unwrap();
    }
}
