//! Secret backend HTTP client
//!
//! Thin typed wrapper over the backend's HTTP API: health, AppRole auth
//! management, login, KV reads/writes, policy uploads, and PKI issuance.
//! The client performs no retries and holds no ambient credentials; every
//! authenticated call takes its token explicitly and retry policy lives in
//! the callers.

use std::collections::BTreeMap;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::BackendConfig;
use crate::service::RoleConfig;

/// Typed failures from the secret backend.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Could not reach the backend at all (connect failure or timeout)
    #[error("backend unreachable: {0}")]
    Unreachable(String),

    /// The backend rejected the supplied token or credential
    #[error("backend rejected credentials: {0}")]
    Unauthenticated(String),

    /// The named entity does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// The entity already exists or the operation was already performed
    #[error("conflict: {0}")]
    Conflict(String),

    /// The backend returned an unexpected server-side error
    #[error("backend error (status {status}): {message}")]
    Server {
        /// HTTP status code
        status: u16,
        /// Response body or status text
        message: String,
    },

    /// The response body did not have the expected shape
    #[error("invalid backend response: {0}")]
    InvalidResponse(String),
}

impl BackendError {
    /// True for transport-level failures worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }
}

/// A certificate issuance request.
#[derive(Clone, Debug, Serialize)]
pub struct IssueRequest {
    /// Leaf common name
    pub common_name: String,
    /// DNS SANs
    pub alt_names: Vec<String>,
    /// IP SANs
    pub ip_sans: Vec<String>,
    /// Requested TTL, e.g. `8760h`
    pub ttl: String,
}

/// Material returned by a successful issuance.
#[derive(Clone, Debug, Deserialize)]
pub struct IssuedCertificate {
    /// Leaf certificate, PEM
    pub certificate: String,
    /// Private key, PEM
    pub private_key: String,
    /// Issuing chain, leaf-adjacent first, PEM
    #[serde(default)]
    pub ca_chain: Vec<String>,
}

impl IssuedCertificate {
    /// The CA chain concatenated into one PEM blob.
    pub fn ca_bundle(&self) -> String {
        self.ca_chain.join("\n")
    }
}

/// Operations the orchestrator needs from a secret backend.
///
/// The HTTP implementation is [`HttpBackend`]; tests substitute mocks or
/// in-memory fakes through this trait.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Backend: Send + Sync {
    /// True when the backend is reachable, unsealed, and serving requests.
    async fn health(&self) -> Result<bool, BackendError>;

    /// Exchange an AppRole credential pair for a client token.
    async fn login(&self, role_id: &str, secret_id: &str) -> Result<String, BackendError>;

    /// Read a KV secret. `NotFound` when the path has never been written.
    async fn read_secret(
        &self,
        token: &str,
        path: &str,
    ) -> Result<BTreeMap<String, serde_json::Value>, BackendError>;

    /// Write a KV secret.
    async fn write_secret(
        &self,
        token: &str,
        path: &str,
        data: &BTreeMap<String, serde_json::Value>,
    ) -> Result<(), BackendError>;

    /// Request a certificate from the PKI authority.
    async fn issue_certificate(
        &self,
        token: &str,
        role: &str,
        request: &IssueRequest,
    ) -> Result<IssuedCertificate, BackendError>;

    /// Fetch the PKI authority's CA certificate chain, PEM. Serves as the
    /// readiness probe for the PKI engine; the endpoint is unauthenticated.
    async fn read_ca_chain(&self) -> Result<String, BackendError>;

    /// Enable the AppRole auth method. `Conflict` when already enabled.
    async fn enable_approle(&self, token: &str) -> Result<(), BackendError>;

    /// Disable the AppRole auth method.
    async fn disable_approle(&self, token: &str) -> Result<(), BackendError>;

    /// Upload (create or replace) a named policy.
    async fn write_policy(
        &self,
        token: &str,
        name: &str,
        document: &str,
    ) -> Result<(), BackendError>;

    /// Delete a named policy.
    async fn delete_policy(&self, token: &str, name: &str) -> Result<(), BackendError>;

    /// Create or update an AppRole role.
    async fn create_role(
        &self,
        token: &str,
        name: &str,
        config: &RoleConfig,
    ) -> Result<(), BackendError>;

    /// Delete an AppRole role.
    async fn delete_role(&self, token: &str, name: &str) -> Result<(), BackendError>;

    /// Read the stable role-id of a role.
    async fn read_role_id(&self, token: &str, name: &str) -> Result<String, BackendError>;

    /// Generate a fresh secret-id for a role.
    async fn generate_secret_id(&self, token: &str, name: &str) -> Result<String, BackendError>;
}

/// HTTP implementation of [`Backend`] over reqwest.
pub struct HttpBackend {
    client: reqwest::Client,
    base: String,
}

impl HttpBackend {
    /// Build a client from backend connection config.
    pub fn new(config: &BackendConfig) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| BackendError::InvalidResponse(e.to_string()))?;
        Ok(Self {
            client,
            base: config.addr.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path.trim_start_matches('/'))
    }

    fn transport_error(e: reqwest::Error) -> BackendError {
        if e.is_connect() || e.is_timeout() {
            BackendError::Unreachable(e.to_string())
        } else {
            BackendError::Server {
                status: 0,
                message: e.to_string(),
            }
        }
    }

    /// Map a non-success response onto a typed error, consuming the body.
    async fn error_for(what: &str, resp: reqwest::Response) -> BackendError {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        let message = if body.is_empty() {
            what.to_string()
        } else {
            format!("{what}: {body}")
        };
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                BackendError::Unauthenticated(message)
            }
            StatusCode::NOT_FOUND => BackendError::NotFound(message),
            StatusCode::CONFLICT => BackendError::Conflict(message),
            _ => BackendError::Server {
                status: status.as_u16(),
                message,
            },
        }
    }

    async fn send(
        &self,
        what: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, BackendError> {
        let resp = request.send().await.map_err(Self::transport_error)?;
        if resp.status().is_success() {
            Ok(resp)
        } else {
            Err(Self::error_for(what, resp).await)
        }
    }

    fn authed(&self, request: reqwest::RequestBuilder, token: &str) -> reqwest::RequestBuilder {
        request.bearer_auth(token)
    }
}

#[derive(Deserialize)]
struct LoginResponse {
    token: String,
}

#[derive(Deserialize)]
struct SecretResponse {
    data: BTreeMap<String, serde_json::Value>,
}

#[derive(Deserialize)]
struct RoleIdResponse {
    role_id: String,
}

#[derive(Deserialize)]
struct SecretIdResponse {
    secret_id: String,
}

#[async_trait]
impl Backend for HttpBackend {
    async fn health(&self) -> Result<bool, BackendError> {
        let resp = self
            .client
            .get(self.url("health"))
            .send()
            .await
            .map_err(Self::transport_error)?;
        debug!(status = %resp.status(), "backend health probe");
        Ok(resp.status().is_success())
    }

    async fn login(&self, role_id: &str, secret_id: &str) -> Result<String, BackendError> {
        let body = serde_json::json!({ "role_id": role_id, "secret_id": secret_id });
        let resp = self
            .send(
                "approle login",
                self.client.post(self.url("auth/approle/login")).json(&body),
            )
            .await?;
        let login: LoginResponse = resp
            .json()
            .await
            .map_err(|e| BackendError::InvalidResponse(format!("login response: {e}")))?;
        Ok(login.token)
    }

    async fn read_secret(
        &self,
        token: &str,
        path: &str,
    ) -> Result<BTreeMap<String, serde_json::Value>, BackendError> {
        let resp = self
            .send(
                &format!("read {path}"),
                self.authed(self.client.get(self.url(path)), token),
            )
            .await?;
        let secret: SecretResponse = resp
            .json()
            .await
            .map_err(|e| BackendError::InvalidResponse(format!("secret response: {e}")))?;
        Ok(secret.data)
    }

    async fn write_secret(
        &self,
        token: &str,
        path: &str,
        data: &BTreeMap<String, serde_json::Value>,
    ) -> Result<(), BackendError> {
        self.send(
            &format!("write {path}"),
            self.authed(self.client.post(self.url(path)).json(data), token),
        )
        .await?;
        Ok(())
    }

    async fn issue_certificate(
        &self,
        token: &str,
        role: &str,
        request: &IssueRequest,
    ) -> Result<IssuedCertificate, BackendError> {
        let resp = self
            .send(
                &format!("issue certificate for {}", request.common_name),
                self.authed(
                    self.client
                        .post(self.url(&format!("pki/issue/{role}")))
                        .json(request),
                    token,
                ),
            )
            .await?;
        resp.json()
            .await
            .map_err(|e| BackendError::InvalidResponse(format!("issuance response: {e}")))
    }

    async fn read_ca_chain(&self) -> Result<String, BackendError> {
        let resp = self
            .send("read ca chain", self.client.get(self.url("pki/ca/pem")))
            .await?;
        resp.text()
            .await
            .map_err(|e| BackendError::InvalidResponse(format!("ca response: {e}")))
    }

    async fn enable_approle(&self, token: &str) -> Result<(), BackendError> {
        self.send(
            "enable approle auth",
            self.authed(self.client.post(self.url("sys/auth/approle")), token),
        )
        .await?;
        Ok(())
    }

    async fn disable_approle(&self, token: &str) -> Result<(), BackendError> {
        self.send(
            "disable approle auth",
            self.authed(self.client.delete(self.url("sys/auth/approle")), token),
        )
        .await?;
        Ok(())
    }

    async fn write_policy(
        &self,
        token: &str,
        name: &str,
        document: &str,
    ) -> Result<(), BackendError> {
        let body = serde_json::json!({ "policy": document });
        self.send(
            &format!("write policy {name}"),
            self.authed(
                self.client
                    .put(self.url(&format!("sys/policy/{name}")))
                    .json(&body),
                token,
            ),
        )
        .await?;
        Ok(())
    }

    async fn delete_policy(&self, token: &str, name: &str) -> Result<(), BackendError> {
        self.send(
            &format!("delete policy {name}"),
            self.authed(
                self.client.delete(self.url(&format!("sys/policy/{name}"))),
                token,
            ),
        )
        .await?;
        Ok(())
    }

    async fn create_role(
        &self,
        token: &str,
        name: &str,
        config: &RoleConfig,
    ) -> Result<(), BackendError> {
        let body = serde_json::json!({
            "token_ttl": config.token_ttl,
            "token_max_ttl": config.token_max_ttl,
            "secret_id_ttl": config.secret_id_ttl,
            "secret_id_num_uses": config.secret_id_num_uses,
            "token_policies": [name],
        });
        self.send(
            &format!("create role {name}"),
            self.authed(
                self.client
                    .put(self.url(&format!("auth/approle/role/{name}")))
                    .json(&body),
                token,
            ),
        )
        .await?;
        Ok(())
    }

    async fn delete_role(&self, token: &str, name: &str) -> Result<(), BackendError> {
        self.send(
            &format!("delete role {name}"),
            self.authed(
                self.client
                    .delete(self.url(&format!("auth/approle/role/{name}"))),
                token,
            ),
        )
        .await?;
        Ok(())
    }

    async fn read_role_id(&self, token: &str, name: &str) -> Result<String, BackendError> {
        let resp = self
            .send(
                &format!("read role-id for {name}"),
                self.authed(
                    self.client
                        .get(self.url(&format!("auth/approle/role/{name}/role-id"))),
                    token,
                ),
            )
            .await?;
        let role: RoleIdResponse = resp
            .json()
            .await
            .map_err(|e| BackendError::InvalidResponse(format!("role-id response: {e}")))?;
        Ok(role.role_id)
    }

    async fn generate_secret_id(&self, token: &str, name: &str) -> Result<String, BackendError> {
        let resp = self
            .send(
                &format!("generate secret-id for {name}"),
                self.authed(
                    self.client
                        .post(self.url(&format!("auth/approle/role/{name}/secret-id"))),
                    token,
                ),
            )
            .await?;
        let secret: SecretIdResponse = resp
            .json()
            .await
            .map_err(|e| BackendError::InvalidResponse(format!("secret-id response: {e}")))?;
        Ok(secret.secret_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_joins_without_double_slashes() {
        let backend = HttpBackend::new(&BackendConfig {
            addr: "http://127.0.0.1:8200/".to_string(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            backend.url("/auth/approle/login"),
            "http://127.0.0.1:8200/auth/approle/login"
        );
        assert_eq!(backend.url("health"), "http://127.0.0.1:8200/health");
    }

    #[test]
    fn ca_bundle_concatenates_chain() {
        let issued = IssuedCertificate {
            certificate: "LEAF".into(),
            private_key: "KEY".into(),
            ca_chain: vec!["INT".into(), "ROOT".into()],
        };
        assert_eq!(issued.ca_bundle(), "INT\nROOT");

        let no_chain = IssuedCertificate {
            certificate: "LEAF".into(),
            private_key: "KEY".into(),
            ca_chain: vec![],
        };
        assert_eq!(no_chain.ca_bundle(), "");
    }

    #[test]
    fn only_unreachable_is_transient() {
        assert!(BackendError::Unreachable("connect refused".into()).is_transient());
        assert!(!BackendError::Unauthenticated("denied".into()).is_transient());
        assert!(!BackendError::NotFound("role".into()).is_transient());
        assert!(!BackendError::Server {
            status: 500,
            message: "boom".into()
        }
        .is_transient());
    }

    #[tokio::test]
    async fn mock_backend_satisfies_trait() {
        let mut mock = MockBackend::new();
        mock.expect_health().returning(|| Ok(true));
        mock.expect_read_role_id()
            .withf(|_, name| name == "alpha")
            .returning(|_, _| Ok("rid-alpha".to_string()));

        assert!(mock.health().await.unwrap());
        assert_eq!(mock.read_role_id("t", "alpha").await.unwrap(), "rid-alpha");
    }
}
