//! Certificate lifecycle management
//!
//! Issues per-service TLS material from the backend's PKI authority and
//! writes it to disk in each service's layout. Issuance is skip-if-valid:
//! a certificate with comfortably more lifetime than the renewal threshold
//! is left alone, so the renewal pass is cheap to run on a schedule.

pub mod layout;

use std::path::Path;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use tracing::{debug, info};

use crate::backend::{Backend, IssueRequest, IssuedCertificate};
use crate::config::Config;
use crate::fsutil;
use crate::retry::{retry_fixed, wait_for, PollConfig};
use crate::service::ServiceSpec;
use crate::{Error, Result, PUBLIC_FILE_MODE, SECRET_FILE_MODE};

/// Mode for per-service certificate directories: certificates are public,
/// but the directory also holds the private key's parent path.
const CERT_DIR_MODE: u32 = 0o755;

/// Attempts for one issuance call when the backend is unreachable.
const ISSUE_ATTEMPTS: u32 = 3;

/// Pause between issuance attempts.
const ISSUE_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Days of validity left in a certificate file.
///
/// Errors on a missing or unparsable file; callers that only need a
/// yes/no answer use [`is_valid`].
pub fn days_remaining(path: &Path) -> Result<i64> {
    let raw = std::fs::read(path)
        .map_err(|e| Error::io(format!("reading certificate {}", path.display()), e))?;
    let (_, pem) = x509_parser::pem::parse_x509_pem(&raw)
        .map_err(|e| Error::CertParse(format!("{}: {e}", path.display())))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| Error::CertParse(format!("{}: {e}", path.display())))?;

    let not_after = cert.validity().not_after.timestamp();
    let now = chrono::Utc::now().timestamp();
    Ok((not_after - now) / 86_400)
}

/// Expiry instant (`notAfter`) of a certificate file.
pub fn not_after(path: &Path) -> Result<chrono::DateTime<chrono::Utc>> {
    let raw = std::fs::read(path)
        .map_err(|e| Error::io(format!("reading certificate {}", path.display()), e))?;
    let (_, pem) = x509_parser::pem::parse_x509_pem(&raw)
        .map_err(|e| Error::CertParse(format!("{}: {e}", path.display())))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| Error::CertParse(format!("{}: {e}", path.display())))?;
    chrono::DateTime::from_timestamp(cert.validity().not_after.timestamp(), 0)
        .ok_or_else(|| Error::CertParse(format!("{}: notAfter out of range", path.display())))
}

/// True when the certificate at `path` exists, parses, and has strictly
/// more than `min_days` of validity left. Absent or corrupt files are
/// simply invalid.
pub fn is_valid(path: &Path, min_days: i64) -> bool {
    match days_remaining(path) {
        Ok(days) => days > min_days,
        Err(_) => false,
    }
}

/// What the lifecycle pass did for one service.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CertOutcome {
    /// Existing certificate still has enough lifetime
    Skipped {
        /// Days of validity remaining on the existing certificate
        days_remaining: i64,
    },
    /// A fresh certificate was issued and written
    Issued,
}

/// Summary of a completed lifecycle pass.
#[derive(Clone, Debug)]
pub struct CertReport {
    /// Certificates issued this pass
    pub issued: usize,
    /// Certificates left in place
    pub skipped: usize,
    /// Wall-clock duration of the pass
    pub elapsed: std::time::Duration,
}

/// Certificate lifecycle manager, generic over [`Backend`] for testing.
pub struct CertManager<B: Backend> {
    backend: B,
    config: Config,
    token: String,
}

impl<B: Backend> CertManager<B> {
    /// Create a manager bound to a backend, config, and operator token.
    pub fn new(backend: B, config: Config, token: String) -> Self {
        Self {
            backend,
            config,
            token,
        }
    }

    /// Wait until the PKI authority is actually able to issue.
    ///
    /// Polls the CA endpoint until the chain is served, then performs one
    /// real short-lived issuance and discards the result. The probe requests
    /// the first service's own common name under its own role, so a role
    /// locked down to its permitted names still accepts it.
    pub async fn readiness_gate(&self, poll: &PollConfig) -> Result<()> {
        wait_for("pki ca chain", poll, || async {
            match self.backend.read_ca_chain().await {
                Ok(_) => Ok(Some(())),
                Err(e) => Err(e.to_string()),
            }
        })
        .await?;

        let Some(first) = self.config.services.first() else {
            return Ok(());
        };
        let probe = IssueRequest {
            common_name: first.common_name().to_string(),
            alt_names: vec![],
            ip_sans: vec![],
            ttl: "1h".to_string(),
        };
        wait_for("pki issuance readiness", poll, || {
            let probe = probe.clone();
            async move {
                match self
                    .backend
                    .issue_certificate(&self.token, first.pki_role(), &probe)
                    .await
                {
                    Ok(_) => Ok(Some(())),
                    Err(e) => Err(e.to_string()),
                }
            }
        })
        .await?;

        info!("pki authority ready");
        Ok(())
    }

    /// Issue or skip one service's certificate.
    pub async fn ensure_service(&self, spec: &ServiceSpec, force: bool) -> Result<CertOutcome> {
        let dir = self.config.service_cert_dir(&spec.name);
        let crt = dir.join("server.crt");
        let key = dir.join("server.key");

        if !force && key.is_file() && is_valid(&crt, self.config.certs.renew_threshold_days) {
            // days_remaining cannot fail here, is_valid just parsed the file
            let days = days_remaining(&crt).unwrap_or(0);
            debug!(service = %spec.name, days_remaining = days, "certificate still valid, skipping");
            return Ok(CertOutcome::Skipped {
                days_remaining: days,
            });
        }

        let request = IssueRequest {
            common_name: spec.common_name().to_string(),
            alt_names: spec.hostnames.clone(),
            ip_sans: spec.ip_sans.clone(),
            ttl: format!("{}h", self.config.certs.ttl_hours),
        };
        // Only transport failures are retried; a rejection is final.
        let issued = retry_fixed(ISSUE_ATTEMPTS, ISSUE_RETRY_INTERVAL, "certificate issuance", || {
            let request = request.clone();
            async move {
                match self
                    .backend
                    .issue_certificate(&self.token, spec.pki_role(), &request)
                    .await
                {
                    Err(e) if e.is_transient() => Err(e),
                    other => Ok(other),
                }
            }
        })
        .await
        .and_then(|result| result)
        .map_err(|e| Error::Issuance {
            service: spec.name.clone(),
            message: e.to_string(),
        })?;

        self.materialize(spec, &issued)?;
        info!(service = %spec.name, cn = %request.common_name, "certificate issued");
        Ok(CertOutcome::Issued)
    }

    /// Run the lifecycle pass over the registry (or one service).
    pub async fn run(&self, only: Option<&str>, force: bool) -> Result<CertReport> {
        let start = Instant::now();
        let services: Vec<&ServiceSpec> = match only {
            Some(name) => vec![self.config.service(name)?],
            None => self.config.services.iter().collect(),
        };

        let results: Vec<Result<CertOutcome>> = stream::iter(services)
            .map(|spec| self.ensure_service(spec, force))
            .buffer_unordered(self.config.bootstrap.parallelism)
            .collect()
            .await;

        let mut issued = 0;
        let mut skipped = 0;
        let mut errors = Vec::new();
        for result in results {
            match result {
                Ok(CertOutcome::Issued) => issued += 1,
                Ok(CertOutcome::Skipped { .. }) => skipped += 1,
                Err(e) => errors.push(e),
            }
        }

        if errors.is_empty() {
            let report = CertReport {
                issued,
                skipped,
                elapsed: start.elapsed(),
            };
            info!(
                issued = report.issued,
                skipped = report.skipped,
                elapsed = ?report.elapsed,
                "certificate pass complete"
            );
            Ok(report)
        } else if errors.len() == 1 {
            Err(errors.swap_remove(0))
        } else {
            Err(Error::Aggregate(errors))
        }
    }

    /// Write issued material to disk: the canonical triad, the shared CA
    /// bundle, and any family-specific extra files.
    fn materialize(&self, spec: &ServiceSpec, issued: &IssuedCertificate) -> Result<()> {
        let dir = self.config.service_cert_dir(&spec.name);
        fsutil::ensure_dir_with_mode(&dir, CERT_DIR_MODE)?;

        fsutil::write_file_with_mode(
            &dir.join("server.crt"),
            issued.certificate.as_bytes(),
            PUBLIC_FILE_MODE,
        )?;
        fsutil::write_file_with_mode(
            &dir.join("server.key"),
            issued.private_key.as_bytes(),
            SECRET_FILE_MODE,
        )?;

        let bundle = issued.ca_bundle();
        if !bundle.is_empty() {
            fsutil::write_file_with_mode(&dir.join("ca.crt"), bundle.as_bytes(), PUBLIC_FILE_MODE)?;
            let ca_dir = self.config.ca_dir();
            fsutil::ensure_dir_with_mode(&ca_dir, CERT_DIR_MODE)?;
            fsutil::write_file_with_mode(
                &ca_dir.join("ca.crt"),
                bundle.as_bytes(),
                PUBLIC_FILE_MODE,
            )?;
        }

        for file in layout::extra_files(spec.family, &spec.name, issued) {
            fsutil::write_file_with_mode(&dir.join(&file.name), file.contents.as_bytes(), file.mode)?;
        }
        Ok(())
    }
}
