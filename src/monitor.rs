//! Certificate expiration monitor
//!
//! Reads certificates already on disk and classifies each service's state.
//! Never talks to the backend and never mutates anything, so it is safe to
//! run from a scheduler or a monitoring agent. The process exit code follows
//! the usual monitoring convention: 0 all clear, 1 warnings, 2 critical.

use std::path::PathBuf;

use colored::Colorize;
use serde::Serialize;

use crate::certs;
use crate::config::Config;
use crate::Result;

/// Classification of one service's certificate.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StatusKind {
    /// More lifetime left than the warning threshold
    Ok,
    /// At or below the warning threshold
    Warning,
    /// At or below the critical threshold
    Critical,
    /// Already past `notAfter`
    Expired,
    /// No certificate file on disk
    Missing,
    /// File exists but could not be parsed
    Error,
}

impl StatusKind {
    /// Monitoring severity: 0 ok, 1 warning, 2 critical-family.
    pub fn severity(self) -> u8 {
        match self {
            StatusKind::Ok => 0,
            StatusKind::Warning => 1,
            StatusKind::Critical | StatusKind::Expired | StatusKind::Missing | StatusKind::Error => 2,
        }
    }

    fn label(self) -> &'static str {
        match self {
            StatusKind::Ok => "OK",
            StatusKind::Warning => "WARNING",
            StatusKind::Critical => "CRITICAL",
            StatusKind::Expired => "EXPIRED",
            StatusKind::Missing => "MISSING",
            StatusKind::Error => "ERROR",
        }
    }
}

/// One scanned certificate.
#[derive(Clone, Debug, Serialize)]
pub struct CertificateStatus {
    /// Service the certificate belongs to
    pub service: String,
    /// Path that was inspected
    pub path: PathBuf,
    /// Classification
    pub status: StatusKind,
    /// Days of validity remaining; absent for missing/unparsable files
    pub days_remaining: Option<i64>,
    /// Expiry instant, RFC 3339; absent for missing/unparsable files
    pub not_after: Option<String>,
    /// Parse error detail when status is ERROR
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Scan the registry's certificates and classify each one.
///
/// `only` restricts the scan to one service; threshold overrides fall back
/// to the config's monitor policy.
pub fn scan(
    config: &Config,
    only: Option<&str>,
    warning_days: Option<i64>,
    critical_days: Option<i64>,
) -> Result<Vec<CertificateStatus>> {
    let warning = warning_days.unwrap_or(config.monitor.warning_days);
    let critical = critical_days.unwrap_or(config.monitor.critical_days);

    let services: Vec<&crate::service::ServiceSpec> = match only {
        Some(name) => vec![config.service(name)?],
        None => config.services.iter().collect(),
    };

    let mut statuses = Vec::with_capacity(services.len());
    for spec in services {
        let path = config.service_cert_dir(&spec.name).join("server.crt");
        statuses.push(classify(&spec.name, path, warning, critical));
    }
    Ok(statuses)
}

fn classify(service: &str, path: PathBuf, warning: i64, critical: i64) -> CertificateStatus {
    if !path.is_file() {
        return CertificateStatus {
            service: service.to_string(),
            path,
            status: StatusKind::Missing,
            days_remaining: None,
            not_after: None,
            detail: None,
        };
    }

    match (certs::days_remaining(&path), certs::not_after(&path)) {
        (Ok(days), Ok(expiry)) => {
            let status = if days < 0 {
                StatusKind::Expired
            } else if days <= critical {
                StatusKind::Critical
            } else if days <= warning {
                StatusKind::Warning
            } else {
                StatusKind::Ok
            };
            CertificateStatus {
                service: service.to_string(),
                path,
                status,
                days_remaining: Some(days),
                not_after: Some(expiry.to_rfc3339()),
                detail: None,
            }
        }
        (Err(e), _) | (_, Err(e)) => CertificateStatus {
            service: service.to_string(),
            path,
            status: StatusKind::Error,
            days_remaining: None,
            not_after: None,
            detail: Some(e.to_string()),
        },
    }
}

/// Exit code for a scan: the worst severity found.
pub fn exit_code(statuses: &[CertificateStatus]) -> u8 {
    statuses
        .iter()
        .map(|s| s.status.severity())
        .max()
        .unwrap_or(0)
}

/// Human-readable, color-coded report.
pub fn render_human(statuses: &[CertificateStatus]) -> String {
    let mut out = String::new();
    for s in statuses {
        let label = match s.status.severity() {
            0 => s.status.label().green(),
            1 => s.status.label().yellow(),
            _ => s.status.label().red(),
        };
        let detail = match (&s.days_remaining, &s.detail) {
            (Some(days), _) if *days < 0 => format!("expired {} days ago", -days),
            (Some(days), _) => format!("{days} days remaining"),
            (None, Some(msg)) => msg.clone(),
            (None, None) => "no certificate".to_string(),
        };
        out.push_str(&format!("{:>8}  {:<16} {}\n", label, s.service, detail));
    }
    out
}

/// JSON report for machine consumers.
pub fn render_json(statuses: &[CertificateStatus]) -> Result<String> {
    serde_json::to_string_pretty(statuses).map_err(|e| crate::Error::serialization(e.to_string()))
}

/// Single-line report in the Nagios plugin convention.
pub fn render_nagios(statuses: &[CertificateStatus]) -> String {
    let worst = statuses
        .iter()
        .max_by_key(|s| s.status.severity())
        .map(|s| s.status)
        .unwrap_or(StatusKind::Ok);

    let overall = match worst.severity() {
        0 => "OK",
        1 => "WARNING",
        _ => "CRITICAL",
    };

    let problems: Vec<String> = statuses
        .iter()
        .filter(|s| s.status.severity() > 0)
        .map(|s| match s.days_remaining {
            Some(days) if days < 0 => format!("{} expired {} days ago", s.service, -days),
            Some(days) => format!("{} expires in {} days", s.service, days),
            None => format!("{} has no readable certificate", s.service),
        })
        .collect();

    if problems.is_empty() {
        format!("CERTS {overall} - {} certificates healthy", statuses.len())
    } else {
        format!("CERTS {overall} - {}", problems.join("; "))
    }
}
