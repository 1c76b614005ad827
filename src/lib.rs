//! Warden - credential and certificate lifecycle orchestrator
//!
//! Warden bootstraps least-privilege authentication for a fleet of services
//! against a shared secret backend, issues and rotates per-service TLS
//! material from the backend's PKI authority, watches issued certificates for
//! expiry, and can restore a whole environment from a backup bundle inside a
//! bounded recovery window.
//!
//! # Architecture
//!
//! Everything is built on a thin HTTP [`backend`] client. The [`bootstrap`]
//! engine and the [`certs`] manager depend only on that client and run
//! independently; the [`monitor`] only reads certificates already on disk;
//! the [`recovery`] orchestrator sequences all of the above as timed,
//! criticality-tiered steps over a [`backup`] bundle.
//!
//! # Modules
//!
//! - [`backend`] - secret backend HTTP client (health, login, KV, PKI, roles)
//! - [`bootstrap`] - AppRole bootstrap engine with rollback
//! - [`certs`] - certificate issuance, renewal checks, on-disk layouts
//! - [`monitor`] - expiration scanner with human/JSON/Nagios output
//! - [`backup`] - backup bundle inspection and checksum verification
//! - [`recovery`] - disaster-recovery step sequence
//! - [`runtime`] - container runtime control (start, health, exec)
//! - [`retry`] - bounded polling and fixed-interval retry helpers
//! - [`schedule`] - periodic-execution entries for renewal and reporting
//! - [`service`] - the immutable service registry types
//! - [`config`] - explicit configuration threaded through every component
//! - [`fsutil`] - permission-aware filesystem helpers
//! - [`error`] - error types shared across the crate

#![deny(missing_docs)]

pub mod backend;
pub mod backup;
pub mod bootstrap;
pub mod certs;
pub mod config;
pub mod error;
pub mod fsutil;
pub mod monitor;
pub mod recovery;
pub mod retry;
pub mod runtime;
pub mod schedule;
pub mod service;

pub use error::Error;

/// Result type alias using the crate's [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================
// Centralizing these ensures config defaults, CLI defaults, and test fixtures
// agree with each other.

/// Default leaf certificate TTL requested from the PKI authority (one year).
pub const DEFAULT_CERT_TTL_HOURS: u32 = 8760;

/// Days-remaining below which a certificate is reissued by the renewal pass.
pub const DEFAULT_RENEW_THRESHOLD_DAYS: i64 = 30;

/// Days-remaining below which the monitor reports WARNING.
pub const DEFAULT_WARNING_DAYS: i64 = 30;

/// Days-remaining below which the monitor reports CRITICAL.
pub const DEFAULT_CRITICAL_DAYS: i64 = 7;

/// Default validity window for generated secret-id credentials (30 days).
pub const DEFAULT_SECRET_ID_TTL: &str = "720h";

/// Default use-count cap for generated secret-id credentials.
///
/// The backend treats zero as "unlimited uses". A finite cap is the safer
/// default for a bearer credential; zero must be configured explicitly.
pub const DEFAULT_SECRET_ID_NUM_USES: u32 = 24;

/// Bounded fan-out used when generating credentials or issuing certificates
/// across independent services.
pub const DEFAULT_PARALLELISM: usize = 4;

/// Mode for directories holding secret material (owner only).
pub const SECRET_DIR_MODE: u32 = 0o700;

/// Mode for files holding secret material (owner read/write).
pub const SECRET_FILE_MODE: u32 = 0o600;

/// Mode for public certificate files.
pub const PUBLIC_FILE_MODE: u32 = 0o644;
