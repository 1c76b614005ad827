//! Disaster recovery orchestrator
//!
//! Rebuilds a working environment from a backup bundle as a fixed sequence
//! of timed steps. Steps come in two tiers: hard steps guard invariants the
//! rest of the sequence depends on and abort the run when they fail; soft
//! steps degrade to recorded warnings so one damaged artifact does not stop
//! an otherwise recoverable environment.
//!
//! A dry run walks the same sequence, logs what each step would do, and is
//! guaranteed to mutate nothing: no filesystem writes, no runtime calls.

use std::path::Path;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::backup::BackupBundle;
use crate::config::Config;
use crate::fsutil;
use crate::retry::{wait_for, PollConfig};
use crate::runtime::{Runtime, ServiceHealth};
use crate::{Error, Result, PUBLIC_FILE_MODE, SECRET_DIR_MODE, SECRET_FILE_MODE};

/// Step criticality.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Tier {
    /// Failure aborts the whole run
    Hard,
    /// Failure becomes a warning and the run continues
    Soft,
}

/// Where one step ended up.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StepStatus {
    /// Never reached (an earlier hard step aborted)
    Pending,
    /// Completed without issue
    Succeeded,
    /// Failed; run aborted (hard) or continued with a warning (soft)
    Failed,
    /// Dry run: intent logged, nothing executed
    Skipped,
}

/// The fixed recovery sequence.
const STEPS: [(&str, Tier); 7] = [
    ("verify-backup", Tier::Hard),
    ("ensure-runtime", Tier::Hard),
    ("restore-config", Tier::Soft),
    ("restore-credentials", Tier::Soft),
    ("start-services", Tier::Soft),
    ("restore-data", Tier::Soft),
    ("verify-recovery", Tier::Soft),
];

/// Outcome of one step.
#[derive(Clone, Debug)]
pub struct StepResult {
    /// Step name
    pub name: &'static str,
    /// Criticality tier
    pub tier: Tier,
    /// Final status
    pub status: StepStatus,
    /// Warning or failure detail
    pub detail: Option<String>,
    /// Wall-clock time spent in the step
    pub elapsed: Duration,
}

/// Overall outcome of a recovery run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Outcome {
    /// Every step succeeded
    Complete,
    /// Finished, but one or more soft steps degraded
    CompleteWithWarnings,
    /// A hard step failed; later steps never ran
    Aborted,
}

/// Full report of a recovery run.
#[derive(Clone, Debug)]
pub struct RecoveryReport {
    /// Overall outcome
    pub outcome: Outcome,
    /// Per-step results, in sequence order
    pub steps: Vec<StepResult>,
    /// Wall-clock time for the whole run
    pub total: Duration,
    /// Services reporting healthy at the final verification
    pub healthy_services: usize,
    /// Services in the registry
    pub total_services: usize,
}

/// Knobs for one recovery run.
#[derive(Clone, Copy, Debug, Default)]
pub struct RecoveryOptions {
    /// Log intent only; guarantee zero mutations
    pub dry_run: bool,
    /// Proceed past a failed or impossible backup verification
    pub force: bool,
}

/// The orchestrator. Generic over [`Runtime`] so tests can substitute a
/// mock and prove, among other things, that a dry run makes no calls.
pub struct RecoveryOrchestrator<R: Runtime> {
    runtime: R,
    config: Config,
    bundle: BackupBundle,
    options: RecoveryOptions,
    healthy_services: usize,
}

impl<R: Runtime> RecoveryOrchestrator<R> {
    /// Create an orchestrator for one bundle.
    pub fn new(runtime: R, config: Config, bundle: BackupBundle, options: RecoveryOptions) -> Self {
        Self {
            runtime,
            config,
            bundle,
            options,
            healthy_services: 0,
        }
    }

    /// Run the recovery sequence and return the full report.
    ///
    /// Errors are folded into the report; this only returns `Err` for
    /// conditions outside the sequence itself (none today).
    pub async fn run(&mut self) -> Result<RecoveryReport> {
        let start = Instant::now();
        info!(bundle = %self.bundle.id(), dry_run = self.options.dry_run, "starting recovery");

        let mut steps: Vec<StepResult> = STEPS
            .iter()
            .map(|(name, tier)| StepResult {
                name: *name,
                tier: *tier,
                status: StepStatus::Pending,
                detail: None,
                elapsed: Duration::ZERO,
            })
            .collect();

        let mut warnings = 0usize;
        let mut aborted = false;

        for (index, (name, tier)) in STEPS.iter().enumerate() {
            if self.options.dry_run {
                info!(step = %name, "dry-run: {}", self.describe(index));
                steps[index].status = StepStatus::Skipped;
                continue;
            }

            info!(step = %name, "running");
            let step_start = Instant::now();
            let result = self.execute(index).await;
            steps[index].elapsed = step_start.elapsed();

            match result {
                Ok(None) => {
                    steps[index].status = StepStatus::Succeeded;
                    info!(step = %name, elapsed = ?steps[index].elapsed, "step succeeded");
                }
                Ok(Some(warning)) => {
                    steps[index].status = StepStatus::Succeeded;
                    steps[index].detail = Some(warning.clone());
                    warnings += 1;
                    warn!(step = %name, warning = %warning, "step degraded");
                }
                Err(e) => {
                    steps[index].status = StepStatus::Failed;
                    steps[index].detail = Some(e.to_string());
                    match tier {
                        Tier::Hard => {
                            warn!(step = %name, error = %e, "hard step failed, aborting recovery");
                            aborted = true;
                            break;
                        }
                        Tier::Soft => {
                            warnings += 1;
                            warn!(step = %name, error = %e, "soft step failed, continuing");
                        }
                    }
                }
            }
        }

        let outcome = if aborted {
            Outcome::Aborted
        } else if warnings > 0 {
            Outcome::CompleteWithWarnings
        } else {
            Outcome::Complete
        };

        let report = RecoveryReport {
            outcome,
            steps,
            total: start.elapsed(),
            healthy_services: self.healthy_services,
            total_services: self.config.services.len(),
        };
        info!(
            outcome = ?report.outcome,
            total = ?report.total,
            healthy = report.healthy_services,
            services = report.total_services,
            "recovery finished"
        );
        Ok(report)
    }

    /// One-line intent for dry-run logging.
    fn describe(&self, index: usize) -> String {
        match index {
            0 => format!("would verify checksums in bundle {}", self.bundle.id()),
            1 => "would check the container runtime is available".to_string(),
            2 => "would restore the environment file".to_string(),
            3 => format!(
                "would restore unseal material, root credential, CA chain, and per-service files into {}",
                self.config.base_dir.display()
            ),
            4 => "would start all services and wait for health".to_string(),
            5 => "would replay data snapshots into stateful services".to_string(),
            _ => "would verify every service reports healthy".to_string(),
        }
    }

    /// Run one step. `Ok(None)` is success, `Ok(Some(msg))` a degraded
    /// success, `Err` a failure handled per the step's tier.
    async fn execute(&mut self, index: usize) -> Result<Option<String>> {
        match index {
            0 => self.verify_backup(),
            1 => self.ensure_runtime().await,
            2 => self.restore_config(),
            3 => self.restore_credentials(),
            4 => self.start_services().await,
            5 => self.restore_data().await,
            _ => self.verify_recovery().await,
        }
    }

    /// Presence of unseal material and the root credential is non-negotiable:
    /// without them the restored backend can never be opened, so recovery
    /// aborts immediately. A missing CA chain or missing snapshots only
    /// degrade the run. Checksum failures abort unless forced.
    fn verify_backup(&self) -> Result<Option<String>> {
        if !self.bundle.has_unseal_material() {
            return Err(Error::prerequisite(format!(
                "bundle {} has no unseal material",
                self.bundle.id()
            )));
        }
        if !self.bundle.has_root_credential() {
            return Err(Error::prerequisite(format!(
                "bundle {} has no root credential",
                self.bundle.id()
            )));
        }

        let mut warnings = Vec::new();
        if !self.bundle.has_pki_chain() {
            warnings.push("bundle has no CA chain".to_string());
        }
        for spec in &self.config.services {
            if let Some(snapshot) = &spec.snapshot {
                if self.bundle.data_snapshot(snapshot).is_none() {
                    warnings.push(format!("no data snapshot for {}", spec.name));
                }
            }
        }

        let verification = self.bundle.verify().and_then(|report| {
            if report.is_clean() {
                Ok(report)
            } else {
                Err(Error::prerequisite(format!(
                    "bundle {} failed verification: {} missing, {} mismatched",
                    self.bundle.id(),
                    report.missing.len(),
                    report.mismatched.len()
                )))
            }
        });

        match verification {
            Ok(report) => {
                debug!(verified = report.verified, "bundle checksums verified");
            }
            Err(e) if self.options.force => warnings.push(format!("proceeding despite {e}")),
            Err(e) => return Err(e),
        }

        if warnings.is_empty() {
            Ok(None)
        } else {
            Ok(Some(warnings.join("; ")))
        }
    }

    async fn ensure_runtime(&self) -> Result<Option<String>> {
        let poll = PollConfig::with_timeout(Duration::from_secs(
            self.config.recovery.runtime_ready_timeout_secs,
        ));
        wait_for("container runtime availability", &poll, || async {
            Ok::<_, String>(self.runtime.is_available().await.then_some(()))
        })
        .await?;
        Ok(None)
    }

    /// Restore the environment file from the bundle, or synthesize it from
    /// the configured template when the bundle has no saved copy.
    fn restore_config(&self) -> Result<Option<String>> {
        let Some(env_file) = &self.config.env_file else {
            debug!("no env_file configured, nothing to restore");
            return Ok(None);
        };

        if let Some(saved) = self.bundle.env_config() {
            fsutil::copy_with_mode(&saved, env_file, SECRET_FILE_MODE)?;
            return Ok(None);
        }

        match &self.config.env_template {
            Some(template) if template.is_file() => {
                fsutil::copy_with_mode(template, env_file, SECRET_FILE_MODE)?;
                Ok(Some(format!(
                    "bundle has no saved environment file; synthesized from {}",
                    template.display()
                )))
            }
            _ => Ok(Some(
                "bundle has no saved environment file and no template is configured".to_string(),
            )),
        }
    }

    /// Restore unseal material, the root credential, the CA chain, AppRole
    /// credential pairs, and per-service certificates.
    fn restore_credentials(&self) -> Result<Option<String>> {
        let base = &self.config.base_dir;
        fsutil::ensure_dir_with_mode(base, SECRET_DIR_MODE)?;

        let mut missing = Vec::new();

        if self.bundle.has_unseal_material() {
            fsutil::copy_with_mode(
                &self.bundle.keys_file(),
                &self.config.keys_file(),
                SECRET_FILE_MODE,
            )?;
        } else {
            missing.push("unseal material");
        }

        if self.bundle.has_root_credential() {
            fsutil::copy_with_mode(
                &self.bundle.root_token_file(),
                &self.config.root_token_file(),
                SECRET_FILE_MODE,
            )?;
        } else {
            missing.push("root credential");
        }

        if self.bundle.has_pki_chain() {
            fsutil::ensure_dir_with_mode(&self.config.ca_dir(), 0o755)?;
            fsutil::copy_with_mode(
                &self.bundle.ca_dir().join("ca.crt"),
                &self.config.ca_dir().join("ca.crt"),
                PUBLIC_FILE_MODE,
            )?;
        } else {
            missing.push("CA chain");
        }

        for spec in &self.config.services {
            restore_tree(
                &self.bundle.approles_dir().join(&spec.name),
                &self.config.service_approle_dir(&spec.name),
                SECRET_DIR_MODE,
                |_| SECRET_FILE_MODE,
            )?;
            restore_tree(
                &self.bundle.certs_dir().join(&spec.name),
                &self.config.service_cert_dir(&spec.name),
                0o755,
                cert_file_mode,
            )?;
        }

        if missing.is_empty() {
            Ok(None)
        } else {
            Ok(Some(format!("bundle is missing: {}", missing.join(", "))))
        }
    }

    async fn start_services(&mut self) -> Result<Option<String>> {
        self.runtime.start_services().await?;

        // One deadline for the whole fleet; a slow service consumes the
        // shared window, it does not extend the run by its own full timeout.
        let deadline = Instant::now()
            + Duration::from_secs(self.config.recovery.service_ready_timeout_secs);
        let mut unhealthy = Vec::new();
        for spec in &self.config.services {
            let poll =
                PollConfig::with_timeout(deadline.saturating_duration_since(Instant::now()));
            let wait = wait_for(&format!("{} health", spec.name), &poll, || async {
                match self.runtime.service_health(&spec.name).await {
                    Ok(ServiceHealth::Healthy) => Ok(Some(())),
                    Ok(_) => Ok(None),
                    Err(e) => Err(e.to_string()),
                }
            })
            .await;
            match wait {
                Ok(()) => self.healthy_services += 1,
                Err(_) => unhealthy.push(spec.name.clone()),
            }
        }

        if unhealthy.is_empty() {
            Ok(None)
        } else {
            Ok(Some(format!(
                "services not healthy in time: {}",
                unhealthy.join(", ")
            )))
        }
    }

    /// Replay data snapshots into stateful services.
    async fn restore_data(&self) -> Result<Option<String>> {
        let mut skipped = Vec::new();

        for spec in &self.config.services {
            let (Some(snapshot_name), Some(argv)) = (&spec.snapshot, &spec.restore_command) else {
                continue;
            };
            match self.bundle.data_snapshot(snapshot_name) {
                Some(snapshot) => {
                    info!(service = %spec.name, snapshot = %snapshot_name, "replaying data snapshot");
                    self.runtime
                        .exec_with_stdin(&spec.name, argv, &snapshot)
                        .await?;
                }
                None => skipped.push(format!("{} ({snapshot_name})", spec.name)),
            }
        }

        if skipped.is_empty() {
            Ok(None)
        } else {
            Ok(Some(format!(
                "no snapshot in bundle for: {}",
                skipped.join(", ")
            )))
        }
    }

    async fn verify_recovery(&mut self) -> Result<Option<String>> {
        let mut healthy = 0usize;
        let mut unhealthy = Vec::new();

        for spec in &self.config.services {
            match self.runtime.service_health(&spec.name).await {
                Ok(ServiceHealth::Healthy) => healthy += 1,
                Ok(state) => unhealthy.push(format!("{} ({state:?})", spec.name)),
                Err(e) => unhealthy.push(format!("{} ({e})", spec.name)),
            }
        }
        self.healthy_services = healthy;

        if unhealthy.is_empty() {
            Ok(None)
        } else {
            Ok(Some(format!(
                "{}/{} services healthy; degraded: {}",
                healthy,
                self.config.services.len(),
                unhealthy.join(", ")
            )))
        }
    }
}

/// Mode for a restored certificate file: key material is owner-only,
/// everything else is public.
fn cert_file_mode(name: &str) -> u32 {
    if name.ends_with("-cert.pem") || name.ends_with(".crt") {
        PUBLIC_FILE_MODE
    } else if name.ends_with(".key") || name.ends_with(".pem") {
        SECRET_FILE_MODE
    } else {
        PUBLIC_FILE_MODE
    }
}

/// Copy a flat directory of files, applying a per-file mode. Absent source
/// directories are fine; the bundle simply did not carry that material.
fn restore_tree(
    src: &Path,
    dst: &Path,
    dir_mode: u32,
    file_mode: impl Fn(&str) -> u32,
) -> Result<()> {
    if !src.is_dir() {
        return Ok(());
    }
    fsutil::ensure_dir_with_mode(dst, dir_mode)?;

    let entries =
        std::fs::read_dir(src).map_err(|e| Error::io(format!("listing {}", src.display()), e))?;
    for entry in entries {
        let entry = entry.map_err(|e| Error::io(format!("listing {}", src.display()), e))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        fsutil::copy_with_mode(&path, &dst.join(&name), file_mode(&name))?;
    }
    Ok(())
}
