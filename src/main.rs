//! Command-line entrypoint for warden.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use warden::backend::HttpBackend;
use warden::backup::{self, BackupBundle};
use warden::bootstrap::BootstrapEngine;
use warden::certs::CertManager;
use warden::config::Config;
use warden::monitor;
use warden::recovery::{Outcome, RecoveryOptions, RecoveryOrchestrator, StepStatus};
use warden::retry::PollConfig;
use warden::runtime::ComposeRuntime;
use warden::schedule;

#[derive(Parser)]
#[command(name = "warden", version, about = "Credential and certificate lifecycle orchestrator")]
struct Cli {
    /// Path to the configuration file
    #[arg(long, short = 'c', env = "WARDEN_CONFIG", default_value = "warden.yaml")]
    config: PathBuf,

    /// Operator token; falls back to the token file under base_dir
    #[arg(long, env = "WARDEN_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision auth, policies, roles, and credentials for every service
    Bootstrap,

    /// Tear down everything bootstrap manages
    Rollback {
        /// Skip the confirmation prompt
        #[arg(long)]
        force: bool,
    },

    /// Issue or renew certificates; valid certificates are left alone
    Renew {
        /// Only this service
        #[arg(long)]
        service: Option<String>,
        /// Reissue even when the existing certificate is still valid
        #[arg(long)]
        force: bool,
    },

    /// Report certificate expiration status
    Status {
        /// Machine-readable JSON output
        #[arg(long, conflicts_with = "nagios")]
        json: bool,
        /// Single-line output for monitoring agents
        #[arg(long)]
        nagios: bool,
        /// Only this service
        #[arg(long)]
        service: Option<String>,
        /// Override the warning threshold (days)
        #[arg(long)]
        warning_days: Option<i64>,
        /// Override the critical threshold (days)
        #[arg(long)]
        critical_days: Option<i64>,
    },

    /// Create a timestamped backup bundle from on-disk state
    Backup,

    /// Restore the environment from a backup bundle
    Recover {
        /// Bundle directory; defaults to the newest bundle under the
        /// configured backup directory
        #[arg(long, value_name = "PATH")]
        backup_dir: Option<PathBuf>,
        /// Log what each step would do without executing anything
        #[arg(long)]
        dry_run: bool,
        /// Skip the confirmation prompt and proceed past a failed
        /// backup verification
        #[arg(long)]
        force: bool,
    },

    /// List, verify, or remove backup bundles
    Backups {
        /// List bundles (the default when no other action is given)
        #[arg(long)]
        list: bool,
        /// Verify checksums of one bundle
        #[arg(long, value_name = "ID", conflicts_with = "list")]
        verify: Option<String>,
        /// Remove one bundle
        #[arg(long, value_name = "ID", conflicts_with = "verify")]
        remove: Option<String>,
        /// Skip the confirmation prompt for --remove
        #[arg(long)]
        force: bool,
    },

    /// Print crontab entries for periodic renewal and reporting
    Schedule,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warden=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{} {e:#}", "error:".red().bold());
            if let Some(hint) = remedial_hint(&e) {
                eprintln!("{} {hint}", "hint:".yellow().bold());
            }
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<i32> {
    let config = Config::load(&cli.config)
        .with_context(|| format!("loading config {}", cli.config.display()))?;

    match cli.command {
        Commands::Bootstrap => {
            let token = resolve_token(&cli.token, &config)?;
            let backend = HttpBackend::new(&config.backend)?;
            let engine = BootstrapEngine::new(backend, config, token);
            let report = engine.run().await?;
            println!(
                "{} {} services bootstrapped ({} credentials generated, {} reused) in {:.1?}",
                "ok:".green().bold(),
                report.services,
                report.generated,
                report.reused,
                report.elapsed
            );
            Ok(0)
        }

        Commands::Rollback { force } => {
            if !force && !confirm("Remove all managed policies, roles, and credentials?")? {
                println!("aborted");
                return Ok(1);
            }
            let token = resolve_token(&cli.token, &config)?;
            let backend = HttpBackend::new(&config.backend)?;
            let engine = BootstrapEngine::new(backend, config, token);
            engine.rollback().await?;
            println!("{} bootstrap state removed", "ok:".green().bold());
            Ok(0)
        }

        Commands::Renew { service, force } => {
            let token = resolve_token(&cli.token, &config)?;
            let backend = HttpBackend::new(&config.backend)?;
            let manager = CertManager::new(backend, config, token);
            manager.readiness_gate(&PollConfig::default()).await?;
            let report = manager.run(service.as_deref(), force).await?;
            println!(
                "{} {} issued, {} skipped in {:.1?}",
                "ok:".green().bold(),
                report.issued,
                report.skipped,
                report.elapsed
            );
            Ok(0)
        }

        Commands::Status {
            json,
            nagios,
            service,
            warning_days,
            critical_days,
        } => {
            let statuses = monitor::scan(&config, service.as_deref(), warning_days, critical_days)?;
            if json {
                println!("{}", monitor::render_json(&statuses)?);
            } else if nagios {
                println!("{}", monitor::render_nagios(&statuses));
            } else {
                print!("{}", monitor::render_human(&statuses));
            }
            Ok(i32::from(monitor::exit_code(&statuses)))
        }

        Commands::Backup => {
            let bundle = backup::create_bundle(&config)?;
            let files = bundle.manifest().map_or(0, |m| m.files.len());
            println!(
                "{} bundle {} created ({files} files)",
                "ok:".green().bold(),
                bundle.id()
            );
            Ok(0)
        }

        Commands::Recover {
            backup_dir,
            dry_run,
            force,
        } => {
            let bundle = match backup_dir {
                Some(dir) => BackupBundle::open(&dir)?,
                None => backup::list_bundles(&config.backup_dir)?
                    .into_iter()
                    .next()
                    .with_context(|| {
                        format!("no backup bundles in {}", config.backup_dir.display())
                    })?,
            };

            if !dry_run
                && !force
                && !confirm(&format!(
                    "Restore the environment from bundle {}? Existing state will be overwritten.",
                    bundle.id()
                ))?
            {
                println!("aborted");
                return Ok(1);
            }

            let project_dir =
                std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
            let runtime =
                ComposeRuntime::new(project_dir, config.recovery.container_prefix.clone());
            let mut orchestrator = RecoveryOrchestrator::new(
                runtime,
                config,
                bundle,
                RecoveryOptions { dry_run, force },
            );
            // Ctrl-C aborts at the next poll or step boundary, never
            // mid-filesystem-write.
            let report = tokio::select! {
                report = orchestrator.run() => report?,
                _ = tokio::signal::ctrl_c() => bail!("recovery interrupted"),
            };
            print_recovery_report(&report);
            match report.outcome {
                Outcome::Complete | Outcome::CompleteWithWarnings => Ok(0),
                Outcome::Aborted => Ok(1),
            }
        }

        Commands::Backups {
            list: _,
            verify,
            remove,
            force,
        } => {
            if let Some(id) = verify {
                let bundle = BackupBundle::open(&config.backup_dir.join(&id))?;
                let report = bundle.verify()?;
                if report.is_clean() {
                    println!(
                        "{} bundle {} verified ({} files)",
                        "ok:".green().bold(),
                        bundle.id(),
                        report.verified
                    );
                    return Ok(0);
                }
                for rel in &report.missing {
                    println!("{} missing: {rel}", "fail:".red().bold());
                }
                for rel in &report.mismatched {
                    println!("{} checksum mismatch: {rel}", "fail:".red().bold());
                }
                return Ok(2);
            }

            if let Some(id) = remove {
                let bundle = BackupBundle::open(&config.backup_dir.join(&id))?;
                if !force && !confirm(&format!("Delete bundle {}?", bundle.id()))? {
                    println!("aborted");
                    return Ok(1);
                }
                backup::remove_bundle(&bundle)?;
                println!("{} bundle {} removed", "ok:".green().bold(), id);
                return Ok(0);
            }

            let bundles = backup::list_bundles(&config.backup_dir)?;
            if bundles.is_empty() {
                println!("no backup bundles in {}", config.backup_dir.display());
                return Ok(0);
            }
            for bundle in bundles {
                let markers = [
                    bundle.has_unseal_material().then_some("keys"),
                    bundle.has_root_credential().then_some("root-token"),
                    bundle.has_pki_chain().then_some("ca"),
                    bundle.manifest().is_some().then_some("manifest"),
                ];
                let markers: Vec<&str> = markers.into_iter().flatten().collect();
                println!("{}  [{}]", bundle.id(), markers.join(", "));
            }
            Ok(0)
        }

        Commands::Schedule => {
            let exe = std::env::current_exe().context("resolving executable path")?;
            print!("{}", schedule::render_crontab(&config, &exe, &cli.config));
            Ok(0)
        }
    }
}

/// Resolve the operator token: flag/env first, then the token file.
fn resolve_token(flag: &Option<String>, config: &Config) -> Result<String> {
    if let Some(token) = flag {
        return Ok(token.clone());
    }
    let path = config.root_token_file();
    let raw = std::fs::read_to_string(&path).with_context(|| {
        format!(
            "no token given and token file {} is unreadable",
            path.display()
        )
    })?;
    let token = raw.trim().to_string();
    if token.is_empty() {
        bail!("token file {} is empty", path.display());
    }
    Ok(token)
}

/// A concrete next command for the classes of failure an operator can act
/// on directly.
fn remedial_hint(error: &anyhow::Error) -> Option<&'static str> {
    match error.downcast_ref::<warden::Error>()? {
        warden::Error::Prerequisite(_) => {
            Some("nothing was changed; fix the prerequisite and re-run the same command")
        }
        warden::Error::Isolation { .. } => Some(
            "bootstrap state was rolled back; fix the service policy document and re-run `warden bootstrap`",
        ),
        warden::Error::Authentication { .. } => Some(
            "bootstrap state was rolled back; re-run `warden bootstrap` once the backend accepts logins again",
        ),
        warden::Error::Timeout { .. } => {
            Some("the wait deadline elapsed; check the backend and runtime, then re-run")
        }
        _ => None,
    }
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{prompt} [y/N] ");
    std::io::stdout().flush().context("flushing stdout")?;
    let mut line = String::new();
    std::io::stdin()
        .read_line(&mut line)
        .context("reading confirmation")?;
    Ok(matches!(line.trim(), "y" | "Y" | "yes"))
}

fn print_recovery_report(report: &warden::recovery::RecoveryReport) {
    for step in &report.steps {
        let status = match step.status {
            StepStatus::Succeeded => "ok".green(),
            StepStatus::Failed => "failed".red(),
            StepStatus::Skipped => "skipped".cyan(),
            StepStatus::Pending => "-".dimmed(),
        };
        match &step.detail {
            Some(detail) => println!("{:>22}  {status} ({detail})", step.name),
            None => println!("{:>22}  {status}", step.name),
        }
    }

    let summary = format!(
        "{:?} in {:.1?}, {}/{} services healthy",
        report.outcome, report.total, report.healthy_services, report.total_services
    );
    match report.outcome {
        Outcome::Complete => println!("{} {summary}", "ok:".green().bold()),
        Outcome::CompleteWithWarnings => println!("{} {summary}", "warning:".yellow().bold()),
        Outcome::Aborted => println!("{} {summary}", "aborted:".red().bold()),
    }
}
