//! Container runtime control
//!
//! Recovery needs three things from the environment's container runtime:
//! start the stack, report per-service health, and pipe a data snapshot
//! into a running container. The [`Runtime`] trait carries exactly those,
//! and [`ComposeRuntime`] implements them over the `docker` CLI so nothing
//! else in the crate shells out directly.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use thiserror::Error;
use tracing::debug;

/// Failures from the container runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The runtime daemon is not installed or not responding
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),

    /// A runtime command exited non-zero
    #[error("command `{command}` failed: {stderr}")]
    CommandFailed {
        /// The command that was run
        command: String,
        /// Captured stderr (trimmed)
        stderr: String,
    },

    /// Could not spawn or talk to the command at all
    #[error("command `{command}`: {source}")]
    Spawn {
        /// The command that was run
        command: String,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },
}

/// Health of one service container.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ServiceHealth {
    /// Health check passing, or running with no health check defined
    Healthy,
    /// Health check failing
    Unhealthy,
    /// Health check still in its start period
    Starting,
    /// Container missing or state unreadable
    Unknown,
}

/// Container runtime operations recovery depends on.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Runtime: Send + Sync {
    /// True when the runtime daemon responds.
    async fn is_available(&self) -> bool;

    /// Start (or create) every service in the stack, detached.
    async fn start_services(&self) -> Result<(), RuntimeError>;

    /// Health of one service's container.
    async fn service_health(&self, service: &str) -> Result<ServiceHealth, RuntimeError>;

    /// Run `argv` inside a service container with `stdin` streamed from a
    /// file. Used to replay data snapshots.
    async fn exec_with_stdin(
        &self,
        service: &str,
        argv: &[String],
        stdin: &Path,
    ) -> Result<(), RuntimeError>;
}

/// [`Runtime`] implementation over `docker compose` / `docker inspect`.
pub struct ComposeRuntime {
    project_dir: PathBuf,
    container_prefix: String,
}

impl ComposeRuntime {
    /// Create a runtime rooted at the compose project directory.
    pub fn new(project_dir: PathBuf, container_prefix: String) -> Self {
        Self {
            project_dir,
            container_prefix,
        }
    }

    fn container_name(&self, service: &str) -> String {
        format!("{}-{}", self.container_prefix, service)
    }

    async fn run(&self, program: &str, args: &[&str], stdin: Stdio) -> Result<String, RuntimeError> {
        let command = format!("{program} {}", args.join(" "));
        debug!(command = %command, "running runtime command");

        let output = tokio::process::Command::new(program)
            .args(args)
            .current_dir(&self.project_dir)
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| RuntimeError::Spawn {
                command: command.clone(),
                source: e,
            })?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(RuntimeError::CommandFailed {
                command,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

/// Map a `docker inspect` health/state string onto [`ServiceHealth`].
fn parse_health(raw: &str) -> ServiceHealth {
    match raw.trim() {
        "healthy" => ServiceHealth::Healthy,
        "unhealthy" => ServiceHealth::Unhealthy,
        "starting" => ServiceHealth::Starting,
        // Containers without a health check report their run state instead.
        "running" => ServiceHealth::Healthy,
        _ => ServiceHealth::Unknown,
    }
}

#[async_trait]
impl Runtime for ComposeRuntime {
    async fn is_available(&self) -> bool {
        self.run("docker", &["info"], Stdio::null()).await.is_ok()
    }

    async fn start_services(&self) -> Result<(), RuntimeError> {
        self.run("docker", &["compose", "up", "-d"], Stdio::null())
            .await?;
        Ok(())
    }

    async fn service_health(&self, service: &str) -> Result<ServiceHealth, RuntimeError> {
        let name = self.container_name(service);
        // Falls back to the container state when no health check is defined.
        let format = "{{if .State.Health}}{{.State.Health.Status}}{{else}}{{.State.Status}}{{end}}";
        match self
            .run("docker", &["inspect", "--format", format, &name], Stdio::null())
            .await
        {
            Ok(raw) => Ok(parse_health(&raw)),
            Err(RuntimeError::CommandFailed { .. }) => Ok(ServiceHealth::Unknown),
            Err(e) => Err(e),
        }
    }

    async fn exec_with_stdin(
        &self,
        service: &str,
        argv: &[String],
        stdin: &Path,
    ) -> Result<(), RuntimeError> {
        let file = std::fs::File::open(stdin).map_err(|e| RuntimeError::Spawn {
            command: format!("open {}", stdin.display()),
            source: e,
        })?;

        let mut args: Vec<&str> = vec!["compose", "exec", "-T", service];
        args.extend(argv.iter().map(String::as_str));
        self.run("docker", &args, Stdio::from(file)).await?;
        Ok(())
    }
}
