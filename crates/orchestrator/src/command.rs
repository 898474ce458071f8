//! Actions, health checks and services backed by external programs.

use std::process::Stdio;

use async_trait::async_trait;
use keel_bootable::{Action, Bootable, BoxError, HealthCheck};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::CommandConfig;

impl CommandConfig {
    /// Creates a command with no arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Sets the arguments.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Sets an environment variable.
    #[must_use]
    pub fn with_env<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        command
    }
}

/// Runs a program to completion; succeeds on exit status 0.
#[derive(Clone, Debug)]
pub struct CommandAction {
    id: String,
    command: CommandConfig,
}

impl CommandAction {
    /// Creates an action.
    pub fn new(id: impl Into<String>, command: CommandConfig) -> Self {
        Self {
            id: id.into(),
            command,
        }
    }
}

#[async_trait]
impl Action for CommandAction {
    async fn invoke(&self) -> Result<(), BoxError> {
        debug!("action {}: running {}", self.id, self.command.program);

        let output = self
            .command
            .command()
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        Err(format!(
            "{} exited with {}{}{}",
            self.command.program,
            output.status,
            if stderr.is_empty() { "" } else { ": " },
            stderr
        )
        .into())
    }
}

/// Runs a probe program; healthy on exit status 0.
#[derive(Clone, Debug)]
pub struct CommandHealthCheck {
    id: String,
    command: CommandConfig,
}

impl CommandHealthCheck {
    /// Creates a health check.
    pub fn new(id: impl Into<String>, command: CommandConfig) -> Self {
        Self {
            id: id.into(),
            command,
        }
    }
}

#[async_trait]
impl HealthCheck for CommandHealthCheck {
    async fn check(&self) -> bool {
        match self
            .command
            .command()
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
        {
            Ok(status) => status.success(),
            Err(e) => {
                debug!("health check {}: {} failed to run: {}", self.id, self.command.program, e);
                false
            }
        }
    }
}

/// A long-running child process, optionally probed by a health command.
pub struct CommandService {
    id: String,
    command: CommandConfig,
    health: Option<CommandHealthCheck>,
    child: Mutex<Option<Child>>,
}

impl std::fmt::Debug for CommandService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandService")
            .field("id", &self.id)
            .field("command", &self.command)
            .field("health", &self.health)
            .finish_non_exhaustive()
    }
}

impl CommandService {
    /// Creates a service.
    pub fn new(id: impl Into<String>, command: CommandConfig) -> Self {
        Self {
            id: id.into(),
            command,
            health: None,
            child: Mutex::new(None),
        }
    }

    /// Sets the health probe.
    #[must_use]
    pub fn with_health_command(mut self, command: CommandConfig) -> Self {
        self.health = Some(CommandHealthCheck::new(format!("{}-health", self.id), command));
        self
    }
}

#[async_trait]
impl Bootable for CommandService {
    fn name(&self) -> &str {
        &self.id
    }

    async fn start(&self) -> Result<(), BoxError> {
        let mut child = self.child.lock().await;
        if let Some(running) = child.as_mut() {
            if running.try_wait()?.is_none() {
                debug!("service {} already running", self.id);
                return Ok(());
            }
        }

        let spawned = self
            .command
            .command()
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()?;
        info!(
            "service {} started (pid {})",
            self.id,
            spawned.id().unwrap_or_default()
        );
        *child = Some(spawned);
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), BoxError> {
        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };

        if child.try_wait()?.is_none() {
            child.kill().await?;
        }
        info!("service {} stopped", self.id);
        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        {
            let mut child = self.child.lock().await;
            let alive = match child.as_mut().map(Child::try_wait) {
                Some(Ok(None)) => true,
                Some(Ok(Some(status))) => {
                    warn!("service {} exited with {}", self.id, status);
                    false
                }
                Some(Err(e)) => {
                    warn!("service {} status unknown: {}", self.id, e);
                    false
                }
                None => false,
            };
            if !alive {
                return false;
            }
        }

        match &self.health {
            Some(probe) => probe.check().await,
            None => true,
        }
    }
}
