use crate::{Result, RuntimeError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, warn};

/// stderr/stdout fragments reporting that the host is already in the
/// requested state. A non-zero exit carrying one of these is a success for
/// the idempotent operations.
pub const IDEMPOTENT_OUTCOMES: &[&str] = &[
    "already exists",
    "Skipping adding existing rule",
    "Could not delete non-existent rule",
    "does a matching rule exist",
    "No chain/target/match by that name",
    "No such file or directory",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    fn is_idempotent_outcome(&self) -> bool {
        IDEMPOTENT_OUTCOMES
            .iter()
            .any(|marker| self.stderr.contains(marker) || self.stdout.contains(marker))
    }
}

/// Runs a program on the host and captures everything it says.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandOutput>;
}

/// Spawns real processes, optionally through non-interactive `sudo`.
#[derive(Debug, Clone, Default)]
pub struct SystemCommandRunner {
    use_sudo: bool,
}

impl SystemCommandRunner {
    pub fn new(use_sudo: bool) -> Self {
        Self { use_sudo }
    }
}

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandOutput> {
        let mut command = if self.use_sudo {
            let mut command = Command::new("sudo");
            command.arg("-n").arg(program);
            command
        } else {
            Command::new(program)
        };
        let output = command.args(args).kill_on_drop(true).output().await?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

#[derive(Clone)]
pub struct HostShell {
    runner: Arc<dyn CommandRunner>,
}

impl HostShell {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Non-zero exit is a hard failure.
    pub async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        self.execute(program, args, false).await
    }

    /// Non-zero exit is tolerated when the output is on the allow-list.
    pub async fn run_idempotent(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        self.execute(program, args, true).await
    }

    /// Exit status as a yes/no answer, e.g. `iptables -C`.
    pub async fn probe(&self, program: &str, args: &[String]) -> Result<bool> {
        let output = self.spawn(program, args).await?;
        Ok(output.success())
    }

    async fn spawn(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        let command = render(program, args);
        debug!(%command, "Running host command");
        self.runner
            .run(program, args)
            .await
            .map_err(|e| RuntimeError::HostCommand {
                command,
                code: None,
                stderr: e.to_string(),
            })
    }

    async fn execute(&self, program: &str, args: &[String], tolerate: bool) -> Result<CommandOutput> {
        let output = self.spawn(program, args).await?;
        if output.success() {
            return Ok(output);
        }
        if tolerate && output.is_idempotent_outcome() {
            warn!(
                command = %render(program, args),
                stderr = %output.stderr.trim(),
                "Host already in requested state"
            );
            return Ok(output);
        }
        Err(RuntimeError::HostCommand {
            command: render(program, args),
            code: output.code,
            stderr: output.stderr.trim().to_string(),
        })
    }

    pub async fn create_directory(&self, path: &Path) -> Result<()> {
        self.run("mkdir", &["-p".to_string(), path_arg(path)])
            .await
            .map(|_| ())
    }

    pub async fn remove_directory(&self, path: &Path) -> Result<()> {
        if !path.is_absolute() || path.parent().is_none() {
            return Err(RuntimeError::HostCommand {
                command: format!("rm -rf {}", path.display()),
                code: None,
                stderr: "refusing to remove a relative or root path".to_string(),
            });
        }
        self.run("rm", &["-rf".to_string(), path_arg(path)])
            .await
            .map(|_| ())
    }

    /// Stages `content` in a private temp file, copies it next to the
    /// destination and renames it into place, so readers never observe a
    /// partially written file.
    pub async fn write_file(&self, path: &Path, content: &str) -> Result<()> {
        let staged = tempfile::Builder::new().prefix("node-agent-").tempfile()?;
        tokio::fs::write(staged.path(), content).await?;

        let mut partial = path.as_os_str().to_owned();
        partial.push(".partial");
        let partial = PathBuf::from(partial);
        self.run(
            "install",
            &[
                "-m".to_string(),
                "0600".to_string(),
                path_arg(staged.path()),
                path_arg(&partial),
            ],
        )
        .await?;
        self.run(
            "mv",
            &["-f".to_string(), path_arg(&partial), path_arg(path)],
        )
        .await?;
        Ok(())
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn render(program: &str, args: &[String]) -> String {
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{program} {}", args.join(" "))
    }
}
