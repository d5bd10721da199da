//! External step executor

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::deploy::catalog::PlaybookStep;
use crate::errors::ConsoleError;

/// Runs one provisioning step against an inventory
///
/// Implementations stream output into `output` as it is produced and should
/// stop promptly once `cancel` fires. An `Err` means the step did not
/// complete successfully.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn run(
        &self,
        cancel: CancellationToken,
        step: &PlaybookStep,
        inventory: &Path,
        output: &mut (dyn Write + Send),
    ) -> Result<(), ConsoleError>;
}

/// Runs steps with `ansible-playbook`
#[derive(Debug, Clone)]
pub struct AnsibleExecutor {
    binary: PathBuf,
    playbooks_dir: PathBuf,
}

impl AnsibleExecutor {
    pub fn new(binary: impl Into<PathBuf>, playbooks_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            playbooks_dir: playbooks_dir.into(),
        }
    }

    /// Resolve a step's playbook identifier to a file path
    pub fn playbook_path(&self, step: &PlaybookStep) -> PathBuf {
        self.playbooks_dir.join(&step.playbook)
    }
}

#[async_trait]
impl StepExecutor for AnsibleExecutor {
    async fn run(
        &self,
        cancel: CancellationToken,
        step: &PlaybookStep,
        inventory: &Path,
        output: &mut (dyn Write + Send),
    ) -> Result<(), ConsoleError> {
        let playbook = self.playbook_path(step);
        info!(
            step = %step.name,
            playbook = %playbook.display(),
            inventory = %inventory.display(),
            "Running playbook"
        );

        let mut child = Command::new(&self.binary)
            .arg("-i")
            .arg(inventory)
            .arg(&playbook)
            .env("ANSIBLE_NOCOLOR", "1")
            .env("ANSIBLE_FORCE_COLOR", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ConsoleError::StepError(format!(
                    "Failed to run {}: {}",
                    self.binary.display(),
                    e
                ))
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ConsoleError::Internal("playbook stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ConsoleError::Internal("playbook stderr not captured".to_string()))?;
        let mut stdout = BufReader::new(stdout).lines();
        let mut stderr = BufReader::new(stderr).lines();
        let mut stdout_open = true;
        let mut stderr_open = true;

        while stdout_open || stderr_open {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!(step = %step.name, "Cancellation requested, killing playbook");
                    if let Err(e) = child.kill().await {
                        warn!(step = %step.name, "Failed to kill playbook: {}", e);
                    }
                    return Err(ConsoleError::StepError("cancelled".to_string()));
                }
                line = stdout.next_line(), if stdout_open => match line? {
                    Some(line) => writeln!(output, "{}", line)?,
                    None => stdout_open = false,
                },
                line = stderr.next_line(), if stderr_open => match line? {
                    Some(line) => writeln!(output, "{}", line)?,
                    None => stderr_open = false,
                },
            }
        }

        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                if let Err(e) = child.kill().await {
                    warn!(step = %step.name, "Failed to kill playbook: {}", e);
                }
                return Err(ConsoleError::StepError("cancelled".to_string()));
            }
            status = child.wait() => status?,
        };

        if !status.success() {
            return Err(ConsoleError::StepError(format!(
                "{} exited with {}",
                playbook.display(),
                status
            )));
        }

        debug!(step = %step.name, "Playbook finished");
        Ok(())
    }
}
