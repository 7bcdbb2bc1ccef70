//! Remote command execution over the system `ssh` client.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::storage::SshTarget;

#[derive(Debug, thiserror::Error)]
pub enum SshError {
    #[error("Failed to spawn ssh: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Remote command timed out after {0:?}")]
    Timeout(Duration),

    #[error("Remote command exited with {status:?}: {stderr}")]
    Failed { status: Option<i32>, stderr: String },
}

/// Runs one command per call with batch-mode authentication and a hard
/// per-command timeout.
#[derive(Debug, Clone)]
pub struct SshRunner {
    program: String,
    command_timeout: Duration,
    connect_timeout_secs: u64,
}

impl SshRunner {
    pub fn new(command_timeout: Duration, connect_timeout: Duration) -> Self {
        Self {
            program: "ssh".to_string(),
            command_timeout,
            connect_timeout_secs: connect_timeout.as_secs().max(1),
        }
    }

    /// Use a different client binary.
    #[must_use]
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub(crate) fn args(&self, target: &SshTarget, remote_command: &str) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout_secs),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-p".to_string(),
            target.port.to_string(),
        ];
        if let Some(identity) = &target.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        args.push(format!("{}@{}", target.user, target.address));
        args.push(remote_command.to_string());
        args
    }

    /// Run `remote_command` on `target` and return its stdout.
    pub async fn run(&self, target: &SshTarget, remote_command: &str) -> Result<String, SshError> {
        let child = Command::new(&self.program)
            .args(self.args(target, remote_command))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = tokio::time::timeout(self.command_timeout, child.wait_with_output())
            .await
            .map_err(|_| SshError::Timeout(self.command_timeout))??;

        if !output.status.success() {
            return Err(SshError::Failed {
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
