//! Remote command transport.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use crate::types::Host;

/// Exit status ssh reserves for its own failures.
const SSH_CONNECTION_FAILURE: i32 = 255;

/// Transport errors. A non-zero exit code is not an error.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to spawn transport process: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("connection to {host} failed: {message}")]
    Connection { host: String, message: String },
}

/// Raw output of one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

/// Runs a single command on a host.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommandTransport: Send + Sync {
    async fn execute(
        &self,
        host: &Host,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, TransportError>;
}

/// OpenSSH client transport.
#[derive(Debug, Clone, Default)]
pub struct SshTransport {
    /// Used when the host record has no user
    pub default_user: Option<String>,
    pub identity_file: Option<String>,
    pub connect_timeout_secs: u64,
}

impl SshTransport {
    fn args(&self, host: &Host, command: &str) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout_secs.max(1)),
            "-o".to_string(),
            "StrictHostKeyChecking=yes".to_string(),
        ];
        if let Some(identity) = &self.identity_file {
            args.push("-i".to_string());
            args.push(identity.clone());
        }
        if let Some(port) = host.ssh_port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        let target = match host.ssh_user.as_ref().or(self.default_user.as_ref()) {
            Some(user) => format!("{user}@{}", host.address),
            None => host.address.clone(),
        };
        args.push(target);
        args.push("--".to_string());
        args.push(command.to_string());
        args
    }
}

#[async_trait]
impl CommandTransport for SshTransport {
    async fn execute(
        &self,
        host: &Host,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, TransportError> {
        debug!(host = %host.id, address = %host.address, command, "Running remote command");

        let started = Instant::now();
        let child = Command::new("ssh")
            .args(self.args(host, command))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // Dropping the future on timeout kills the child.
        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| TransportError::Timeout(timeout))??;

        let exit_code = output.status.code().unwrap_or(-1);
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if exit_code == SSH_CONNECTION_FAILURE {
            return Err(TransportError::Connection {
                host: host.address.clone(),
                message: stderr.trim().to_string(),
            });
        }

        Ok(CommandOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr,
            duration: started.elapsed(),
        })
    }
}
