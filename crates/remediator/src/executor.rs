//! Command executor.
//!
//! Runs a rendered command list strictly in order, stopping at the first
//! command that fails, times out or cannot be delivered. Every command that
//! was attempted leaves a `CommandResult` on the record.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::error::TransitionError;
use crate::transport::{CommandTransport, TransportError};
use crate::types::{CommandResult, FailureReason, Host, RemediationRecord};

/// Exit code recorded when the command never produced one.
const NO_EXIT_CODE: i32 = -1;

const TRUNCATION_MARKER: &str = "... (truncated)";

/// How a command sequence ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Every command exited 0
    Completed,
    Failed(FailureReason),
}

/// Sends runbook commands through a transport.
pub struct CommandExecutor {
    transport: Arc<dyn CommandTransport>,
    timeout: Duration,
    output_limit: usize,
}

impl CommandExecutor {
    #[must_use]
    pub fn new(transport: Arc<dyn CommandTransport>, timeout: Duration, output_limit: usize) -> Self {
        Self {
            transport,
            timeout,
            output_limit,
        }
    }

    /// Execute `commands` against `host`, appending results to `record`.
    ///
    /// The record must be executing. In dry-run mode nothing is sent and
    /// every command is recorded as a simulated success.
    pub async fn execute(
        &self,
        host: &Host,
        commands: &[String],
        dry_run: bool,
        record: &mut RemediationRecord,
    ) -> Result<ExecutionOutcome, TransitionError> {
        for (index, command) in commands.iter().enumerate() {
            if dry_run {
                info!(record_id = %record.id, host = %host.id, command = %command, "Dry run: command not sent");
                record.push_command_result(CommandResult {
                    command: command.clone(),
                    exit_code: 0,
                    stdout: String::new(),
                    stderr: "dry run: command not sent".to_string(),
                    duration_ms: 0,
                    simulated: true,
                })?;
                continue;
            }

            let started = Instant::now();
            let (result, failure) = match self.transport.execute(host, command, self.timeout).await {
                Ok(output) => {
                    let failure = (output.exit_code != 0).then_some(FailureReason::CommandFailed);
                    let result = CommandResult {
                        command: command.clone(),
                        exit_code: output.exit_code,
                        stdout: truncate_output(&output.stdout, self.output_limit),
                        stderr: truncate_output(&output.stderr, self.output_limit),
                        duration_ms: output.duration.as_millis() as u64,
                        simulated: false,
                    };
                    (result, failure)
                }
                Err(e) => {
                    let reason = match e {
                        TransportError::Timeout(_) => FailureReason::CommandTimeout,
                        TransportError::Spawn(_) | TransportError::Connection { .. } => {
                            FailureReason::TransportError
                        }
                    };
                    let result = CommandResult {
                        command: command.clone(),
                        exit_code: NO_EXIT_CODE,
                        stdout: String::new(),
                        stderr: truncate_output(&e.to_string(), self.output_limit),
                        duration_ms: started.elapsed().as_millis() as u64,
                        simulated: false,
                    };
                    (result, Some(reason))
                }
            };

            let exit_code = result.exit_code;
            record.push_command_result(result)?;

            if let Some(reason) = failure {
                warn!(
                    record_id = %record.id,
                    host = %host.id,
                    command = %command,
                    exit_code,
                    reason = reason.as_str(),
                    skipped = commands.len() - index - 1,
                    "Command failed, aborting runbook"
                );
                return Ok(ExecutionOutcome::Failed(reason));
            }

            info!(record_id = %record.id, host = %host.id, command = %command, "Command succeeded");
        }

        Ok(ExecutionOutcome::Completed)
    }
}

/// Cap `output` at `limit` bytes on a char boundary.
#[must_use]
pub fn truncate_output(output: &str, limit: usize) -> String {
    if output.len() <= limit {
        return output.to_string();
    }
    let mut end = limit;
    while !output.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{TRUNCATION_MARKER}", &output[..end])
}
