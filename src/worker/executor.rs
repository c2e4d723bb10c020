use std::process::Stdio;
use std::time::Instant;

use tokio::process::Command;
use uuid::Uuid;

use crate::model::{Cmd, Job};

/// Outcome of one command invocation.
#[derive(Debug)]
pub struct RunReport {
    pub invocation: Uuid,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub output: Option<String>,
    pub error: Option<String>,
}

/// Executes job commands via the shell.
#[derive(Debug, Clone, Default)]
pub struct Executor;

impl Executor {
    /// Run a job's command to completion and capture its output.
    pub async fn execute(&self, job: &Job) -> RunReport {
        let invocation = Uuid::new_v4();
        tracing::info!(
            invocation = %invocation,
            job_id = %job.id,
            command = %job.command,
            node_id = job.run_on.as_deref().unwrap_or_default(),
            "executing command"
        );

        let started = Instant::now();
        let result = shell_command(job)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await;

        match result {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout).to_string();
                let stderr = String::from_utf8_lossy(&output.stderr).to_string();

                let (success, error) = if output.status.success() {
                    (true, None)
                } else {
                    let error = if stderr.is_empty() {
                        format!("exit code: {:?}", output.status.code())
                    } else {
                        stderr.clone()
                    };
                    (false, Some(error))
                };

                tracing::info!(
                    invocation = %invocation,
                    job_id = %job.id,
                    success,
                    exit_code = ?output.status.code(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "command finished"
                );

                RunReport {
                    invocation,
                    success,
                    exit_code: output.status.code(),
                    output: if stdout.is_empty() { None } else { Some(stdout) },
                    error,
                }
            }
            Err(e) => {
                tracing::warn!(
                    invocation = %invocation,
                    job_id = %job.id,
                    error = %e,
                    "command spawn failed"
                );
                RunReport {
                    invocation,
                    success: false,
                    exit_code: None,
                    output: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Detached run of a wheel-fired command. Failures and panics stay
    /// inside the spawned task.
    pub fn spawn(&self, cmd: Cmd) {
        let executor = self.clone();
        tokio::spawn(async move {
            let report = executor.execute(&cmd.job).await;
            if !report.success {
                tracing::warn!(
                    invocation = %report.invocation,
                    cmd_id = %cmd.id(),
                    error = report.error.as_deref().unwrap_or_default(),
                    "scheduled run failed"
                );
            }
        });
    }

    /// Detached run of a one-shot trigger.
    pub fn spawn_job(&self, job: Job) {
        let executor = self.clone();
        tokio::spawn(async move {
            let report = executor.execute(&job).await;
            if !report.success {
                tracing::warn!(
                    invocation = %report.invocation,
                    job_id = %job.id,
                    error = report.error.as_deref().unwrap_or_default(),
                    "one-shot run failed"
                );
            }
        });
    }
}

/// `sh -c` directly, or through `su` when the job names a run-as user.
fn shell_command(job: &Job) -> Command {
    match &job.user {
        Some(user) => {
            let mut command = Command::new("su");
            command.args(["-s", "/bin/sh", user, "-c", &job.command]);
            command
        }
        None => {
            let mut command = Command::new("sh");
            command.args(["-c", &job.command]);
            command
        }
    }
}
