use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use chrono::Utc;
use tokio::io::AsyncWriteExt;

use super::command::{confine_script, JobTarget};
use super::tail::{read_tail, tail_chars, TAIL_CHARS};
use crate::config::{AgentConfig, ToolchainConfig};
use crate::error::{AgentError, Result};
use crate::notify::{Notification, Notifier};
use crate::queue::{Job, JobStatus, JobUpdate, QueueClient, ScriptKind};
use crate::store::RowId;

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Scripts must resolve under this directory
    pub home: PathBuf,
    /// Each job logs to `log_root/<job_id>/`
    pub log_root: PathBuf,
    pub toolchain: ToolchainConfig,
    /// Recipient of job notifications
    pub notify_email: String,
}

impl ExecutorConfig {
    pub fn from_agent(config: &AgentConfig) -> Self {
        Self {
            home: config.home.clone(),
            log_root: config.log_root.clone(),
            toolchain: config.toolchain.clone(),
            notify_email: config.identity.email.clone(),
        }
    }
}

/// Result of job execution
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub job_id: RowId,
    pub status: JobStatus,
    pub retcode: Option<i32>,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    pub stdout_tail: Option<String>,
    pub stderr_tail: Option<String>,
    /// Why the job did not run to a normal exit, if it did not
    pub error: Option<String>,
}

/// Runs at most one queued job per tick.
///
/// A claimed job always leaves `running`: resolution, launch and I/O failures are
/// folded into an `error` result with the reason appended to the job's stderr log.
pub struct JobExecutor {
    queue: QueueClient,
    notifier: Arc<dyn Notifier>,
    config: ExecutorConfig,
}

impl JobExecutor {
    pub fn new(queue: QueueClient, notifier: Arc<dyn Notifier>, config: ExecutorConfig) -> Self {
        Self {
            queue,
            notifier,
            config,
        }
    }

    /// Claim the oldest pending job, run it to completion, report and notify.
    ///
    /// Returns `Ok(None)` when nothing is pending. Errors are store failures on
    /// the claim or on the final report.
    pub async fn tick(&self) -> Result<Option<ExecutionResult>> {
        let Some(job) = self.queue.claim_next_job(Utc::now()).await? else {
            tracing::info!(user_id = %self.queue.user_id(), "No pending jobs");
            return Ok(None);
        };
        tracing::info!(job_id = %job.job_id, script = %job.target_label(), "Claimed job");

        let result = self.execute(&job).await;
        self.report(&job, &result).await?;

        let notification = Notification::for_job(&self.config.notify_email, &job, &result);
        if let Err(e) = self.notifier.notify(&notification).await {
            tracing::error!(job_id = %job.job_id, error = %e, "Failed to send notification");
        }
        Ok(Some(result))
    }

    /// Run a claimed job and collect its outcome. Never fails.
    pub async fn execute(&self, job: &Job) -> ExecutionResult {
        let log_dir = self.config.log_root.join(job.job_id.to_string());
        let stdout_path = log_dir.join("stdout.log");
        let stderr_path = log_dir.join("stderr.log");

        let (retcode, error) = match self.run(job, &log_dir, &stdout_path, &stderr_path).await {
            Ok(status) => {
                let error = exit_description(status);
                tracing::info!(job_id = %job.job_id, retcode = ?status.code(), "Job finished");
                (status.code(), error)
            }
            Err(e) => {
                tracing::error!(job_id = %job.job_id, error = %e, "Job failed");
                append_line(&stderr_path, &format!("lab-agent: {}", e)).await;
                (None, Some(e.to_string()))
            }
        };

        let stdout_tail = read_tail(&stdout_path, TAIL_CHARS).await.ok();
        let stderr_tail = read_tail(&stderr_path, TAIL_CHARS)
            .await
            .ok()
            .or_else(|| {
                error
                    .as_deref()
                    .map(|e| tail_chars(e, TAIL_CHARS).to_string())
            });

        ExecutionResult {
            job_id: job.job_id.clone(),
            status: JobStatus::from_retcode(retcode),
            retcode,
            stdout_path,
            stderr_path,
            stdout_tail,
            stderr_tail,
            error,
        }
    }

    async fn run(
        &self,
        job: &Job,
        log_dir: &Path,
        stdout_path: &Path,
        stderr_path: &Path,
    ) -> Result<ExitStatus> {
        tokio::fs::create_dir_all(log_dir).await?;
        let target = self.resolve(job).await?;
        let command = target.command(&self.config.toolchain, log_dir);

        let stdout = open_append(stdout_path)?;
        let mut stderr = open_append(stderr_path)?;
        if target.kind() == ScriptKind::Notebook && job.has_args() {
            tracing::warn!(job_id = %job.job_id, "Arguments are ignored for notebook jobs");
            writeln!(stderr, "Args are ignored for notebook jobs.")?;
        }

        tracing::info!(job_id = %job.job_id, command = %command.display(), "Running job");
        let mut process = command.to_tokio();
        process
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        #[cfg(unix)]
        process.process_group(0);

        let mut child = process.spawn().map_err(|source| AgentError::Launch {
            program: command.program.clone(),
            source,
        })?;
        Ok(child.wait().await?)
    }

    /// Turn the job row into something runnable: `script_path` wins over
    /// `script_id`, which is looked up in the current scripts snapshot.
    async fn resolve(&self, job: &Job) -> Result<JobTarget> {
        let (raw, expected) = match (&job.script_path, &job.script_id) {
            (Some(path), _) if !path.trim().is_empty() => (path.clone(), None),
            (_, Some(id)) => {
                let script = self.queue.find_script(id).await?.ok_or_else(|| {
                    AgentError::Resolution(format!("script_id {} is not in the scripts table", id))
                })?;
                (script.path, Some(script.kind))
            }
            _ => {
                return Err(AgentError::Resolution(
                    "job names neither script_path nor script_id".to_string(),
                ))
            }
        };

        let (path, kind) = confine_script(&self.config.home, &raw, expected)?;
        let args = match kind {
            ScriptKind::Python => job.argv()?,
            ScriptKind::Notebook => Vec::new(),
        };
        Ok(JobTarget::new(kind, path, args))
    }

    /// Persist the terminal state. If the full write is refused, fall back to the
    /// status alone so the job does not stay `running`.
    async fn report(&self, job: &Job, result: &ExecutionResult) -> Result<()> {
        let update = JobUpdate {
            status: Some(result.status),
            finished_at: Some(Utc::now()),
            retcode: result.retcode,
            stdout_path: Some(result.stdout_path.display().to_string()),
            stderr_path: Some(result.stderr_path.display().to_string()),
            stdout_tail: result.stdout_tail.clone(),
            stderr_tail: result.stderr_tail.clone(),
            ..Default::default()
        };
        if let Err(e) = self.queue.update_job(&job.job_id, update).await {
            tracing::error!(job_id = %job.job_id, error = %e, "Failed to report job result, retrying with status only");
            let minimal = JobUpdate {
                status: Some(result.status),
                finished_at: Some(Utc::now()),
                ..Default::default()
            };
            self.queue.update_job(&job.job_id, minimal).await?;
        }
        tracing::info!(job_id = %job.job_id, status = %result.status, retcode = ?result.retcode, "Job reported");
        Ok(())
    }
}

fn open_append(path: &Path) -> std::io::Result<std::fs::File> {
    OpenOptions::new().create(true).append(true).open(path)
}

async fn append_line(path: &Path, line: &str) {
    let written = async {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(format!("{}\n", line).as_bytes()).await
    }
    .await;
    if let Err(e) = written {
        tracing::warn!(path = %path.display(), error = %e, "Failed to append to job log");
    }
}

#[cfg(unix)]
fn exit_description(status: ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;
    status
        .signal()
        .map(|signal| format!("terminated by signal {}", signal))
}

#[cfg(not(unix))]
fn exit_description(_status: ExitStatus) -> Option<String> {
    None
}
