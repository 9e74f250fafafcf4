use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use crate::config::SmtpConfig;
use crate::error::{AgentError, Result};
use crate::queue::Job;
use crate::worker::ExecutionResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub subject: String,
    pub body: String,
    pub recipient: String,
}

impl Notification {
    /// Summary of a finished job for its owner.
    pub fn for_job(recipient: &str, job: &Job, result: &ExecutionResult) -> Self {
        let subject = format!("[Lab job] {} {}", job.target_label(), result.status);

        let args = job
            .args
            .as_ref()
            .and_then(|args| serde_json::to_string(args).ok())
            .unwrap_or_else(|| "null".to_string());
        let retcode = result
            .retcode
            .map(|code| code.to_string())
            .unwrap_or_else(|| "none".to_string());
        let mut lines = vec![
            format!("job_id: {}", job.job_id),
            format!(
                "script_id: {}",
                job.script_id
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_default()
            ),
            format!("script_path: {}", job.script_path.as_deref().unwrap_or("")),
            format!("args: {}", args),
            format!("status: {}", result.status),
            format!("return code: {}", retcode),
            format!("stdout: {}", result.stdout_path.display()),
            format!("stderr: {}", result.stderr_path.display()),
        ];
        if let Some(error) = &result.error {
            lines.push(format!("error: {}", error));
        }
        for (name, tail) in [
            ("stdout", &result.stdout_tail),
            ("stderr", &result.stderr_tail),
        ] {
            if let Some(tail) = tail.as_deref().filter(|t| !t.is_empty()) {
                lines.push(String::new());
                lines.push(format!("--- {} (tail) ---", name));
                lines.push(tail.to_string());
            }
        }

        Self {
            subject,
            body: lines.join("\n"),
            recipient: recipient.to_string(),
        }
    }
}

/// Fire-and-forget delivery of notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<()>;
}

/// Plain SMTP relay, typically the host's local MTA.
pub struct SmtpNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: String,
}

impl SmtpNotifier {
    pub fn new(config: &SmtpConfig, from: &str) -> Self {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(config.host.as_str())
            .port(config.port)
            .build();
        Self {
            transport,
            from: from.to_string(),
        }
    }
}

fn mailbox(address: &str) -> Result<Mailbox> {
    address
        .parse()
        .map_err(|e| AgentError::Notify(format!("invalid address {:?}: {}", address, e)))
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        let message = Message::builder()
            .from(mailbox(&self.from)?)
            .to(mailbox(&notification.recipient)?)
            .subject(notification.subject.as_str())
            .header(ContentType::TEXT_PLAIN)
            .body(notification.body.clone())
            .map_err(|e| AgentError::Notify(e.to_string()))?;
        self.transport
            .send(message)
            .await
            .map_err(|e| AgentError::Notify(e.to_string()))?;
        tracing::info!(recipient = %notification.recipient, "Notification email sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::JobStatus;
    use serde_json::json;
    use std::path::PathBuf;

    fn job() -> Job {
        serde_json::from_value(json!({
            "job_id": "j-1",
            "user_id": "u1",
            "script_path": "lab/train.py",
            "args": "--epochs 3",
            "status": "running"
        }))
        .unwrap()
    }

    fn result(status: JobStatus, retcode: Option<i32>) -> ExecutionResult {
        ExecutionResult {
            job_id: "j-1".into(),
            status,
            retcode,
            stdout_path: PathBuf::from("/logs/j-1/stdout.log"),
            stderr_path: PathBuf::from("/logs/j-1/stderr.log"),
            stdout_tail: Some("loss=0.1".to_string()),
            stderr_tail: Some(String::new()),
            error: None,
        }
    }

    #[test]
    fn job_summary_lists_outcome() {
        let n = Notification::for_job("a@example.com", &job(), &result(JobStatus::Done, Some(0)));
        assert_eq!(n.subject, "[Lab job] lab/train.py done");
        assert_eq!(n.recipient, "a@example.com");
        assert!(n.body.contains("job_id: j-1"));
        assert!(n.body.contains("args: \"--epochs 3\""));
        assert!(n.body.contains("return code: 0"));
        assert!(n.body.contains("--- stdout (tail) ---\nloss=0.1"));
        assert!(!n.body.contains("stderr (tail)"));
    }

    #[test]
    fn failed_job_summary_includes_error() {
        let mut failed = result(JobStatus::Error, None);
        failed.error = Some("Script rejected: outside home".to_string());
        let n = Notification::for_job("a@example.com", &job(), &failed);
        assert!(n.subject.ends_with("error"));
        assert!(n.body.contains("return code: none"));
        assert!(n.body.contains("error: Script rejected: outside home"));
    }

    #[test]
    fn invalid_address_is_notify_error() {
        assert!(matches!(mailbox("not an address"), Err(AgentError::Notify(_))));
        assert!(mailbox("lab@example.com").is_ok());
    }
}
