use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::RowId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Starting,
    Running,
    Error,
    /// Set by whoever shuts the server down; never by the agent.
    Stopped,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Pending => write!(f, "pending"),
            SessionStatus::Starting => write!(f, "starting"),
            SessionStatus::Running => write!(f, "running"),
            SessionStatus::Error => write!(f, "error"),
            SessionStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// A row of the `jupyter_sessions` table.
#[derive(Clone, Serialize, Deserialize)]
pub struct JupyterSession {
    pub session_id: RowId,
    pub user_id: String,
    pub status: SessionStatus,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default, deserialize_with = "super::timestamp::lenient")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "super::timestamp::lenient")]
    pub updated_at: Option<DateTime<Utc>>,
}

// The token is a bearer credential for the notebook server.
impl std::fmt::Debug for JupyterSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JupyterSession")
            .field("session_id", &self.session_id)
            .field("user_id", &self.user_id)
            .field("status", &self.status)
            .field("port", &self.port)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("pid", &self.pid)
            .field("error_message", &self.error_message)
            .finish()
    }
}

/// Partial write to a `jupyter_sessions` row. `updated_at` is always stamped.
#[derive(Clone, Serialize)]
pub struct SessionUpdate {
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl SessionUpdate {
    pub fn running(port: u16, token: String, pid: u32, now: DateTime<Utc>) -> Self {
        Self {
            status: SessionStatus::Running,
            port: Some(port),
            token: Some(token),
            pid: Some(pid),
            error_message: None,
            updated_at: now,
        }
    }

    pub fn error(message: String, now: DateTime<Utc>) -> Self {
        Self {
            status: SessionStatus::Error,
            port: None,
            token: None,
            pid: None,
            error_message: Some(message),
            updated_at: now,
        }
    }
}
