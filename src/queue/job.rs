use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{AgentError, Result};
use crate::store::RowId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Error,
}

impl JobStatus {
    /// Terminal status for a finished child: only a clean zero exit counts as done.
    pub fn from_retcode(retcode: Option<i32>) -> Self {
        match retcode {
            Some(0) => JobStatus::Done,
            _ => JobStatus::Error,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Done => write!(f, "done"),
            JobStatus::Error => write!(f, "error"),
        }
    }
}

/// Arguments a submitting client attached to a job.
///
/// A string is split into shell-style tokens without ever reaching a shell; an
/// array contributes one argument per element; an object contributes
/// `--key value` pairs (a `null` value yields a bare `--key` flag).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobArgs {
    Text(String),
    List(Vec<Value>),
    Map(Map<String, Value>),
    Other(Value),
}

impl JobArgs {
    pub fn to_argv(&self) -> Result<Vec<String>> {
        match self {
            JobArgs::Text(text) => shlex::split(text)
                .ok_or_else(|| AgentError::InvalidArgs(format!("cannot tokenize {:?}", text))),
            JobArgs::List(items) => Ok(items.iter().map(value_to_arg).collect()),
            JobArgs::Map(map) => {
                let mut argv = Vec::with_capacity(map.len() * 2);
                for (key, value) in map {
                    argv.push(format!("--{}", key));
                    if !value.is_null() {
                        argv.push(value_to_arg(value));
                    }
                }
                Ok(argv)
            }
            JobArgs::Other(Value::Null) => Ok(Vec::new()),
            JobArgs::Other(value) => Ok(vec![value_to_arg(value)]),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            JobArgs::Text(text) => text.trim().is_empty(),
            JobArgs::List(items) => items.is_empty(),
            JobArgs::Map(map) => map.is_empty(),
            JobArgs::Other(value) => value.is_null(),
        }
    }
}

fn value_to_arg(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// A row of the `jobs` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: RowId,
    pub user_id: String,
    #[serde(default)]
    pub script_id: Option<RowId>,
    #[serde(default)]
    pub script_path: Option<String>,
    #[serde(default)]
    pub args: Option<JobArgs>,
    pub status: JobStatus,
    #[serde(default)]
    pub stdout_path: Option<String>,
    #[serde(default)]
    pub stderr_path: Option<String>,
    #[serde(default)]
    pub retcode: Option<i32>,
    #[serde(default)]
    pub stdout_tail: Option<String>,
    #[serde(default)]
    pub stderr_tail: Option<String>,
    #[serde(default, deserialize_with = "super::timestamp::lenient")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "super::timestamp::lenient")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "super::timestamp::lenient")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Human-readable name of what the job runs.
    pub fn target_label(&self) -> String {
        match (&self.script_path, &self.script_id) {
            (Some(path), _) if !path.trim().is_empty() => path.clone(),
            (_, Some(id)) => format!("script #{}", id),
            _ => "<unknown script>".to_string(),
        }
    }

    pub fn argv(&self) -> Result<Vec<String>> {
        match &self.args {
            Some(args) => args.to_argv(),
            None => Ok(Vec::new()),
        }
    }

    pub fn has_args(&self) -> bool {
        self.args.as_ref().is_some_and(|args| !args.is_empty())
    }
}

/// Partial write to a `jobs` row. Unset fields are left untouched.
#[derive(Debug, Clone, Default, Serialize)]
pub struct JobUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retcode: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout_tail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr_tail: Option<String>,
}
