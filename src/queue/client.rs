use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::{
    Job, JobStatus, JobUpdate, JupyterSession, NewScript, Script, SessionStatus, SessionUpdate,
    User,
};
use crate::error::{AgentError, Result};
use crate::indexer::IndexedScript;
use crate::store::{Filter, QueueStore, Row, RowId, Table};

/// Queue operations on behalf of one user.
#[derive(Clone)]
pub struct QueueClient {
    store: Arc<dyn QueueStore>,
    user_id: String,
}

impl QueueClient {
    pub fn new(store: Arc<dyn QueueStore>, user_id: impl Into<String>) -> Self {
        Self {
            store,
            user_id: user_id.into(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Look up the user id owning `linux_user` in the `users` table.
    pub async fn resolve_user_id(store: &dyn QueueStore, linux_user: &str) -> Result<String> {
        let rows = store
            .list(Table::Users, &Filter::new().eq("linux_user", linux_user))
            .await?;
        let user: User = match rows.into_iter().next() {
            Some(row) => decode(Table::Users, row)?,
            None => {
                return Err(AgentError::Config(format!(
                    "no users row with linux_user = {}",
                    linux_user
                )))
            }
        };
        if user.user_id.trim().is_empty() {
            return Err(AgentError::Config(format!(
                "users row for {} has an empty user_id",
                linux_user
            )));
        }
        Ok(user.user_id)
    }

    /// Claim the oldest pending job, moving it to `running` and stamping `started_at`.
    pub async fn claim_next_job(&self, now: DateTime<Utc>) -> Result<Option<Job>> {
        let patch = encode(&JobUpdate {
            status: Some(JobStatus::Running),
            started_at: Some(now),
            ..Default::default()
        })?;
        let Some(row) = self
            .store
            .claim_next_pending(Table::Jobs, &self.user_id, patch)
            .await?
        else {
            return Ok(None);
        };

        match decode::<Job>(Table::Jobs, row.clone()) {
            Ok(job) => Ok(Some(job)),
            Err(e) => {
                // The row is already `running`; do not leave it there.
                if let Some(id) = RowId::from_row(Table::Jobs, &row) {
                    let update = JobUpdate {
                        status: Some(JobStatus::Error),
                        finished_at: Some(now),
                        stderr_tail: Some(e.to_string()),
                        ..Default::default()
                    };
                    if let Err(update_err) = self.update_job(&id, update).await {
                        tracing::error!(job_id = %id, error = %update_err, "Failed to fail malformed job");
                    }
                }
                Err(e)
            }
        }
    }

    pub async fn update_job(&self, id: &RowId, update: JobUpdate) -> Result<()> {
        self.store.update(Table::Jobs, id, encode(&update)?).await
    }

    /// Claim the oldest pending session request, moving it to `starting`.
    pub async fn claim_next_session(&self, now: DateTime<Utc>) -> Result<Option<JupyterSession>> {
        let mut patch = Row::new();
        patch.insert(
            "status".to_string(),
            Value::from(SessionStatus::Starting.to_string()),
        );
        patch.insert("updated_at".to_string(), Value::from(now.to_rfc3339()));
        let Some(row) = self
            .store
            .claim_next_pending(Table::JupyterSessions, &self.user_id, patch)
            .await?
        else {
            return Ok(None);
        };

        match decode::<JupyterSession>(Table::JupyterSessions, row.clone()) {
            Ok(session) => Ok(Some(session)),
            Err(e) => {
                if let Some(id) = RowId::from_row(Table::JupyterSessions, &row) {
                    let update = SessionUpdate::error(e.to_string(), now);
                    if let Err(update_err) = self.update_session(&id, update).await {
                        tracing::error!(session_id = %id, error = %update_err, "Failed to fail malformed session");
                    }
                }
                Err(e)
            }
        }
    }

    pub async fn update_session(&self, id: &RowId, update: SessionUpdate) -> Result<()> {
        self.store
            .update(Table::JupyterSessions, id, encode(&update)?)
            .await
    }

    pub async fn list_scripts(&self) -> Result<Vec<Script>> {
        self.store
            .list(Table::Scripts, &Filter::owner(&self.user_id))
            .await?
            .into_iter()
            .map(|row| decode(Table::Scripts, row))
            .collect()
    }

    /// Find one of this user's scripts by id in the current snapshot.
    pub async fn find_script(&self, id: &RowId) -> Result<Option<Script>> {
        Ok(self
            .list_scripts()
            .await?
            .into_iter()
            .find(|script| &script.script_id == id))
    }

    /// Replace this user's script set with `scripts`, atomically.
    pub async fn replace_scripts(&self, scripts: &[IndexedScript], now: DateTime<Utc>) -> Result<()> {
        let rows = scripts
            .iter()
            .map(|script| {
                encode(&NewScript {
                    user_id: self.user_id.clone(),
                    path: script.path.clone(),
                    kind: script.kind,
                    updated_at: now,
                })
            })
            .collect::<Result<Vec<Row>>>()?;
        self.store
            .replace_all(Table::Scripts, &self.user_id, rows)
            .await
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Row> {
    match serde_json::to_value(value) {
        Ok(Value::Object(row)) => Ok(row),
        Ok(other) => Err(AgentError::Store(format!(
            "expected an object row, got {}",
            other
        ))),
        Err(e) => Err(AgentError::Store(format!("failed to encode row: {}", e))),
    }
}

fn decode<T: DeserializeOwned>(table: Table, row: Row) -> Result<T> {
    serde_json::from_value(Value::Object(row))
        .map_err(|e| AgentError::Store(format!("malformed {} row: {}", table, e)))
}
