use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use super::{
    Filter, QueueStore, Row, RowId, Table, ORDER_COLUMN, OWNER_COLUMN, PENDING, STATUS_COLUMN,
};
use crate::error::{AgentError, Result};

/// In-process queue store.
///
/// Mirrors the guarantees of the remote store: claims are conditional on the row
/// still being `pending`, status values are checked against each table's closed
/// set, `jupyter_sessions.updated_at` is refreshed on every write, and
/// `replace_all` either commits the whole new set or leaves the old one in place.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<HashMap<Table, Vec<Row>>>,
    faults: Mutex<Faults>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Faults {
    unavailable: bool,
    fail_inserts: bool,
    fail_updates: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a row as an external client would, filling in the primary key and
    /// `created_at` when absent. Returns the primary key.
    pub fn insert(&self, table: Table, mut row: Row) -> RowId {
        let id = match RowId::from_row(table, &row) {
            Some(id) => id,
            None => {
                let id = RowId::Text(Uuid::new_v4().to_string());
                row.insert(table.primary_key().to_string(), id.to_value());
                id
            }
        };
        row.entry(ORDER_COLUMN.to_string())
            .or_insert_with(|| Value::from(Utc::now().to_rfc3339()));
        self.lock().entry(table).or_default().push(row);
        id
    }

    pub fn rows(&self, table: Table) -> Vec<Row> {
        self.lock().get(&table).cloned().unwrap_or_default()
    }

    pub fn get(&self, table: Table, id: &RowId) -> Option<Row> {
        self.lock()
            .get(&table)?
            .iter()
            .find(|row| RowId::from_row(table, row).as_ref() == Some(id))
            .cloned()
    }

    /// Make every operation fail as if the network were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults_mut().unavailable = unavailable;
    }

    /// Make the insert half of `replace_all` fail.
    pub fn fail_inserts(&self, fail: bool) {
        self.faults_mut().fail_inserts = fail;
    }

    /// Make `update` fail while claims still succeed.
    pub fn fail_updates(&self, fail: bool) {
        self.faults_mut().fail_updates = fail;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Table, Vec<Row>>> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn faults_mut(&self) -> std::sync::MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_available(&self) -> Result<()> {
        if self.faults_mut().unavailable {
            return Err(AgentError::Store("store unavailable".to_string()));
        }
        Ok(())
    }

    fn validate_status(table: Table, fields: &Row) -> Result<()> {
        let (Some(allowed), Some(value)) = (table.statuses(), fields.get(STATUS_COLUMN)) else {
            return Ok(());
        };
        match value.as_str() {
            Some(status) if allowed.contains(&status) => Ok(()),
            _ => Err(AgentError::Store(format!(
                "invalid status {} for {}",
                value, table
            ))),
        }
    }

    fn apply(table: Table, row: &mut Row, fields: Row) {
        for (column, value) in fields {
            row.insert(column, value);
        }
        if table == Table::JupyterSessions {
            row.insert(
                "updated_at".to_string(),
                Value::from(Utc::now().to_rfc3339()),
            );
        }
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn claim_next_pending(
        &self,
        table: Table,
        user_id: &str,
        patch: Row,
    ) -> Result<Option<Row>> {
        self.check_available()?;
        Self::validate_status(table, &patch)?;

        // Select and conditional write are separate steps, as they are over HTTP,
        // so concurrent claimers can interleave between them.
        let pending = Filter::owner(user_id).eq(STATUS_COLUMN, PENDING);
        let mut candidates: Vec<Row> = self
            .rows(table)
            .into_iter()
            .filter(|row| pending.matches(row))
            .collect();
        candidates.sort_by(|a, b| {
            let key = |row: &Row| {
                row.get(ORDER_COLUMN)
                    .and_then(Value::as_str)
                    .map(str::to_string)
            };
            key(a).cmp(&key(b))
        });

        tokio::task::yield_now().await;

        for candidate in candidates {
            let Some(id) = RowId::from_row(table, &candidate) else {
                continue;
            };
            let mut tables = self.lock();
            let rows = tables.entry(table).or_default();
            let Some(row) = rows
                .iter_mut()
                .find(|row| RowId::from_row(table, row).as_ref() == Some(&id))
            else {
                continue;
            };
            if !pending.matches(row) {
                tracing::debug!(table = %table, id = %id, "Lost claim race, trying next row");
                continue;
            }
            Self::apply(table, row, patch.clone());
            return Ok(Some(row.clone()));
        }
        Ok(None)
    }

    async fn update(&self, table: Table, id: &RowId, fields: Row) -> Result<()> {
        self.check_available()?;
        if self.faults_mut().fail_updates {
            return Err(AgentError::Store("update rejected".to_string()));
        }
        Self::validate_status(table, &fields)?;

        let mut tables = self.lock();
        let row = tables
            .get_mut(&table)
            .and_then(|rows| {
                rows.iter_mut()
                    .find(|row| RowId::from_row(table, row).as_ref() == Some(id))
            })
            .ok_or_else(|| AgentError::RowNotFound {
                table: table.to_string(),
                id: id.to_string(),
            })?;
        Self::apply(table, row, fields);
        Ok(())
    }

    async fn replace_all(&self, table: Table, user_id: &str, rows: Vec<Row>) -> Result<()> {
        self.check_available()?;
        let fail_inserts = self.faults_mut().fail_inserts;

        let mut tables = self.lock();
        let current = tables.entry(table).or_default();

        // Stage the delete and insert on a copy; commit only if both succeed.
        let owner = Filter::owner(user_id);
        let mut staged: Vec<Row> = current
            .iter()
            .filter(|row| !owner.matches(row))
            .cloned()
            .collect();

        let not_applied = |reason: String| AgentError::ReplaceNotAtomic {
            table: table.to_string(),
            reason,
        };
        if fail_inserts {
            return Err(not_applied("insert rejected".to_string()));
        }

        let mut seen_paths = HashSet::new();
        for mut row in rows {
            if row.get(OWNER_COLUMN).and_then(Value::as_str) != Some(user_id) {
                return Err(not_applied(format!("row not owned by {}", user_id)));
            }
            if let Some(path) = row.get("path").and_then(Value::as_str) {
                if !seen_paths.insert(path.to_string()) {
                    return Err(not_applied(format!("duplicate path {}", path)));
                }
            }
            if RowId::from_row(table, &row).is_none() {
                row.insert(
                    table.primary_key().to_string(),
                    Value::from(Uuid::new_v4().to_string()),
                );
            }
            staged.push(row);
        }

        *current = staged;
        Ok(())
    }

    async fn list(&self, table: Table, filter: &Filter) -> Result<Vec<Row>> {
        self.check_available()?;
        Ok(self
            .rows(table)
            .into_iter()
            .filter(|row| filter.matches(row))
            .collect())
    }
}
