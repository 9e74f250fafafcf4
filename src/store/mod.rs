//! Remote queue store access.
//!
//! The agent talks to its queue through four narrow operations, all defined on
//! [`QueueStore`]:
//!
//! - **claim_next_pending**: flip the oldest `pending` row of a user to an in-progress
//!   status, conditioned on the row still being `pending` at write time
//! - **update**: partial update of one row by primary key
//! - **replace_all**: delete-then-insert every row of a user in one transaction
//! - **list**: read rows matching equality filters
//!
//! # Implementations
//!
//! - [`PostgrestStore`]: HTTP client for a PostgREST endpoint (Supabase)
//! - [`MemoryStore`]: in-process store with fault injection, used by tests and dry runs

pub mod memory;
pub mod postgrest;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

pub use memory::MemoryStore;
pub use postgrest::PostgrestStore;

/// One store row, keyed by column name.
pub type Row = serde_json::Map<String, Value>;

pub const STATUS_COLUMN: &str = "status";
pub const OWNER_COLUMN: &str = "user_id";
pub const ORDER_COLUMN: &str = "created_at";
pub const PENDING: &str = "pending";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Users,
    Scripts,
    Jobs,
    JupyterSessions,
}

impl Table {
    pub fn name(&self) -> &'static str {
        match self {
            Table::Users => "users",
            Table::Scripts => "scripts",
            Table::Jobs => "jobs",
            Table::JupyterSessions => "jupyter_sessions",
        }
    }

    pub fn primary_key(&self) -> &'static str {
        match self {
            Table::Users => "user_id",
            Table::Scripts => "script_id",
            Table::Jobs => "job_id",
            Table::JupyterSessions => "session_id",
        }
    }

    /// Closed set of `status` values the table accepts, if it has a status column.
    pub fn statuses(&self) -> Option<&'static [&'static str]> {
        match self {
            Table::Jobs => Some(&["pending", "running", "done", "error"]),
            Table::JupyterSessions => Some(&["pending", "starting", "running", "error", "stopped"]),
            Table::Users | Table::Scripts => None,
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Opaque primary key. Stores hand out either integers or strings (uuids).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RowId {
    Int(i64),
    Text(String),
}

impl RowId {
    pub fn to_value(&self) -> Value {
        match self {
            RowId::Int(n) => Value::from(*n),
            RowId::Text(s) => Value::from(s.as_str()),
        }
    }

    /// Read the primary key out of a raw row.
    pub fn from_row(table: Table, row: &Row) -> Option<Self> {
        match row.get(table.primary_key())? {
            Value::Number(n) => n.as_i64().map(RowId::Int),
            Value::String(s) => Some(RowId::Text(s.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowId::Int(n) => write!(f, "{}", n),
            RowId::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for RowId {
    fn from(s: &str) -> Self {
        RowId::Text(s.to_string())
    }
}

impl From<i64> for RowId {
    fn from(n: i64) -> Self {
        RowId::Int(n)
    }
}

/// Conjunction of column equality conditions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<(String, Value)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn owner(user_id: &str) -> Self {
        Self::new().eq(OWNER_COLUMN, user_id)
    }

    pub fn eq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.conditions.push((column.to_string(), value.into()));
        self
    }

    pub fn conditions(&self) -> &[(String, Value)] {
        &self.conditions
    }

    pub fn matches(&self, row: &Row) -> bool {
        self.conditions
            .iter()
            .all(|(column, value)| row.get(column) == Some(value))
    }
}

#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Claim the oldest `pending` row owned by `user_id`.
    ///
    /// `patch` carries the in-progress status and any timestamps to stamp on the
    /// row. The write only applies while the row is still `pending`; a row taken
    /// by someone else in between is skipped. Returns the row as written.
    async fn claim_next_pending(&self, table: Table, user_id: &str, patch: Row)
        -> Result<Option<Row>>;

    /// Apply `fields` to the row with primary key `id`.
    async fn update(&self, table: Table, id: &RowId, fields: Row) -> Result<()>;

    /// Replace every row owned by `user_id` with `rows`, all or nothing.
    async fn replace_all(&self, table: Table, user_id: &str, rows: Vec<Row>) -> Result<()>;

    async fn list(&self, table: Table, filter: &Filter) -> Result<Vec<Row>>;
}
