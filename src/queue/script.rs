use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::RowId;

/// How a script is run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptKind {
    Python,
    Notebook,
}

impl ScriptKind {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "py" => Some(ScriptKind::Python),
            "ipynb" => Some(ScriptKind::Notebook),
            _ => None,
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(Self::from_extension)
    }

}

impl std::fmt::Display for ScriptKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScriptKind::Python => write!(f, "python"),
            ScriptKind::Notebook => write!(f, "notebook"),
        }
    }
}

/// A row of the `scripts` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Script {
    pub script_id: RowId,
    pub user_id: String,
    /// Relative to the owner's home directory
    pub path: String,
    pub kind: ScriptKind,
    #[serde(default, deserialize_with = "super::timestamp::lenient")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// A `scripts` row as written by a sync; the store assigns `script_id`.
#[derive(Debug, Clone, Serialize)]
pub struct NewScript {
    pub user_id: String,
    pub path: String,
    pub kind: ScriptKind,
    pub updated_at: DateTime<Utc>,
}
