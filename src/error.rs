use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Row not found in {table}: {id}")]
    RowNotFound { table: String, id: String },

    #[error("Script not found: {0}")]
    Resolution(String),

    #[error("Script rejected: {0}")]
    Rejected(String),

    #[error("Invalid job arguments: {0}")]
    InvalidArgs(String),

    #[error("Failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Replace of {table} was not applied: {reason}")]
    ReplaceNotAtomic { table: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Notification error: {0}")]
    Notify(String),
}

impl AgentError {
    /// Store and network failures are retried on the next tick.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AgentError::Store(_) | AgentError::Http(_) | AgentError::ReplaceNotAtomic { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
