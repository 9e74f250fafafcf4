//! Typed view of the queue tables.
//!
//! [`QueueClient`] wraps a [`QueueStore`](crate::store::QueueStore) and scopes
//! every operation to the agent's resolved user id. It holds no business logic:
//! deciding what to claim and how to react is left to the workers.

pub mod client;
pub mod job;
pub mod script;
pub mod session;
pub mod timestamp;
pub mod user;

pub use client::QueueClient;
pub use job::{Job, JobArgs, JobStatus, JobUpdate};
pub use script::{NewScript, Script, ScriptKind};
pub use session::{JupyterSession, SessionStatus, SessionUpdate};
pub use user::User;
