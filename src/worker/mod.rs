//! Local execution of queued work.
//!
//! # Components
//!
//! - [`JobExecutor`]: claims one job, runs it as a subprocess and reports the result
//! - [`SessionLauncher`]: claims one notebook-session request and detaches a server
//! - [`command`]: argument vectors for every child the agent starts, plus path confinement
//! - [`tail`]: bounded trailing excerpts of captured output
//!
//! # Execution Flow
//!
//! 1. The claim flips the row to its in-progress status
//! 2. The job's script is resolved and confined to the home directory
//! 3. The child runs without a shell, output appended to per-job log files
//! 4. Exit code and tails are written back; the owner is notified
//!
//! Jobs have no timeout. A job left `running` by an agent crash is not reclaimed.

pub mod command;
pub mod executor;
pub mod session;
pub mod tail;

pub use command::{confine_script, CommandSpec, JobTarget};
pub use executor::{ExecutionResult, ExecutorConfig, JobExecutor};
pub use session::{generate_token, session_port, SessionConfig, SessionLauncher, SessionOutcome};
