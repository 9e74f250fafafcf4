use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::Stdio;

use chrono::Utc;

use super::command::session_command;
use crate::config::{AgentConfig, JupyterConfig};
use crate::error::{AgentError, Result};
use crate::queue::{JupyterSession, QueueClient, SessionUpdate};
use crate::store::RowId;

/// Port for a user's notebook server: `base_port + uid % 100`.
pub fn session_port(base_port: u16, uid: u32) -> u16 {
    // uid % 100 < 100, and the config caps base_port so this cannot wrap.
    base_port.saturating_add((uid % 100) as u16)
}

/// 128 random bits, lowercase hex.
pub fn generate_token() -> String {
    let bytes: [u8; 16] = rand::random();
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub jupyter: JupyterConfig,
    /// Program used to start the server
    pub program: String,
    /// Working directory of the server
    pub home: PathBuf,
    /// Server output goes to `log_root/jupyter/<session_id>.log`
    pub log_root: PathBuf,
}

impl SessionConfig {
    pub fn from_agent(config: &AgentConfig) -> Self {
        Self {
            jupyter: config.jupyter.clone(),
            program: config.toolchain.jupyter.clone(),
            home: config.home.clone(),
            log_root: config.log_root.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Running {
        session_id: RowId,
        port: u16,
        pid: u32,
    },
    Failed {
        session_id: RowId,
        error: String,
    },
}

/// Starts at most one requested notebook server per tick.
///
/// The server is detached into its own process group and outlives the agent;
/// only its pid is kept, in the session row.
pub struct SessionLauncher {
    queue: QueueClient,
    config: SessionConfig,
    uid: u32,
}

impl SessionLauncher {
    /// Launcher for the current process's uid.
    pub fn new(queue: QueueClient, config: SessionConfig) -> Self {
        let uid = nix::unistd::getuid().as_raw();
        Self::with_uid(queue, config, uid)
    }

    pub fn with_uid(queue: QueueClient, config: SessionConfig, uid: u32) -> Self {
        Self { queue, config, uid }
    }

    pub fn port(&self) -> u16 {
        session_port(self.config.jupyter.base_port, self.uid)
    }

    pub async fn tick(&self) -> Result<Option<SessionOutcome>> {
        let Some(session) = self.queue.claim_next_session(Utc::now()).await? else {
            tracing::info!(user_id = %self.queue.user_id(), "No pending Jupyter sessions");
            return Ok(None);
        };
        let session_id = session.session_id.clone();
        let port = self.port();
        tracing::info!(session_id = %session_id, port, "Starting Jupyter session");

        let token = generate_token();
        match self.launch(&session, port, &token) {
            Ok(pid) => {
                let update = SessionUpdate::running(port, token, pid, Utc::now());
                if let Err(e) = self.queue.update_session(&session_id, update).await {
                    // The server is up but the row still says `starting`.
                    tracing::error!(
                        session_id = %session_id,
                        pid,
                        port,
                        error = %e,
                        "Jupyter server started but could not be recorded; stop it by pid"
                    );
                    return Err(AgentError::Store(format!(
                        "session {} running as pid {} on port {} was not recorded: {}",
                        session_id, pid, port, e
                    )));
                }
                tracing::info!(session_id = %session_id, port, pid, "Jupyter session running");
                Ok(Some(SessionOutcome::Running {
                    session_id,
                    port,
                    pid,
                }))
            }
            Err(e) => {
                tracing::error!(session_id = %session_id, error = %e, "Failed to start Jupyter session");
                let error = e.to_string();
                self.queue
                    .update_session(&session_id, SessionUpdate::error(error.clone(), Utc::now()))
                    .await?;
                Ok(Some(SessionOutcome::Failed { session_id, error }))
            }
        }
    }

    /// Spawn the server and return its pid. The child handle is dropped
    /// immediately; the process keeps running.
    fn launch(&self, session: &JupyterSession, port: u16, token: &str) -> Result<u32> {
        let log_dir = self.config.log_root.join("jupyter");
        std::fs::create_dir_all(&log_dir)?;
        let log_path = log_dir.join(format!("{}.log", session.session_id));
        let stdout = OpenOptions::new().create(true).append(true).open(&log_path)?;
        let stderr = stdout.try_clone()?;

        let command = session_command(&self.config.program, &self.config.jupyter, port, token)
            .in_dir(&self.config.home);
        let mut process = command.to_tokio();
        process
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        #[cfg(unix)]
        process.process_group(0);

        let child = process.spawn().map_err(|source| AgentError::Launch {
            program: command.program.clone(),
            source,
        })?;
        child.id().ok_or_else(|| AgentError::Launch {
            program: command.program.clone(),
            source: std::io::Error::new(
                std::io::ErrorKind::Other,
                "server exited before its pid could be read",
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_is_base_plus_uid_mod_100() {
        assert_eq!(session_port(8800, 1000), 8800);
        assert_eq!(session_port(8800, 1042), 8842);
        assert_eq!(session_port(9000, 99), 9099);
    }

    #[test]
    fn token_is_32_hex_chars_and_fresh() {
        let a = generate_token();
        let b = generate_token();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(a, b);
    }
}
