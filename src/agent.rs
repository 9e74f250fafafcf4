use std::sync::Arc;

use crate::config::AgentConfig;
use crate::error::Result;
use crate::indexer::ScriptIndexer;
use crate::notify::{Notifier, SmtpNotifier};
use crate::queue::QueueClient;
use crate::store::{PostgrestStore, QueueStore};
use crate::sync::{Clock, SyncMarker, SyncOutcome, SyncScheduler, SystemClock};
use crate::worker::{
    ExecutionResult, ExecutorConfig, JobExecutor, SessionConfig, SessionLauncher, SessionOutcome,
};

/// What one tick did. `None` in a slot means that component failed; the
/// failure has already been logged.
#[derive(Debug, Default)]
pub struct TickReport {
    pub sync: Option<SyncOutcome>,
    pub job: Option<Option<ExecutionResult>>,
    pub session: Option<Option<SessionOutcome>>,
}

/// Top-level driver run once per invocation.
pub struct Agent {
    pub sync: SyncScheduler,
    pub executor: JobExecutor,
    pub sessions: SessionLauncher,
}

impl Agent {
    /// Connect to the remote store and resolve this agent's identity.
    ///
    /// # Errors
    ///
    /// Fails if the store client cannot be built or the linux account has no
    /// `users` row. No queue work happens in that case.
    pub async fn connect(config: AgentConfig) -> Result<Self> {
        let store: Arc<dyn QueueStore> = Arc::new(PostgrestStore::new(&config.store)?);
        let user_id = match &config.identity.user_id {
            Some(user_id) => user_id.clone(),
            None => QueueClient::resolve_user_id(store.as_ref(), &config.identity.linux_user).await?,
        };
        tracing::info!(
            linux_user = %config.identity.linux_user,
            user_id = %user_id,
            "Resolved agent identity"
        );
        let notifier = Arc::new(SmtpNotifier::new(&config.smtp, config.from_address()));
        Ok(Self::from_parts(
            &config,
            store,
            notifier,
            Arc::new(SystemClock),
            user_id,
        ))
    }

    /// Assemble an agent from already-built collaborators.
    pub fn from_parts(
        config: &AgentConfig,
        store: Arc<dyn QueueStore>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        user_id: String,
    ) -> Self {
        let queue = QueueClient::new(store, user_id);
        let sync = SyncScheduler::new(
            ScriptIndexer::new(&config.home),
            queue.clone(),
            clock,
            config.sync_interval,
        )
        .with_marker(SyncMarker::new(config.log_root.join("last_sync.txt")));

        Self {
            sync,
            executor: JobExecutor::new(
                queue.clone(),
                notifier,
                ExecutorConfig::from_agent(config),
            ),
            sessions: SessionLauncher::new(queue, SessionConfig::from_agent(config)),
        }
    }

    /// One pass: sync, then at most one job, then at most one session.
    ///
    /// A failing component is logged and skipped; the others still run.
    pub async fn tick(&mut self) -> TickReport {
        let sync = match self.sync.tick().await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                tracing::error!(error = %e, transient = e.is_transient(), "Script sync failed");
                None
            }
        };

        let job = match self.executor.tick().await {
            Ok(result) => Some(result),
            Err(e) => {
                tracing::error!(error = %e, transient = e.is_transient(), "Job processing failed");
                None
            }
        };

        let session = match self.sessions.tick().await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                tracing::error!(error = %e, transient = e.is_transient(), "Session processing failed");
                None
            }
        };

        TickReport { sync, job, session }
    }
}
