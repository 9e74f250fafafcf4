use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::indexer::ScriptIndexer;
use crate::queue::QueueClient;

/// Source of the current time, injectable for tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let Ok(by) = chrono::Duration::from_std(by) else {
            return;
        };
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(later) = now.checked_add_signed(by) {
            *now = later;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// File holding the time of the last successful sync.
///
/// The agent exits after every tick, so the rate limit has to survive between
/// processes.
#[derive(Debug, Clone)]
pub struct SyncMarker {
    path: PathBuf,
}

impl SyncMarker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing or unparsable markers read as "never synced".
    pub fn load(&self) -> Option<DateTime<Utc>> {
        let text = std::fs::read_to_string(&self.path).ok()?;
        match DateTime::parse_from_rfc3339(text.trim()) {
            Ok(at) => Some(at.with_timezone(&Utc)),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Ignoring unreadable sync marker");
                None
            }
        }
    }

    pub fn store(&self, at: DateTime<Utc>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, at.to_rfc3339())?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Interval not yet elapsed since `last_sync_at`
    Skipped { last_sync_at: DateTime<Utc> },
    Synced { scripts: usize },
}

/// Rate-limited reconciliation of the script index with the `scripts` table.
pub struct SyncScheduler {
    indexer: ScriptIndexer,
    queue: QueueClient,
    clock: Arc<dyn Clock>,
    interval: Duration,
    last_sync_at: Option<DateTime<Utc>>,
    marker: Option<SyncMarker>,
}

impl SyncScheduler {
    pub fn new(
        indexer: ScriptIndexer,
        queue: QueueClient,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> Self {
        Self {
            indexer,
            queue,
            clock,
            interval,
            last_sync_at: None,
            marker: None,
        }
    }

    /// Persist `last_sync_at` in `marker`, seeding it from the file's current content.
    pub fn with_marker(mut self, marker: SyncMarker) -> Self {
        self.last_sync_at = marker.load();
        self.marker = Some(marker);
        self
    }

    pub fn last_sync_at(&self) -> Option<DateTime<Utc>> {
        self.last_sync_at
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if self.interval.is_zero() {
            return true;
        }
        let Some(last) = self.last_sync_at else {
            return true;
        };
        match (now - last).to_std() {
            Ok(elapsed) => elapsed >= self.interval,
            // Last sync lies in the future: the clock moved back, resync.
            Err(_) => true,
        }
    }

    /// Reconcile if due. On failure `last_sync_at` is left alone so the next
    /// tick retries.
    pub async fn tick(&mut self) -> Result<SyncOutcome> {
        let now = self.clock.now();
        if let Some(last_sync_at) = self.last_sync_at.filter(|_| !self.is_due(now)) {
            tracing::info!(
                interval_min = self.interval.as_secs() / 60,
                "Skip script sync (last sync within interval)"
            );
            return Ok(SyncOutcome::Skipped { last_sync_at });
        }

        let scripts = self.indexer.scan()?;
        tracing::info!(
            count = scripts.len(),
            home = %self.indexer.root().display(),
            user_id = %self.queue.user_id(),
            "Syncing scripts"
        );
        self.queue.replace_scripts(&scripts, now).await?;

        self.last_sync_at = Some(now);
        if let Some(marker) = &self.marker {
            if let Err(e) = marker.store(now) {
                tracing::warn!(path = %marker.path().display(), error = %e, "Failed to record sync time");
            }
        }
        Ok(SyncOutcome::Synced {
            scripts: scripts.len(),
        })
    }
}
