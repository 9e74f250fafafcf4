
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use lab_agent::error::AgentError;
use lab_agent::indexer::ScriptIndexer;
use lab_agent::sync::{ManualClock, SyncMarker, SyncOutcome, SyncScheduler};
use test_harness::TestEnv;

const TEN_MINUTES: Duration = Duration::from_secs(600);

fn scheduler(env: &TestEnv, clock: &ManualClock, interval: Duration) -> SyncScheduler {
    SyncScheduler::new(
        ScriptIndexer::new(env.home.path()),
        env.queue(),
        Arc::new(clock.clone()),
        interval,
    )
}

#[tokio::test]
async fn test_second_tick_within_interval_is_skipped() {
    let env = TestEnv::new();
    env.write_script("a.py", "");
    env.write_script("nb/b.ipynb", "{}");
    let clock = ManualClock::new(Utc::now());
    let mut sync = scheduler(&env, &clock, TEN_MINUTES);

    assert_eq!(sync.tick().await.unwrap(), SyncOutcome::Synced { scripts: 2 });
    assert_eq!(env.script_paths(), vec!["a.py", "nb/b.ipynb"]);

    env.write_script("c.py", "");
    clock.advance(Duration::from_secs(9 * 60));
    assert!(matches!(
        sync.tick().await.unwrap(),
        SyncOutcome::Skipped { .. }
    ));
    assert_eq!(env.script_paths(), vec!["a.py", "nb/b.ipynb"]);
}

#[tokio::test]
async fn test_tick_after_interval_resyncs() {
    let env = TestEnv::new();
    let removed = env.write_script("old.py", "");
    let clock = ManualClock::new(Utc::now());
    let mut sync = scheduler(&env, &clock, TEN_MINUTES);
    sync.tick().await.unwrap();

    std::fs::remove_file(removed).unwrap();
    env.write_script("new.py", "");
    clock.advance(TEN_MINUTES);

    assert_eq!(sync.tick().await.unwrap(), SyncOutcome::Synced { scripts: 1 });
    assert_eq!(env.script_paths(), vec!["new.py"]);
    assert_eq!(sync.last_sync_at(), Some(clock_now(&clock)));
}

#[tokio::test]
async fn test_failed_replace_keeps_previous_set_and_retries() {
    let env = TestEnv::new();
    env.write_script("a.py", "");
    let clock = ManualClock::new(Utc::now());
    let mut sync = scheduler(&env, &clock, TEN_MINUTES);
    sync.tick().await.unwrap();
    let first_sync = sync.last_sync_at();

    env.write_script("b.py", "");
    clock.advance(TEN_MINUTES);
    env.store.fail_inserts(true);

    let err = sync.tick().await.unwrap_err();
    assert!(matches!(err, AgentError::ReplaceNotAtomic { .. }));
    assert_eq!(sync.last_sync_at(), first_sync);
    assert_eq!(env.script_paths(), vec!["a.py"]);

    // Not rate limited: the failed attempt did not count as a sync.
    env.store.fail_inserts(false);
    assert_eq!(sync.tick().await.unwrap(), SyncOutcome::Synced { scripts: 2 });
    assert_eq!(env.script_paths(), vec!["a.py", "b.py"]);
}

#[tokio::test]
async fn test_zero_interval_syncs_every_tick() {
    let env = TestEnv::new();
    env.write_script("a.py", "");
    let clock = ManualClock::new(Utc::now());
    let mut sync = scheduler(&env, &clock, Duration::ZERO);

    for _ in 0..3 {
        assert!(matches!(
            sync.tick().await.unwrap(),
            SyncOutcome::Synced { .. }
        ));
    }
}

#[tokio::test]
async fn test_marker_carries_rate_limit_across_processes() {
    let env = TestEnv::new();
    env.write_script("a.py", "");
    let marker_path = env.logs.path().join("last_sync.txt");
    let clock = ManualClock::new(Utc::now());

    let mut first = scheduler(&env, &clock, TEN_MINUTES).with_marker(SyncMarker::new(&marker_path));
    first.tick().await.unwrap();
    assert!(marker_path.exists());

    clock.advance(Duration::from_secs(60));
    let mut second =
        scheduler(&env, &clock, TEN_MINUTES).with_marker(SyncMarker::new(&marker_path));
    assert!(matches!(
        second.tick().await.unwrap(),
        SyncOutcome::Skipped { .. }
    ));

    clock.advance(TEN_MINUTES);
    let mut third = scheduler(&env, &clock, TEN_MINUTES).with_marker(SyncMarker::new(&marker_path));
    assert!(matches!(
        third.tick().await.unwrap(),
        SyncOutcome::Synced { .. }
    ));
}

#[tokio::test]
async fn test_unreadable_home_is_an_error() {
    let env = TestEnv::new();
    let clock = ManualClock::new(Utc::now());
    let mut sync = SyncScheduler::new(
        ScriptIndexer::new(env.home.path().join("missing")),
        env.queue(),
        Arc::new(clock),
        TEN_MINUTES,
    );

    assert!(sync.tick().await.is_err());
    assert!(sync.last_sync_at().is_none());
}

fn clock_now(clock: &ManualClock) -> chrono::DateTime<Utc> {
    use lab_agent::sync::Clock;
    clock.now()
}
