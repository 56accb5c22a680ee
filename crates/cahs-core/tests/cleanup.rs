//! Functional tests for session release: teardown and idle eviction.
//!
//! Guarantees exercised here:
//! - Tearing down a session with a run in flight kills the engine, forgets
//!   the run and removes the workspace.
//! - Idle sessions are evicted; sessions with an active run never are.

#![cfg(unix)]

use cahs_core::{ArtifactKind, CoreError};
use cahs_intake::FileKind;
use cahs_test_utils::{fastq, sh_profile, TestBed};
use std::sync::Arc;
use std::time::Duration;

fn hang_profile() -> (&'static str, cahs_core::EngineProfile) {
    ("hang", sh_profile("sleep 30", &[FileKind::ReadSet], ArtifactKind::Image))
}

/// Teardown during a run cancels it and releases everything.
#[tokio::test]
async fn teardown_cancels_active_run() {
    let bed = TestBed::new([hang_profile()]);
    let session = bed.session().await;
    bed.upload(&session, "sample.fastq", fastq(1).as_bytes()).await;
    let workspace = bed.workspace(&session);

    let run_id = bed
        .orchestrator
        .submit_run(&bed.principal, &session, "hang")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    tokio::time::timeout(
        Duration::from_secs(15),
        bed.orchestrator.teardown(&bed.principal, &session),
    )
    .await
    .expect("teardown should not wait for the engine to finish")
    .unwrap();

    assert!(!workspace.exists());
    assert!(matches!(
        bed.orchestrator.run_status(&bed.principal, run_id),
        Err(CoreError::UnknownRun(_))
    ));
}

/// With a zero TTL every idle session goes; the busy one stays.
#[tokio::test]
async fn eviction_skips_busy_sessions() {
    let bed = TestBed::with_config([hang_profile()], |config| {
        config.with_session_ttl(Duration::ZERO)
    });
    let idle = bed.session().await;
    let busy = bed.session().await;
    bed.upload(&busy, "sample.fastq", fastq(1).as_bytes()).await;
    let run_id = bed
        .orchestrator
        .submit_run(&bed.principal, &busy, "hang")
        .await
        .unwrap();
    let idle_workspace = bed.root().join(idle.as_str());

    let evicted = bed.orchestrator.evict_idle().await;

    assert_eq!(evicted, vec![idle.clone()]);
    assert!(!idle_workspace.exists());
    assert!(matches!(
        bed.orchestrator.get_workspace(&bed.principal, &idle),
        Err(CoreError::UnknownSession(_))
    ));
    assert!(bed.workspace(&busy).exists());

    bed.orchestrator.cancel_run(&bed.principal, run_id).unwrap();
    bed.orchestrator.wait_for_run(&bed.principal, run_id).await.unwrap();
    assert_eq!(bed.orchestrator.evict_idle().await, vec![busy]);
    assert!(bed.orchestrator.sessions().is_empty());
}

/// Recently used sessions survive a sweep.
#[tokio::test]
async fn fresh_sessions_survive() {
    let bed = TestBed::with_config([hang_profile()], |config| {
        config.with_session_ttl(Duration::from_secs(3600))
    });
    let session = bed.session().await;

    assert!(bed.orchestrator.evict_idle().await.is_empty());
    assert!(bed.workspace(&session).exists());
}

/// The sweeper evicts on its own schedule and stops with the orchestrator.
#[tokio::test]
async fn sweeper_runs_in_background() {
    let bed = TestBed::with_config([hang_profile()], |mut config| {
        config.sweep_interval_secs = 1;
        config.with_session_ttl(Duration::ZERO)
    });
    let root = bed.root().to_path_buf();
    let session = bed.session().await;
    let workspace = root.join(session.as_str());

    let orchestrator = Arc::new(bed.orchestrator);
    let sweeper = orchestrator.spawn_sweeper();

    tokio::time::timeout(Duration::from_secs(10), async {
        while workspace.exists() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("sweeper should evict the idle session");

    drop(orchestrator);
    tokio::time::timeout(Duration::from_secs(5), sweeper)
        .await
        .expect("sweeper should stop once the orchestrator is gone")
        .unwrap();
}
