//! Update attempts driven through the scheduler.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use super::{
    payload_files, tar_gz_bytes, within, zip_bytes, FailAfter, StallAfter, TestHarness, TRACKED,
};
use os_health_agent::upgrade::ReplaceFile;
use os_health_agent::{AgentEvent, Installer, UpdateOutcome, UpdateState};
use sha2::{Digest, Sha256};
use std::ffi::OsString;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

fn states(events: &[AgentEvent]) -> Vec<UpdateState> {
    events
        .iter()
        .filter_map(|e| match e {
            AgentEvent::UpdateStateChanged { state } => Some(*state),
            _ => None,
        })
        .collect()
}

/// Scenario A: 1.0.0 installed, v1.2.3 published.
#[tokio::test]
async fn test_newer_release_is_installed_and_restarts() {
    let mut h = TestHarness::new("1.0.0");
    h.publish_zip("1.2.3");

    let outcome = within(h.scheduler.trigger()).await;

    let UpdateOutcome::Committed { version, snapshot } = outcome else {
        panic!("expected a commit, got {outcome:?}");
    };
    assert_eq!(version.parts(), [1, 2, 3]);

    // Post-commit: marker holds the new version, tracked files match the payload.
    assert_eq!(h.install.marker(), "1.2.3");
    for rel in TRACKED {
        assert_eq!(h.install.read(rel), format!("{rel} 1.2.3"));
    }
    assert_eq!(h.install.read("state.db"), "local data");

    let snapshots = h.install.snapshots();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].path(), snapshot.as_path());
    assert_eq!(snapshots[0].version().to_string(), "1.0.0");
    assert_eq!(
        std::fs::read_to_string(snapshot.join("agent")).unwrap(),
        "agent 1.0.0"
    );

    let restarts = h.supervisor.restarts();
    assert_eq!(restarts.len(), 1);
    assert_eq!(
        restarts[0].args,
        vec![OsString::from("run"), OsString::from("--log-format=json")]
    );

    // The staging area is gone once the attempt ends.
    let scratch = h.install.root().join("scratch");
    assert_eq!(std::fs::read_dir(scratch).unwrap().count(), 0);

    let events = h.drain_events();
    assert_eq!(
        states(&events),
        [
            UpdateState::Checking,
            UpdateState::Downloading,
            UpdateState::Staged,
            UpdateState::BackedUp,
            UpdateState::Installing,
            UpdateState::Committed,
        ]
    );
    assert!(events
        .iter()
        .any(|e| matches!(e, AgentEvent::DownloadProgress { total: Some(_), .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, AgentEvent::UpgradeComplete { version } if version == "1.2.3")));
    assert!(events.iter().any(|e| matches!(e, AgentEvent::Restarting)));
}

/// Scenario B: 2.0.0 installed, v1.9.9 published.
#[tokio::test]
async fn test_older_release_is_ignored() {
    let mut h = TestHarness::new("2.0.0");
    h.publish_zip("1.9.9");
    let before = h.install.tree();

    let outcome = within(h.scheduler.trigger()).await;

    assert_eq!(outcome, UpdateOutcome::NoUpdate);
    assert_eq!(h.source.downloads(), 0);
    assert_eq!(h.install.tree(), before);
    assert!(h.install.snapshots().is_empty());
    assert_eq!(
        states(&h.drain_events()),
        [UpdateState::Checking, UpdateState::Idle]
    );
}

#[tokio::test]
async fn test_equal_release_touches_nothing() {
    let h = TestHarness::new("1.0.0");
    h.publish_zip("1.0.0");
    let tree = h.install.tree();
    let siblings = h.install.siblings();

    for _ in 0..3 {
        assert_eq!(within(h.scheduler.trigger()).await, UpdateOutcome::NoUpdate);
    }

    assert_eq!(h.source.metadata_calls(), 3);
    assert_eq!(h.install.tree(), tree);
    assert_eq!(h.install.siblings(), siblings);
    assert!(h.supervisor.restarts().is_empty());
}

#[tokio::test]
async fn test_unparsable_tag_is_not_an_update() {
    let h = TestHarness::new("1.0.0");
    h.source.publish("nightly", Vec::new());

    assert_eq!(within(h.scheduler.trigger()).await, UpdateOutcome::NoUpdate);
    assert_eq!(h.source.downloads(), 0);
}

/// Scenario C: the archive downloads but cannot be extracted.
#[tokio::test]
async fn test_corrupt_archive_leaves_install_untouched() {
    let mut h = TestHarness::new("1.0.0");
    let archive = zip_bytes(&payload_files("1.2.3"));
    let truncated = archive[..archive.len() / 2].to_vec();
    h.source
        .publish("v1.2.3", vec![("os-health-agent-1.2.3.zip", truncated)]);
    let before = h.install.tree();

    let outcome = within(h.scheduler.trigger()).await;

    assert!(matches!(
        outcome,
        UpdateOutcome::Failed {
            stage: UpdateState::Downloading,
            ..
        }
    ));
    assert_eq!(h.install.tree(), before);
    assert!(h.install.snapshots().is_empty());
    assert!(h.supervisor.restarts().is_empty());

    let events = h.drain_events();
    assert_eq!(states(&events).last(), Some(&UpdateState::Failed));
    assert!(events.iter().any(|e| matches!(
        e,
        AgentEvent::UpdateFailed {
            stage: UpdateState::Downloading,
            ..
        }
    )));
}

#[tokio::test]
async fn test_garbage_tar_gz_is_rejected() {
    let h = TestHarness::new("1.0.0");
    h.source.publish(
        "v1.2.3",
        vec![("os-health-agent-1.2.3.tar.gz", b"definitely not gzip".to_vec())],
    );
    let before = h.install.tree();

    let outcome = within(h.scheduler.trigger()).await;
    assert_eq!(outcome.final_state(), UpdateState::Failed);
    assert_eq!(h.install.tree(), before);
}

/// Scenario D: triggers arriving mid-attempt are dropped.
#[tokio::test]
async fn test_concurrent_triggers_run_one_attempt() {
    let h = TestHarness::new("1.0.0");
    h.publish_zip("1.2.3");
    let gate = h.source.gate_downloads();

    let scheduler = Arc::clone(&h.scheduler);
    let first = tokio::spawn(async move { scheduler.trigger().await });
    within(h.source.wait_for_download()).await;

    assert!(h.scheduler.is_busy());
    assert_eq!(h.scheduler.trigger().await, UpdateOutcome::Skipped);
    assert_eq!(h.scheduler.trigger().await, UpdateOutcome::Skipped);

    gate.notify_one();
    let outcome = within(first).await.unwrap();

    assert!(outcome.is_committed());
    assert_eq!(h.install.snapshots().len(), 1);
    assert_eq!(h.source.metadata_calls(), 1);
    assert_eq!(h.source.downloads(), 1);
    assert_eq!(h.supervisor.restarts().len(), 1);
    assert!(!h.scheduler.is_busy());
}

/// Failing after k of n files, or on the marker once all n are replaced,
/// must leave the live tree exactly as it was.
#[tokio::test]
async fn test_partial_install_is_rolled_back() {
    for k in 1..=TRACKED.len() {
        let mut h = TestHarness::with(
            "1.0.0",
            |_| {},
            Some(Installer::with_replacer(FailAfter::new(k))),
        );
        h.publish_zip("1.2.3");
        let before = h.install.tree();

        let outcome = within(h.scheduler.trigger()).await;

        let UpdateOutcome::RolledBack { reason, snapshot } = outcome else {
            panic!("k={k}: expected rollback, got {outcome:?}");
        };
        assert!(reason.contains("partial install"), "k={k}: {reason}");
        assert_eq!(h.install.tree(), before, "k={k}");
        assert_eq!(h.install.marker(), "1.0.0");
        assert!(snapshot.is_dir());
        assert!(h.supervisor.restarts().is_empty());

        let events = h.drain_events();
        assert_eq!(
            states(&events)[4..],
            [
                UpdateState::Installing,
                UpdateState::Failed,
                UpdateState::RolledBack
            ]
        );
        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::RolledBack { .. })));
    }
}

#[tokio::test]
async fn test_failure_before_first_replacement_needs_no_rollback() {
    let h = TestHarness::with(
        "1.0.0",
        |_| {},
        Some(Installer::with_replacer(FailAfter::new(0))),
    );
    h.publish_zip("1.2.3");
    let before = h.install.tree();

    let outcome = within(h.scheduler.trigger()).await;

    assert!(matches!(
        outcome,
        UpdateOutcome::Failed {
            stage: UpdateState::Installing,
            ..
        }
    ));
    assert_eq!(h.install.tree(), before);
}

#[tokio::test]
async fn test_payload_missing_tracked_file_fails_cleanly() {
    let h = TestHarness::new("1.0.0");
    let files: Vec<_> = payload_files("1.2.3")
        .into_iter()
        .filter(|(name, _)| !name.ends_with("config.toml"))
        .collect();
    h.source
        .publish("v1.2.3", vec![("os-health-agent-1.2.3.zip", zip_bytes(&files))]);
    let before = h.install.tree();

    let outcome = within(h.scheduler.trigger()).await;

    let UpdateOutcome::Failed { stage, reason } = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert_eq!(stage, UpdateState::Installing);
    assert!(reason.contains("config.toml"), "{reason}");
    assert_eq!(h.install.tree(), before);
    assert!(h.supervisor.restarts().is_empty());
}

#[tokio::test]
async fn test_metadata_failure_is_transient() {
    let h = TestHarness::new("1.0.0");
    h.source.fail_metadata("connection reset by peer");
    let before = h.install.tree();

    let outcome = within(h.scheduler.trigger()).await;

    assert!(matches!(
        outcome,
        UpdateOutcome::Failed {
            stage: UpdateState::Checking,
            ..
        }
    ));
    assert_eq!(h.install.tree(), before);
    let record = h.scheduler.last_attempt().unwrap();
    assert!(record.finished_at >= record.started_at);
    assert_eq!(record.outcome, outcome);
}

#[tokio::test]
async fn test_tar_gz_release_is_installed() {
    let h = TestHarness::new("1.0.0");
    h.source.publish(
        "v1.3.0",
        vec![(
            "os-health-agent-1.3.0.tar.gz",
            tar_gz_bytes(&payload_files("1.3.0")),
        )],
    );

    let outcome = within(h.scheduler.trigger()).await;

    assert!(outcome.is_committed());
    assert_eq!(h.install.marker(), "1.3.0");
    assert_eq!(h.install.read("lib/collector.so"), "lib/collector.so 1.3.0");

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(h.install.install_dir().join("agent"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o755);
    }
}

#[tokio::test]
async fn test_source_archive_fallback() {
    let h = TestHarness::new("1.0.0");
    h.source.publish("v1.2.3", Vec::new());
    h.source.serve(
        "https://github.com/acme/os-health-agent/archive/v1.2.3.zip",
        zip_bytes(&payload_files("1.2.3")),
    );

    let outcome = within(h.scheduler.trigger()).await;
    assert!(outcome.is_committed());
    assert_eq!(h.install.marker(), "1.2.3");
}

#[tokio::test]
async fn test_checksum_mismatch_is_rejected() {
    let h = TestHarness::new("1.0.0");
    let listing = format!("{}  os-health-agent-1.2.3.zip\n", "0".repeat(64));
    h.source.publish(
        "v1.2.3",
        vec![
            (
                "os-health-agent-1.2.3.zip",
                zip_bytes(&payload_files("1.2.3")),
            ),
            ("SHA256SUMS", listing.into_bytes()),
        ],
    );
    let before = h.install.tree();

    let outcome = within(h.scheduler.trigger()).await;

    let UpdateOutcome::Failed { stage, reason } = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert_eq!(stage, UpdateState::Downloading);
    assert!(reason.contains("checksum mismatch"), "{reason}");
    assert_eq!(h.install.tree(), before);
}

#[tokio::test]
async fn test_matching_checksum_is_accepted() {
    let h = TestHarness::new("1.0.0");
    let archive = zip_bytes(&payload_files("1.2.3"));
    let listing = format!(
        "{}  os-health-agent-1.2.3.zip\n",
        hex::encode(Sha256::digest(&archive))
    );
    h.source.publish(
        "v1.2.3",
        vec![
            ("os-health-agent-1.2.3.zip", archive),
            ("SHA256SUMS", listing.into_bytes()),
        ],
    );

    assert!(within(h.scheduler.trigger()).await.is_committed());
}

#[tokio::test]
async fn test_old_backups_are_pruned_after_commit() {
    let h = TestHarness::with("1.0.0", |c| c.upgrade.keep_backups = 2, None);

    for version in ["1.1.0", "1.2.0", "1.3.0"] {
        h.publish_zip(version);
        assert!(within(h.scheduler.trigger()).await.is_committed());
    }

    let kept: Vec<String> = h
        .install
        .snapshots()
        .iter()
        .map(|s| s.version().to_string())
        .collect();
    assert_eq!(kept, ["1.1.0", "1.2.0"]);
    assert_eq!(h.install.marker(), "1.3.0");
}

#[tokio::test]
async fn test_run_loop_installs_on_first_tick() {
    let h = TestHarness::new("1.0.0");
    h.publish_zip("1.2.3");
    let (tx, rx) = watch::channel(false);

    let handle = tokio::spawn(Arc::clone(&h.scheduler).run(rx));
    within(async {
        while h.supervisor.restarts().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;

    tx.send(true).unwrap();
    within(handle).await.unwrap();
    assert_eq!(h.install.marker(), "1.2.3");
}

#[tokio::test]
async fn test_marker_records_published_tag_text() {
    let h = TestHarness::new("1.0.0");
    h.source.publish(
        "v1.02.3",
        vec![("os-health-agent.zip", zip_bytes(&payload_files("1.02.3")))],
    );

    let outcome = within(h.scheduler.trigger()).await;

    let UpdateOutcome::Committed { version, .. } = outcome else {
        panic!("expected a commit, got {outcome:?}");
    };
    assert_eq!(version.parts(), [1, 2, 3]);
    assert_eq!(h.install.marker(), "1.02.3");

    // Same version once parsed, so the next check is a no-op.
    let again = within(h.scheduler.trigger()).await;
    assert_eq!(again, UpdateOutcome::NoUpdate);
}

/// Shutdown while files are being replaced waits for the attempt, including
/// its rollback, instead of abandoning a half-installed tree.
#[tokio::test]
async fn test_shutdown_mid_install_completes_rollback() {
    let stall = StallAfter::new(1, Duration::from_millis(300), true);
    let h = TestHarness::with(
        "1.0.0",
        |_| {},
        Some(Installer::with_replacer(Arc::clone(&stall) as Arc<dyn ReplaceFile>)),
    );
    h.publish_zip("1.2.3");
    let before = h.install.tree();
    let (tx, rx) = watch::channel(false);

    let handle = tokio::spawn(Arc::clone(&h.scheduler).run(rx));
    within(async {
        while !stall.stalled() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert_eq!(h.install.read("agent"), "agent 1.2.3");

    tx.send(true).unwrap();
    within(handle).await.unwrap();

    assert!(!h.scheduler.is_busy());
    assert_eq!(h.install.tree(), before);
    let record = h.scheduler.last_attempt().unwrap();
    assert!(
        matches!(record.outcome, UpdateOutcome::RolledBack { .. }),
        "{:?}",
        record.outcome
    );
    assert!(h.supervisor.restarts().is_empty());
}

/// An attempt that commits after shutdown was requested does not restart.
#[tokio::test]
async fn test_shutdown_mid_install_commits_without_restart() {
    let stall = StallAfter::new(1, Duration::from_millis(300), false);
    let h = TestHarness::with(
        "1.0.0",
        |_| {},
        Some(Installer::with_replacer(Arc::clone(&stall) as Arc<dyn ReplaceFile>)),
    );
    h.publish_zip("1.2.3");
    let (tx, rx) = watch::channel(false);

    let handle = tokio::spawn(Arc::clone(&h.scheduler).run(rx));
    within(async {
        while !stall.stalled() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    tx.send(true).unwrap();
    within(handle).await.unwrap();

    assert_eq!(h.install.marker(), "1.2.3");
    for rel in TRACKED {
        assert_eq!(h.install.read(rel), format!("{rel} 1.2.3"));
    }
    assert!(h.scheduler.last_attempt().unwrap().outcome.is_committed());
    assert!(h.supervisor.restarts().is_empty());
}
