mod support;

use pretty_assertions::assert_eq;
use settingsync_cloud::crypto_provider::{build_aad, SyncCrypto};
use settingsync_cloud::sync_manager::{SyncDeps, SyncManager};
use settingsync_cloud::types::*;
use settingsync_cloud::SyncConfig;
use settingsync_storage::{now_millis, SyncStateStore};
use std::time::Duration;
use support::{eventually, AppliedCall, Harness, DEVICE_ID};

fn config() -> SyncConfig {
    SyncConfig {
        debounce_ms: 20,
        ..SyncConfig::default()
    }
}

// ── Push ─────────────────────────────────────────────────────────

#[tokio::test]
async fn local_upsert_is_pushed_encrypted_and_marked_synced() {
    let h = Harness::new(config());
    *h.relay.push_server_ts.lock().await = 1_700_000_123_000;
    h.record_global("Theme", "dark");

    h.manager.push_pending().await;

    let pushes = h.relay.pushes.lock().await.clone();
    assert_eq!(pushes.len(), 1);
    assert_eq!(pushes[0].device_id, DEVICE_ID);

    let change = &pushes[0].changes[0];
    assert_eq!(change.entity_type, ENTITY_WOX_SETTING);
    assert_eq!(change.key, "Theme");
    assert_eq!(change.op, Operation::Upsert);
    assert_eq!(change.plugin_id, "");
    let sealed = change.value.as_ref().expect("upsert carries a value");
    assert!(!sealed.ciphertext.contains("dark"));

    let aad = build_aad(ENTITY_WOX_SETTING, "", "Theme", Operation::Upsert);
    assert_eq!(h.crypto.decrypt(sealed, &aad).unwrap(), b"dark");

    assert_eq!(h.oplog.pending_count().unwrap(), 0);
    let state = h.state.load().unwrap();
    assert_eq!(state.last_push_ts, 1_700_000_123_000);
    assert_eq!(state.last_error, "");
}

#[tokio::test]
async fn push_without_server_ts_uses_local_clock_and_adopts_cursor() {
    let h = Harness::new(config());
    *h.relay.push_next_cursor.lock().await = "cur-7".into();
    h.record_global("Font", "mono");

    let before = now_millis();
    h.manager.push_pending().await;

    let state = h.state.load().unwrap();
    assert!(state.last_push_ts >= before);
    assert_eq!(state.cursor, "cur-7");
}

#[tokio::test]
async fn delete_is_pushed_without_value() {
    let h = Harness::new(config());
    h.oplog
        .append(&settingsync_storage::NewOplogEntry {
            entity_type: ENTITY_PLUGIN_SETTING.into(),
            entity_id: "p1".into(),
            key: "ApiKey".into(),
            operation: Operation::Delete,
            value: String::new(),
            timestamp: 5,
        })
        .unwrap();

    h.manager.push_pending().await;

    let changes = h.relay.pushed_changes().await;
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].op, Operation::Delete);
    assert_eq!(changes[0].plugin_id, "p1");
    assert_eq!(changes[0].client_ts, 5);
    assert!(changes[0].value.is_none());
}

#[tokio::test]
async fn change_ids_are_unique() {
    let h = Harness::new(config());
    for i in 0..5 {
        h.record_global(&format!("K{i}"), "v");
    }
    h.manager.push_pending().await;

    let mut ids: Vec<_> = h
        .relay
        .pushed_changes()
        .await
        .into_iter()
        .map(|c| c.change_id)
        .collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 5);
}

#[tokio::test]
async fn disabled_plugin_changes_are_dropped_not_sent() {
    let h = Harness::new(config());
    h.exclusions.set(["plugin.off"]);
    h.record_plugin("plugin.off", "Token", "secret");
    h.record_plugin("plugin.on", "Token", "visible");
    h.record_global("Theme", "dark");

    h.manager.push_pending().await;

    let changes = h.relay.pushed_changes().await;
    assert_eq!(changes.len(), 2);
    assert!(changes.iter().all(|c| c.plugin_id != "plugin.off"));
    assert_eq!(h.oplog.pending_count().unwrap(), 0);
}

#[tokio::test]
async fn only_disabled_changes_drain_without_any_push() {
    let h = Harness::new(config());
    h.exclusions.set(["plugin.off"]);
    for i in 0..3 {
        h.record_plugin("plugin.off", &format!("K{i}"), "v");
    }

    h.manager.push_pending().await;

    assert!(h.relay.pushes.lock().await.is_empty());
    assert_eq!(h.oplog.pending_count().unwrap(), 0);
    assert_eq!(h.state.load().unwrap().last_error, "");
}

#[tokio::test]
async fn batches_respect_count_cap() {
    let h = Harness::new(SyncConfig {
        max_batch_count: 3,
        ..config()
    });
    for i in 0..7 {
        h.record_global(&format!("K{i}"), "v");
    }

    h.manager.push_pending().await;

    let sizes: Vec<_> = h
        .relay
        .pushes
        .lock()
        .await
        .iter()
        .map(|p| p.changes.len())
        .collect();
    assert_eq!(sizes, vec![3, 3, 1]);
    assert_eq!(h.oplog.pending_count().unwrap(), 0);
}

#[tokio::test]
async fn batches_respect_byte_cap_except_single_oversized_item() {
    let max_bytes = 700;
    let h = Harness::new(SyncConfig {
        max_batch_bytes: max_bytes,
        ..config()
    });
    h.record_global("Huge", &"x".repeat(4_000));
    for i in 0..6 {
        h.record_global(&format!("K{i}"), &"y".repeat(150));
    }

    h.manager.push_pending().await;

    let pushes = h.relay.pushes.lock().await.clone();
    assert!(pushes.len() >= 3);
    // The oversized entry goes out alone
    assert_eq!(pushes[0].changes.len(), 1);
    assert_eq!(pushes[0].changes[0].key, "Huge");

    for push in &pushes {
        let total: usize = push
            .changes
            .iter()
            .map(|c| serde_json::to_vec(c).unwrap().len())
            .sum();
        assert!(
            push.changes.len() == 1 || total <= max_bytes,
            "batch of {} changes is {total} bytes",
            push.changes.len()
        );
    }
    assert_eq!(h.oplog.pending_count().unwrap(), 0);
}

#[tokio::test]
async fn entries_are_sent_oldest_first() {
    let h = Harness::new(config());
    for key in ["A", "B", "C"] {
        h.record_global(key, "v");
    }
    h.manager.push_pending().await;

    let keys: Vec<_> = h
        .relay
        .pushed_changes()
        .await
        .into_iter()
        .map(|c| c.key)
        .collect();
    assert_eq!(keys, vec!["A", "B", "C"]);
}

// ── Failures and backoff ─────────────────────────────────────────

#[tokio::test]
async fn push_failure_schedules_backoff_and_keeps_oplog() {
    let h = Harness::new(config());
    h.relay.fail_pushes_with(Some(500)).await;
    h.record_global("Theme", "dark");

    let before = now_millis();
    h.manager.push_pending().await;

    let state = h.state.load().unwrap();
    assert_eq!(state.retry_count, 1);
    assert!(state.backoff_until >= before + 1_000);
    assert!(state.backoff_until <= now_millis() + 1_250);
    assert!(state.last_error.contains("500"));
    assert_eq!(h.oplog.pending_count().unwrap(), 1);
}

#[tokio::test]
async fn attempts_inside_backoff_window_are_skipped_silently() {
    let h = Harness::new(config());
    h.relay.fail_pushes_with(Some(502)).await;
    h.record_global("Theme", "dark");
    h.manager.push_pending().await;

    h.relay.fail_pushes_with(None).await;
    h.manager.push_pending().await;
    h.manager.pull().await;

    assert!(h.relay.pushes.lock().await.is_empty());
    assert!(h.relay.pulls.lock().await.is_empty());
    assert_eq!(h.state.load().unwrap().retry_count, 1);
}

#[tokio::test]
async fn consecutive_failures_grow_the_window() {
    let h = Harness::new(config());
    h.relay.fail_pushes_with(Some(503)).await;
    h.record_global("Theme", "dark");

    let mut windows = Vec::new();
    for _ in 0..4 {
        let now = now_millis();
        h.manager.push_pending().await;
        let state = h.state.load().unwrap();
        windows.push(state.backoff_until - now);
        h.clear_backoff();
    }

    assert_eq!(h.state.load().unwrap().retry_count, 4);
    // Base delays 1s, 2s, 4s, 8s with at most 25% jitter never overlap
    assert!(windows.windows(2).all(|w| w[0] < w[1]), "{windows:?}");
}

#[tokio::test]
async fn success_resets_backoff() {
    let h = Harness::new(config());
    h.relay.fail_pushes_with(Some(500)).await;
    h.record_global("Theme", "dark");
    h.manager.push_pending().await;
    h.manager.push_pending().await;

    h.clear_backoff();
    h.relay.fail_pushes_with(None).await;
    h.manager.push_pending().await;

    let state = h.state.load().unwrap();
    assert_eq!(state.retry_count, 0);
    assert_eq!(state.backoff_until, 0);
    assert_eq!(state.last_error, "");
    assert_eq!(h.oplog.pending_count().unwrap(), 0);
}

#[tokio::test]
async fn missing_collaborators_are_recorded_with_backoff() {
    let state = SyncStateStore::open_in_memory().unwrap();
    let manager = SyncManager::new(config(), state.clone(), SyncDeps::default());

    let before = now_millis();
    manager.push_pending().await;
    let after_push = state.load().unwrap();
    assert!(after_push.last_error.contains("relay client not configured"));
    assert_eq!(after_push.retry_count, 1);
    assert!(after_push.backoff_until >= before + 1000);

    // Wiring is checked before the backoff window
    manager.pull().await;
    assert_eq!(state.load().unwrap().retry_count, 2);
}

// ── Pull ─────────────────────────────────────────────────────────

#[tokio::test]
async fn pulled_plugin_record_is_applied_once_with_plaintext() {
    let h = Harness::new(config());
    let record = h.sealed_record(ENTITY_PLUGIN_SETTING, "plugin.on", "Token", "abc123");
    h.relay.set_page("", vec![record], "c1", false).await;

    h.manager.pull().await;

    assert_eq!(
        h.applier.calls().await,
        vec![AppliedCall {
            plugin_id: Some("plugin.on".into()),
            key: "Token".into(),
            op: Operation::Upsert,
            value: "abc123".into(),
        }]
    );
    let state = h.state.load().unwrap();
    assert_eq!(state.cursor, "c1");
    assert!(state.last_pull_ts > 0);
}

#[tokio::test]
async fn pulled_global_delete_is_applied_with_empty_value() {
    let h = Harness::new(config());
    let record = Record {
        entity_type: ENTITY_WOX_SETTING.into(),
        plugin_id: String::new(),
        key: "Theme".into(),
        op: Operation::Delete,
        server_ts: 3,
        client_ts: 2,
        value: None,
    };
    h.relay.set_page("", vec![record], "c1", false).await;

    h.manager.pull().await;

    assert_eq!(
        h.applier.calls().await,
        vec![AppliedCall {
            plugin_id: None,
            key: "Theme".into(),
            op: Operation::Delete,
            value: String::new(),
        }]
    );
}

#[tokio::test]
async fn pulled_records_for_disabled_plugins_are_not_applied() {
    let h = Harness::new(config());
    h.exclusions.set(["plugin.off"]);
    let records = vec![
        h.sealed_record(ENTITY_PLUGIN_SETTING, "plugin.off", "Token", "hidden"),
        h.sealed_record(ENTITY_WOX_SETTING, "", "Theme", "dark"),
    ];
    h.relay.set_page("", records, "c1", false).await;

    h.manager.pull().await;

    let calls = h.applier.calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].key, "Theme");
    assert_eq!(h.state.load().unwrap().cursor, "c1");
}

#[tokio::test]
async fn unknown_entity_types_are_skipped() {
    let h = Harness::new(config());
    let records = vec![
        h.sealed_record("theme_pack", "", "Whatever", "x"),
        h.sealed_record(ENTITY_WOX_SETTING, "", "Theme", "dark"),
    ];
    h.relay.set_page("", records, "c1", false).await;

    h.manager.pull().await;

    assert_eq!(h.applier.calls().await.len(), 1);
    assert_eq!(h.state.load().unwrap().last_error, "");
}

#[tokio::test]
async fn pull_resumes_from_last_complete_page() {
    let h = Harness::new(config());
    h.relay
        .set_page("", vec![h.sealed_record(ENTITY_WOX_SETTING, "", "P1", "1")], "c1", true)
        .await;
    h.relay
        .set_page("c1", vec![h.sealed_record(ENTITY_WOX_SETTING, "", "P2", "2")], "c2", true)
        .await;
    // Page 3 is not available yet: the run stops after page 2

    h.manager.pull().await;

    let state = h.state.load().unwrap();
    assert_eq!(state.cursor, "c2");
    assert_eq!(state.retry_count, 1);
    let keys: Vec<_> = h.applier.calls().await.into_iter().map(|c| c.key).collect();
    assert_eq!(keys, vec!["P1", "P2"]);

    h.relay
        .set_page("c2", vec![h.sealed_record(ENTITY_WOX_SETTING, "", "P3", "3")], "c3", false)
        .await;
    h.clear_backoff();
    h.manager.pull().await;

    let cursors: Vec<_> = h
        .relay
        .pulls
        .lock()
        .await
        .iter()
        .map(|r| r.cursor.clone())
        .collect();
    assert_eq!(cursors, vec!["", "c1", "c2", "c2"]);

    let keys: Vec<_> = h.applier.calls().await.into_iter().map(|c| c.key).collect();
    assert_eq!(keys, vec!["P1", "P2", "P3"]);
    let state = h.state.load().unwrap();
    assert_eq!(state.cursor, "c3");
    assert_eq!(state.retry_count, 0);
}

#[tokio::test]
async fn tampered_record_rejects_the_whole_page() {
    let h = Harness::new(config());
    let good = h.sealed_record(ENTITY_WOX_SETTING, "", "Theme", "dark");
    // Sealed for a different key: AAD no longer matches
    let mut moved = h.sealed_record(ENTITY_WOX_SETTING, "", "Font", "mono");
    moved.key = "Language".into();
    h.relay.set_page("", vec![good, moved], "c1", false).await;

    h.manager.pull().await;

    assert!(h.applier.calls().await.is_empty());
    let state = h.state.load().unwrap();
    assert_eq!(state.cursor, "");
    assert_eq!(state.retry_count, 1);
    assert!(!state.last_error.is_empty());
}

#[tokio::test]
async fn upsert_without_value_rejects_the_page() {
    let h = Harness::new(config());
    let mut record = h.sealed_record(ENTITY_WOX_SETTING, "", "Theme", "dark");
    record.value = None;
    h.relay.set_page("", vec![record], "c1", false).await;

    h.manager.pull().await;

    assert!(h.applier.calls().await.is_empty());
    let state = h.state.load().unwrap();
    assert_eq!(state.cursor, "");
    assert!(state.last_error.contains("no value"));
}

#[tokio::test]
async fn pull_sends_device_and_limit() {
    let h = Harness::new(SyncConfig {
        pull_limit: 50,
        ..config()
    });
    h.relay.set_page("", Vec::new(), "", false).await;

    h.manager.pull().await;

    let reqs = h.relay.pulls.lock().await.clone();
    assert_eq!(reqs.len(), 1);
    assert_eq!(reqs[0].device_id, DEVICE_ID);
    assert_eq!(reqs[0].limit, 50);
}

#[tokio::test]
async fn snapshot_resync_starts_from_empty_cursor() {
    let h = Harness::new(config());
    h.state.update(|s| s.cursor = "stale".into()).unwrap();
    h.relay
        .set_snapshot_page("", vec![h.sealed_record(ENTITY_WOX_SETTING, "", "A", "1")], "s1", true)
        .await;
    h.relay
        .set_snapshot_page("s1", vec![h.sealed_record(ENTITY_WOX_SETTING, "", "B", "2")], "s2", false)
        .await;

    h.manager.resync_from_snapshot("cursor rejected").await;

    let cursors: Vec<_> = h
        .relay
        .snapshots
        .lock()
        .await
        .iter()
        .map(|r| r.cursor.clone())
        .collect();
    assert_eq!(cursors, vec!["", "s1"]);
    assert_eq!(h.applier.calls().await.len(), 2);
    assert_eq!(h.state.load().unwrap().cursor, "s2");
    assert!(h.relay.pulls.lock().await.is_empty());
}

// ── Lifecycle ────────────────────────────────────────────────────

#[tokio::test]
async fn start_pulls_immediately_and_stop_joins_workers() {
    let h = Harness::new(config());
    h.relay.set_page("", Vec::new(), "", false).await;

    h.manager.start().await;
    assert!(h.manager.is_running().await);
    assert!(eventually(|| async { !h.relay.pulls.lock().await.is_empty() }).await);

    h.manager.stop().await;
    assert!(!h.manager.is_running().await);
}

#[tokio::test]
async fn recorded_change_is_pushed_after_debounce() {
    let h = Harness::new(config());
    h.relay.set_page("", Vec::new(), "", false).await;
    h.manager.start().await;

    h.record_global("Theme", "dark");
    h.record_global("Font", "mono");

    assert!(eventually(|| async { h.oplog.pending_count().unwrap() == 0 }).await);
    // Both changes coalesced into one flush
    assert_eq!(h.relay.pushes.lock().await.len(), 1);
    assert_eq!(h.relay.pushed_changes().await.len(), 2);

    h.manager.stop().await;
}

#[tokio::test]
async fn start_flushes_changes_recorded_while_stopped() {
    let h = Harness::new(config());
    h.relay.set_page("", Vec::new(), "", false).await;
    h.record_global("Theme", "dark");

    h.manager.start().await;
    assert!(eventually(|| async { h.oplog.pending_count().unwrap() == 0 }).await);
    h.manager.stop().await;
}

#[tokio::test]
async fn manual_triggers_work_after_stop() {
    let h = Harness::new(config());
    h.relay.set_page("", Vec::new(), "", false).await;
    h.manager.start().await;
    h.manager.stop().await;

    h.record_global("Theme", "dark");
    h.manager.push_pending().await;
    assert_eq!(h.oplog.pending_count().unwrap(), 0);
}

#[tokio::test]
async fn stop_racing_start_joins_old_workers() {
    let h = Harness::new(config());
    h.relay.set_page("", Vec::new(), "", false).await;
    h.manager.start().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let raced = tokio::time::timeout(Duration::from_secs(3), async {
        tokio::join!(h.manager.stop(), h.manager.start());
    })
    .await;
    assert!(raced.is_ok());
    assert!(h.manager.is_running().await);

    let stopped = tokio::time::timeout(Duration::from_secs(3), h.manager.stop()).await;
    assert!(stopped.is_ok());
    assert!(!h.manager.is_running().await);
}

#[tokio::test]
async fn restart_after_stop_pulls_again() {
    let h = Harness::new(config());
    h.relay.set_page("", Vec::new(), "", false).await;

    h.manager.start().await;
    assert!(eventually(|| async { h.relay.pulls.lock().await.len() == 1 }).await);
    h.manager.stop().await;

    h.manager.start().await;
    assert!(eventually(|| async { h.relay.pulls.lock().await.len() == 2 }).await);
    h.manager.stop().await;
}
