//! Reconnection Invariant Tests
//!
//! - subscription identity survives any number of reconnects
//! - per-subscription failures stay isolated
//! - a failed link attempt is reported, never retried in a loop
//! - automatic attempts back off and stop at the configured cap
//! - delivery is at-most-once: nothing is replayed after a reconnect

mod common;

use std::time::Duration;

use serde_json::json;

use common::{client_with, collecting, count, quiet_config, settle};
use dossier_realtime::realtime::{
    ChangeEvent, ConnectionStatus, EventFilter, EventType, HeartbeatSignal, RealtimeError,
    ReconnectOutcome, SubscriptionStatus,
};

// =============================================================================
// Identity
// =============================================================================

/// For any N, the same ids come back subscribed after a reconnect.
#[tokio::test]
async fn test_identity_preserved_for_any_count() {
    for n in [0usize, 1, 5] {
        let t = client_with(quiet_config().with_reconnect_on_disconnect(false));
        let mut seen_all = Vec::new();
        let mut ids = Vec::new();
        for i in 0..n {
            let (callback, seen) = collecting();
            ids.push(
                t.client
                    .subscribe(&format!("table_{}", i), EventFilter::All, callback, None)
                    .unwrap(),
            );
            seen_all.push(seen);
        }
        settle().await;

        t.provider.drop_link();
        t.client.reconnect().await.unwrap();

        assert_eq!(t.client.subscription_ids(), ids);
        for id in &ids {
            assert_eq!(
                t.client.subscription_status(id),
                Some(SubscriptionStatus::Subscribed)
            );
        }

        // Same callbacks: each table still reaches its original collector.
        for (i, seen) in seen_all.iter().enumerate() {
            t.provider.emit(ChangeEvent::new(
                EventType::Insert,
                format!("table_{}", i),
                json!({"id": i}),
            ));
            assert_eq!(count(seen), 1);
        }
    }
}

/// Repeated reconnects never grow the provider's channel set.
#[tokio::test]
async fn test_repeated_reconnects_do_not_leak_channels() {
    let t = client_with(quiet_config().with_reconnect_on_disconnect(false));
    for table in ["dossiers", "forums"] {
        t.client
            .subscribe(table, EventFilter::All, |_| {}, None)
            .unwrap();
    }
    settle().await;

    for _ in 0..3 {
        t.provider.drop_link();
        t.client.reconnect().await.unwrap();
    }

    assert_eq!(t.provider.open_channel_count(), 2);
    assert_eq!(t.provider.opened_total(), 8);
    assert_eq!(t.provider.closed_total(), 6);
}

// =============================================================================
// Isolation
// =============================================================================

/// A failing resubscribe leaves its sibling subscribed.
#[tokio::test]
async fn test_isolated_join_failure() {
    let t = client_with(quiet_config().with_reconnect_on_disconnect(false));
    let a = t
        .client
        .subscribe("restricted", EventFilter::All, |_| {}, None)
        .unwrap();
    let b = t
        .client
        .subscribe("countries", EventFilter::All, |_| {}, None)
        .unwrap();
    settle().await;

    t.provider.drop_link();
    t.provider.reject_join("restricted");
    let ReconnectOutcome::Completed(report) = t.client.reconnect().await.unwrap() else {
        panic!("reconnect did not run");
    };

    assert_eq!(report.failed, vec![a]);
    assert_eq!(report.resubscribed, vec![b]);
    assert_eq!(
        t.client.subscription_status(&a),
        Some(SubscriptionStatus::Error)
    );
    assert_eq!(
        t.client.subscription_status(&b),
        Some(SubscriptionStatus::Subscribed)
    );
    assert_eq!(t.client.subscription_count(), 2);
    assert_eq!(t.client.connection_status(), ConnectionStatus::Connected);
}

/// A channel the provider refuses to reopen is marked failed, not dropped.
#[tokio::test]
async fn test_isolated_open_failure() {
    let t = client_with(quiet_config().with_reconnect_on_disconnect(false));
    let a = t
        .client
        .subscribe("restricted", EventFilter::All, |_| {}, None)
        .unwrap();
    let b = t
        .client
        .subscribe("countries", EventFilter::All, |_| {}, None)
        .unwrap();
    settle().await;

    t.provider.drop_link();
    t.provider.reject_open("restricted");
    t.client.reconnect().await.unwrap();

    assert_eq!(
        t.client.subscription_status(&a),
        Some(SubscriptionStatus::Error)
    );
    assert_eq!(
        t.client.subscription_status(&b),
        Some(SubscriptionStatus::Subscribed)
    );

    // The next cycle heals it once the provider accepts again.
    t.provider.accept_all();
    t.client.reconnect().await.unwrap();
    assert_eq!(
        t.client.subscription_status(&a),
        Some(SubscriptionStatus::Subscribed)
    );
}

// =============================================================================
// Link Failures
// =============================================================================

/// An unreachable link is reported once and not retried by the coordinator.
#[tokio::test]
async fn test_failed_reconnect_does_not_loop() {
    let t = client_with(quiet_config().with_reconnect_on_disconnect(false));
    t.provider.drop_link();
    t.provider.fail_connect(Some("no route to host"));

    let result = t.client.reconnect().await;
    assert_eq!(
        result,
        Err(RealtimeError::ConnectionError("no route to host".into()))
    );
    settle().await;

    assert_eq!(t.provider.connect_calls(), 1);
    assert_eq!(t.client.connection_status(), ConnectionStatus::Error);
    assert_eq!(t.metrics.snapshot().reconnects_failed, 1);
}

/// A link that never answers is cut off by the reconnect timeout.
#[tokio::test(start_paused = true)]
async fn test_reconnect_timeout() {
    let config = quiet_config()
        .with_reconnect_on_disconnect(false)
        .with_reconnect_timeout(Duration::from_secs(2));
    let t = client_with(config);
    t.provider.drop_link();
    t.provider.hang_connect(true);

    let result = t.client.reconnect().await;
    assert_eq!(result, Err(RealtimeError::ConnectionTimeout(2_000)));
    assert_eq!(t.client.connection_status(), ConnectionStatus::Error);
}

/// A heartbeat failure during a hung connect is recorded, not dropped.
#[tokio::test(start_paused = true)]
async fn test_heartbeat_timeout_during_hung_connect() {
    let config = quiet_config()
        .with_reconnect_on_disconnect(false)
        .with_reconnect_timeout(Duration::from_secs(2));
    let t = client_with(config);
    t.client.start();
    settle().await;
    t.provider.drop_link();
    t.provider.hang_connect(true);

    let (result, _) = tokio::join!(t.client.reconnect(), async {
        while t.client.connection_status() != ConnectionStatus::Reconnecting {
            tokio::task::yield_now().await;
        }
        t.provider.emit_heartbeat(HeartbeatSignal::Timeout);
        assert_eq!(t.client.connection_status(), ConnectionStatus::Reconnecting);
        assert_eq!(t.client.last_error().as_deref(), Some("heartbeat timeout"));
        assert!(t.client.monitor().has_deferred_failure());
    });

    assert_eq!(result, Err(RealtimeError::ConnectionTimeout(2_000)));
    assert_eq!(t.client.connection_status(), ConnectionStatus::Error);
    assert!(!t.client.monitor().has_deferred_failure());
    assert_eq!(t.metrics.snapshot().heartbeat_failures, 1);
}

/// A heartbeat failure during a cycle that succeeds stays visible.
#[tokio::test]
async fn test_heartbeat_failure_during_successful_reconnect() {
    let t = client_with(quiet_config().with_reconnect_on_disconnect(false));
    let id = t
        .client
        .subscribe("dossiers", EventFilter::All, |_| {}, None)
        .unwrap();
    t.client.start();
    settle().await;
    t.provider.drop_link();

    let (result, _) = tokio::join!(t.client.reconnect(), async {
        while t.client.connection_status() != ConnectionStatus::Reconnecting {
            tokio::task::yield_now().await;
        }
        t.provider.emit_heartbeat(HeartbeatSignal::Timeout);
    });

    assert!(matches!(result, Ok(ReconnectOutcome::Completed(_))));
    assert!(t.client.is_connected());
    assert_eq!(t.client.last_error().as_deref(), Some("heartbeat timeout"));
    assert_eq!(
        t.client.subscription_status(&id),
        Some(SubscriptionStatus::Subscribed)
    );
    assert!(!t.client.monitor().reconnect_scheduled());
}

// =============================================================================
// Automatic Reconnect
// =============================================================================

/// A heartbeat failure schedules exactly one delayed reconnect.
#[tokio::test(start_paused = true)]
async fn test_heartbeat_failure_reconnects_after_backoff() {
    let t = client_with(quiet_config());
    t.client.start();
    let id = t
        .client
        .subscribe("dossiers", EventFilter::All, |_| {}, None)
        .unwrap();
    settle().await;

    t.provider.drop_link();
    t.provider.emit_heartbeat(HeartbeatSignal::Disconnected);
    t.provider.emit_heartbeat(HeartbeatSignal::Timeout);
    assert_eq!(t.client.connection_status(), ConnectionStatus::Error);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(t.provider.connect_calls(), 0);

    tokio::time::sleep(Duration::from_millis(100)).await;
    settle().await;

    assert_eq!(t.provider.connect_calls(), 1);
    assert!(t.client.is_connected());
    assert_eq!(
        t.client.subscription_status(&id),
        Some(SubscriptionStatus::Subscribed)
    );
    let metrics = t.metrics.snapshot();
    assert_eq!(metrics.reconnects_scheduled, 1);
    assert_eq!(metrics.reconnects_succeeded, 1);
}

/// Automatic attempts stop at the cap; a manual reconnect still works.
#[tokio::test(start_paused = true)]
async fn test_attempt_cap_then_manual_reconnect() {
    let config = quiet_config()
        .with_poll_interval(Duration::from_millis(50))
        .with_max_reconnect_attempts(2);
    let t = client_with(config);
    t.provider.drop_link();
    t.provider.fail_connect(Some("refused"));
    t.client.start();

    tokio::time::sleep(Duration::from_secs(2)).await;
    settle().await;
    assert_eq!(t.provider.connect_calls(), 2);
    assert_eq!(t.client.monitor().attempts(), 2);
    assert!(t.client.last_error().unwrap().contains("refused"));

    t.provider.fail_connect(None);
    let outcome = t.client.reconnect().await.unwrap();
    assert!(matches!(outcome, ReconnectOutcome::Completed(_)));
    assert!(t.client.is_connected());
    assert_eq!(t.client.monitor().attempts(), 0);
    t.client.shutdown();
}

// =============================================================================
// Delivery Guarantees
// =============================================================================

/// Changes emitted while the link is down are not replayed.
#[tokio::test]
async fn test_no_replay_after_reconnect() {
    let t = client_with(quiet_config().with_reconnect_on_disconnect(false));
    let (callback, seen) = collecting();
    t.client
        .subscribe("dossiers", EventFilter::All, callback, None)
        .unwrap();
    settle().await;

    t.provider.drop_link();
    let missed = t.provider.emit(ChangeEvent::new(
        EventType::Insert,
        "dossiers",
        json!({"id": 1}),
    ));
    assert_eq!(missed, 0);

    t.client.reconnect().await.unwrap();
    assert_eq!(count(&seen), 0);

    t.provider.emit(ChangeEvent::new(
        EventType::Insert,
        "dossiers",
        json!({"id": 2}),
    ));
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].data["id"], 2);
}

/// Unsubscribing after a reconnect closes the fresh channel.
#[tokio::test]
async fn test_unsubscribe_after_reconnect() {
    let t = client_with(quiet_config().with_reconnect_on_disconnect(false));
    let id = t
        .client
        .subscribe("dossiers", EventFilter::All, |_| {}, None)
        .unwrap();
    settle().await;

    t.provider.drop_link();
    t.client.reconnect().await.unwrap();
    assert!(t.client.unsubscribe(&id));
    assert_eq!(t.provider.open_channel_count(), 0);
    assert!(t.client.subscription_ids().is_empty());
}
