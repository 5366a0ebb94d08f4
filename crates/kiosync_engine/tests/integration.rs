//! End-to-end failover scenarios over in-memory endpoints.

use kiosync_engine::mock::{MemoryStore, MockHttpClient, MockProbe, MockSessionFactory};
use kiosync_engine::{
    CoordinatorConfig, FailoverState, HealthConfig, HttpProbe, HttpSessionFactory, LivenessProbe,
    SessionConfig, SessionFactory, SyncSettings, SyncSystem, TransitionOutcome,
};
use kiosync_protocol::{CollectionId, CollectionSyncConfig, EndpointId, EndpointPair};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const INTERVAL: Duration = Duration::from_secs(10);

fn pair() -> EndpointPair {
    EndpointPair::new(
        "https://primary.example",
        "wss://primary.example",
        "https://secondary.example",
        "wss://secondary.example",
    )
}

fn settings() -> SyncSettings {
    SyncSettings::new(pair())
        .with_health(
            HealthConfig::default()
                .with_interval(INTERVAL)
                .with_probe_timeout(Duration::from_secs(5))
                .with_thresholds(3, 5),
        )
        .with_coordinator(CoordinatorConfig::default().with_settle_delay(Duration::from_millis(150)))
}

fn collections() -> Vec<CollectionSyncConfig> {
    vec![
        CollectionSyncConfig::new("orders"),
        CollectionSyncConfig::new("visits"),
        CollectionSyncConfig::new("inventory"),
    ]
}

struct Kiosk {
    probe: Arc<MockProbe>,
    factory: Arc<MockSessionFactory>,
    system: SyncSystem,
}

fn kiosk() -> Kiosk {
    let probe = Arc::new(MockProbe::new());
    let factory = Arc::new(MockSessionFactory::new());
    let system = SyncSystem::new(
        settings(),
        Arc::clone(&probe) as Arc<dyn LivenessProbe>,
        Arc::clone(&factory) as Arc<dyn SessionFactory>,
    )
    .unwrap();
    Kiosk {
        probe,
        factory,
        system,
    }
}

/// No collection may be live, or marked started, on both endpoints.
fn assert_single_live_session(kiosk: &Kiosk) {
    let primary = kiosk.factory.active_on(EndpointId::Primary);
    let secondary = kiosk.factory.active_on(EndpointId::Secondary);
    for collection in &primary {
        assert!(
            !secondary.contains(collection),
            "{collection} is live on both endpoints"
        );
    }

    let registry = kiosk.system.registry();
    for collection in registry.collections() {
        let started = EndpointId::ALL
            .iter()
            .filter(|endpoint| registry.is_started(&collection, **endpoint))
            .count();
        assert!(started <= 1, "{collection} is started on both endpoints");
    }
}

fn started_endpoints(kiosk: &Kiosk) -> Vec<(CollectionId, EndpointId)> {
    kiosk
        .system
        .registry()
        .get_all_states()
        .into_iter()
        .filter(|state| state.was_started)
        .map(|state| (state.collection, state.endpoint))
        .collect()
}

#[tokio::test(start_paused = true)]
async fn healthy_startup_runs_everything_on_primary() {
    let kiosk = kiosk();
    let outcome = kiosk.system.start(&collections()).await.unwrap();

    assert_eq!(
        outcome,
        TransitionOutcome::Transitioned {
            from: FailoverState::Stopped,
            to: FailoverState::Primary
        }
    );
    let started = started_endpoints(&kiosk);
    assert_eq!(started.len(), 3);
    assert!(started.iter().all(|(_, endpoint)| *endpoint == EndpointId::Primary));
    assert_single_live_session(&kiosk);

    kiosk.system.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn primary_failure_fails_over_within_one_interval() {
    let kiosk = kiosk();
    kiosk.system.start(&collections()).await.unwrap();
    let mut states = kiosk.system.coordinator().subscribe();

    kiosk.probe.set_healthy(EndpointId::Primary, false);
    let failing_since = tokio::time::Instant::now();

    let state = *states
        .wait_for(|s| s.state != FailoverState::Primary && !s.is_processing)
        .await
        .unwrap();
    assert_eq!(state.state, FailoverState::Secondary);

    // Five failed probes span four intervals after the first one, which
    // may land up to one interval after the endpoint went down.
    assert!(failing_since.elapsed() <= INTERVAL * 5 + Duration::from_secs(1));

    for state in kiosk.system.registry().get_all_states() {
        match state.endpoint {
            EndpointId::Primary => assert!(!state.was_started),
            EndpointId::Secondary => assert!(state.was_started),
        }
    }
    assert_single_live_session(&kiosk);

    // Still failing: nothing moves back toward the primary.
    tokio::time::sleep(INTERVAL * 3).await;
    assert_eq!(kiosk.system.coordinator().state(), FailoverState::Secondary);

    kiosk.system.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn both_down_then_manual_start_on_secondary() {
    let kiosk = kiosk();
    kiosk.system.start(&collections()).await.unwrap();
    let mut states = kiosk.system.coordinator().subscribe();

    kiosk.probe.set_healthy(EndpointId::Primary, false);
    kiosk.probe.set_healthy(EndpointId::Secondary, false);

    states
        .wait_for(|s| s.state == FailoverState::Stopped && s.both_unavailable && !s.is_processing)
        .await
        .unwrap();
    assert!(started_endpoints(&kiosk).is_empty());
    assert!(kiosk.system.snapshot().both_unavailable);

    kiosk.probe.set_healthy(EndpointId::Secondary, true);
    let outcome = kiosk.system.retry().await;
    assert_eq!(outcome.state(), Some(FailoverState::Secondary));
    assert!(!kiosk.system.snapshot().both_unavailable);

    let started = started_endpoints(&kiosk);
    assert_eq!(started.len(), 3);
    assert!(started.iter().all(|(_, endpoint)| *endpoint == EndpointId::Secondary));
    assert_single_live_session(&kiosk);

    kiosk.system.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn primary_recovery_returns_from_secondary_once() {
    let kiosk = kiosk();
    kiosk.probe.set_healthy(EndpointId::Primary, false);
    kiosk.system.start(&collections()).await.unwrap();
    assert_eq!(kiosk.system.coordinator().state(), FailoverState::Secondary);

    // Let the primary fall all the way to offline before it comes back.
    tokio::time::sleep(INTERVAL * 6).await;
    assert_eq!(
        kiosk.system.health().get_health(EndpointId::Primary).status,
        kiosync_engine::HealthStatus::Offline
    );
    assert_eq!(kiosk.system.coordinator().state(), FailoverState::Secondary);

    let mut states = kiosk.system.coordinator().subscribe();
    kiosk.probe.set_healthy(EndpointId::Primary, true);

    // The next probe tick brings the primary back online.
    states
        .wait_for(|s| s.state == FailoverState::Primary && !s.is_processing)
        .await
        .unwrap();
    assert_single_live_session(&kiosk);

    kiosk.factory.log().clear();
    let outcome = kiosk.system.coordinator().handle_primary_recovery().await;
    assert_eq!(outcome, TransitionOutcome::Unchanged(FailoverState::Primary));
    assert_eq!(kiosk.factory.log().transport_call_count(), 0);

    kiosk.system.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn concurrent_retries_run_once() {
    let kiosk = kiosk();
    kiosk.system.start(&collections()).await.unwrap();
    kiosk.system.set_network_available(false).await;
    kiosk.factory.set_start_delay(Duration::from_secs(1));

    let (first, second) = tokio::join!(kiosk.system.retry(), kiosk.system.retry());
    let outcomes = [first, second];
    assert_eq!(outcomes.iter().filter(|o| o.is_busy()).count(), 1);
    assert!(outcomes
        .iter()
        .any(|o| o.state() == Some(FailoverState::Primary)));

    kiosk.system.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn never_started_sessions_are_never_cancelled() {
    let kiosk = kiosk();
    kiosk.factory.fail_starts_for("visits", EndpointId::Primary);
    kiosk.system.start(&collections()).await.unwrap();

    kiosk.system.set_network_available(false).await;
    kiosk.system.set_network_available(true).await;
    kiosk.system.coordinator().handle_both_down().await;
    kiosk.system.retry().await;
    assert_single_live_session(&kiosk);
    kiosk.system.shutdown().await;

    assert_eq!(kiosk.factory.untracked_cancels(), 0);
    assert!(started_endpoints(&kiosk).is_empty());
}

#[tokio::test]
async fn http_sessions_switch_endpoints_without_reusing_cursors() {
    let client = Arc::new(MockHttpClient::new());
    let store = Arc::new(MemoryStore::new());

    client.respond("https://primary.example/health", json!({"ok": true}));
    client.respond("https://secondary.example/health", json!({"ok": true}));
    client.respond(
        "https://primary.example/sync/orders/pull",
        json!({
            "documents": [{"id": "o-1", "total": 10}],
            "checkpoint": {"id": "o-1", "updatedAt": "2024-05-01T10:00:00Z"}
        }),
    );
    client.respond(
        "https://secondary.example/sync/orders/pull",
        json!({
            "items": [{"id": "o-2", "total": 20}],
            "checkpoint": {"id": "o-2", "server_updated_at": "2024-05-01T11:00:00Z"}
        }),
    );

    let settings = SyncSettings::new(pair())
        .with_health(HealthConfig::default().with_interval(Duration::from_secs(3600)))
        .with_coordinator(CoordinatorConfig::default().with_settle_delay(Duration::from_millis(5)));
    let factory = HttpSessionFactory::new(
        client.clone(),
        store.clone(),
        SessionConfig::default().with_poll_interval(Duration::from_secs(3600)),
    );
    let system = SyncSystem::new(
        settings,
        Arc::new(HttpProbe::new(client.clone(), "/health")),
        Arc::new(factory),
    )
    .unwrap();

    let outcome = system
        .start(&[CollectionSyncConfig::new("orders")])
        .await
        .unwrap();
    assert_eq!(outcome.state(), Some(FailoverState::Primary));

    let orders = CollectionId::new("orders");
    assert!(store.document(&orders, "o-1").is_some());
    assert!(system.snapshot().sessions[0].last_synced_at.is_some());

    client.fail("https://primary.example/health", "connection refused");
    let outcome = system.coordinator().handle_primary_down().await;
    assert_eq!(outcome.state(), Some(FailoverState::Secondary));
    assert!(store.document(&orders, "o-2").is_some());

    let first_secondary_pull = &client.bodies("https://secondary.example/sync/orders/pull")[0];
    assert_eq!(first_secondary_pull["checkpoint"], serde_json::Value::Null);

    system.shutdown().await;
}
