//! Crash-resume, our analogue of the teacher's
//! `scenario_crash_recovery_no_double_order.rs`: an op left `inFlight` by a
//! process that died mid-dispatch must be picked back up by the next
//! `start()` and redelivered with the *same* idempotency key — never a
//! second, distinct attempt (spec §4.9 start step 3, scenario S3).
//!
//! Rather than racing a real HTTP call against a hard process kill, we seed
//! the store directly into the state a crash mid-dispatch would leave behind
//! (an `inFlight` row with nothing cleaned up) and hand that same store to a
//! fresh `Engine`, exactly as the teacher's crash-recovery test seeds an
//! outbox row as `SENT` before exercising recovery against it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opsync_engine::config::EngineConfig;
use opsync_engine::{Clock, Engine, EngineDependencies, EngineRng, StatusEvent};
use opsync_http::{AuthProvider, OutgoingRequest, RouteSpec, Router, Transport, TransportError, TransportResponse};
use opsync_kvstore::InMemoryPersistentMap;
use opsync_metrics::InMemoryMetrics;
use opsync_queue::Queue;
use opsync_reconcile::FingerprintConfig;
use opsync_types::{EnqueueOptions, OpType, Payload};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration as StdDuration;

struct FixedClock(StdMutex<DateTime<Utc>>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap()
    }
}

struct NoopAuth;

#[async_trait]
impl AuthProvider for NoopAuth {
    async fn access_token(&self) -> Result<String, opsync_http::AuthError> {
        Ok("token".to_string())
    }
    async fn refresh(&self) -> Result<String, opsync_http::AuthError> {
        Ok("token-2".to_string())
    }
}

/// Records the `X-Idempotency-Key` of every call and always succeeds —
/// standing in for a server that already applied the pre-crash attempt and
/// would reject (or silently dedupe) a second one with a different key.
struct RecordingTransport {
    calls: AtomicU64,
    idempotency_keys: StdMutex<Vec<String>>,
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, request: OutgoingRequest) -> Result<TransportResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let key = request
            .headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("X-Idempotency-Key"))
            .map(|(_, v)| v.clone())
            .unwrap_or_default();
        self.idempotency_keys.lock().unwrap().push(key);
        Ok(TransportResponse {
            status: 200,
            headers: vec![],
            body: serde_json::to_vec(&serde_json::json!({"ok": true})).unwrap(),
        })
    }
}

fn router_with_device_update() -> Router {
    let mut router = Router::new();
    router.register(
        OpType::Update,
        "device",
        RouteSpec { method: reqwest::Method::PATCH, path_template: "/v1/devices/{entity_id}".into(), requires_idempotency: true },
    );
    router
}

#[tokio::test]
async fn in_flight_op_survives_restart_and_redelivers_with_the_same_idempotency_key() {
    let store = Arc::new(InMemoryPersistentMap::new());
    let epoch = DateTime::<Utc>::UNIX_EPOCH;

    // Pre-crash process: enqueue, then advance to `inFlight` — the exact
    // point a dispatch in progress when the process dies leaves things.
    {
        let queue = Queue::load(store.clone()).await.unwrap();
        let mut payload = Payload::new();
        payload.insert("on".into(), serde_json::json!(true));
        let op = opsync_types::PendingOp::new(
            "op-1".into(),
            OpType::Update,
            "device".into(),
            Some("d1".into()),
            payload,
            &EnqueueOptions::default(),
            epoch,
        );
        queue.enqueue(op).await.unwrap();
        let in_flight = queue.mark_in_flight("op-1", epoch).await.unwrap();
        assert_eq!(in_flight.idempotency_key, "op-1");
        // `queue` (and the process that owned it) is dropped here, unclean.
    }

    // Restart: a brand-new Engine, same store, never saw the pre-crash
    // enqueue or dispatch.
    let clock: Arc<dyn Clock> = Arc::new(FixedClock(StdMutex::new(epoch)));
    let transport = Arc::new(RecordingTransport { calls: AtomicU64::new(0), idempotency_keys: StdMutex::new(Vec::new()) });
    let deps = EngineDependencies {
        persistent_map: store,
        transport: PassthroughTransport(transport.clone()),
        auth_provider: NoopAuth,
        clock,
        random: Arc::new(EngineRng::new(Box::new(rand::rngs::mock::StepRng::new(0, 0)))),
        metrics_sink: Arc::new(InMemoryMetrics::new()),
    };
    let config = EngineConfig { idle_poll_cap: StdDuration::from_millis(20), ..EngineConfig::default() };
    let engine = Engine::new(config, deps, router_with_device_update(), FingerprintConfig::new(), "test-holder")
        .await
        .unwrap();

    let mut status = engine.on_status_change();
    engine.start().await;

    let mut saw_recovered = false;
    let mut saw_succeeded = false;
    for _ in 0..20 {
        match tokio::time::timeout(StdDuration::from_secs(1), status.recv()).await {
            Ok(Ok(StatusEvent::Recovered { id })) if id == "op-1" => saw_recovered = true,
            Ok(Ok(StatusEvent::Succeeded { id })) if id == "op-1" => {
                saw_succeeded = true;
                break;
            }
            Ok(Ok(_)) => continue,
            _ => break,
        }
    }
    engine.stop().await;

    assert!(saw_recovered, "expected the stale inFlight op to be recovered to queued on start()");
    assert!(saw_succeeded, "expected the recovered op to redispatch and succeed");
    assert_eq!(transport.calls.load(Ordering::SeqCst), 1, "the op must be dispatched exactly once after recovery");
    assert_eq!(
        transport.idempotency_keys.lock().unwrap().as_slice(),
        ["op-1"],
        "the redelivered attempt must reuse the same idempotency key, not mint a new one"
    );
}

/// `Arc<RecordingTransport>` can't directly satisfy `Transport` for `Engine`
/// (the orphan rule forbids implementing a foreign trait for `Arc<Local>`);
/// this thin wrapper delegates to the shared instance so the test can keep
/// its own handle for assertions after the engine is done with it.
struct PassthroughTransport(Arc<RecordingTransport>);

#[async_trait]
impl Transport for PassthroughTransport {
    async fn send(&self, request: OutgoingRequest) -> Result<TransportResponse, TransportError> {
        self.0.send(request).await
    }
}
