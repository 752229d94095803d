//! Composes a full [`opsync_engine::Engine`] over the in-memory map and the
//! fakes in this crate, the way the teacher's `Orchestrator` composes its
//! strategy/execution/portfolio engines into one runnable loop for scenario
//! tests.

use crate::{FakeAuthProvider, FakeClock, FakeTransport};
use opsync_engine::{Engine, EngineConfig, EngineDependencies, EngineRng, StatusEvent};
use opsync_http::Router;
use opsync_kvstore::InMemoryPersistentMap;
use opsync_reconcile::FingerprintConfig;
use opsync_types::{EnqueueOptions, OpType, Payload};
use rand::rngs::mock::StepRng;
use std::sync::Arc;
use std::time::Duration;

pub type ScenarioEngine = Engine<InMemoryPersistentMap, PassthroughTransport, PassthroughAuth>;

/// One running scenario: a wired-up engine plus handles to the fakes that
/// drove it, so a test can both advance the clock/network and assert on
/// what the engine did in response.
pub struct ScenarioHarness {
    pub engine: ScenarioEngine,
    pub clock: Arc<FakeClock>,
    pub transport: Arc<FakeTransport>,
    pub auth: Arc<FakeAuthProvider>,
}

impl ScenarioHarness {
    /// Build a harness with engine defaults except for `config`/`router`,
    /// which every scenario supplies since they're what makes one test
    /// different from the next.
    pub async fn new(config: EngineConfig, router: Router, fingerprints: FingerprintConfig) -> Self {
        let clock = Arc::new(FakeClock::epoch());
        let transport = Arc::new(FakeTransport::new());
        let auth = Arc::new(FakeAuthProvider::new());

        let deps = EngineDependencies {
            persistent_map: Arc::new(InMemoryPersistentMap::new()),
            transport: PassthroughTransport(transport.clone()),
            auth_provider: PassthroughAuth(auth.clone()),
            clock: clock.clone(),
            random: Arc::new(EngineRng::new(Box::new(StepRng::new(0, 0)))),
            metrics_sink: Arc::new(opsync_metrics::InMemoryMetrics::new()),
        };

        let engine = Engine::new(config, deps, router, fingerprints, "scenario-holder")
            .await
            .expect("in-memory map never fails to load");

        Self { engine, clock, transport, auth }
    }

    /// Enqueue with the common defaults a scenario usually wants, returning
    /// the outcome for assertion.
    pub async fn enqueue(
        &self,
        id: &str,
        op_type: OpType,
        entity_type: &str,
        entity_id: Option<&str>,
        payload: Payload,
    ) -> opsync_queue::EnqueueOutcome {
        self.engine
            .enqueue(id, op_type, entity_type, entity_id.map(str::to_string), payload, EnqueueOptions::default())
            .await
            .expect("scenario enqueue should not hit a duplicate id")
    }

    /// Start the engine, then block until `predicate` matches a delivered
    /// status event or `timeout` elapses (in which case panics — a scenario
    /// test that times out is a failing test, not a flaky one, since
    /// `FakeClock` makes every real delay instantaneous).
    pub async fn run_until(&self, timeout: Duration, mut predicate: impl FnMut(&StatusEvent) -> bool) {
        let mut status = self.engine.on_status_change();
        self.engine.start().await;

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                panic!("scenario timed out waiting for a matching status event");
            }
            match tokio::time::timeout(remaining, status.recv()).await {
                Ok(Ok(event)) if predicate(&event) => return,
                Ok(Ok(_)) => continue,
                Ok(Err(_)) => panic!("status channel closed before the expected event arrived"),
                Err(_) => panic!("scenario timed out waiting for a matching status event"),
            }
        }
    }

    pub async fn stop(&self) {
        self.engine.stop().await;
    }
}

/// `FakeTransport`/`FakeAuthProvider` are shared (`Arc`) so the test can keep
/// its own handle after handing one to the engine; these thin wrappers let
/// the shared handle itself implement the traits `Engine` needs to own by
/// value, since a foreign trait can't be implemented directly on `Arc<T>`.
pub struct PassthroughTransport(Arc<FakeTransport>);

#[async_trait::async_trait]
impl opsync_http::Transport for PassthroughTransport {
    async fn send(
        &self,
        request: opsync_http::OutgoingRequest,
    ) -> Result<opsync_http::TransportResponse, opsync_http::TransportError> {
        self.0.send(request).await
    }
}

pub struct PassthroughAuth(Arc<FakeAuthProvider>);

#[async_trait::async_trait]
impl opsync_http::AuthProvider for PassthroughAuth {
    async fn access_token(&self) -> Result<String, opsync_http::AuthError> {
        self.0.access_token().await
    }
    async fn refresh(&self) -> Result<String, opsync_http::AuthError> {
        self.0.refresh().await
    }
}
