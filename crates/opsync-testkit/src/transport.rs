//! Fake `Transport` for scenario tests. Scripted like a storyboard: queue up
//! one [`ScriptedStep`] per expected call, then drive the engine and assert
//! on what actually went out. Also tracks idempotency keys it has seen, the
//! same way the teacher's `FakeBroker` dedupes repeated broker submissions by
//! key, so a scenario can assert "retried three times, applied once".

use async_trait::async_trait;
use opsync_http::{OutgoingRequest, Transport, TransportError, TransportResponse};
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub enum ScriptedStep {
    /// Simulates the server being unreachable (S1: "API unreachable for 3s").
    Unreachable,
    Status(u16),
    StatusWithHeader(u16, String, String),
    Json(u16, serde_json::Value),
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: reqwest::Method,
    pub url: String,
    pub idempotency_key: Option<String>,
    pub body: Option<Vec<u8>>,
}

struct State {
    scripted: VecDeque<ScriptedStep>,
    /// Returned once `scripted` runs dry, so a harness doesn't have to script
    /// every single call of a long-running scenario.
    fallback: ScriptedStep,
    recorded: Vec<RecordedRequest>,
    applied_idempotency_keys: HashSet<String>,
}

pub struct FakeTransport(Mutex<State>);

impl Default for FakeTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeTransport {
    pub fn new() -> Self {
        Self(Mutex::new(State {
            scripted: VecDeque::new(),
            fallback: ScriptedStep::Status(200),
            recorded: Vec::new(),
            applied_idempotency_keys: HashSet::new(),
        }))
    }

    pub fn script(&self, step: ScriptedStep) -> &Self {
        self.0.lock().unwrap().scripted.push_back(step);
        self
    }

    pub fn set_fallback(&self, step: ScriptedStep) {
        self.0.lock().unwrap().fallback = step;
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.0.lock().unwrap().recorded.clone()
    }

    pub fn call_count(&self) -> usize {
        self.0.lock().unwrap().recorded.len()
    }

    /// Number of distinct idempotency keys that ever reached a `2xx`
    /// response, i.e. the count of effects actually applied server-side —
    /// the number a scenario compares against `call_count()` to prove
    /// retries never double-applied.
    pub fn applied_count(&self) -> usize {
        self.0.lock().unwrap().applied_idempotency_keys.len()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(&self, request: OutgoingRequest) -> Result<TransportResponse, TransportError> {
        let idempotency_key = request
            .headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("x-idempotency-key"))
            .map(|(_, v)| v.clone());

        let mut state = self.0.lock().unwrap();
        state.recorded.push(RecordedRequest {
            method: request.method.clone(),
            url: request.url.clone(),
            idempotency_key: idempotency_key.clone(),
            body: request.body.clone(),
        });

        let step = state.scripted.pop_front().unwrap_or_else(|| state.fallback.clone());

        let response = match step {
            ScriptedStep::Unreachable => {
                return Err(TransportError {
                    message: "connection refused (simulated offline)".to_string(),
                    timed_out: false,
                });
            }
            ScriptedStep::Status(status) => TransportResponse {
                status,
                headers: vec![],
                body: serde_json::to_vec(&serde_json::json!({})).unwrap(),
            },
            ScriptedStep::StatusWithHeader(status, name, value) => TransportResponse {
                status,
                headers: vec![(name, value)],
                body: serde_json::to_vec(&serde_json::json!({})).unwrap(),
            },
            ScriptedStep::Json(status, body) => TransportResponse {
                status,
                headers: vec![],
                body: serde_json::to_vec(&body).unwrap(),
            },
        };

        if (200..300).contains(&response.status) {
            if let Some(key) = idempotency_key {
                state.applied_idempotency_keys.insert(key);
            }
        }

        Ok(response)
    }
}
