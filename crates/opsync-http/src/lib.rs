//! The sync API client (spec §4.5): the single choke-point through which
//! every queued op reaches the server. Resolves a route, attaches the
//! required headers, classifies the response into an `ErrorKind`, and
//! retries exactly once on a `401` after a token refresh.
//!
//! Grounded on the teacher's broker-gateway pattern: a thin trait (here
//! `Transport`) isolates wire concerns so this client's retry/classification
//! logic is unit-testable without a socket.

pub mod router;
pub mod transport;

pub use router::{LookupRouteSpec, RouteSpec, Router, RouterError};
pub use transport::{OutgoingRequest, ReqwestTransport, Transport, TransportError, TransportResponse};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opsync_types::{ErrorKind, LastError, PendingOp, Payload};
use std::time::Duration;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct AuthError(pub String);

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "auth error: {}", self.0)
    }
}

impl std::error::Error for AuthError {}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn access_token(&self) -> Result<String, AuthError>;
    /// Force a token refresh, returning the new token. Called exactly once
    /// per request, after a `401` (spec §4.5).
    async fn refresh(&self) -> Result<String, AuthError>;
}

/// Static headers attached to every request (spec §4.5), set once at
/// client construction.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub app_version: String,
    pub device_id: String,
}

/// Classify an HTTP status into the taxonomy the engine switches on (spec
/// §4.5, §7). Only `Network`/`Server` ever count toward the circuit
/// breaker; everything else here is a response the server actually sent.
pub fn classify_status(status: u16) -> ErrorKind {
    match status {
        400 | 422 => ErrorKind::Validation,
        401 => ErrorKind::Auth,
        403 => ErrorKind::PermissionDenied,
        404 => ErrorKind::NotFound,
        408 | 429 | 503 | 504 => ErrorKind::Retryable,
        409 => ErrorKind::Conflict,
        s if (500..=599).contains(&s) => ErrorKind::Server,
        s if (400..=499).contains(&s) => ErrorKind::Validation,
        _ => ErrorKind::Server,
    }
}

pub struct ApiClient<T: Transport, A: AuthProvider> {
    transport: T,
    auth: A,
    router: Router,
    base_url: String,
    identity: ClientIdentity,
    timeout: Duration,
}

impl<T: Transport, A: AuthProvider> ApiClient<T, A> {
    pub fn new(transport: T, auth: A, router: Router, base_url: impl Into<String>, identity: ClientIdentity) -> Self {
        Self {
            transport,
            auth,
            router,
            base_url: base_url.into(),
            identity,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send `op` to the server. `now` drives `Retry-After` parsing and must
    /// come from the caller's injected clock.
    pub async fn execute(
        &self,
        op: &PendingOp,
        trace_id: &str,
        now: DateTime<Utc>,
    ) -> Result<serde_json::Value, LastError> {
        let (method, path, requires_idempotency) = self.router.resolve(op).map_err(|e| LastError {
            kind: ErrorKind::Routing,
            message: e.to_string(),
            http_status: None,
            retry_after: None,
        })?;

        let mut token = self.access_token().await?;
        let mut refreshed_once = false;

        loop {
            let response = self
                .send_once(&method, &path, op, requires_idempotency, trace_id, &token)
                .await?;

            if (200..300).contains(&response.status) {
                return serde_json::from_slice(&response.body).map_err(|e| LastError {
                    kind: ErrorKind::Server,
                    message: format!("malformed response body: {e}"),
                    http_status: Some(response.status),
                    retry_after: None,
                });
            }

            let kind = classify_status(response.status);
            if kind == ErrorKind::Auth && !refreshed_once {
                refreshed_once = true;
                token = self
                    .auth
                    .refresh()
                    .await
                    .map_err(|e| LastError {
                        kind: ErrorKind::Auth,
                        message: e.to_string(),
                        http_status: Some(response.status),
                        retry_after: None,
                    })?;
                continue;
            }

            let retry_after = response
                .header("retry-after")
                .and_then(|v| opsync_backoff::parse_retry_after(v, now))
                .and_then(|d| chrono::Duration::from_std(d).ok())
                .map(|d| now + d);

            return Err(LastError {
                kind,
                message: format!("server responded with status {}", response.status),
                http_status: Some(response.status),
                retry_after,
            });
        }
    }

    /// `GET` the server's current view of the resource `op` addresses (spec
    /// §4.6). `Ok(None)` on `404`.
    pub async fn fetch(
        &self,
        op: &PendingOp,
        trace_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Payload>, LastError> {
        let path = self.router.resolve_lookup(op).map_err(|e| LastError {
            kind: ErrorKind::Routing,
            message: e.to_string(),
            http_status: None,
            retry_after: None,
        })?;

        let token = self.access_token().await?;
        let headers = vec![
            ("Authorization".to_string(), format!("Bearer {token}")),
            ("X-Trace-Id".to_string(), trace_id.to_string()),
            ("X-App-Version".to_string(), self.identity.app_version.clone()),
            ("X-Device-Id".to_string(), self.identity.device_id.clone()),
        ];
        let request = OutgoingRequest {
            method: reqwest::Method::GET,
            url: format!("{}{}", self.base_url, path),
            headers,
            body: None,
            timeout: self.timeout,
        };

        let response = self.transport.send(request).await.map_err(|e| LastError {
            kind: ErrorKind::Network,
            message: e.to_string(),
            http_status: None,
            retry_after: None,
        })?;

        if response.status == 404 {
            return Ok(None);
        }
        if !(200..300).contains(&response.status) {
            let kind = classify_status(response.status);
            let retry_after = response
                .header("retry-after")
                .and_then(|v| opsync_backoff::parse_retry_after(v, now))
                .and_then(|d| chrono::Duration::from_std(d).ok())
                .map(|d| now + d);
            return Err(LastError {
                kind,
                message: format!("lookup responded with status {}", response.status),
                http_status: Some(response.status),
                retry_after,
            });
        }

        serde_json::from_slice(&response.body).map(Some).map_err(|e| LastError {
            kind: ErrorKind::Server,
            message: format!("malformed lookup response body: {e}"),
            http_status: Some(response.status),
            retry_after: None,
        })
    }

    async fn access_token(&self) -> Result<String, LastError> {
        self.auth.access_token().await.map_err(|e| LastError {
            kind: ErrorKind::Auth,
            message: e.to_string(),
            http_status: None,
            retry_after: None,
        })
    }

    async fn send_once(
        &self,
        method: &reqwest::Method,
        path: &str,
        op: &PendingOp,
        requires_idempotency: bool,
        trace_id: &str,
        token: &str,
    ) -> Result<TransportResponse, LastError> {
        let mut headers = vec![
            ("Authorization".to_string(), format!("Bearer {token}")),
            ("X-Trace-Id".to_string(), trace_id.to_string()),
            ("X-App-Version".to_string(), self.identity.app_version.clone()),
            ("X-Device-Id".to_string(), self.identity.device_id.clone()),
            ("Content-Type".to_string(), "application/json".to_string()),
        ];
        if requires_idempotency {
            headers.push(("X-Idempotency-Key".to_string(), op.idempotency_key.clone()));
        }

        let body = serde_json::to_vec(&op.payload).map_err(|e| LastError {
            kind: ErrorKind::Validation,
            message: format!("failed to encode payload: {e}"),
            http_status: None,
            retry_after: None,
        })?;

        let request = OutgoingRequest {
            method: method.clone(),
            url: format!("{}{}", self.base_url, path),
            headers,
            body: Some(body),
            timeout: self.timeout,
        };

        self.transport.send(request).await.map_err(|e| LastError {
            kind: ErrorKind::Network,
            message: e.to_string(),
            http_status: None,
            retry_after: None,
        })
    }
}
