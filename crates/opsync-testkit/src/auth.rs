//! Fake credential provider for scenario tests (spec §4.5, §7 auth tier).
//! Refresh succeeds by default; `fail_next_refreshes` lets a test simulate a
//! stretch of expired credentials to exercise the engine's pause-until-
//! `authUpdated` path without a real identity provider.

use async_trait::async_trait;
use opsync_http::{AuthError, AuthProvider};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

pub struct FakeAuthProvider {
    token_generation: AtomicU64,
    refresh_calls: AtomicU32,
    fail_next_refreshes: AtomicU32,
}

impl Default for FakeAuthProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeAuthProvider {
    pub fn new() -> Self {
        Self {
            token_generation: AtomicU64::new(0),
            refresh_calls: AtomicU32::new(0),
            fail_next_refreshes: AtomicU32::new(0),
        }
    }

    /// The next `n` calls to `refresh` return `Err` instead of minting a
    /// fresh token, simulating an identity provider that is itself down.
    pub fn fail_next_refreshes(&self, n: u32) {
        self.fail_next_refreshes.store(n, Ordering::SeqCst);
    }

    pub fn refresh_call_count(&self) -> u32 {
        self.refresh_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuthProvider for FakeAuthProvider {
    async fn access_token(&self) -> Result<String, AuthError> {
        Ok(format!("fake-token-gen-{}", self.token_generation.load(Ordering::SeqCst)))
    }

    async fn refresh(&self) -> Result<String, AuthError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.fail_next_refreshes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next_refreshes.store(remaining - 1, Ordering::SeqCst);
            return Err(AuthError("identity provider unavailable".to_string()));
        }
        let gen = self.token_generation.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("fake-token-gen-{gen}"))
    }
}
