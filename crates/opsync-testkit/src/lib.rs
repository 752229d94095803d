//! Fakes and a scenario harness for exercising the engine without a real
//! server, a real clock, or a real identity provider. Kept as a dev-only
//! dependency of `opsync-engine` and a regular dependency of the CLI's own
//! test binaries — never a dependency of anything shipped.

mod auth;
mod clock;
mod harness;
mod transport;

pub use auth::FakeAuthProvider;
pub use clock::FakeClock;
pub use harness::{PassthroughAuth, PassthroughTransport, ScenarioEngine, ScenarioHarness};
pub use transport::{FakeTransport, RecordedRequest, ScriptedStep};
