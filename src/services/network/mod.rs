//! Network mode orchestration: client mode when a saved network is usable,
//! access point mode otherwise, never both.

pub mod access_point;
pub mod client;
pub mod orchestrator;
pub mod parse;
pub mod probe;
pub mod reachability;
pub mod retry;
pub mod supervisor;
mod systemd;
pub mod types;

pub use access_point::{AccessPointDriver, AccessPointSettings, HostapdDriver};
pub use client::{ClientDriver, ClientSettings, NmClientDriver};
pub use orchestrator::{FallbackReason, Orchestrator, OrchestratorSettings, PassOutcome};
pub use probe::{NetworkProbe, SystemProbe};
pub use reachability::ReachabilityProbe;
pub use retry::{RetryPolicy, RetryState};
pub use supervisor::{DEFAULT_QUEUE_DEPTH, OrchestratorHandle, Request, RequestError};
pub use types::{
    ApIdentity, AttemptOutcome, ConnectionAttempt, LinkSnapshot, NetworkMode, NetworkStatus,
    SavedNetwork,
};
