//! Worker registry and liveness tracking.
//!
//! Workers are external agents: they register with a capability set,
//! heartbeat to stay alive, and report per-job status through the
//! orchestrator. This module tracks who exists and who is still breathing;
//! it never executes anything itself.

pub mod health;
pub mod registry;

pub use health::HealthMonitor;
pub use registry::WorkerRegistry;
