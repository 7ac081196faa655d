//! startstop - build, start, probe and measure harness
//!
//! Builds an application, starts it repeatedly, waits for its HTTP
//! endpoints, samples memory and descriptors, stops it gracefully and
//! gates the trimmed results against per-application thresholds.

pub mod archive;
pub mod orchestrator;
pub mod platform;
pub mod prober;
pub mod sampler;
pub mod supervisor;

pub use orchestrator::{Orchestrator, OrchestratorError};
pub use platform::{detect, Platform};
pub use prober::{Prober, ProberConfig};
pub use sampler::{ResourceSample, ResourceSampler};
pub use supervisor::{RunningProcess, Supervisor, SupervisorConfig};
