//! Staged job orchestration: a durable job store, per-type stage sequences,
//! classified agent retries, dependency-aware sub-job queues and a bounded
//! auto-repair loop.

pub mod agent;
pub mod anthropic;
pub mod clock;
pub mod config;
pub mod error;
pub mod git;
pub mod orchestrator;
pub mod queue;
pub mod repair;
pub mod sequencer;
pub mod state_machine;
pub mod store;

pub use config::ForgeConfig;
pub use error::{AgentError, FailureClass, ForgeError, Result};
pub use orchestrator::{Orchestrator, OrchestratorBuilder};
pub use store::JobStore;
