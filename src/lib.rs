//! gantry: an agent workflow orchestration engine.
//!
//! Given a declarative plan of steps with dependencies, gantry drives
//! long-running LLM-backed coding sessions against a local git
//! repository, gates their access to secrets through a leased
//! credential vault, enforces per-session policy and budgets, and opens
//! a draft pull request when every step has finished.
//!
//! The session runtime, task system, and event consumers are external
//! collaborators injected through the [`workflow::SessionSpawner`],
//! [`approval::TaskService`], and [`events::Broadcaster`] traits.

pub mod approval;
pub mod credential;
pub mod error;
pub mod events;
pub mod git;
pub mod policy;
pub mod settings;
pub mod store;
pub mod workflow;

#[cfg(feature = "cli")]
pub mod cli;

pub use error::{GantryError, Result};

/// Current wall-clock time in epoch milliseconds, the timestamp unit
/// used across the stores.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
