//! # autoclaude-core
//!
//! Core library for auto-claude - an unattended supervisor that drives a
//! command-line agent through a durable queue of work items.
//!
//! This crate provides the task orchestration core: the durable state
//! machine that moves a task from submission through execution,
//! suspension, recovery, and terminal outcome while coordinating a pool
//! of worker processes, a rate-limit arbiter, a recovery loop, and a
//! security gate.
//!
//! ## Components
//!
//! - **Store**: durable task ledger with atomic, fenced state transitions
//! - **Security Gate**: command classification and output masking
//! - **Rate-Limit Arbiter**: global pause and resume scheduling
//! - **Worker Pool**: agent subprocess ownership and output monitoring
//! - **Recovery Loop**: orphan detection, heartbeat timeouts, retries
//! - **Orchestrator**: couples the above and drives the state machine
//!
//! ## Example
//!
//! ```rust,no_run
//! use autoclaude_core::config::Config;
//! use autoclaude_core::store::Store;
//! use autoclaude_core::task::TaskSpec;
//!
//! let config = Config::default();
//! let store = Store::open(&config.ledger_path()).unwrap();
//! let spec = TaskSpec::builder()
//!     .name("nightly-review")
//!     .description("review the diff landed since yesterday")
//!     .build();
//! let task_id = store.submit(&spec).unwrap();
//! println!("submitted {task_id}");
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod alerts;
pub mod arbiter;
pub mod clock;
pub mod command;
pub mod config;
pub mod gate;
pub mod metrics;
pub mod orchestrator;
pub mod recovery;
pub mod resume;
pub mod schedule;
pub mod store;
pub mod task;
pub mod telemetry;
pub mod worker;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::arbiter::RateLimitArbiter;
    pub use crate::clock::{Clock, SystemClock};
    pub use crate::config::Config;
    pub use crate::gate::SecurityGate;
    pub use crate::orchestrator::Orchestrator;
    pub use crate::store::Store;
    pub use crate::task::{Task, TaskClass, TaskPriority, TaskSpec, TaskState};
}

pub use config::Config;
pub use store::Store;
pub use task::{Task, TaskClass, TaskPriority, TaskSpec, TaskState};
