//! # proofstream
//!
//! Live-stream verification for physical tasks that AI agents hand to humans.
//!
//! An agent submits a task with visual checkpoints. Once an operator claims
//! it and goes live, a remote vision service watches the stream against a
//! condition built from the unverified checkpoints and calls back through
//! signed webhooks. Verified checkpoints move the task to completion, which
//! is sealed with a verification hash and a ledger receipt.
//!
//! ## Flow
//!
//! ```text
//!   agent ──POST /api/tasks──▶ Orchestrator ──start──▶ JobRegistry ──▶ vision service
//!                                  ▲                                       │
//!                                  │           POST /webhooks/monitor      │
//!                                  └──────── signature + idempotency ◀─────┘
//!                                  │
//!                                  ├──▶ EventDelivery (agent destination)
//!                                  └──▶ Settlement ──▶ Ledger
//! ```
//!
//! ## Modules
//! - `orchestrator`: task state machine and trigger handling
//! - `jobs`: monitoring job lifecycle, capacity, seamless restart
//! - `checkpoints`: checkpoint templates, condition building, response parsing
//! - `webhooks`: payload types, HMAC signatures, idempotency
//! - `heartbeat` / `maintenance`: background reconciliation loops
//! - `store`: persistence (in-memory or SQLite)

pub mod api;
pub mod checkpoints;
pub mod config;
pub mod delivery;
pub mod evidence;
pub mod heartbeat;
pub mod jobs;
pub mod ledger;
pub mod maintenance;
pub mod monitor;
pub mod orchestrator;
pub mod settlement;
pub mod store;
pub mod util;
pub mod webhooks;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use orchestrator::Orchestrator;
