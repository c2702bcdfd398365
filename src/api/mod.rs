//! HTTP API.
//!
//! ## Endpoints
//!
//! - `GET /api/health` - Health check
//! - `POST /webhooks/monitor` - Signed callbacks from the monitoring service
//! - `POST /api/tasks` - Submit a verification task
//! - `GET /api/tasks` - List tasks, most recently updated first
//! - `GET /api/tasks/{id}` - Task with its checkpoints
//! - `POST /api/tasks/{id}/claim` - Operator claims the task
//! - `POST /api/tasks/{id}/start` - Stream is live; start monitoring
//! - `POST /api/tasks/{id}/stop` - Cancel the task
//! - `GET /api/tasks/{id}/events` - Audit trail
//! - `GET /api/tasks/{id}/checkpoints` - Checkpoint state

mod routes;
mod tasks;
pub mod types;
mod webhooks;

pub use routes::{router, serve, AppState};
pub use types::*;
