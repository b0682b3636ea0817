//! Reference worker host.
//!
//! Serves the control protocol over HTTP and processes jobs from the same
//! store the scheduler reads:
//! - `handler`: `JobHandler` trait, built-in handlers and the registry
//! - `host`: activation state and the processor loop
//! - `routes`: axum routes for `/health`, `/activate`, `/deactivate`, `/status`

pub mod handler;
pub mod host;
pub mod routes;

pub use handler::{HandlerRegistry, JobHandler};
pub use host::{RunSummary, StopReason, WorkerHost};
pub use routes::worker_routes;
