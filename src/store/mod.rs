//! Persistence layer: libSQL-backed job queue and activation history.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{HistoryStore, JobStore};
