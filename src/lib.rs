//! Job autoscaler: keeps an on-demand worker running only while the job
//! queue has work for it.

pub mod config;
pub mod control;
pub mod error;
pub mod jobs;
pub mod scheduler;
pub mod store;
pub mod worker;
