//! Activation scheduling: backlog analysis, duration estimation, the tick
//! state machine, activation history and the periodic trigger.

pub mod backlog;
pub mod clock;
pub mod engine;
pub mod estimator;
pub mod history;
pub mod trigger;

pub use backlog::{BacklogAnalyzer, BacklogSnapshot};
pub use clock::{Clock, FixedClock, SystemClock};
pub use engine::{ActivationScheduler, Diagnostics, SchedulerDeps, TickOutcome, TickPhase};
pub use estimator::{DurationEstimate, DurationEstimator};
pub use history::{ActivationHistory, ActivationRecord, HistoryAggregate};
pub use trigger::spawn_ticker;
