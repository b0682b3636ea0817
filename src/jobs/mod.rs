//! Job queue domain types: jobs, their lifecycle, and the versioned payload envelope.

pub mod model;
pub mod payload;

pub use model::{Job, JobStatus, JobType};
pub use payload::{DecodedPayload, PayloadDecoding, PayloadEnvelope};
