//! Ingestion pipeline: envelope decode, Sign-Collapse Writer, Queue Worker,
//! Scheduler (C5-C7).

pub mod envelope;
pub mod scheduler;
pub mod worker;
pub mod writer;

pub use envelope::{parse_envelope, Envelope, EnvelopeError};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use worker::{drain_queue, WorkerOutcome, WorkerState};
