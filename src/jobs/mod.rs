//! Asynchronous job orchestration.
//!
//! Jobs are flat, independently queued units of work partitioned by a kind
//! tag. Each kind gets one FIFO queue drained by one long-lived worker, so
//! same-kind jobs execute strictly in submission order while kinds run
//! concurrently. Records are mirrored to a [`Persist`] store on every
//! transition; log events fan out best-effort to live subscribers.

pub mod persist;
pub mod record;
pub mod runner;

pub use persist::{MemoryStore, Persist};
pub use record::{JobRecord, JobStatus, LogEvent};
pub use runner::{JobContext, LogSubscription, Runner, QUEUE_CAPACITY};
