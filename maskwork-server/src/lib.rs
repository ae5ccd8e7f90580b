//! maskwork-server: service facade, streaming events and the batch worker
//!
//! The facade exposes one async method per operation and is independent of
//! any transport. Batch results leave as self-delimited `data:` frames whose
//! final `done` frame marks a complete stream.

pub mod dto;
pub mod events;
pub mod service;
pub mod telemetry;
pub mod worker;

pub use events::{decode_events, encode_event, BatchEvent, EventDecoder, StreamOutcome};
pub use service::MaskworkService;
pub use worker::{
    submit_job, InMemoryObjectStore, InMemoryQueue, InMemoryStatusStore, JobQueue, JobSpec, JobStatus,
    JobStatusStore, JobTemplate, LocalDirObjectStore, ObjectStore, Worker,
};
