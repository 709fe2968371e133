//! Shared infrastructure for the logship pipeline: the record model, the
//! `Sink` capability contract, the `Runtime` abstraction, bounded queues,
//! backoff, configuration, and HTTP plumbing.

pub mod backoff;
pub mod bounded_queue;
pub mod config;
pub mod errors;
pub mod http;
pub mod ingest;
pub mod knobs;
mod metrics;
pub mod record;
pub mod runtime;
pub mod sink;
pub mod supervisor;

pub use crate::{
    record::{
        BatchEnvelope,
        FieldValue,
        LogRecord,
        SourceKind,
    },
    runtime::{
        Runtime,
        UnixTimestamp,
    },
    sink::Sink,
};
