//! The hand-off from sources into the pipeline's admission path.

use async_trait::async_trait;

use crate::record::LogRecord;

/// Accepts records from tailers. Implemented by the pipeline's admission
/// front end; sources only ever see this shape.
#[async_trait]
pub trait RecordSender: Send + Sync + 'static {
    /// Offer one record. Returns `false` when the record was not admitted
    /// (duplicate, out-of-window drop, queue full within the producer's
    /// send timeout, or load shedding); producers observe the outcome but
    /// must not block beyond it.
    async fn send(&self, record: LogRecord) -> bool;

    /// Offer a record replayed from durable storage. Returns `false` only
    /// when the pipeline cannot accept it right now and the caller should
    /// hold the record for a later pass; records the admission path rejects
    /// permanently (duplicate, out-of-window) count as accepted.
    async fn reinject(&self, record: LogRecord) -> bool {
        self.send(record).await
    }
}
