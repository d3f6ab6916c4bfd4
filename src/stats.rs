//! Per-event-class high-water marks, maintained alongside each sink.
//!
//! The stats store caches the maximum global sequence seen per event
//! class so lag monitoring never has to scan the events table. It is
//! updated inside the sink transaction; a reader that races an open sink
//! sees pre-sink values, which keeps reported lag non-negative and
//! eventually consistent.

use async_trait::async_trait;

use crate::error::StoreError;

/// Cached per-event-class maximum global sequence.
#[async_trait]
pub trait SequenceStats: Send + Sync {
    /// The highest global sequence recorded for any of `event_types`,
    /// or across all classes when the slice is empty. Zero when nothing
    /// matches.
    async fn last_sequence(&self, event_types: &[&str]) -> Result<i64, StoreError>;
}
