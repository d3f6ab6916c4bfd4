//! Asynchronous delivery: batched polling of the log into event
//! processors, with bookmark-tracked progress, per-consumer workers, and
//! lag monitoring.
//!
//! One [`BatchedEventProcessor`] drives one named consumer. Each
//! `process_one_batch` call loads the consumer's bookmark, scans the log
//! past it (filtered to the processor's interests), and delivers events
//! in order, saving the bookmark after each one. A crash mid-batch
//! leaves the bookmark at the last processed event, so the next poll
//! re-delivers from there. Delivery is at-least-once and handlers must
//! tolerate replay.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::bookmark::{Bookmark, BookmarkStore};
use crate::error::{HandlerError, StoreError};
use crate::event::SequencedEvent;
use crate::processor::EventProcessor;
use crate::stats::SequenceStats;
use crate::store::EventSource;

/// Default number of events fetched per poll.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// What a batch said about remaining work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// The batch was full; poll again immediately.
    Continue,
    /// The batch was short; the consumer is caught up, back off.
    Wait,
}

/// Failure while draining one batch.
#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    /// A handler rejected an event. The bookmark stays before it, so the
    /// event is re-delivered on the next poll.
    #[error("event handler failed: {0}")]
    Handler(HandlerError),

    /// The event source or bookmark store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Observer for per-event delivery timings.
pub trait DeliveryStats: Send + Sync {
    /// Called after each successfully processed event.
    fn event_processed(&self, processor: &str, event: &SequencedEvent, elapsed: Duration);
}

/// A named polling consumer: event source + bookmark + processor.
pub struct BatchedEventProcessor {
    source: Arc<dyn EventSource>,
    bookmarks: Arc<dyn BookmarkStore>,
    bookmark_name: String,
    processor: EventProcessor,
    batch_size: usize,
    delivery_stats: Option<Arc<dyn DeliveryStats>>,
}

impl BatchedEventProcessor {
    /// A consumer named `bookmark_name` draining `source` into
    /// `processor`, with the default batch size.
    pub fn new(
        source: Arc<dyn EventSource>,
        bookmarks: Arc<dyn BookmarkStore>,
        bookmark_name: impl Into<String>,
        processor: EventProcessor,
    ) -> Self {
        Self {
            source,
            bookmarks,
            bookmark_name: bookmark_name.into(),
            processor,
            batch_size: DEFAULT_BATCH_SIZE,
            delivery_stats: None,
        }
    }

    /// Override the number of events fetched per poll.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Attach a delivery-timing observer.
    pub fn with_delivery_stats(mut self, stats: Arc<dyn DeliveryStats>) -> Self {
        self.delivery_stats = Some(stats);
        self
    }

    /// The consumer's bookmark name.
    pub fn bookmark_name(&self) -> &str {
        &self.bookmark_name
    }

    /// The processor's combined interest set. Empty means all classes.
    pub fn event_types(&self) -> Vec<&'static str> {
        self.processor.event_types()
    }

    /// The consumer's current bookmark.
    pub async fn bookmark(&self) -> Result<Bookmark, StoreError> {
        self.bookmarks.bookmark_for(&self.bookmark_name).await
    }

    /// Drain one batch: poll past the bookmark, deliver each event in
    /// order, advance the bookmark after each successful delivery.
    ///
    /// Returns [`BatchOutcome::Continue`] when the batch was full (more
    /// work may remain) and [`BatchOutcome::Wait`] when the consumer has
    /// caught up.
    pub async fn process_one_batch(&self) -> Result<BatchOutcome, ProcessingError> {
        let bookmark = self.bookmarks.bookmark_for(&self.bookmark_name).await?;
        let interests = self.event_types();
        let batch = self
            .source
            .get_after(bookmark.sequence, &interests, self.batch_size)
            .await?;
        let full_batch = batch.len() == self.batch_size;

        for sequenced in &batch {
            let started = Instant::now();
            self.processor
                .process(sequenced)
                .await
                .map_err(ProcessingError::Handler)?;
            self.bookmarks
                .save(&self.bookmark_name, Bookmark::at(sequenced.sequence))
                .await?;
            if let Some(stats) = &self.delivery_stats {
                stats.event_processed(&self.bookmark_name, sequenced, started.elapsed());
            }
        }

        if !batch.is_empty() {
            tracing::debug!(
                processor = %self.bookmark_name,
                events = batch.len(),
                bookmark = batch[batch.len() - 1].sequence,
                "processed event batch"
            );
        }

        Ok(if full_batch {
            BatchOutcome::Continue
        } else {
            BatchOutcome::Wait
        })
    }
}

impl std::fmt::Debug for BatchedEventProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchedEventProcessor")
            .field("bookmark_name", &self.bookmark_name)
            .field("batch_size", &self.batch_size)
            .field("event_types", &self.event_types())
            .finish()
    }
}

/// Runs each consumer on its own worker task.
///
/// A full batch yields and polls again immediately; a short batch backs
/// off for the poll interval; a failed batch is logged and backed off,
/// never crashing the worker. Cancellation is cooperative through the
/// shared token.
pub struct PollingSupervisor {
    processors: Vec<Arc<BatchedEventProcessor>>,
    poll_interval: Duration,
    error_backoff: Duration,
}

impl PollingSupervisor {
    /// A supervisor over `processors` with half-second poll backoff and
    /// one-second error backoff.
    pub fn new(processors: Vec<Arc<BatchedEventProcessor>>) -> Self {
        Self {
            processors,
            poll_interval: Duration::from_millis(500),
            error_backoff: Duration::from_secs(1),
        }
    }

    /// How long a caught-up consumer sleeps before polling again.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// How long a failed consumer sleeps before retrying.
    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    /// Spawn one worker task per processor. Workers stop when `shutdown`
    /// is cancelled; await the returned handles to join them.
    pub fn spawn(&self, shutdown: CancellationToken) -> Vec<tokio::task::JoinHandle<()>> {
        self.processors
            .iter()
            .map(|processor| {
                tokio::spawn(run_worker(
                    processor.clone(),
                    shutdown.clone(),
                    self.poll_interval,
                    self.error_backoff,
                ))
            })
            .collect()
    }
}

async fn run_worker(
    processor: Arc<BatchedEventProcessor>,
    shutdown: CancellationToken,
    poll_interval: Duration,
    error_backoff: Duration,
) {
    tracing::info!(processor = %processor.bookmark_name(), "event processor worker starting");
    loop {
        if shutdown.is_cancelled() {
            break;
        }
        let backoff = match processor.process_one_batch().await {
            Ok(BatchOutcome::Continue) => {
                tokio::task::yield_now().await;
                continue;
            }
            Ok(BatchOutcome::Wait) => poll_interval,
            Err(error) => {
                tracing::error!(
                    processor = %processor.bookmark_name(),
                    error = %error,
                    "event batch failed"
                );
                error_backoff
            }
        };
        tokio::select! {
            () = shutdown.cancelled() => break,
            () = tokio::time::sleep(backoff) => {}
        }
    }
    tracing::info!(processor = %processor.bookmark_name(), "event processor worker stopping");
}

/// One consumer's distance behind the log head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorLag {
    /// The consumer's bookmark name.
    pub processor: String,
    /// Last processed sequence.
    pub bookmark: i64,
    /// High-water mark over the consumer's interest set.
    pub head: i64,
    /// `head - bookmark`, floored at zero.
    pub lag: i64,
}

/// Periodically reports how far each consumer is behind.
pub struct ProcessorMonitor {
    processors: Vec<Arc<BatchedEventProcessor>>,
    stats: Arc<dyn SequenceStats>,
}

impl ProcessorMonitor {
    /// A monitor over `processors`, reading high-water marks from `stats`.
    pub fn new(processors: Vec<Arc<BatchedEventProcessor>>, stats: Arc<dyn SequenceStats>) -> Self {
        Self { processors, stats }
    }

    /// Measure every consumer's lag, logging one line per consumer.
    ///
    /// Stats are updated inside sink transactions, so a measurement that
    /// races an open sink sees the pre-sink high-water mark; lag is never
    /// negative and converges once the consumer catches up.
    pub async fn measure(&self) -> Result<Vec<ProcessorLag>, StoreError> {
        let mut lags = Vec::with_capacity(self.processors.len());
        for processor in &self.processors {
            let interests = processor.event_types();
            let head = self.stats.last_sequence(&interests).await?;
            let bookmark = processor.bookmark().await?.sequence;
            let lag = (head - bookmark).max(0);
            tracing::info!(
                processor = %processor.bookmark_name(),
                bookmark,
                head,
                lag,
                "event processor lag"
            );
            lags.push(ProcessorLag {
                processor: processor.bookmark_name().to_string(),
                bookmark,
                head,
                lag,
            });
        }
        Ok(lags)
    }

    /// Measure on `interval` until `shutdown` is cancelled. Measurement
    /// failures are logged and the loop continues.
    pub async fn run(&self, shutdown: CancellationToken, interval: Duration) {
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(interval) => {}
            }
            if let Err(error) = self.measure().await {
                tracing::warn!(error = %error, "lag measurement failed");
            }
        }
    }
}
