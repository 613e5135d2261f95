//! Background workers: the calendar sync queue and the WAL compactor.
//!
//! Calendar updates and removals never run on the booking path. Operations
//! enqueue a job and move on; the worker delivers it with bounded
//! exponential backoff and gives up loudly rather than blocking anything.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::calendar::{CalendarEvent, CalendarSink};
use crate::engine::Engine;

const MAX_ATTEMPTS: u32 = 5;
const BASE_BACKOFF: Duration = Duration::from_millis(250);

/// One deferred calendar mutation.
#[derive(Debug, Clone)]
pub enum SyncJob {
    Update {
        calendar_id: String,
        external_id: String,
        event: CalendarEvent,
    },
    Remove {
        calendar_id: String,
        external_id: String,
    },
}

/// Producer half handed to the engine.
#[derive(Clone)]
pub struct SyncQueue {
    tx: mpsc::Sender<SyncJob>,
}

impl SyncQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<SyncJob>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Hand a job to the worker. Never blocks; a full or closed queue drops
    /// the job with a warning — bookkeeping must not fail bookings.
    pub fn enqueue(&self, job: SyncJob) {
        if self.tx.try_send(job).is_err() {
            metrics::counter!(crate::observability::CALENDAR_SYNC_DROPPED_TOTAL).increment(1);
            warn!("calendar sync queue unavailable, dropping job");
        }
    }
}

/// Worker task draining the sync queue.
pub async fn run_sync_worker(mut rx: mpsc::Receiver<SyncJob>, sink: Arc<dyn CalendarSink>) {
    while let Some(job) = rx.recv().await {
        deliver(&*sink, job).await;
    }
}

async fn deliver(sink: &dyn CalendarSink, job: SyncJob) {
    for attempt in 0..MAX_ATTEMPTS {
        if attempt > 0 {
            tokio::time::sleep(BASE_BACKOFF * 2u32.pow(attempt - 1)).await;
        }

        let result = match &job {
            SyncJob::Update {
                calendar_id,
                external_id,
                event,
            } => sink.update_event(calendar_id, external_id, event).await,
            SyncJob::Remove {
                calendar_id,
                external_id,
            } => sink.remove_event(calendar_id, external_id).await,
        };

        match result {
            Ok(()) => {
                if attempt > 0 {
                    debug!("calendar sync succeeded after {} retries", attempt);
                }
                return;
            }
            Err(e) => {
                metrics::counter!(crate::observability::CALENDAR_SYNC_FAILURES_TOTAL).increment(1);
                debug!("calendar sync attempt {} failed: {e}", attempt + 1);
            }
        }
    }

    metrics::counter!(crate::observability::CALENDAR_SYNC_DROPPED_TOTAL).increment(1);
    warn!("giving up on calendar sync job after {MAX_ATTEMPTS} attempts");
}

/// Periodically rewrites the WAL once enough appends accumulate.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        if engine.wal_appends_since_compact().await >= threshold {
            match engine.compact_wal().await {
                Ok(()) => info!("WAL compacted"),
                Err(e) => warn!("WAL compaction failed: {e}"),
            }
        }
    }
}
