mod conflict;
mod error;
mod mutations;
mod normalize;
mod queries;
#[cfg(test)]
mod tests;

pub use error::EngineError;
pub use mutations::CancellationOutcome;
pub use queries::BookingFilter;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use ulid::Ulid;

use crate::access::{AccessGate, AllowAll};
use crate::cache::LookupCache;
use crate::calendar::{CalendarSink, NullCalendar};
use crate::clock::{Clock, SystemClock};
use crate::ledger::{Ledger, MemoryLedger};
use crate::model::*;
use crate::notify::NotifyHub;
use crate::sync::SyncQueue;
use crate::wal::Wal;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());

    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(
    wal: &mut Wal,
    batch: &mut [(Event, oneshot::Sender<io::Result<()>>)],
) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

// ── Engine ───────────────────────────────────────────────

/// The collaborators consulted by every booking operation. All injected so
/// they can be swapped for test doubles or real external services.
pub struct Collaborators {
    pub ledger: Arc<dyn Ledger>,
    pub gate: Arc<dyn AccessGate>,
    pub calendar: Arc<dyn CalendarSink>,
    pub clock: Arc<dyn Clock>,
}

impl Default for Collaborators {
    /// In-memory ledger, open gate, discarded calendar events, system time.
    fn default() -> Self {
        Self {
            ledger: Arc::new(MemoryLedger::new()),
            gate: Arc::new(AllowAll),
            calendar: Arc::new(NullCalendar),
            clock: Arc::new(SystemClock),
        }
    }
}

/// One booking registry: equipment configuration plus the reservation
/// ledger, made durable through the WAL and announced through the notify
/// hub.
pub struct Engine {
    equipment: DashMap<Ulid, Equipment>,
    ledger: Arc<dyn Ledger>,
    wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    gate: Arc<dyn AccessGate>,
    calendar: Arc<dyn CalendarSink>,
    sync: SyncQueue,
    clock: Arc<dyn Clock>,
    names: LookupCache,
}

impl Engine {
    pub async fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        collaborators: Collaborators,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let (sync, sync_rx) = SyncQueue::new(1024);
        tokio::spawn(crate::sync::run_sync_worker(
            sync_rx,
            collaborators.calendar.clone(),
        ));

        let engine = Self {
            equipment: DashMap::new(),
            ledger: collaborators.ledger,
            wal_tx,
            notify,
            gate: collaborators.gate,
            calendar: collaborators.calendar,
            sync,
            clock: collaborators.clock,
            names: LookupCache::new(),
        };

        for event in &events {
            // A clean log always applies; a corrupt tail may reference rows
            // that never made it to disk.
            if let Err(e) = engine.apply_event(event).await {
                tracing::debug!("replay skipped event: {e}");
            }
        }

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append + apply + notify in one call.
    pub(super) async fn persist_and_apply(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply_event(event).await?;
        self.notify.send(event.equipment_id(), event);
        Ok(())
    }

    /// Mutate in-memory state according to one event. Used both on the live
    /// path (after the WAL append) and during replay.
    async fn apply_event(&self, event: &Event) -> Result<(), EngineError> {
        match event {
            Event::EquipmentCreated { equipment } | Event::EquipmentUpdated { equipment } => {
                let old_name = self.equipment.get(&equipment.id).map(|p| p.name.clone());
                if let Some(old_name) = old_name
                    && old_name != equipment.name
                {
                    self.names.invalidate(&old_name);
                }
                self.names.put(&equipment.name, equipment.id);
                self.equipment.insert(equipment.id, equipment.clone());
            }
            Event::EquipmentDeleted { id } => {
                if let Some((_, equipment)) = self.equipment.remove(id) {
                    self.names.invalidate(&equipment.name);
                }
                self.ledger.clear_equipment(*id).await;
            }
            Event::CalendarAttached { id, calendar_id } => {
                let mut entry = self
                    .equipment
                    .get_mut(id)
                    .ok_or(EngineError::NotFound(*id))?;
                entry.calendar_id = Some(calendar_id.clone());
            }
            Event::ReservationCreated {
                equipment_id,
                reservation,
            } => {
                self.ledger.insert(*equipment_id, reservation.clone()).await?;
            }
            Event::ReservationConfirmed {
                equipment_id,
                id,
                project,
                values,
                pending,
            } => {
                let mut row = self.reservation_row(*id).await?;
                row.project = project.clone();
                row.requirement_values = values.clone();
                row.status = if *pending {
                    BookingStatus::PendingAuthorization
                } else {
                    BookingStatus::Confirmed
                };
                self.ledger.replace(*equipment_id, row).await?;
            }
            Event::ReservationAuthorized { equipment_id, id } => {
                let mut row = self.reservation_row(*id).await?;
                row.status = BookingStatus::Confirmed;
                self.ledger.replace(*equipment_id, row).await?;
            }
            Event::ReservationDenied {
                equipment_id,
                id,
                reason,
            } => {
                let mut row = self.reservation_row(*id).await?;
                row.status = BookingStatus::Denied;
                row.denied_reason = Some(reason.clone());
                self.ledger.replace(*equipment_id, row).await?;
            }
            Event::ReservationCancelled { equipment_id, id } => {
                let mut row = self.reservation_row(*id).await?;
                row.status = BookingStatus::Cancelled;
                self.ledger.replace(*equipment_id, row).await?;
            }
            Event::ReservationTruncated {
                equipment_id,
                id,
                end,
            } => {
                let mut row = self.reservation_row(*id).await?;
                row.span.end = *end;
                self.ledger.replace(*equipment_id, row).await?;
            }
            Event::ReservationLinked {
                equipment_id,
                id,
                external_id,
            } => {
                let mut row = self.reservation_row(*id).await?;
                row.external_calendar_id = Some(external_id.clone());
                self.ledger.replace(*equipment_id, row).await?;
            }
            Event::ReservationUnlinked { equipment_id, id } => {
                let mut row = self.reservation_row(*id).await?;
                row.external_calendar_id = None;
                self.ledger.replace(*equipment_id, row).await?;
            }
            Event::ReservationDeleted { equipment_id, id } => {
                let _ = self.ledger.remove(*equipment_id, *id).await;
            }
        }
        Ok(())
    }

    async fn reservation_row(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.ledger
            .get(id)
            .await
            .map(|(_, row)| row)
            .ok_or(EngineError::NotFound(id))
    }

    pub(super) fn equipment_config(&self, id: Ulid) -> Result<Equipment, EngineError> {
        self.equipment
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(id))
    }

    pub(super) fn equipment_map(&self) -> &DashMap<Ulid, Equipment> {
        &self.equipment
    }

    pub(super) fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    pub(super) fn gate(&self) -> &Arc<dyn AccessGate> {
        &self.gate
    }

    pub(super) fn calendar_sink(&self) -> &Arc<dyn CalendarSink> {
        &self.calendar
    }

    pub(super) fn sync_queue(&self) -> &SyncQueue {
        &self.sync
    }

    pub(super) fn name_cache(&self) -> &LookupCache {
        &self.names
    }

    pub(super) fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    /// Compact the WAL by rewriting it with only the events needed to
    /// recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();
        for entry in self.equipment.iter() {
            events.push(Event::EquipmentCreated {
                equipment: entry.value().clone(),
            });
        }
        // Reservation rows carry their full state, so one create each is
        // enough to rebuild the ledger.
        for (equipment_id, reservation) in self.ledger.all().await {
            events.push(Event::ReservationCreated {
                equipment_id,
                reservation,
            });
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
