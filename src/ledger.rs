//! The reservation ledger: storage for every reservation, scoped by
//! equipment. The ledger is dumb on purpose — it enforces no uniqueness or
//! exclusivity over time windows; that is the conflict resolver's job. The
//! engine takes the ledger as an injected dependency so the booking logic
//! never couples to a concrete store.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::engine::EngineError;
use crate::limits::MAX_RESERVATIONS_PER_EQUIPMENT;
use crate::model::{BookingStatus, Reservation, ReservationBook, Span};

#[async_trait]
pub trait Ledger: Send + Sync {
    /// Store a new reservation under the given equipment. Individually
    /// atomic: once this returns, the row is visible to every later scan.
    async fn insert(&self, equipment_id: Ulid, reservation: Reservation)
    -> Result<(), EngineError>;

    /// Whole-row replace by id.
    async fn replace(&self, equipment_id: Ulid, reservation: Reservation)
    -> Result<(), EngineError>;

    /// Delete a row, returning it if it existed.
    async fn remove(&self, equipment_id: Ulid, id: Ulid) -> Option<Reservation>;

    /// Look a reservation up by id alone, resolving its owning equipment.
    async fn get(&self, id: Ulid) -> Option<(Ulid, Reservation)>;

    /// Forward-looking pre-filter: rows on this equipment still running
    /// strictly after `t`.
    async fn ending_after(&self, equipment_id: Ulid, t: DateTime<Utc>) -> Vec<Reservation>;

    /// Rows whose interval intersects `span` (half-open).
    async fn intersecting(&self, equipment_id: Ulid, span: Span) -> Vec<Reservation>;

    /// All rows on one equipment, optionally restricted to a status.
    async fn for_equipment(
        &self,
        equipment_id: Ulid,
        status: Option<BookingStatus>,
    ) -> Vec<Reservation>;

    /// Every row across every equipment. Read-only consumer use (reports).
    async fn all(&self) -> Vec<(Ulid, Reservation)>;

    /// Drop every row for an equipment, returning what was removed.
    async fn clear_equipment(&self, equipment_id: Ulid) -> Vec<Reservation>;
}

type SharedBook = Arc<RwLock<ReservationBook>>;

/// In-memory ledger: one `ReservationBook` per equipment plus a reverse
/// index from reservation id to owning equipment.
#[derive(Default)]
pub struct MemoryLedger {
    books: DashMap<Ulid, SharedBook>,
    owner: DashMap<Ulid, Ulid>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn book(&self, equipment_id: Ulid) -> SharedBook {
        self.books
            .entry(equipment_id)
            .or_insert_with(|| Arc::new(RwLock::new(ReservationBook::new())))
            .clone()
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn insert(
        &self,
        equipment_id: Ulid,
        reservation: Reservation,
    ) -> Result<(), EngineError> {
        let book = self.book(equipment_id);
        let mut guard = book.write().await;
        if guard.len() >= MAX_RESERVATIONS_PER_EQUIPMENT {
            return Err(EngineError::LimitExceeded(
                "too many reservations on equipment",
            ));
        }
        self.owner.insert(reservation.id, equipment_id);
        guard.insert(reservation);
        Ok(())
    }

    async fn replace(
        &self,
        equipment_id: Ulid,
        reservation: Reservation,
    ) -> Result<(), EngineError> {
        let id = reservation.id;
        let book = self.book(equipment_id);
        let mut guard = book.write().await;
        if !guard.replace(reservation) {
            return Err(EngineError::NotFound(id));
        }
        Ok(())
    }

    async fn remove(&self, equipment_id: Ulid, id: Ulid) -> Option<Reservation> {
        let book = self.books.get(&equipment_id)?.value().clone();
        let removed = book.write().await.remove(id);
        if removed.is_some() {
            self.owner.remove(&id);
        }
        removed
    }

    async fn get(&self, id: Ulid) -> Option<(Ulid, Reservation)> {
        let equipment_id = *self.owner.get(&id)?.value();
        let book = self.books.get(&equipment_id)?.value().clone();
        let guard = book.read().await;
        guard.get(id).map(|r| (equipment_id, r.clone()))
    }

    async fn ending_after(&self, equipment_id: Ulid, t: DateTime<Utc>) -> Vec<Reservation> {
        match self.books.get(&equipment_id) {
            Some(entry) => {
                let book = entry.value().clone();
                let guard = book.read().await;
                guard.ending_after(t).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    async fn intersecting(&self, equipment_id: Ulid, span: Span) -> Vec<Reservation> {
        match self.books.get(&equipment_id) {
            Some(entry) => {
                let book = entry.value().clone();
                let guard = book.read().await;
                guard.intersecting(&span).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    async fn for_equipment(
        &self,
        equipment_id: Ulid,
        status: Option<BookingStatus>,
    ) -> Vec<Reservation> {
        match self.books.get(&equipment_id) {
            Some(entry) => {
                let book = entry.value().clone();
                let guard = book.read().await;
                guard
                    .iter()
                    .filter(|r| status.is_none_or(|s| r.status == s))
                    .cloned()
                    .collect()
            }
            None => Vec::new(),
        }
    }

    async fn all(&self) -> Vec<(Ulid, Reservation)> {
        let mut out = Vec::new();
        let books: Vec<(Ulid, SharedBook)> = self
            .books
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        for (equipment_id, book) in books {
            let guard = book.read().await;
            out.extend(guard.iter().map(|r| (equipment_id, r.clone())));
        }
        out
    }

    async fn clear_equipment(&self, equipment_id: Ulid) -> Vec<Reservation> {
        let Some((_, book)) = self.books.remove(&equipment_id) else {
            return Vec::new();
        };
        let guard = book.read().await;
        let removed: Vec<Reservation> = guard.iter().cloned().collect();
        for r in &removed {
            self.owner.remove(&r.id);
        }
        removed
    }
}
