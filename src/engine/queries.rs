use chrono::{DateTime, Utc};
use ulid::Ulid;

use crate::limits::MAX_QUERY_WINDOW_MINUTES;
use crate::model::{BookingStatus, Equipment, Reservation};

use super::{Engine, EngineError};

/// Filters for booking listings. All optional, combined with AND.
#[derive(Debug, Default, Clone)]
pub struct BookingFilter {
    pub equipment: Option<Ulid>,
    pub user: Option<String>,
    /// Both endpoints are kept: a booking is listed when it runs past the
    /// range start and begins no later than the range end. An inverted range
    /// is swapped; a degenerate one matches nothing.
    pub range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    pub status: Option<BookingStatus>,
}

impl BookingFilter {
    pub fn for_equipment(equipment_id: Ulid) -> Self {
        Self {
            equipment: Some(equipment_id),
            ..Default::default()
        }
    }

    pub fn for_user(user: impl Into<String>) -> Self {
        Self {
            user: Some(user.into()),
            ..Default::default()
        }
    }
}

impl Engine {
    pub async fn list_bookings(
        &self,
        filter: &BookingFilter,
    ) -> Result<Vec<Reservation>, EngineError> {
        let range = match filter.range {
            Some((a, b)) if a == b => return Ok(Vec::new()),
            Some((a, b)) if a > b => Some((b, a)),
            other => other,
        };
        if let Some((a, b)) = range
            && (b - a).num_minutes() > MAX_QUERY_WINDOW_MINUTES
        {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }

        let mut rows: Vec<Reservation> = match filter.equipment {
            // Cheap pre-filter at the ledger, the rest locally.
            Some(equipment_id) => match range {
                Some((a, _)) => self.ledger().ending_after(equipment_id, a).await,
                None => self.ledger().for_equipment(equipment_id, None).await,
            },
            None => self
                .ledger()
                .all()
                .await
                .into_iter()
                .map(|(_, r)| r)
                .collect(),
        };

        rows.retain(|r| {
            filter.status.is_none_or(|s| r.status == s)
                && filter.user.as_deref().is_none_or(|u| r.user == u)
                && range.is_none_or(|(a, b)| r.span.end > a && r.span.start <= b)
        });
        rows.sort_by_key(|r| r.span.start);
        Ok(rows)
    }

    pub async fn get_reservation(&self, id: Ulid) -> Option<(Ulid, Reservation)> {
        self.ledger().get(id).await
    }

    /// Future bookings still awaiting an administrator's decision.
    pub async fn pending_bookings(&self, equipment_id: Ulid) -> Vec<Reservation> {
        let now = self.now();
        let mut rows = self.ledger().ending_after(equipment_id, now).await;
        rows.retain(|r| r.status == BookingStatus::PendingAuthorization);
        rows.sort_by_key(|r| r.span.start);
        rows
    }

    pub fn get_equipment(&self, id: Ulid) -> Option<Equipment> {
        self.equipment_map().get(&id).map(|e| e.value().clone())
    }

    /// Name lookup through the derived cache, falling back to a scan on a
    /// miss (and repopulating the cache from the scan).
    pub fn find_equipment(&self, name: &str) -> Option<Equipment> {
        if let Some(id) = self.name_cache().get(name)
            && let Some(equipment) = self.get_equipment(id)
            && equipment.name == name
        {
            return Some(equipment);
        }
        let found = self
            .equipment_map()
            .iter()
            .find(|e| e.value().name == name)
            .map(|e| e.value().clone())?;
        self.name_cache().put(name, found.id);
        Some(found)
    }

    pub fn list_equipment(&self) -> Vec<Equipment> {
        let mut items: Vec<Equipment> = self
            .equipment_map()
            .iter()
            .map(|e| e.value().clone())
            .collect();
        items.sort_by(|a, b| a.name.cmp(&b.name));
        items
    }
}
