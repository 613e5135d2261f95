//! The external calendar collaborator. Bookings are mirrored into a shared
//! calendar so lab members can see who holds an instrument; the service
//! itself is opaque and reached only through [`CalendarSink`].

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use ulid::Ulid;

use crate::model::{BookingStatus, Reservation};

#[derive(Debug)]
pub struct CalendarError(pub String);

impl std::fmt::Display for CalendarError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "calendar error: {}", self.0)
    }
}

impl std::error::Error for CalendarError {}

/// The event shape pushed at the external service.
#[derive(Debug, Clone, PartialEq)]
pub struct CalendarEvent {
    pub reservation_id: Ulid,
    pub summary: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub status: BookingStatus,
}

impl CalendarEvent {
    pub fn from_reservation(reservation: &Reservation) -> Self {
        Self {
            reservation_id: reservation.id,
            summary: reservation.user.clone(),
            start: reservation.span.start,
            end: reservation.span.end,
            status: reservation.status,
        }
    }

    /// JSON body in the shape the calendar service expects.
    pub fn payload(&self) -> serde_json::Value {
        json!({
            "summary": self.summary,
            "start": { "dateTime": self.start.to_rfc3339() },
            "end": { "dateTime": self.end.to_rfc3339() },
            "extendedProperties": {
                "private": {
                    "reservation": self.reservation_id.to_string(),
                    "status": self.status.label(),
                }
            }
        })
    }
}

/// Sink for calendar mutations. Event ids are opaque strings minted by the
/// service.
#[async_trait]
pub trait CalendarSink: Send + Sync {
    async fn add_event(
        &self,
        calendar_id: &str,
        event: &CalendarEvent,
    ) -> Result<String, CalendarError>;

    async fn update_event(
        &self,
        calendar_id: &str,
        external_id: &str,
        event: &CalendarEvent,
    ) -> Result<(), CalendarError>;

    async fn remove_event(&self, calendar_id: &str, external_id: &str)
    -> Result<(), CalendarError>;
}

/// Sink that drops everything. Used when no mirror calendar is configured.
pub struct NullCalendar;

#[async_trait]
impl CalendarSink for NullCalendar {
    async fn add_event(
        &self,
        _calendar_id: &str,
        event: &CalendarEvent,
    ) -> Result<String, CalendarError> {
        Ok(format!("null-{}", event.reservation_id))
    }

    async fn update_event(
        &self,
        _calendar_id: &str,
        _external_id: &str,
        _event: &CalendarEvent,
    ) -> Result<(), CalendarError> {
        Ok(())
    }

    async fn remove_event(
        &self,
        _calendar_id: &str,
        _external_id: &str,
    ) -> Result<(), CalendarError> {
        Ok(())
    }
}

/// In-memory sink that records every call. Used by tests and demo registries;
/// `fail_next` makes the next N calls error to exercise the retry paths.
#[derive(Default)]
pub struct RecordingCalendar {
    next_id: AtomicU64,
    failures: AtomicU32,
    events: Mutex<HashMap<String, (String, CalendarEvent)>>,
    removed: Mutex<Vec<String>>,
}

impl RecordingCalendar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` sink calls fail.
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn event(&self, external_id: &str) -> Option<CalendarEvent> {
        self.events
            .lock()
            .unwrap()
            .get(external_id)
            .map(|(_, e)| e.clone())
    }

    pub fn event_count(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn removed_ids(&self) -> Vec<String> {
        self.removed.lock().unwrap().clone()
    }

    fn take_failure(&self) -> bool {
        self.failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl CalendarSink for RecordingCalendar {
    async fn add_event(
        &self,
        calendar_id: &str,
        event: &CalendarEvent,
    ) -> Result<String, CalendarError> {
        if self.take_failure() {
            return Err(CalendarError("injected add failure".into()));
        }
        let external_id = format!("evt-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.events
            .lock()
            .unwrap()
            .insert(external_id.clone(), (calendar_id.to_string(), event.clone()));
        Ok(external_id)
    }

    async fn update_event(
        &self,
        calendar_id: &str,
        external_id: &str,
        event: &CalendarEvent,
    ) -> Result<(), CalendarError> {
        if self.take_failure() {
            return Err(CalendarError("injected update failure".into()));
        }
        let mut events = self.events.lock().unwrap();
        match events.get_mut(external_id) {
            Some(slot) => {
                *slot = (calendar_id.to_string(), event.clone());
                Ok(())
            }
            None => Err(CalendarError(format!("no such event: {external_id}"))),
        }
    }

    async fn remove_event(
        &self,
        _calendar_id: &str,
        external_id: &str,
    ) -> Result<(), CalendarError> {
        if self.take_failure() {
            return Err(CalendarError("injected remove failure".into()));
        }
        self.events.lock().unwrap().remove(external_id);
        self.removed.lock().unwrap().push(external_id.to_string());
        Ok(())
    }
}
