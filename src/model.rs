use chrono::{DateTime, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::requirements::{RequirementSet, RequirementValue};

/// Half-open interval `[start, end)`, always UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Span {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_minutes(&self) -> i64 {
        (self.end - self.start).num_minutes()
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: DateTime<Utc>) -> bool {
        self.start <= t && t < self.end
    }
}

/// Discretization applied to reservation start/end instants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingUnit {
    Minute,
    Hour,
    HalfDay,
    Day,
    Week,
}

impl BookingUnit {
    pub fn by_name(name: &str) -> Option<Self> {
        match name {
            "minute" => Some(Self::Minute),
            "hour" => Some(Self::Hour),
            "half-day" => Some(Self::HalfDay),
            "day" => Some(Self::Day),
            "week" => Some(Self::Week),
            _ => None,
        }
    }

    /// User-facing description, e.g. shown on the equipment page.
    pub fn describe(&self) -> &'static str {
        match self {
            Self::Minute => "booked by the minute",
            Self::Hour => "booked by the hour",
            Self::HalfDay => "booked for a morning or an afternoon",
            Self::Day => "booked by the day",
            Self::Week => "booked by the week",
        }
    }
}

/// Days of the week on which bookings may start or end, Monday first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Weekdays([bool; 7]);

impl Weekdays {
    pub const ALL: Weekdays = Weekdays([true; 7]);

    pub fn weekdays_only() -> Self {
        Weekdays([true, true, true, true, true, false, false])
    }

    pub fn from_array(days: [bool; 7]) -> Self {
        Weekdays(days)
    }

    pub fn allows(&self, day: Weekday) -> bool {
        self.0[day.num_days_from_monday() as usize]
    }

    pub fn set(&mut self, day: Weekday, allowed: bool) {
        self.0[day.num_days_from_monday() as usize] = allowed;
    }

    /// Human-readable listing: "any day", "Monday-Friday", or the explicit list.
    pub fn describe(&self) -> String {
        if self.0.iter().all(|d| *d) {
            return "any day".to_string();
        }
        if self.0[..5].iter().all(|d| *d) && !self.0[5] && !self.0[6] {
            return "Monday-Friday".to_string();
        }

        const NAMES: [&str; 7] = [
            "Monday",
            "Tuesday",
            "Wednesday",
            "Thursday",
            "Friday",
            "Saturday",
            "Sunday",
        ];
        let days: Vec<&str> = NAMES
            .iter()
            .zip(self.0.iter())
            .filter_map(|(name, allowed)| allowed.then_some(*name))
            .collect();
        days.join(", ")
    }
}

impl Default for Weekdays {
    fn default() -> Self {
        Self::ALL
    }
}

/// Wall-clock window bookings must fall inside, e.g. 08:00-20:00.
/// Only meaningful for minute and hour units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeOfDayRange {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeOfDayRange {
    /// Returns None unless `start < end`.
    pub fn new(start: NaiveTime, end: NaiveTime) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }
}

/// Scheduling rules applied when reserving a piece of equipment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingConstraint {
    pub unit: BookingUnit,
    pub allowed_days: Weekdays,
    pub time_range: Option<TimeOfDayRange>,
    /// Minimum reservation length in minutes, inclusive.
    pub min_minutes: Option<i64>,
    /// Maximum reservation length in minutes, inclusive.
    pub max_minutes: Option<i64>,
    /// Free-text blurb shown alongside the derived constraint description.
    pub info: Option<String>,
}

impl Default for BookingConstraint {
    fn default() -> Self {
        Self {
            unit: BookingUnit::Minute,
            allowed_days: Weekdays::ALL,
            time_range: None,
            min_minutes: None,
            max_minutes: None,
            info: None,
        }
    }
}

impl BookingConstraint {
    /// Human-readable summary of every rule that applies to a booking.
    pub fn describe(&self) -> String {
        let mut output = vec![format!(
            "This equipment is available to be {}.",
            self.unit.describe()
        )];

        match self.unit {
            BookingUnit::HalfDay => output.push(
                "Half-day bookings allow access between either 9am-1pm, or 2pm-6pm.".to_string(),
            ),
            BookingUnit::Day => {
                output.push("Day bookings allow access between 9am-6pm.".to_string())
            }
            BookingUnit::Week => output.push(
                "Week bookings allow access between Monday-Friday, 9am-6pm.".to_string(),
            ),
            _ => {}
        }

        if let Some(range) = &self.time_range
            && matches!(self.unit, BookingUnit::Minute | BookingUnit::Hour)
        {
            output.push(format!(
                "Bookings allow access between {}-{}.",
                range.start.format("%I:%M%p"),
                range.end.format("%I:%M%p")
            ));
        }

        output.push(format!(
            "Bookings can be made on {}.",
            self.allowed_days.describe()
        ));

        if let Some(min) = self.min_minutes {
            output.push(format!(
                "The minimum amount of time you can book is {}.",
                minutes_to_string(min)
            ));
        }
        if let Some(max) = self.max_minutes {
            output.push(format!(
                "The maximum amount of time you can book is {}.",
                minutes_to_string(max)
            ));
        }

        output.join("\n")
    }
}

/// Render a duration in minutes the way users expect to read it.
pub fn minutes_to_string(mins: i64) -> String {
    if mins < 60 {
        format!("{mins} minute{}", if mins == 1 { "" } else { "s" })
    } else if mins % 60 == 0 {
        let hours = mins / 60;
        format!("{hours} hour{}", if hours == 1 { "" } else { "s" })
    } else {
        format!("{} hours {} minutes", mins / 60, mins % 60)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Reserved,
    Confirmed,
    PendingAuthorization,
    Denied,
    Cancelled,
}

impl BookingStatus {
    /// Terminal states accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Denied | Self::Cancelled)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Reserved => "reserved",
            Self::Confirmed => "confirmed",
            Self::PendingAuthorization => "pending authorization",
            Self::Denied => "denied",
            Self::Cancelled => "cancelled",
        }
    }
}

/// A user's claim on one piece of equipment for one time window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    /// Owner's email. A back-reference only, never an ownership relation.
    pub user: String,
    pub span: Span,
    /// When the claim was made. The conflict tie-break key — NOT the start time.
    pub created_at: DateTime<Utc>,
    pub status: BookingStatus,
    pub project: Option<String>,
    pub external_calendar_id: Option<String>,
    pub requirement_values: Vec<RequirementValue>,
    pub denied_reason: Option<String>,
}

impl Reservation {
    pub fn new(user: impl Into<String>, span: Span, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Ulid::new(),
            user: user.into(),
            span,
            created_at,
            status: BookingStatus::Reserved,
            project: None,
            external_calendar_id: None,
            requirement_values: Vec::new(),
            denied_reason: None,
        }
    }

    pub fn is_past(&self, now: DateTime<Utc>) -> bool {
        self.span.end <= now
    }

    pub fn has_started(&self, now: DateTime<Utc>) -> bool {
        self.span.start <= now
    }

    /// One-line summary used when a competing reservation blocks a request.
    pub fn describe(&self) -> String {
        let window = format!(
            "{} until {}",
            self.span.start.format("%Y-%m-%d %H:%M"),
            self.span.end.format("%Y-%m-%d %H:%M")
        );
        if self.status == BookingStatus::Confirmed {
            format!("{} [{}]", self.user, window)
        } else {
            format!("{} [{} - NOT CONFIRMED YET]", self.user, window)
        }
    }
}

/// A bookable instrument and its scheduling configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Equipment {
    pub id: Ulid,
    pub name: String,
    pub constraint: BookingConstraint,
    pub requirements: RequirementSet,
    /// Id of the external calendar mirroring this equipment's bookings.
    pub calendar_id: Option<String>,
}

impl Equipment {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Ulid::new(),
            name: name.into(),
            constraint: BookingConstraint::default(),
            requirements: RequirementSet::default(),
            calendar_id: None,
        }
    }
}

/// All reservations on one equipment, sorted by `span.start`.
#[derive(Debug, Default)]
pub struct ReservationBook {
    entries: Vec<Reservation>,
}

impl ReservationBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert maintaining sort order by span.start.
    pub fn insert(&mut self, reservation: Reservation) {
        let pos = self
            .entries
            .binary_search_by_key(&reservation.span.start, |r| r.span.start)
            .unwrap_or_else(|e| e);
        self.entries.insert(pos, reservation);
    }

    pub fn remove(&mut self, id: Ulid) -> Option<Reservation> {
        let pos = self.entries.iter().position(|r| r.id == id)?;
        Some(self.entries.remove(pos))
    }

    pub fn get(&self, id: Ulid) -> Option<&Reservation> {
        self.entries.iter().find(|r| r.id == id)
    }

    /// Whole-row replace. Re-inserts because the span may have changed.
    pub fn replace(&mut self, reservation: Reservation) -> bool {
        if self.remove(reservation.id).is_none() {
            return false;
        }
        self.insert(reservation);
        true
    }

    /// Reservations whose interval intersects `query`, half-open semantics.
    /// Binary search skips everything starting at or after `query.end`.
    pub fn intersecting(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self.entries.partition_point(|r| r.span.start < query.end);
        self.entries[..right_bound]
            .iter()
            .filter(move |r| r.span.end > query.start)
    }

    /// Forward-looking scan: reservations still running at or after `t`.
    pub fn ending_after(&self, t: DateTime<Utc>) -> impl Iterator<Item = &Reservation> {
        self.entries.iter().filter(move |r| r.span.end > t)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Reservation> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ── Event log ────────────────────────────────────────────────────

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    EquipmentCreated {
        equipment: Equipment,
    },
    EquipmentUpdated {
        equipment: Equipment,
    },
    EquipmentDeleted {
        id: Ulid,
    },
    CalendarAttached {
        id: Ulid,
        calendar_id: String,
    },
    ReservationCreated {
        equipment_id: Ulid,
        reservation: Reservation,
    },
    ReservationConfirmed {
        equipment_id: Ulid,
        id: Ulid,
        project: Option<String>,
        values: Vec<RequirementValue>,
        pending: bool,
    },
    ReservationAuthorized {
        equipment_id: Ulid,
        id: Ulid,
    },
    ReservationDenied {
        equipment_id: Ulid,
        id: Ulid,
        reason: String,
    },
    ReservationCancelled {
        equipment_id: Ulid,
        id: Ulid,
    },
    ReservationTruncated {
        equipment_id: Ulid,
        id: Ulid,
        end: DateTime<Utc>,
    },
    ReservationLinked {
        equipment_id: Ulid,
        id: Ulid,
        external_id: String,
    },
    ReservationUnlinked {
        equipment_id: Ulid,
        id: Ulid,
    },
    ReservationDeleted {
        equipment_id: Ulid,
        id: Ulid,
    },
}

impl Event {
    /// The equipment an event belongs to.
    pub fn equipment_id(&self) -> Ulid {
        match self {
            Event::EquipmentCreated { equipment } | Event::EquipmentUpdated { equipment } => {
                equipment.id
            }
            Event::EquipmentDeleted { id } | Event::CalendarAttached { id, .. } => *id,
            Event::ReservationCreated { equipment_id, .. }
            | Event::ReservationConfirmed { equipment_id, .. }
            | Event::ReservationAuthorized { equipment_id, .. }
            | Event::ReservationDenied { equipment_id, .. }
            | Event::ReservationCancelled { equipment_id, .. }
            | Event::ReservationTruncated { equipment_id, .. }
            | Event::ReservationLinked { equipment_id, .. }
            | Event::ReservationUnlinked { equipment_id, .. }
            | Event::ReservationDeleted { equipment_id, .. } => *equipment_id,
        }
    }
}
