use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::warn;
use ulid::Ulid;

use crate::calendar::CalendarEvent;
use crate::limits::*;
use crate::model::*;
use crate::requirements::RequirementSet;
use crate::sync::SyncJob;

use super::{Engine, EngineError, conflict, normalize};

/// How a cancel request was honored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancellationOutcome {
    /// An unconfirmed reservation was cancelled outright.
    ReservationCancelled,
    /// A confirmed booking that had not started was cancelled in full.
    BookingCancelled,
    /// A running booking had its remaining time released; the booking itself
    /// stays confirmed with a truncated window.
    RemainderCancelled,
}

impl std::fmt::Display for CancellationOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReservationCancelled => write!(f, "The reservation has been cancelled"),
            Self::BookingCancelled => write!(f, "The booking has been cancelled"),
            Self::RemainderCancelled => {
                write!(f, "The time remaining on the booking has been cancelled")
            }
        }
    }
}

impl Engine {
    // ── Equipment configuration ──────────────────────────────

    pub async fn create_equipment(
        &self,
        name: &str,
        constraint: BookingConstraint,
        requirements: RequirementSet,
    ) -> Result<Equipment, EngineError> {
        if self.equipment_map().len() >= MAX_EQUIPMENT_PER_REGISTRY {
            return Err(EngineError::LimitExceeded("too many equipment items"));
        }
        check_equipment_name(name)?;
        if requirements.fields.len() > MAX_REQUIREMENTS_PER_SET {
            return Err(EngineError::LimitExceeded("too many requirements"));
        }
        if self.find_equipment(name).is_some() {
            return Err(EngineError::AlreadyExists(name.to_string()));
        }

        let mut equipment = Equipment::new(name);
        equipment.constraint = constraint;
        equipment.requirements = requirements;
        self.persist_and_apply(&Event::EquipmentCreated {
            equipment: equipment.clone(),
        })
        .await?;
        Ok(equipment)
    }

    pub async fn update_constraint(
        &self,
        admin: &str,
        equipment_id: Ulid,
        constraint: BookingConstraint,
    ) -> Result<Equipment, EngineError> {
        let mut equipment = self.equipment_config(equipment_id)?;
        self.require_admin(admin, equipment_id).await?;
        equipment.constraint = constraint;
        self.persist_and_apply(&Event::EquipmentUpdated {
            equipment: equipment.clone(),
        })
        .await?;
        Ok(equipment)
    }

    pub async fn set_requirements(
        &self,
        admin: &str,
        equipment_id: Ulid,
        requirements: RequirementSet,
    ) -> Result<Equipment, EngineError> {
        if requirements.fields.len() > MAX_REQUIREMENTS_PER_SET {
            return Err(EngineError::LimitExceeded("too many requirements"));
        }
        let mut equipment = self.equipment_config(equipment_id)?;
        self.require_admin(admin, equipment_id).await?;
        equipment.requirements = requirements;
        self.persist_and_apply(&Event::EquipmentUpdated {
            equipment: equipment.clone(),
        })
        .await?;
        Ok(equipment)
    }

    pub async fn rename_equipment(
        &self,
        admin: &str,
        equipment_id: Ulid,
        name: &str,
    ) -> Result<Equipment, EngineError> {
        check_equipment_name(name)?;
        let mut equipment = self.equipment_config(equipment_id)?;
        self.require_admin(admin, equipment_id).await?;
        if let Some(existing) = self.find_equipment(name)
            && existing.id != equipment_id
        {
            return Err(EngineError::AlreadyExists(name.to_string()));
        }
        equipment.name = name.to_string();
        self.persist_and_apply(&Event::EquipmentUpdated {
            equipment: equipment.clone(),
        })
        .await?;
        Ok(equipment)
    }

    pub async fn attach_calendar(
        &self,
        admin: &str,
        equipment_id: Ulid,
        calendar_id: &str,
    ) -> Result<(), EngineError> {
        self.equipment_config(equipment_id)?;
        self.require_admin(admin, equipment_id).await?;
        self.persist_and_apply(&Event::CalendarAttached {
            id: equipment_id,
            calendar_id: calendar_id.to_string(),
        })
        .await
    }

    pub async fn delete_equipment(&self, admin: &str, equipment_id: Ulid) -> Result<(), EngineError> {
        self.equipment_config(equipment_id)?;
        self.require_admin(admin, equipment_id).await?;
        self.persist_and_apply(&Event::EquipmentDeleted { id: equipment_id })
            .await?;
        self.notify.remove(&equipment_id);
        Ok(())
    }

    // ── Reservations ─────────────────────────────────────────

    /// Claim a time window. The request is normalized and validated against
    /// the equipment's constraint, then resolved against every competing
    /// reservation; at most one claimant can win any overlapping window.
    pub async fn make_reservation(
        &self,
        equipment_id: Ulid,
        user: &str,
        raw_start: DateTime<Utc>,
        raw_end: DateTime<Utc>,
    ) -> Result<Reservation, EngineError> {
        if user.len() > MAX_USER_LEN {
            return Err(EngineError::LimitExceeded("user email too long"));
        }
        let equipment = self.equipment_config(equipment_id)?;
        self.require_authorized(user, equipment_id).await?;

        let span = normalize::validate(&equipment.constraint, raw_start, raw_end)?;
        let now = self.now();
        if span.start < now {
            return Err(EngineError::ConstraintViolation(format!(
                "Could not create a reservation as the start time ({}) is in the past (now is {})",
                span.start.format("%Y-%m-%d %H:%M"),
                now.format("%Y-%m-%d %H:%M")
            )));
        }

        // The candidate row is inserted before conflict detection: its
        // presence in the ledger is what concurrent claimants tie-break
        // against. It is deleted again below if it loses.
        let candidate = Reservation::new(user, span, now);
        self.persist_and_apply(&Event::ReservationCreated {
            equipment_id,
            reservation: candidate.clone(),
        })
        .await?;

        let competitors = self.ledger().ending_after(equipment_id, span.start).await;
        let resolution = conflict::resolve(&candidate, &competitors);

        // Out-raced reserved rows are cancelled even when the candidate
        // itself goes on to lose against a confirmed booking. Best-effort: a
        // failure here never rolls back the decision.
        for loser in &resolution.evicted {
            metrics::counter!(crate::observability::EVICTIONS_TOTAL).increment(1);
            if let Err(e) = self
                .persist_and_apply(&Event::ReservationCancelled {
                    equipment_id,
                    id: loser.id,
                })
                .await
            {
                warn!("failed to cancel out-raced reservation {}: {e}", loser.id);
            }
        }

        if !resolution.blockers.is_empty() {
            metrics::counter!(crate::observability::CONFLICTS_TOTAL).increment(1);
            self.persist_and_apply(&Event::ReservationDeleted {
                equipment_id,
                id: candidate.id,
            })
            .await?;
            return Err(EngineError::BookingConflict {
                blockers: resolution.blockers,
            });
        }

        metrics::counter!(crate::observability::RESERVATIONS_TOTAL).increment(1);
        Ok(candidate)
    }

    /// Confirm a reserved booking, supplying the project and the answers to
    /// the equipment's requirement questionnaire. Whether the booking lands
    /// in `Confirmed` or `PendingAuthorization` depends on the equipment.
    pub async fn confirm_reservation(
        &self,
        user: &str,
        reservation_id: Ulid,
        project: Option<&str>,
        answers: &HashMap<String, String>,
    ) -> Result<Reservation, EngineError> {
        let (equipment_id, row) = self
            .ledger()
            .get(reservation_id)
            .await
            .ok_or(EngineError::NotFound(reservation_id))?;
        let equipment = self.equipment_config(equipment_id)?;
        self.require_owner_or_admin(user, &row, equipment_id).await?;

        if row.status != BookingStatus::Reserved {
            return Err(EngineError::InvalidStateTransition {
                reservation: reservation_id,
                status: row.status,
                operation: "confirm",
            });
        }
        if let Some(p) = project
            && p.len() > MAX_PROJECT_LEN
        {
            return Err(EngineError::LimitExceeded("project name too long"));
        }

        let values = equipment
            .requirements
            .validate_answers(answers)
            .map_err(EngineError::RequirementValidation)?;
        let pending = equipment.requirements.needs_authorization;

        self.persist_and_apply(&Event::ReservationConfirmed {
            equipment_id,
            id: reservation_id,
            project: project.map(str::to_string),
            values,
            pending,
        })
        .await?;
        metrics::counter!(crate::observability::CONFIRMATIONS_TOTAL).increment(1);

        // One inline attempt at the mirror calendar. Failure leaves the
        // booking confirmed but unlinked; retries belong to the sync worker,
        // never to the booking path.
        if let Some(calendar_id) = &equipment.calendar_id {
            let confirmed = self.reservation(reservation_id).await?;
            match self
                .calendar_sink()
                .add_event(calendar_id, &CalendarEvent::from_reservation(&confirmed))
                .await
            {
                Ok(external_id) => {
                    self.persist_and_apply(&Event::ReservationLinked {
                        equipment_id,
                        id: reservation_id,
                        external_id,
                    })
                    .await?;
                }
                Err(e) => warn!("calendar event creation failed for {reservation_id}: {e}"),
            }
        }

        self.reservation(reservation_id).await
    }

    /// Cancel a reservation, honoring the temporal guards: a finished booking
    /// cannot be cancelled, and a running one is truncated rather than
    /// removed.
    pub async fn cancel_reservation(
        &self,
        user: &str,
        reservation_id: Ulid,
    ) -> Result<CancellationOutcome, EngineError> {
        let (equipment_id, row) = self
            .ledger()
            .get(reservation_id)
            .await
            .ok_or(EngineError::NotFound(reservation_id))?;
        let equipment = self.equipment_config(equipment_id)?;
        self.require_owner_or_admin(user, &row, equipment_id).await?;

        let now = self.now();
        match row.status {
            BookingStatus::Reserved => {
                self.persist_and_apply(&Event::ReservationCancelled {
                    equipment_id,
                    id: reservation_id,
                })
                .await?;
                metrics::counter!(crate::observability::CANCELLATIONS_TOTAL).increment(1);
                Ok(CancellationOutcome::ReservationCancelled)
            }
            BookingStatus::Confirmed | BookingStatus::PendingAuthorization => {
                if row.is_past(now) {
                    return Err(EngineError::TemporalGuard(format!(
                        "You cannot cancel booking '{reservation_id}' as it is in the past."
                    )));
                }

                if row.has_started(now) {
                    // Partial cancellation: release the remaining time, keep
                    // the booking and its calendar entry.
                    self.persist_and_apply(&Event::ReservationTruncated {
                        equipment_id,
                        id: reservation_id,
                        end: now,
                    })
                    .await?;
                    if let (Some(calendar_id), Some(external_id)) =
                        (&equipment.calendar_id, &row.external_calendar_id)
                    {
                        let truncated = self.reservation(reservation_id).await?;
                        self.sync_queue().enqueue(SyncJob::Update {
                            calendar_id: calendar_id.clone(),
                            external_id: external_id.clone(),
                            event: CalendarEvent::from_reservation(&truncated),
                        });
                    }
                    metrics::counter!(crate::observability::CANCELLATIONS_TOTAL).increment(1);
                    return Ok(CancellationOutcome::RemainderCancelled);
                }

                if let (Some(calendar_id), Some(external_id)) =
                    (&equipment.calendar_id, &row.external_calendar_id)
                {
                    self.sync_queue().enqueue(SyncJob::Remove {
                        calendar_id: calendar_id.clone(),
                        external_id: external_id.clone(),
                    });
                    self.persist_and_apply(&Event::ReservationUnlinked {
                        equipment_id,
                        id: reservation_id,
                    })
                    .await?;
                }
                self.persist_and_apply(&Event::ReservationCancelled {
                    equipment_id,
                    id: reservation_id,
                })
                .await?;
                metrics::counter!(crate::observability::CANCELLATIONS_TOTAL).increment(1);
                Ok(CancellationOutcome::BookingCancelled)
            }
            BookingStatus::Cancelled | BookingStatus::Denied => {
                Err(EngineError::InvalidStateTransition {
                    reservation: reservation_id,
                    status: row.status,
                    operation: "cancel",
                })
            }
        }
    }

    /// Refuse a booking that awaits authorization. Administrators only.
    pub async fn deny_reservation(
        &self,
        admin: &str,
        reservation_id: Ulid,
        reason: &str,
    ) -> Result<Reservation, EngineError> {
        if reason.len() > MAX_REASON_LEN {
            return Err(EngineError::LimitExceeded("denial reason too long"));
        }
        let (equipment_id, row) = self
            .ledger()
            .get(reservation_id)
            .await
            .ok_or(EngineError::NotFound(reservation_id))?;
        let equipment = self.equipment_config(equipment_id)?;
        self.require_admin(admin, equipment_id).await?;

        if row.status != BookingStatus::PendingAuthorization {
            return Err(EngineError::InvalidStateTransition {
                reservation: reservation_id,
                status: row.status,
                operation: "deny",
            });
        }
        if row.is_past(self.now()) {
            return Err(EngineError::TemporalGuard(format!(
                "You cannot deny booking '{reservation_id}' as it is in the past."
            )));
        }

        if let (Some(calendar_id), Some(external_id)) =
            (&equipment.calendar_id, &row.external_calendar_id)
        {
            self.sync_queue().enqueue(SyncJob::Remove {
                calendar_id: calendar_id.clone(),
                external_id: external_id.clone(),
            });
            self.persist_and_apply(&Event::ReservationUnlinked {
                equipment_id,
                id: reservation_id,
            })
            .await?;
        }
        self.persist_and_apply(&Event::ReservationDenied {
            equipment_id,
            id: reservation_id,
            reason: reason.to_string(),
        })
        .await?;

        self.reservation(reservation_id).await
    }

    /// Approve a booking that awaits authorization. Administrators only.
    pub async fn authorize_reservation(
        &self,
        admin: &str,
        reservation_id: Ulid,
    ) -> Result<Reservation, EngineError> {
        let (equipment_id, row) = self
            .ledger()
            .get(reservation_id)
            .await
            .ok_or(EngineError::NotFound(reservation_id))?;
        self.require_admin(admin, equipment_id).await?;

        if row.status != BookingStatus::PendingAuthorization {
            return Err(EngineError::InvalidStateTransition {
                reservation: reservation_id,
                status: row.status,
                operation: "authorize",
            });
        }
        let now = self.now();
        if row.is_past(now) {
            return Err(EngineError::TemporalGuard(format!(
                "You cannot authorize booking '{reservation_id}' as it is in the past."
            )));
        }
        if row.has_started(now) {
            return Err(EngineError::TemporalGuard(format!(
                "You cannot authorize booking '{reservation_id}' as it has already started. \
                 Please ask the user to cancel the booking and remake it."
            )));
        }

        self.persist_and_apply(&Event::ReservationAuthorized {
            equipment_id,
            id: reservation_id,
        })
        .await?;
        self.reservation(reservation_id).await
    }

    /// Remove a reservation row outright, in any state. Administrators only;
    /// this is the only way a row ever leaves the ledger.
    pub async fn delete_reservation(
        &self,
        admin: &str,
        reservation_id: Ulid,
    ) -> Result<(), EngineError> {
        let (equipment_id, row) = self
            .ledger()
            .get(reservation_id)
            .await
            .ok_or(EngineError::NotFound(reservation_id))?;
        let equipment = self.equipment_config(equipment_id)?;
        self.require_admin(admin, equipment_id).await?;

        if let (Some(calendar_id), Some(external_id)) =
            (&equipment.calendar_id, &row.external_calendar_id)
        {
            self.sync_queue().enqueue(SyncJob::Remove {
                calendar_id: calendar_id.clone(),
                external_id: external_id.clone(),
            });
        }
        self.persist_and_apply(&Event::ReservationDeleted {
            equipment_id,
            id: reservation_id,
        })
        .await
    }

    // ── Gate helpers ─────────────────────────────────────────

    async fn require_authorized(&self, user: &str, equipment_id: Ulid) -> Result<(), EngineError> {
        if !self.gate().is_authorized(user, equipment_id).await {
            return Err(EngineError::PermissionDenied {
                user: user.to_string(),
            });
        }
        Ok(())
    }

    async fn require_admin(&self, user: &str, equipment_id: Ulid) -> Result<(), EngineError> {
        if !self.gate().is_administrator(user, equipment_id).await {
            return Err(EngineError::PermissionDenied {
                user: user.to_string(),
            });
        }
        Ok(())
    }

    /// The owner may act on their own reservation; administrators may act on
    /// anyone's.
    async fn require_owner_or_admin(
        &self,
        user: &str,
        row: &Reservation,
        equipment_id: Ulid,
    ) -> Result<(), EngineError> {
        if row.user == user {
            return self.require_authorized(user, equipment_id).await;
        }
        self.require_admin(user, equipment_id).await
    }

    async fn reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.ledger()
            .get(id)
            .await
            .map(|(_, row)| row)
            .ok_or(EngineError::NotFound(id))
    }
}

fn check_equipment_name(name: &str) -> Result<(), EngineError> {
    if name.is_empty() {
        return Err(EngineError::LimitExceeded("empty equipment name"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("equipment name too long"));
    }
    Ok(())
}
