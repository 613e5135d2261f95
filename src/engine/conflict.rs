//! The tie-break protocol deciding who wins an overlapping time window.
//!
//! Candidates are resolved against a forward-looking scan (`end > start`)
//! that is filtered here down to true half-open overlap. A confirmed booking
//! always blocks. Two `reserved` rows racing for the same window are ordered
//! by `(created_at, user)`: the earlier claim wins, and an exact timestamp
//! tie goes to the alphabetically later user — arbitrary, but total, so two
//! racing parties can never both win.

use crate::model::{BookingStatus, Reservation};

/// Outcome of scanning the candidate against its competitors.
pub(crate) struct Resolution {
    /// Reservations the candidate cannot displace. Any entry here means the
    /// candidate loses.
    pub blockers: Vec<Reservation>,
    /// Reserved rows the candidate beats; they are cancelled as a side
    /// effect of the win.
    pub evicted: Vec<Reservation>,
}

pub(crate) fn resolve(candidate: &Reservation, competitors: &[Reservation]) -> Resolution {
    let mut blockers = Vec::new();
    let mut evicted = Vec::new();

    for other in competitors {
        if other.id == candidate.id {
            continue;
        }
        // Competitors arrive pre-filtered on `end > candidate.start`; the
        // other half of the overlap test happens here.
        if other.span.start >= candidate.span.end {
            continue;
        }

        match other.status {
            BookingStatus::Confirmed => blockers.push(other.clone()),
            BookingStatus::Reserved => {
                if other.created_at < candidate.created_at {
                    blockers.push(other.clone());
                } else if other.created_at == candidate.created_at {
                    if other.user < candidate.user {
                        evicted.push(other.clone());
                    } else {
                        blockers.push(other.clone());
                    }
                } else {
                    evicted.push(other.clone());
                }
            }
            // Pending, denied and cancelled rows never contend for the slot.
            _ => {}
        }
    }

    Resolution { blockers, evicted }
}
