use ulid::Ulid;

use crate::model::{BookingStatus, Reservation};

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(String),
    /// Bad input relative to the equipment's rules. User-correctable; the
    /// message is surfaced verbatim.
    ConstraintViolation(String),
    /// Lost the race for an overlapping window. Carries every blocking
    /// reservation so the user can pick another slot.
    BookingConflict { blockers: Vec<Reservation> },
    /// Attempted confirm/authorize/deny/cancel from the wrong state.
    InvalidStateTransition {
        reservation: Ulid,
        status: BookingStatus,
        operation: &'static str,
    },
    /// Attempted mutation on a past-dated (or already started) booking.
    TemporalGuard(String),
    /// The access-control gate refused the caller.
    PermissionDenied { user: String },
    /// Aggregate of per-field failures from the requirement questionnaire.
    RequirementValidation(Vec<String>),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(name) => write!(f, "already exists: {name}"),
            EngineError::ConstraintViolation(msg) => write!(f, "{msg}"),
            EngineError::BookingConflict { blockers } => {
                let described: Vec<String> = blockers.iter().map(|b| b.describe()).collect();
                write!(
                    f,
                    "Cannot create a reservation for this time as someone else has already \
                     created a booking. '{}'",
                    described.join(", ")
                )
            }
            EngineError::InvalidStateTransition {
                reservation,
                status,
                operation,
            } => write!(
                f,
                "you cannot {operation} booking '{reservation}' while it is in the \
                 '{}' state",
                status.label()
            ),
            EngineError::TemporalGuard(msg) => write!(f, "{msg}"),
            EngineError::PermissionDenied { user } => {
                write!(f, "'{user}' does not have permission to perform this action")
            }
            EngineError::RequirementValidation(errors) => write!(
                f,
                "there were problems processing the supplied booking requirements: {}",
                errors.join("; ")
            ),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
