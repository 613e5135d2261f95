//! Canonicalization of raw booking times against an equipment's rules.
//!
//! `validate` takes the user's `(start, end)` exactly as submitted (any
//! order, any precision) and either returns the canonical half-open span for
//! the equipment's booking unit or explains what rule was broken. Allowed-day
//! membership is checked against the *submitted* weekdays, before any unit
//! snapping; duration bounds are checked against the *aligned* span.

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};

use crate::limits::{MAX_SPAN_MINUTES, MAX_VALID_TIMESTAMP_MS, MIN_VALID_TIMESTAMP_MS};
use crate::model::{minutes_to_string, BookingConstraint, BookingUnit, Span, Weekdays};

use super::EngineError;

/// Validate and canonicalize a requested booking window.
pub fn validate(
    constraint: &BookingConstraint,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Span, EngineError> {
    let mut start = truncate_to_minute(start);
    let mut end = truncate_to_minute(end);

    check_timestamp_bounds(start)?;
    check_timestamp_bounds(end)?;

    check_allowed_days(&constraint.allowed_days, start, end)?;

    // Align to the booking unit. Everything coarser than a minute starts
    // and stops on the hour.
    if constraint.unit != BookingUnit::Minute {
        start = with_minute_zero(start);
        end = with_minute_zero(end);
    }

    match constraint.unit {
        BookingUnit::Minute | BookingUnit::Hour => {}
        BookingUnit::HalfDay => {
            start = snap_half_day_start(start)?;
            end = snap_half_day_end(end)?;
        }
        BookingUnit::Day => {
            start = with_time(start, 9, 0);
            end = with_time(end, 18, 0);
        }
        BookingUnit::Week => {
            start = with_time(start, 9, 0);
            end = with_time(end, 18, 0);

            // Weeks run Monday 9am to Friday 6pm. The start always rolls
            // back; a Sat/Sun end rolls forward to the *next* Friday.
            let weekday = start.weekday().number_from_monday() as i64;
            if weekday != 1 {
                start -= Duration::days(weekday - 1);
            }
            let weekday = end.weekday().number_from_monday() as i64;
            if weekday < 5 {
                end += Duration::days(5 - weekday);
            } else if weekday > 5 {
                end += Duration::days(12 - weekday);
            }
        }
    }

    if let Some(range) = &constraint.time_range
        && matches!(constraint.unit, BookingUnit::Minute | BookingUnit::Hour)
    {
        // The range applies on each endpoint's own calendar day. Not checked
        // for the slot units — their hours are fixed by the unit itself.
        let day_start = start.date_naive().and_time(range.start).and_utc();
        let day_end = start.date_naive().and_time(range.end).and_utc();
        if start < day_start {
            return Err(EngineError::ConstraintViolation(format!(
                "You cannot arrange a booking that starts before {}.",
                range.start.format("%I:%M%p")
            )));
        } else if start >= day_end {
            return Err(EngineError::ConstraintViolation(format!(
                "You cannot arrange a booking that starts after {}.",
                range.end.format("%I:%M%p")
            )));
        }

        let day_start = end.date_naive().and_time(range.start).and_utc();
        let day_end = end.date_naive().and_time(range.end).and_utc();
        if end <= day_start {
            return Err(EngineError::ConstraintViolation(format!(
                "You cannot arrange a booking that ends before {}.",
                range.start.format("%I:%M%p")
            )));
        } else if end > day_end {
            return Err(EngineError::ConstraintViolation(format!(
                "You cannot arrange a booking that ends after {}.",
                range.end.format("%I:%M%p")
            )));
        }
    }

    // Defensive: callers should not rely on this swap.
    if start > end {
        std::mem::swap(&mut start, &mut end);
    }

    if start == end {
        return Err(EngineError::ConstraintViolation(format!(
            "Could not create a reservation as the start time ({}) equals the end time ({})",
            start.format("%Y-%m-%d %H:%M"),
            end.format("%Y-%m-%d %H:%M")
        )));
    }

    let delta_minutes = (end - start).num_minutes();
    if delta_minutes > MAX_SPAN_MINUTES {
        return Err(EngineError::LimitExceeded("booking window too wide"));
    }
    if let Some(min) = constraint.min_minutes
        && delta_minutes < min
    {
        return Err(EngineError::ConstraintViolation(format!(
            "Your booking is too short ({}). It needs to be at least {}.",
            minutes_to_string(delta_minutes),
            minutes_to_string(min)
        )));
    }
    if let Some(max) = constraint.max_minutes
        && delta_minutes > max
    {
        return Err(EngineError::ConstraintViolation(format!(
            "Your booking is too long ({}). It needs to be less than {}.",
            minutes_to_string(delta_minutes),
            minutes_to_string(max)
        )));
    }

    Ok(Span::new(start, end))
}

fn check_timestamp_bounds(t: DateTime<Utc>) -> Result<(), EngineError> {
    let ms = t.timestamp_millis();
    if !(MIN_VALID_TIMESTAMP_MS..MAX_VALID_TIMESTAMP_MS).contains(&ms) {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

/// Both the submitted start day and the submitted end day must be bookable.
/// Runs before unit snapping so a Saturday request on a weekday-only
/// instrument fails even when the week unit would roll it to a Monday.
fn check_allowed_days(
    days: &Weekdays,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<(), EngineError> {
    if !days.allows(start.weekday()) {
        return Err(EngineError::ConstraintViolation(format!(
            "You cannot start your booking on a {}. Allowable days are {}.",
            start.format("%A"),
            days.describe()
        )));
    }
    if !days.allows(end.weekday()) {
        return Err(EngineError::ConstraintViolation(format!(
            "You cannot end your booking on a {}. Allowable days are {}.",
            end.format("%A"),
            days.describe()
        )));
    }
    Ok(())
}

/// Half-day slots are 9am-1pm and 2pm-6pm. A start snaps back to the
/// beginning of the slot it falls in; anything outside both slots is an
/// error, with the lunch gap (1pm-2pm) called out explicitly.
fn snap_half_day_start(t: DateTime<Utc>) -> Result<DateTime<Utc>, EngineError> {
    let morning_start = with_time(t, 9, 0);
    let morning_end = with_time(t, 13, 0);
    if t >= morning_start && t < morning_end {
        return Ok(morning_start);
    }

    let afternoon_start = with_time(t, 14, 0);
    let afternoon_end = with_time(t, 18, 0);
    if t >= afternoon_start && t < afternoon_end {
        Ok(afternoon_start)
    } else if t < morning_start {
        Err(EngineError::ConstraintViolation(
            "Cannot book a half-day start time that is before 9am".to_string(),
        ))
    } else if t >= afternoon_end {
        Err(EngineError::ConstraintViolation(
            "Cannot book a half-day start time that is after 6pm".to_string(),
        ))
    } else {
        Err(EngineError::ConstraintViolation(
            "Cannot book a half-day start time that is during the lunch break (1pm-2pm)"
                .to_string(),
        ))
    }
}

/// Ends snap forward to the end of their slot; the acceptance windows shift
/// by one instant relative to starts so a 1pm end means "the morning slot".
fn snap_half_day_end(t: DateTime<Utc>) -> Result<DateTime<Utc>, EngineError> {
    let morning_start = with_time(t, 9, 0);
    let morning_end = with_time(t, 13, 0);
    if t > morning_start && t <= morning_end {
        return Ok(morning_end);
    }

    let afternoon_start = with_time(t, 14, 0);
    let afternoon_end = with_time(t, 18, 0);
    if t > afternoon_start && t <= afternoon_end {
        Ok(afternoon_end)
    } else if t <= morning_start {
        Err(EngineError::ConstraintViolation(
            "Cannot book a half-day end time that is before 9am".to_string(),
        ))
    } else if t > afternoon_end {
        Err(EngineError::ConstraintViolation(
            "Cannot book a half-day end time that is after 6pm".to_string(),
        ))
    } else {
        Err(EngineError::ConstraintViolation(
            "Cannot book a half-day end time that is during the lunch break (1pm-2pm)".to_string(),
        ))
    }
}

fn truncate_to_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    t.with_second(0).unwrap().with_nanosecond(0).unwrap()
}

fn with_minute_zero(t: DateTime<Utc>) -> DateTime<Utc> {
    t.with_minute(0).unwrap()
}

/// Same calendar day, fixed wall-clock time. Always valid in UTC.
fn with_time(t: DateTime<Utc>, hour: u32, minute: u32) -> DateTime<Utc> {
    t.date_naive()
        .and_hms_opt(hour, minute, 0)
        .unwrap()
        .and_utc()
}
