use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};

use super::*;
use crate::access::{AccessGate, AclTable, AllowAll, Role};
use crate::calendar::RecordingCalendar;
use crate::clock::ManualClock;
use crate::requirements::{AllowedValues, Requirement, RequirementKind, RequirementSet};

/// Monday 2024-03-04 at the given wall-clock time.
fn monday(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 4, h, m, 0).unwrap()
}

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("benchbook_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

struct Bench {
    engine: Arc<Engine>,
    clock: Arc<ManualClock>,
    calendar: Arc<RecordingCalendar>,
}

/// Engine with an open gate, a recording calendar sink and a manual clock
/// parked at Monday 08:00.
async fn bench(name: &str) -> Bench {
    bench_with_gate(name, Arc::new(AllowAll)).await
}

async fn bench_with_gate(name: &str, gate: Arc<dyn AccessGate>) -> Bench {
    let clock = Arc::new(ManualClock::new(monday(8, 0)));
    let calendar = Arc::new(RecordingCalendar::new());
    let engine = Engine::new(
        test_wal_path(name),
        Arc::new(NotifyHub::new()),
        Collaborators {
            ledger: Arc::new(MemoryLedger::new()),
            gate,
            calendar: calendar.clone(),
            clock: clock.clone(),
        },
    )
    .await
    .unwrap();
    Bench {
        engine: Arc::new(engine),
        clock,
        calendar,
    }
}

fn hour_unit() -> BookingConstraint {
    BookingConstraint {
        unit: BookingUnit::Hour,
        ..Default::default()
    }
}

async fn hour_equipment(b: &Bench, name: &str) -> Equipment {
    b.engine
        .create_equipment(name, hour_unit(), RequirementSet::default())
        .await
        .unwrap()
}

fn no_answers() -> HashMap<String, String> {
    HashMap::new()
}

async fn status_of(b: &Bench, id: ulid::Ulid) -> BookingStatus {
    b.engine.get_reservation(id).await.unwrap().1.status
}

/// Wait for the background sync worker to catch up.
async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("background condition never reached");
}

// ── Equipment configuration ──────────────────────────────

#[tokio::test]
async fn create_and_find_equipment() {
    let b = bench("create_equipment.wal").await;
    let eq = hour_equipment(&b, "confocal microscope").await;

    assert_eq!(b.engine.get_equipment(eq.id).unwrap().name, "confocal microscope");
    assert_eq!(b.engine.find_equipment("confocal microscope").unwrap().id, eq.id);
    assert!(b.engine.find_equipment("electron microscope").is_none());
}

#[tokio::test]
async fn duplicate_equipment_name_rejected() {
    let b = bench("dup_equipment.wal").await;
    hour_equipment(&b, "sequencer").await;
    let result = b
        .engine
        .create_equipment("sequencer", hour_unit(), RequirementSet::default())
        .await;
    assert!(matches!(result, Err(EngineError::AlreadyExists(_))));
}

#[tokio::test]
async fn rename_invalidates_old_name() {
    let b = bench("rename_equipment.wal").await;
    let eq = hour_equipment(&b, "old-scope").await;

    b.engine
        .rename_equipment("grace@lab.example", eq.id, "new-scope")
        .await
        .unwrap();

    assert!(b.engine.find_equipment("old-scope").is_none());
    assert_eq!(b.engine.find_equipment("new-scope").unwrap().id, eq.id);
}

#[tokio::test]
async fn delete_equipment_clears_its_bookings() {
    let b = bench("delete_equipment.wal").await;
    let eq = hour_equipment(&b, "shaker").await;
    let r = b
        .engine
        .make_reservation(eq.id, "ada@lab.example", monday(10, 0), monday(11, 0))
        .await
        .unwrap();

    b.engine
        .delete_equipment("grace@lab.example", eq.id)
        .await
        .unwrap();

    assert!(b.engine.get_equipment(eq.id).is_none());
    assert!(b.engine.find_equipment("shaker").is_none());
    assert!(b.engine.get_reservation(r.id).await.is_none());
}

// ── MakeReservation: validation path ─────────────────────

#[tokio::test]
async fn reservation_on_unknown_equipment_fails() {
    let b = bench("unknown_equipment.wal").await;
    let result = b
        .engine
        .make_reservation(ulid::Ulid::new(), "ada@lab.example", monday(10, 0), monday(11, 0))
        .await;
    assert!(matches!(result, Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn reservation_in_the_past_rejected() {
    let b = bench("past_start.wal").await;
    let eq = hour_equipment(&b, "hplc").await;
    b.clock.set(monday(12, 0));

    let result = b
        .engine
        .make_reservation(eq.id, "ada@lab.example", monday(10, 0), monday(11, 0))
        .await;
    match result {
        Err(EngineError::ConstraintViolation(msg)) => assert!(msg.contains("in the past")),
        other => panic!("expected ConstraintViolation, got {other:?}"),
    }
    // The rejected request leaves no row behind
    let rows = b
        .engine
        .list_bookings(&BookingFilter::for_equipment(eq.id))
        .await
        .unwrap();
    assert!(rows.is_empty());
}

#[tokio::test]
async fn day_unit_snaps_through_booking_path() {
    let b = bench("day_snap.wal").await;
    let con = BookingConstraint {
        unit: BookingUnit::Day,
        ..Default::default()
    };
    let eq = b
        .engine
        .create_equipment("freeze dryer", con, RequirementSet::default())
        .await
        .unwrap();

    // Tuesday 2024-03-05, 11:17 → 15:40 snaps to the full 9am-6pm day
    let start = Utc.with_ymd_and_hms(2024, 3, 5, 11, 17, 0).unwrap();
    let end = Utc.with_ymd_and_hms(2024, 3, 5, 15, 40, 0).unwrap();
    let r = b
        .engine
        .make_reservation(eq.id, "ada@lab.example", start, end)
        .await
        .unwrap();

    assert_eq!(r.span.start, Utc.with_ymd_and_hms(2024, 3, 5, 9, 0, 0).unwrap());
    assert_eq!(r.span.end, Utc.with_ymd_and_hms(2024, 3, 5, 18, 0, 0).unwrap());
}

#[tokio::test]
async fn half_day_lunch_gap_rejected_through_booking_path() {
    let b = bench("half_day_lunch.wal").await;
    let con = BookingConstraint {
        unit: BookingUnit::HalfDay,
        ..Default::default()
    };
    let eq = b
        .engine
        .create_equipment("nmr", con, RequirementSet::default())
        .await
        .unwrap();

    let result = b
        .engine
        .make_reservation(eq.id, "ada@lab.example", monday(13, 30), monday(17, 0))
        .await;
    match result {
        Err(EngineError::ConstraintViolation(msg)) => assert!(msg.contains("lunch break")),
        other => panic!("expected ConstraintViolation, got {other:?}"),
    }

    // The exact morning slot goes through unchanged
    let r = b
        .engine
        .make_reservation(eq.id, "ada@lab.example", monday(9, 0), monday(13, 0))
        .await
        .unwrap();
    assert_eq!(r.span, Span::new(monday(9, 0), monday(13, 0)));
}

#[tokio::test]
async fn min_duration_boundary_through_booking_path() {
    let b = bench("min_duration.wal").await;
    let con = BookingConstraint {
        min_minutes: Some(30),
        ..Default::default()
    };
    let eq = b
        .engine
        .create_equipment("sonicator", con, RequirementSet::default())
        .await
        .unwrap();

    // Exactly at the bound is fine
    b.engine
        .make_reservation(eq.id, "ada@lab.example", monday(10, 0), monday(10, 30))
        .await
        .unwrap();

    // One minute under fails
    let result = b
        .engine
        .make_reservation(eq.id, "ada@lab.example", monday(12, 0), monday(12, 29))
        .await;
    match result {
        Err(EngineError::ConstraintViolation(msg)) => assert!(msg.contains("too short")),
        other => panic!("expected ConstraintViolation, got {other:?}"),
    }
}

// ── MakeReservation: conflicts and the tie-break ─────────

#[tokio::test]
async fn later_request_loses_and_earlier_stays_reserved() {
    let b = bench("conflict_later_loses.wal").await;
    let eq = hour_equipment(&b, "sequencer").await;

    let first = b
        .engine
        .make_reservation(eq.id, "ada@lab.example", monday(10, 0), monday(11, 0))
        .await
        .unwrap();

    b.clock.advance(Duration::minutes(1));
    let result = b
        .engine
        .make_reservation(eq.id, "bob@lab.example", monday(10, 30), monday(11, 30))
        .await;

    match result {
        Err(EngineError::BookingConflict { blockers }) => {
            assert_eq!(blockers.len(), 1);
            assert_eq!(blockers[0].id, first.id);
            assert!(blockers[0].describe().contains("ada@lab.example"));
        }
        other => panic!("expected BookingConflict, got {other:?}"),
    }

    assert_eq!(status_of(&b, first.id).await, BookingStatus::Reserved);
    // The losing candidate's row was deleted again
    let rows = b
        .engine
        .list_bookings(&BookingFilter::for_equipment(eq.id))
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
}

#[tokio::test]
async fn earlier_claim_wins_and_evicts_later_row() {
    let b = bench("win_and_evict.wal").await;
    let eq = hour_equipment(&b, "sequencer").await;

    // First request arrives with the LATER creation stamp (out-of-order
    // clocks between frontends).
    b.clock.set(monday(8, 5));
    let late = b
        .engine
        .make_reservation(eq.id, "ada@lab.example", monday(10, 0), monday(11, 0))
        .await
        .unwrap();

    b.clock.set(monday(8, 0));
    let early = b
        .engine
        .make_reservation(eq.id, "bob@lab.example", monday(10, 30), monday(11, 30))
        .await
        .unwrap();

    assert_eq!(status_of(&b, early.id).await, BookingStatus::Reserved);
    assert_eq!(status_of(&b, late.id).await, BookingStatus::Cancelled);
}

#[tokio::test]
async fn created_at_tie_later_user_wins_regardless_of_order() {
    // Both orders of arrival, same fixed clock: zoe must win both times.
    for (name, first_user, second_user) in [
        ("tie_a.wal", "ada@lab.example", "zoe@lab.example"),
        ("tie_b.wal", "zoe@lab.example", "ada@lab.example"),
    ] {
        let b = bench(name).await;
        let eq = hour_equipment(&b, "sequencer").await;

        let first = b
            .engine
            .make_reservation(eq.id, first_user, monday(10, 0), monday(11, 0))
            .await;
        let second = b
            .engine
            .make_reservation(eq.id, second_user, monday(10, 0), monday(11, 0))
            .await;

        let rows = b
            .engine
            .list_bookings(&BookingFilter::for_equipment(eq.id))
            .await
            .unwrap();
        let reserved: Vec<_> = rows
            .iter()
            .filter(|r| r.status == BookingStatus::Reserved)
            .collect();
        assert_eq!(reserved.len(), 1, "order {first_user} then {second_user}");
        assert_eq!(reserved[0].user, "zoe@lab.example");

        // Whichever call zoe made succeeded; ada's either conflicted or was
        // evicted after the fact.
        if first_user == "zoe@lab.example" {
            assert!(first.is_ok());
            assert!(matches!(second, Err(EngineError::BookingConflict { .. })));
        } else {
            assert!(first.is_ok());
            assert!(second.is_ok());
        }
    }
}

#[tokio::test]
async fn touching_windows_both_succeed() {
    let b = bench("touching_windows.wal").await;
    let eq = hour_equipment(&b, "sequencer").await;

    b.engine
        .make_reservation(eq.id, "ada@lab.example", monday(10, 0), monday(11, 0))
        .await
        .unwrap();
    b.engine
        .make_reservation(eq.id, "bob@lab.example", monday(11, 0), monday(12, 0))
        .await
        .unwrap();
}

#[tokio::test]
async fn confirmed_booking_always_blocks() {
    let b = bench("confirmed_blocks.wal").await;
    let eq = hour_equipment(&b, "sequencer").await;

    let r = b
        .engine
        .make_reservation(eq.id, "ada@lab.example", monday(10, 0), monday(11, 0))
        .await
        .unwrap();
    b.engine
        .confirm_reservation("ada@lab.example", r.id, Some("proj-1"), &no_answers())
        .await
        .unwrap();

    // Even a request with an earlier creation stamp loses to confirmed.
    b.clock.set(monday(7, 0));
    let result = b
        .engine
        .make_reservation(eq.id, "bob@lab.example", monday(10, 30), monday(11, 30))
        .await;
    assert!(matches!(result, Err(EngineError::BookingConflict { .. })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_claims_produce_exactly_one_winner() {
    let b = bench("race_one_winner.wal").await;
    let eq = hour_equipment(&b, "sequencer").await;

    let users = [
        "ada@lab.example",
        "bob@lab.example",
        "eve@lab.example",
        "mia@lab.example",
        "zoe@lab.example",
    ];

    let mut handles = Vec::new();
    for user in users {
        let engine = b.engine.clone();
        let eq_id = eq.id;
        handles.push(tokio::spawn(async move {
            engine
                .make_reservation(eq_id, user, monday(10, 0), monday(11, 0))
                .await
        }));
    }
    for h in handles {
        let _ = h.await.unwrap();
    }

    // At quiescence: every creation stamp was identical, so the
    // alphabetically last user holds the only live claim.
    let rows = b
        .engine
        .list_bookings(&BookingFilter::for_equipment(eq.id))
        .await
        .unwrap();
    let reserved: Vec<_> = rows
        .iter()
        .filter(|r| r.status == BookingStatus::Reserved)
        .collect();
    assert_eq!(reserved.len(), 1);
    assert_eq!(reserved[0].user, "zoe@lab.example");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn confirmed_windows_never_overlap_after_racing() {
    let b = bench("race_no_double_booking.wal").await;
    let eq = hour_equipment(&b, "sequencer").await;

    // Overlapping window pattern: 9-11, 10-12, 11-13, 12-14, ...
    let mut handles = Vec::new();
    for (i, user) in ["a@x", "b@x", "c@x", "d@x", "e@x", "f@x"].iter().enumerate() {
        let engine = b.engine.clone();
        let eq_id = eq.id;
        let user = user.to_string();
        let start = monday(9 + i as u32, 0);
        let end = monday(11 + i as u32, 0);
        handles.push(tokio::spawn(async move {
            engine.make_reservation(eq_id, &user, start, end).await
        }));
    }
    for h in handles {
        let _ = h.await.unwrap();
    }

    // Confirm every surviving claim, then check the invariant.
    let rows = b
        .engine
        .list_bookings(&BookingFilter::for_equipment(eq.id))
        .await
        .unwrap();
    for r in rows.iter().filter(|r| r.status == BookingStatus::Reserved) {
        b.engine
            .confirm_reservation(&r.user, r.id, None, &no_answers())
            .await
            .unwrap();
    }

    let confirmed = b
        .engine
        .list_bookings(&BookingFilter {
            equipment: Some(eq.id),
            status: Some(BookingStatus::Confirmed),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(!confirmed.is_empty());
    for (i, a) in confirmed.iter().enumerate() {
        for other in &confirmed[i + 1..] {
            assert!(
                !a.span.overlaps(&other.span),
                "confirmed bookings overlap: {} and {}",
                a.describe(),
                other.describe()
            );
        }
    }
}

// ── Confirm and the requirement questionnaire ────────────

#[tokio::test]
async fn confirm_transitions_to_confirmed() {
    let b = bench("confirm_basic.wal").await;
    let eq = hour_equipment(&b, "sequencer").await;
    let r = b
        .engine
        .make_reservation(eq.id, "ada@lab.example", monday(10, 0), monday(11, 0))
        .await
        .unwrap();

    let confirmed = b
        .engine
        .confirm_reservation("ada@lab.example", r.id, Some("rna-prep"), &no_answers())
        .await
        .unwrap();

    assert_eq!(confirmed.status, BookingStatus::Confirmed);
    assert_eq!(confirmed.project.as_deref(), Some("rna-prep"));
    // No calendar attached → nothing to link
    assert!(confirmed.external_calendar_id.is_none());
}

#[tokio::test]
async fn confirm_twice_is_invalid_transition() {
    let b = bench("confirm_twice.wal").await;
    let eq = hour_equipment(&b, "sequencer").await;
    let r = b
        .engine
        .make_reservation(eq.id, "ada@lab.example", monday(10, 0), monday(11, 0))
        .await
        .unwrap();

    b.engine
        .confirm_reservation("ada@lab.example", r.id, None, &no_answers())
        .await
        .unwrap();
    let result = b
        .engine
        .confirm_reservation("ada@lab.example", r.id, None, &no_answers())
        .await;
    assert!(matches!(
        result,
        Err(EngineError::InvalidStateTransition {
            operation: "confirm",
            ..
        })
    ));
}

fn spin_requirements(needs_authorization: bool) -> RequirementSet {
    let mut set = RequirementSet {
        needs_authorization,
        ..Default::default()
    };
    set.set(Requirement::new(
        "spin speed",
        RequirementKind::SpinSpeed,
        AllowedValues::parse("1000-15000").unwrap(),
    ));
    set.set(Requirement::new(
        "temperature",
        RequirementKind::Temperature,
        AllowedValues::parse("-20, 4, 20").unwrap(),
    ));
    set
}

#[tokio::test]
async fn confirm_validates_requirement_answers() {
    let b = bench("confirm_requirements.wal").await;
    let eq = b
        .engine
        .create_equipment("centrifuge", hour_unit(), spin_requirements(false))
        .await
        .unwrap();
    let r = b
        .engine
        .make_reservation(eq.id, "ada@lab.example", monday(10, 0), monday(11, 0))
        .await
        .unwrap();

    // Out-of-range speed and missing temperature: both failures reported
    let mut bad = HashMap::new();
    bad.insert("spin speed".to_string(), "20000".to_string());
    match b
        .engine
        .confirm_reservation("ada@lab.example", r.id, None, &bad)
        .await
    {
        Err(EngineError::RequirementValidation(errors)) => assert_eq!(errors.len(), 2),
        other => panic!("expected RequirementValidation, got {other:?}"),
    }
    // The failed confirm left the reservation untouched
    assert_eq!(status_of(&b, r.id).await, BookingStatus::Reserved);

    let mut good = HashMap::new();
    good.insert("spin speed".to_string(), "12000 rpm".to_string());
    good.insert("temperature".to_string(), "4".to_string());
    let confirmed = b
        .engine
        .confirm_reservation("ada@lab.example", r.id, None, &good)
        .await
        .unwrap();

    assert_eq!(confirmed.status, BookingStatus::Confirmed);
    let values: HashMap<_, _> = confirmed
        .requirement_values
        .iter()
        .map(|v| (v.name.as_str(), v.value.as_str()))
        .collect();
    assert_eq!(values["spin speed"], "12000");
    assert_eq!(values["temperature"], "4");
}

#[tokio::test]
async fn confirm_lands_in_pending_when_authorization_required() {
    let b = bench("confirm_pending.wal").await;
    let eq = b
        .engine
        .create_equipment("centrifuge", hour_unit(), spin_requirements(true))
        .await
        .unwrap();
    let r = b
        .engine
        .make_reservation(eq.id, "ada@lab.example", monday(10, 0), monday(11, 0))
        .await
        .unwrap();

    let mut answers = HashMap::new();
    answers.insert("spin speed".to_string(), "5000".to_string());
    answers.insert("temperature".to_string(), "-20".to_string());
    let pending = b
        .engine
        .confirm_reservation("ada@lab.example", r.id, None, &answers)
        .await
        .unwrap();
    assert_eq!(pending.status, BookingStatus::PendingAuthorization);

    let listed = b.engine.pending_bookings(eq.id).await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, r.id);

    let authorized = b
        .engine
        .authorize_reservation("grace@lab.example", r.id)
        .await
        .unwrap();
    assert_eq!(authorized.status, BookingStatus::Confirmed);
    assert!(b.engine.pending_bookings(eq.id).await.is_empty());
}

#[tokio::test]
async fn pending_booking_does_not_block_competitors() {
    let b = bench("pending_not_blocking.wal").await;
    let eq = b
        .engine
        .create_equipment("centrifuge", hour_unit(), spin_requirements(true))
        .await
        .unwrap();
    let r = b
        .engine
        .make_reservation(eq.id, "ada@lab.example", monday(10, 0), monday(11, 0))
        .await
        .unwrap();
    let mut answers = HashMap::new();
    answers.insert("spin speed".to_string(), "5000".to_string());
    answers.insert("temperature".to_string(), "4".to_string());
    b.engine
        .confirm_reservation("ada@lab.example", r.id, None, &answers)
        .await
        .unwrap();

    // A booking awaiting authorization holds no claim on the window.
    b.clock.advance(Duration::minutes(1));
    b.engine
        .make_reservation(eq.id, "bob@lab.example", monday(10, 0), monday(11, 0))
        .await
        .unwrap();
}

#[tokio::test]
async fn deny_stores_reason_and_is_terminal() {
    let b = bench("deny.wal").await;
    let eq = b
        .engine
        .create_equipment("centrifuge", hour_unit(), spin_requirements(true))
        .await
        .unwrap();
    let r = b
        .engine
        .make_reservation(eq.id, "ada@lab.example", monday(10, 0), monday(11, 0))
        .await
        .unwrap();
    let mut answers = HashMap::new();
    answers.insert("spin speed".to_string(), "5000".to_string());
    answers.insert("temperature".to_string(), "20".to_string());
    b.engine
        .confirm_reservation("ada@lab.example", r.id, None, &answers)
        .await
        .unwrap();

    let denied = b
        .engine
        .deny_reservation("grace@lab.example", r.id, "no training record")
        .await
        .unwrap();
    assert_eq!(denied.status, BookingStatus::Denied);
    assert_eq!(denied.denied_reason.as_deref(), Some("no training record"));

    // Terminal: no cancel, no authorize
    let result = b.engine.cancel_reservation("ada@lab.example", r.id).await;
    assert!(matches!(result, Err(EngineError::InvalidStateTransition { .. })));
    let result = b.engine.authorize_reservation("grace@lab.example", r.id).await;
    assert!(matches!(result, Err(EngineError::InvalidStateTransition { .. })));
}

#[tokio::test]
async fn deny_requires_pending_state() {
    let b = bench("deny_wrong_state.wal").await;
    let eq = hour_equipment(&b, "sequencer").await;
    let r = b
        .engine
        .make_reservation(eq.id, "ada@lab.example", monday(10, 0), monday(11, 0))
        .await
        .unwrap();

    let result = b
        .engine
        .deny_reservation("grace@lab.example", r.id, "nope")
        .await;
    assert!(matches!(
        result,
        Err(EngineError::InvalidStateTransition {
            operation: "deny",
            ..
        })
    ));
}

// ── Calendar linkage ─────────────────────────────────────

#[tokio::test]
async fn confirm_links_calendar_event() {
    let b = bench("calendar_link.wal").await;
    let eq = hour_equipment(&b, "sequencer").await;
    b.engine
        .attach_calendar("grace@lab.example", eq.id, "cal-bio")
        .await
        .unwrap();

    let r = b
        .engine
        .make_reservation(eq.id, "ada@lab.example", monday(10, 0), monday(11, 0))
        .await
        .unwrap();
    let confirmed = b
        .engine
        .confirm_reservation("ada@lab.example", r.id, None, &no_answers())
        .await
        .unwrap();

    let external_id = confirmed.external_calendar_id.expect("linked event id");
    let event = b.calendar.event(&external_id).expect("event in sink");
    assert_eq!(event.summary, "ada@lab.example");
    assert_eq!(event.status, BookingStatus::Confirmed);
}

#[tokio::test]
async fn confirm_survives_calendar_failure() {
    let b = bench("calendar_failure.wal").await;
    let eq = hour_equipment(&b, "sequencer").await;
    b.engine
        .attach_calendar("grace@lab.example", eq.id, "cal-bio")
        .await
        .unwrap();

    let r = b
        .engine
        .make_reservation(eq.id, "ada@lab.example", monday(10, 0), monday(11, 0))
        .await
        .unwrap();

    b.calendar.fail_next(1);
    let confirmed = b
        .engine
        .confirm_reservation("ada@lab.example", r.id, None, &no_answers())
        .await
        .unwrap();

    // Confirm completed, just without a mirror event.
    assert_eq!(confirmed.status, BookingStatus::Confirmed);
    assert!(confirmed.external_calendar_id.is_none());
    assert_eq!(b.calendar.event_count(), 0);
}

#[tokio::test]
async fn full_cancel_removes_calendar_event() {
    let b = bench("cancel_removes_event.wal").await;
    let eq = hour_equipment(&b, "sequencer").await;
    b.engine
        .attach_calendar("grace@lab.example", eq.id, "cal-bio")
        .await
        .unwrap();

    let r = b
        .engine
        .make_reservation(eq.id, "ada@lab.example", monday(10, 0), monday(11, 0))
        .await
        .unwrap();
    b.engine
        .confirm_reservation("ada@lab.example", r.id, None, &no_answers())
        .await
        .unwrap();
    assert_eq!(b.calendar.event_count(), 1);

    let outcome = b
        .engine
        .cancel_reservation("ada@lab.example", r.id)
        .await
        .unwrap();
    assert_eq!(outcome, CancellationOutcome::BookingCancelled);
    assert_eq!(status_of(&b, r.id).await, BookingStatus::Cancelled);

    let calendar = b.calendar.clone();
    eventually(move || calendar.event_count() == 0).await;
}

// ── Cancellation and the temporal guards ─────────────────

#[tokio::test]
async fn cancel_reserved_row_outright() {
    let b = bench("cancel_reserved.wal").await;
    let eq = hour_equipment(&b, "sequencer").await;
    let r = b
        .engine
        .make_reservation(eq.id, "ada@lab.example", monday(10, 0), monday(11, 0))
        .await
        .unwrap();

    let outcome = b
        .engine
        .cancel_reservation("ada@lab.example", r.id)
        .await
        .unwrap();
    assert_eq!(outcome, CancellationOutcome::ReservationCancelled);
    assert_eq!(outcome.to_string(), "The reservation has been cancelled");
    assert_eq!(status_of(&b, r.id).await, BookingStatus::Cancelled);
}

#[tokio::test]
async fn running_booking_is_truncated_not_cancelled() {
    let b = bench("partial_cancel.wal").await;
    let eq = hour_equipment(&b, "sequencer").await;
    let r = b
        .engine
        .make_reservation(eq.id, "ada@lab.example", monday(10, 0), monday(14, 0))
        .await
        .unwrap();
    b.engine
        .confirm_reservation("ada@lab.example", r.id, None, &no_answers())
        .await
        .unwrap();

    b.clock.set(monday(12, 0));
    let outcome = b
        .engine
        .cancel_reservation("ada@lab.example", r.id)
        .await
        .unwrap();
    assert_eq!(outcome, CancellationOutcome::RemainderCancelled);

    let (_, row) = b.engine.get_reservation(r.id).await.unwrap();
    assert_eq!(row.status, BookingStatus::Confirmed);
    assert_eq!(row.span.end, monday(12, 0));
    assert_eq!(row.span.start, monday(10, 0));
}

#[tokio::test]
async fn truncation_updates_calendar_event_in_place() {
    let b = bench("truncate_updates_event.wal").await;
    let eq = hour_equipment(&b, "sequencer").await;
    b.engine
        .attach_calendar("grace@lab.example", eq.id, "cal-bio")
        .await
        .unwrap();
    let r = b
        .engine
        .make_reservation(eq.id, "ada@lab.example", monday(10, 0), monday(14, 0))
        .await
        .unwrap();
    let confirmed = b
        .engine
        .confirm_reservation("ada@lab.example", r.id, None, &no_answers())
        .await
        .unwrap();
    let external_id = confirmed.external_calendar_id.unwrap();

    b.clock.set(monday(12, 0));
    b.engine
        .cancel_reservation("ada@lab.example", r.id)
        .await
        .unwrap();

    // Updated, not removed
    let calendar = b.calendar.clone();
    let ext = external_id.clone();
    eventually(move || {
        calendar
            .event(&ext)
            .is_some_and(|e| e.end == monday(12, 0))
    })
    .await;
    assert!(b.calendar.removed_ids().is_empty());
}

#[tokio::test]
async fn finished_booking_cannot_be_cancelled() {
    let b = bench("cancel_past.wal").await;
    let eq = hour_equipment(&b, "sequencer").await;
    let r = b
        .engine
        .make_reservation(eq.id, "ada@lab.example", monday(10, 0), monday(11, 0))
        .await
        .unwrap();
    b.engine
        .confirm_reservation("ada@lab.example", r.id, None, &no_answers())
        .await
        .unwrap();

    b.clock.set(monday(11, 0));
    let result = b.engine.cancel_reservation("ada@lab.example", r.id).await;
    match result {
        Err(EngineError::TemporalGuard(msg)) => assert!(msg.contains("in the past")),
        other => panic!("expected TemporalGuard, got {other:?}"),
    }
}

#[tokio::test]
async fn authorize_guards_past_and_started() {
    let b = bench("authorize_guards.wal").await;
    let eq = b
        .engine
        .create_equipment("centrifuge", hour_unit(), spin_requirements(true))
        .await
        .unwrap();
    let r = b
        .engine
        .make_reservation(eq.id, "ada@lab.example", monday(10, 0), monday(11, 0))
        .await
        .unwrap();
    let mut answers = HashMap::new();
    answers.insert("spin speed".to_string(), "5000".to_string());
    answers.insert("temperature".to_string(), "4".to_string());
    b.engine
        .confirm_reservation("ada@lab.example", r.id, None, &answers)
        .await
        .unwrap();

    // Already started: authorization would hand over a partially used slot.
    b.clock.set(monday(10, 30));
    let result = b.engine.authorize_reservation("grace@lab.example", r.id).await;
    match result {
        Err(EngineError::TemporalGuard(msg)) => assert!(msg.contains("already started")),
        other => panic!("expected TemporalGuard, got {other:?}"),
    }

    // Finished: nothing left to authorize.
    b.clock.set(monday(11, 0));
    let result = b.engine.authorize_reservation("grace@lab.example", r.id).await;
    match result {
        Err(EngineError::TemporalGuard(msg)) => assert!(msg.contains("in the past")),
        other => panic!("expected TemporalGuard, got {other:?}"),
    }
}

#[tokio::test]
async fn delete_reservation_removes_row() {
    let b = bench("delete_reservation.wal").await;
    let eq = hour_equipment(&b, "sequencer").await;
    let r = b
        .engine
        .make_reservation(eq.id, "ada@lab.example", monday(10, 0), monday(11, 0))
        .await
        .unwrap();

    b.engine
        .delete_reservation("grace@lab.example", r.id)
        .await
        .unwrap();
    assert!(b.engine.get_reservation(r.id).await.is_none());
}

// ── Access control ───────────────────────────────────────

#[tokio::test]
async fn unauthorized_user_cannot_reserve() {
    let acl = Arc::new(AclTable::new());
    let b = bench_with_gate("acl_reserve.wal", acl.clone()).await;
    let eq = hour_equipment(&b, "sequencer").await;

    let result = b
        .engine
        .make_reservation(eq.id, "ada@lab.example", monday(10, 0), monday(11, 0))
        .await;
    assert!(matches!(result, Err(EngineError::PermissionDenied { .. })));

    acl.set_role(eq.id, "ada@lab.example", Role::Authorized);
    b.engine
        .make_reservation(eq.id, "ada@lab.example", monday(10, 0), monday(11, 0))
        .await
        .unwrap();
}

#[tokio::test]
async fn only_admins_touch_configuration() {
    let acl = Arc::new(AclTable::new());
    let b = bench_with_gate("acl_config.wal", acl.clone()).await;
    let eq = hour_equipment(&b, "sequencer").await;
    acl.set_role(eq.id, "ada@lab.example", Role::Authorized);

    let result = b
        .engine
        .update_constraint("ada@lab.example", eq.id, hour_unit())
        .await;
    assert!(matches!(result, Err(EngineError::PermissionDenied { .. })));

    acl.set_role(eq.id, "grace@lab.example", Role::Administrator);
    b.engine
        .update_constraint("grace@lab.example", eq.id, hour_unit())
        .await
        .unwrap();
}

#[tokio::test]
async fn only_owner_or_admin_cancels() {
    let acl = Arc::new(AclTable::new());
    let b = bench_with_gate("acl_cancel.wal", acl.clone()).await;
    let eq = hour_equipment(&b, "sequencer").await;
    acl.set_role(eq.id, "ada@lab.example", Role::Authorized);
    acl.set_role(eq.id, "bob@lab.example", Role::Authorized);
    acl.set_role(eq.id, "grace@lab.example", Role::Administrator);

    let r = b
        .engine
        .make_reservation(eq.id, "ada@lab.example", monday(10, 0), monday(11, 0))
        .await
        .unwrap();

    // Another authorized user is not enough
    let result = b.engine.cancel_reservation("bob@lab.example", r.id).await;
    assert!(matches!(result, Err(EngineError::PermissionDenied { .. })));

    // An administrator may cancel on the owner's behalf
    b.engine
        .cancel_reservation("grace@lab.example", r.id)
        .await
        .unwrap();
}

// ── Listings ─────────────────────────────────────────────

#[tokio::test]
async fn listings_filter_and_sort() {
    let b = bench("listings.wal").await;
    let eq_a = hour_equipment(&b, "sequencer").await;
    let eq_b = hour_equipment(&b, "microscope").await;

    let r1 = b
        .engine
        .make_reservation(eq_a.id, "ada@lab.example", monday(12, 0), monday(13, 0))
        .await
        .unwrap();
    b.engine
        .make_reservation(eq_a.id, "bob@lab.example", monday(9, 0), monday(10, 0))
        .await
        .unwrap();
    b.engine
        .make_reservation(eq_b.id, "ada@lab.example", monday(9, 0), monday(10, 0))
        .await
        .unwrap();
    b.engine
        .confirm_reservation("ada@lab.example", r1.id, None, &no_answers())
        .await
        .unwrap();

    // Per equipment, sorted by start
    let rows = b
        .engine
        .list_bookings(&BookingFilter::for_equipment(eq_a.id))
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows[0].span.start < rows[1].span.start);

    // Per user, across equipment
    let rows = b
        .engine
        .list_bookings(&BookingFilter::for_user("ada@lab.example"))
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);

    // By status
    let rows = b
        .engine
        .list_bookings(&BookingFilter {
            equipment: Some(eq_a.id),
            status: Some(BookingStatus::Confirmed),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, r1.id);
}

#[tokio::test]
async fn listing_range_is_swapped_and_degenerate_is_empty() {
    let b = bench("listing_range.wal").await;
    let eq = hour_equipment(&b, "sequencer").await;
    b.engine
        .make_reservation(eq.id, "ada@lab.example", monday(10, 0), monday(11, 0))
        .await
        .unwrap();

    // Inverted range is swapped rather than rejected
    let rows = b
        .engine
        .list_bookings(&BookingFilter {
            equipment: Some(eq.id),
            range: Some((monday(12, 0), monday(9, 0))),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);

    // Degenerate range matches nothing
    let rows = b
        .engine
        .list_bookings(&BookingFilter {
            equipment: Some(eq.id),
            range: Some((monday(10, 30), monday(10, 30))),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(rows.is_empty());

    // A booking that merely touches the range start is excluded...
    let rows = b
        .engine
        .list_bookings(&BookingFilter {
            equipment: Some(eq.id),
            range: Some((monday(11, 0), monday(12, 0))),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(rows.is_empty());

    // ...but one starting exactly at the range end is included.
    let rows = b
        .engine
        .list_bookings(&BookingFilter {
            equipment: Some(eq.id),
            range: Some((monday(9, 0), monday(10, 0))),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
}

// ── Notifications ────────────────────────────────────────

#[tokio::test]
async fn booking_events_reach_subscribers() {
    let b = bench("notify_events.wal").await;
    let eq = hour_equipment(&b, "sequencer").await;
    let mut rx = b.engine.notify.subscribe(eq.id);

    let r = b
        .engine
        .make_reservation(eq.id, "ada@lab.example", monday(10, 0), monday(11, 0))
        .await
        .unwrap();

    match rx.recv().await.unwrap() {
        Event::ReservationCreated { reservation, .. } => assert_eq!(reservation.id, r.id),
        other => panic!("expected ReservationCreated, got {other:?}"),
    }
}

// ── Durability ───────────────────────────────────────────

async fn reopen(path: &std::path::Path, clock: Arc<ManualClock>) -> Engine {
    Engine::new(
        path.to_path_buf(),
        Arc::new(NotifyHub::new()),
        Collaborators {
            ledger: Arc::new(MemoryLedger::new()),
            gate: Arc::new(AllowAll),
            calendar: Arc::new(RecordingCalendar::new()),
            clock,
        },
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn state_survives_restart() {
    let path = test_wal_path("restart.wal");
    let clock = Arc::new(ManualClock::new(monday(8, 0)));
    let calendar = Arc::new(RecordingCalendar::new());

    let (eq_id, confirmed_id, cancelled_id) = {
        let engine = Engine::new(
            path.clone(),
            Arc::new(NotifyHub::new()),
            Collaborators {
                ledger: Arc::new(MemoryLedger::new()),
                gate: Arc::new(AllowAll),
                calendar: calendar.clone(),
                clock: clock.clone(),
            },
        )
        .await
        .unwrap();

        let eq = engine
            .create_equipment("sequencer", hour_unit(), RequirementSet::default())
            .await
            .unwrap();
        let r1 = engine
            .make_reservation(eq.id, "ada@lab.example", monday(10, 0), monday(11, 0))
            .await
            .unwrap();
        engine
            .confirm_reservation("ada@lab.example", r1.id, Some("proj"), &no_answers())
            .await
            .unwrap();
        let r2 = engine
            .make_reservation(eq.id, "bob@lab.example", monday(11, 0), monday(12, 0))
            .await
            .unwrap();
        engine
            .cancel_reservation("bob@lab.example", r2.id)
            .await
            .unwrap();
        (eq.id, r1.id, r2.id)
    };

    let engine = reopen(&path, clock).await;

    let eq = engine.get_equipment(eq_id).expect("equipment restored");
    assert_eq!(eq.name, "sequencer");

    let (_, r1) = engine.get_reservation(confirmed_id).await.unwrap();
    assert_eq!(r1.status, BookingStatus::Confirmed);
    assert_eq!(r1.project.as_deref(), Some("proj"));

    let (_, r2) = engine.get_reservation(cancelled_id).await.unwrap();
    assert_eq!(r2.status, BookingStatus::Cancelled);
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compact_state.wal");
    let clock = Arc::new(ManualClock::new(monday(8, 0)));

    let engine = reopen(&path, clock.clone()).await;
    let eq = engine
        .create_equipment("sequencer", hour_unit(), RequirementSet::default())
        .await
        .unwrap();
    // Churn that compaction folds away
    for i in 0..5 {
        let r = engine
            .make_reservation(eq.id, "ada@lab.example", monday(9 + i, 0), monday(10 + i, 0))
            .await
            .unwrap();
        engine
            .cancel_reservation("ada@lab.example", r.id)
            .await
            .unwrap();
    }
    let keeper = engine
        .make_reservation(eq.id, "ada@lab.example", monday(15, 0), monday(16, 0))
        .await
        .unwrap();

    assert!(engine.wal_appends_since_compact().await > 0);
    engine.compact_wal().await.unwrap();
    assert_eq!(engine.wal_appends_since_compact().await, 0);

    let reopened = reopen(&path, clock).await;
    assert!(reopened.get_equipment(eq.id).is_some());
    let (_, row) = reopened.get_reservation(keeper.id).await.unwrap();
    assert_eq!(row.status, BookingStatus::Reserved);
    assert_eq!(row.span, Span::new(monday(15, 0), monday(16, 0)));
}
