//! benchbook — the booking core of a shared-lab-equipment scheduler.
//!
//! Raw `(equipment, user, start, end)` requests are normalized against the
//! equipment's booking unit and constraints, then resolved against every
//! competing reservation with a deterministic `(created_at, user)` tie-break
//! so at most one claimant wins any overlapping window. Reservations move
//! through reserved → confirmed / pending-authorization → confirmed or
//! denied, with temporal guards on cancellation. State is durable through a
//! per-registry write-ahead log.

pub mod access;
pub mod cache;
pub mod calendar;
pub mod clock;
pub mod engine;
pub mod ledger;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod registry;
pub mod requirements;
pub mod sync;
pub mod wal;
