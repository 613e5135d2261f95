//! Hard caps protecting the engine from unbounded input.

/// Earliest accepted booking instant (2000-01-01T00:00:00Z).
pub const MIN_VALID_TIMESTAMP_MS: i64 = 946_684_800_000;

/// Latest accepted booking instant (2200-01-01T00:00:00Z).
pub const MAX_VALID_TIMESTAMP_MS: i64 = 7_258_118_400_000;

/// Widest single reservation: 8 weeks, in minutes.
pub const MAX_SPAN_MINUTES: i64 = 8 * 7 * 24 * 60;

/// Widest listing query window, in minutes (2 years).
pub const MAX_QUERY_WINDOW_MINUTES: i64 = 2 * 366 * 24 * 60;

pub const MAX_EQUIPMENT_PER_REGISTRY: usize = 10_000;
pub const MAX_RESERVATIONS_PER_EQUIPMENT: usize = 100_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_USER_LEN: usize = 320;
pub const MAX_PROJECT_LEN: usize = 256;
pub const MAX_REASON_LEN: usize = 1024;

pub const MAX_REQUIREMENTS_PER_SET: usize = 64;
pub const MAX_REQUIREMENT_VALUE_LEN: usize = 1024;

pub const MAX_REGISTRIES: usize = 256;
pub const MAX_REGISTRY_NAME_LEN: usize = 128;
