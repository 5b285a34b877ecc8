//! Hard caps on caller-supplied input and store size.

use crate::model::Ms;

pub const MAX_CUSTOMER_NAME_LEN: usize = 120;
pub const MAX_PHONE_LEN: usize = 32;
pub const MAX_DESCRIPTION_LEN: usize = 256;
pub const MAX_COMPLEX_ID_LEN: usize = 64;
pub const MAX_FIELD_NAME_LEN: usize = 64;

/// Longest hold a configuration may ask for.
pub const MAX_HOLD_TTL_MINUTES: u32 = 24 * 60;

/// Upper bound on live rows the store keeps in memory.
pub const MAX_LIVE_RESERVATIONS: usize = 1_000_000;

/// Largest payment id / intent id accepted from a notification or processor.
pub const MAX_EXTERNAL_ID_LEN: usize = 128;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;
