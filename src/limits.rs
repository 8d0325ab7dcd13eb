// Hard caps on request and state sizes. Every engine write checks the ones
// that apply before touching the WAL.

pub const MAX_NAME_LEN: usize = 256;
/// sport_id / payment_method_id
pub const MAX_REF_LEN: usize = 128;
pub const MAX_BATCH_SIZE: usize = 1000;
pub const MAX_RESERVATIONS_PER_COURT: usize = 100_000;
pub const MAX_COURTS_PER_TENANT: usize = 10_000;
/// Longest recurrence a single preview may enumerate.
pub const MAX_RECURRENCE_DAYS: i64 = 366;
pub const MAX_PEAK_WINDOWS: usize = 24;

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 256;
