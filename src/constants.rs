pub const DAY_BOUNDARY_HOUR_UTC: u32 = 10;

pub const DEFAULT_DYNAMIC_DAILY_CAP: i64 = 100;
pub const DEFAULT_CONVERSION_DAILY_CAP: i64 = 50;
pub const DEFAULT_POINTS_PER_KEY: i64 = 10;
pub const DEFAULT_TICKET_THRESHOLD: i64 = 20;

pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 2_000;
pub const DEFAULT_OPEN_LEAD_SECS: i64 = 60;
pub const DEFAULT_MAX_CATCHUP_DAYS: i64 = 7;

/// Upper bound on the scheduler's sleep between ticks, so a suspended host still catches up
pub const SCHEDULER_FALLBACK_TICK_SECS: u64 = 300;

/// Optimistic read-modify-write attempts before a ledger update gives up as contended
pub const LEDGER_MAX_ATTEMPTS: usize = 8;

/// Percentage of the base award granted to the nth repeat of the same activity within a day
pub const DIMINISHING_RETURNS_PCT: [i64; 5] = [100, 60, 30, 10, 0];

pub const DEFAULT_HEADLINE_ID: &str = "headline-default";

pub const USER_ID_HEADER: &str = "X-User-Id";
pub const USER_SIGNATURE_HEADER: &str = "X-User-Signature";
pub const RETRY_AFTER_SECS: &str = "2";

pub const SERVER_PORT: u16 = 3000;
pub const SERVICE_NAME: &str = "daily-draw-api";
pub const TRACER_NAME: &str = "daily-draw-tracer";
