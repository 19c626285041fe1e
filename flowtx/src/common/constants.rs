/// Event type under which transaction lifecycle notifications are published.
pub const TRANSACTION_EVENT: &str = "TRANSACTION_EVENT";

/// Timeout applied to transactions when neither the runtime nor the
/// transaction config sets one (milliseconds).
pub const DEFAULT_TRANSACTION_TIMEOUT_MS: u64 = 30_000;

/// Application name reported in notifications when none is configured.
pub const DEFAULT_APPLICATION_NAME: &str = "flowtx";
