//! Stable exit codes for warden CLI commands.

/// Command succeeded, or `run` stopped on operator interrupt or `--max-iterations`.
pub const OK: i32 = 0;
/// Invalid configuration, failed initialization, or any other error.
pub const INVALID: i32 = 1;
/// `warden run` stopped because workspace disk usage exceeded the quota.
pub const QUOTA_EXCEEDED: i32 = 2;
/// `warden run` stopped after too many consecutive failed iterations.
pub const ERROR_BUDGET_EXHAUSTED: i32 = 3;
/// `warden scan` found at least one violation pattern.
pub const VIOLATIONS_FOUND: i32 = 4;
