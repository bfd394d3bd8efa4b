//! Rest interval resolution between iterations.

use std::time::Duration;

use crate::core::directives::Directives;
use crate::core::types::{PacingDirective, PacingKind};

/// Bounds used to resolve pacing directives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingBounds {
    pub default_secs: u64,
    pub max_secs: u64,
    pub failure_cooldown_secs: u64,
    pub skip_allowed: bool,
}

/// Choose the wait before the next iteration.
///
/// Order: failed iteration cooldown > explicit seconds (clamped to `max_secs`)
/// > `[SKIP_SLEEP]` > default.
pub fn resolve_pacing(directives: &Directives, success: bool, bounds: &PacingBounds) -> PacingDirective {
    if !success {
        return PacingDirective {
            kind: PacingKind::FailureCooldown,
            wait: Duration::from_secs(bounds.failure_cooldown_secs),
        };
    }
    if let Some(requested_secs) = directives.sleep_secs {
        return PacingDirective {
            kind: PacingKind::Explicit { requested_secs },
            wait: Duration::from_secs(requested_secs.min(bounds.max_secs)),
        };
    }
    if directives.skip_sleep && bounds.skip_allowed {
        return PacingDirective {
            kind: PacingKind::Skip,
            wait: Duration::ZERO,
        };
    }
    PacingDirective {
        kind: PacingKind::Default,
        wait: Duration::from_secs(bounds.default_secs),
    }
}
