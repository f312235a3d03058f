//! Rate-limited diagnostics (SPEC_FULL.md §A.2). Logging formatting itself
//! is an external collaborator (spec.md §1); this wraps the `log` facade
//! the teacher crate already depends on with the "at most once per period"
//! discipline spec.md §7 calls for (protocol version mismatch: "log at
//! most once per 10 s").

use std::collections::HashMap;

use crate::timestamp::{LocalInstant, Seconds};

/// Tracks, per diagnostic category, the last instant it was emitted, and
/// suppresses repeats inside `period`.
#[derive(Debug, Default)]
pub struct RateLimitedLog {
    last_emitted: HashMap<&'static str, LocalInstant>,
}

impl RateLimitedLog {
    #[must_use]
    pub fn new() -> Self {
        RateLimitedLog::default()
    }

    /// True if `category` is due to fire again at `now` given `period`;
    /// records the emission if so.
    pub fn should_emit(&mut self, category: &'static str, now: LocalInstant, period: Seconds) -> bool {
        match self.last_emitted.get(category) {
            Some(last) if now.duration_since(*last).0 < period.0 => false,
            _ => {
                self.last_emitted.insert(category, now);
                true
            }
        }
    }
}

/// Emit a `log::warn!` at most once per `period` seconds for `category`.
#[cfg(feature = "log")]
#[macro_export]
macro_rules! rate_limited_warn {
    ($limiter:expr, $category:expr, $now:expr, $period:expr, $($arg:tt)+) => {
        if $limiter.should_emit($category, $now, $period) {
            log::warn!($($arg)+);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suppresses_within_period_then_allows_after() {
        let mut log = RateLimitedLog::new();
        let t0 = LocalInstant::new(1000, 0);
        assert!(log.should_emit("version_mismatch", t0, Seconds(10.0)));
        assert!(!log.should_emit("version_mismatch", t0.add_seconds(Seconds(5.0)), Seconds(10.0)));
        assert!(log.should_emit("version_mismatch", t0.add_seconds(Seconds(11.0)), Seconds(10.0)));
    }

    #[test]
    fn categories_are_independent() {
        let mut log = RateLimitedLog::new();
        let t0 = LocalInstant::new(1000, 0);
        assert!(log.should_emit("a", t0, Seconds(10.0)));
        assert!(log.should_emit("b", t0, Seconds(10.0)));
    }
}
