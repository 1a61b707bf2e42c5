use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Outcome of a rate-limit check. `reason` is the policy error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitResult {
    pub allowed: bool,
    pub reason: &'static str,
}

impl LimitResult {
    const OK: LimitResult = LimitResult {
        allowed: true,
        reason: "ok",
    };
}

/// Per-key sliding-window limiter with minute and hour windows.
///
/// Keys are sender transport ids on the mesh. Events are recorded only when
/// the check passes, so a throttled sender does not extend their own ban.
pub struct InboundLimiter {
    max_per_hour: usize,
    max_per_minute: usize,
    events: Mutex<HashMap<String, VecDeque<i64>>>,
}

impl InboundLimiter {
    pub fn new(max_per_hour: usize, max_per_minute: usize) -> Self {
        Self {
            max_per_hour,
            max_per_minute,
            events: Mutex::new(HashMap::new()),
        }
    }

    pub fn check_and_add(&self, key: &str, now_ms: i64) -> LimitResult {
        let mut events = self.events.lock().unwrap();
        let queue = events.entry(key.to_string()).or_default();

        let hour_ago = now_ms - 3_600_000;
        while queue.front().is_some_and(|ts| *ts < hour_ago) {
            queue.pop_front();
        }

        if queue.len() >= self.max_per_hour {
            return LimitResult {
                allowed: false,
                reason: "rate_limited_hour",
            };
        }

        let minute_ago = now_ms - 60_000;
        let last_minute = queue.iter().rev().take_while(|ts| **ts >= minute_ago).count();
        if last_minute >= self.max_per_minute {
            return LimitResult {
                allowed: false,
                reason: "rate_limited_minute",
            };
        }

        queue.push_back(now_ms);
        LimitResult::OK
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn under_limit_allows() {
        let limiter = InboundLimiter::new(10, 3);
        let now = 1_000_000;
        for i in 0..3 {
            assert!(limiter.check_and_add("a", now + i).allowed);
        }
    }

    #[test]
    fn minute_window_trips_first() {
        let limiter = InboundLimiter::new(100, 3);
        let now = 1_000_000;
        for i in 0..3 {
            assert!(limiter.check_and_add("a", now + i).allowed);
        }
        let res = limiter.check_and_add("a", now + 10);
        assert!(!res.allowed);
        assert_eq!(res.reason, "rate_limited_minute");
    }

    #[test]
    fn minute_window_slides() {
        let limiter = InboundLimiter::new(100, 2);
        let now = 1_000_000;
        assert!(limiter.check_and_add("a", now).allowed);
        assert!(limiter.check_and_add("a", now + 1).allowed);
        assert!(!limiter.check_and_add("a", now + 2).allowed);
        // A minute later both events have left the minute window.
        assert!(limiter.check_and_add("a", now + 61_000).allowed);
    }

    #[test]
    fn hour_window_trips() {
        let limiter = InboundLimiter::new(5, 100);
        let now = 1_000_000;
        for i in 0..5 {
            // Spread beyond the minute window so only the hour cap applies.
            assert!(limiter.check_and_add("a", now + i * 120_000).allowed);
        }
        let res = limiter.check_and_add("a", now + 5 * 120_000);
        assert!(!res.allowed);
        assert_eq!(res.reason, "rate_limited_hour");
    }

    #[test]
    fn keys_are_independent() {
        let limiter = InboundLimiter::new(100, 1);
        let now = 1_000_000;
        assert!(limiter.check_and_add("a", now).allowed);
        assert!(!limiter.check_and_add("a", now + 1).allowed);
        assert!(limiter.check_and_add("b", now + 2).allowed);
    }
}
