use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use tracing::warn;

/// Hourly sliding-window limiter for outbound sends.
///
/// Critical messages bypass the limit entirely; critical-escalated ones go
/// through a separate, more permissive bucket. Keys are recipients on the
/// mesh and a single global key on the assistant.
pub struct OutboundLimiter {
    max_per_hour: usize,
    escalated_per_hour: usize,
    events: Mutex<HashMap<String, VecDeque<i64>>>,
}

impl OutboundLimiter {
    pub fn new(max_per_hour: usize, escalated_per_hour: usize) -> Self {
        Self {
            max_per_hour,
            escalated_per_hour,
            events: Mutex::new(HashMap::new()),
        }
    }

    /// Returns true when the send may proceed, recording it if so.
    pub fn check_and_add(&self, key: &str, critical: bool, escalated: bool, now_ms: i64) -> bool {
        if critical && !escalated {
            return true;
        }

        let (bucket, cap) = if escalated {
            (format!("escalated:{key}"), self.escalated_per_hour)
        } else {
            (key.to_string(), self.max_per_hour)
        };

        let mut events = self.events.lock().unwrap();
        let queue = events.entry(bucket).or_default();

        let hour_ago = now_ms - 3_600_000;
        while queue.front().is_some_and(|ts| *ts < hour_ago) {
            queue.pop_front();
        }

        if queue.len() >= cap {
            warn!(key, cap, "outbound rate limit hit");
            return false;
        }
        queue.push_back(now_ms);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_sends_are_capped_hourly() {
        let limiter = OutboundLimiter::new(3, 10);
        let now = 1_000_000;
        for i in 0..3 {
            assert!(limiter.check_and_add("+1", false, false, now + i));
        }
        assert!(!limiter.check_and_add("+1", false, false, now + 3));
        // An hour later the window has slid.
        assert!(limiter.check_and_add("+1", false, false, now + 3_600_001));
    }

    #[test]
    fn critical_bypasses_entirely() {
        let limiter = OutboundLimiter::new(1, 10);
        let now = 1_000_000;
        assert!(limiter.check_and_add("+1", false, false, now));
        assert!(!limiter.check_and_add("+1", false, false, now + 1));
        for i in 0..20 {
            assert!(limiter.check_and_add("+1", true, false, now + i));
        }
        // Bypassed sends are not recorded against the normal bucket.
        assert!(!limiter.check_and_add("+1", false, false, now + 30));
    }

    #[test]
    fn escalated_uses_its_own_permissive_bucket() {
        let limiter = OutboundLimiter::new(1, 3);
        let now = 1_000_000;
        assert!(limiter.check_and_add("+1", false, false, now));
        assert!(!limiter.check_and_add("+1", false, false, now + 1));

        for i in 0..3 {
            assert!(limiter.check_and_add("+1", true, true, now + i));
        }
        assert!(!limiter.check_and_add("+1", true, true, now + 4));
    }

    #[test]
    fn recipients_are_independent() {
        let limiter = OutboundLimiter::new(1, 10);
        let now = 1_000_000;
        assert!(limiter.check_and_add("+1", false, false, now));
        assert!(limiter.check_and_add("+2", false, false, now));
    }
}
