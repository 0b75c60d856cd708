//! Throttling of connection attempts against an unavailable host.

use std::time::{Duration, Instant};

/// Recent-failure window gating new connection attempts. An attempt is
/// denied only while the previous attempt is younger than the cooldown AND
/// the failure count has passed the bound; any successful inbound message
/// resets the window. Already-open connections are never affected.
#[derive(Debug)]
pub struct ReconnectPolicy {
    cooldown: Duration,
    max_failures: u32,
    last_attempt: Option<Instant>,
    failures: u32,
}

impl ReconnectPolicy {
    pub fn new(cooldown: Duration, max_failures: u32) -> Self {
        Self {
            cooldown,
            max_failures,
            last_attempt: None,
            failures: 0,
        }
    }

    pub fn attempt_allowed(&self, now: Instant) -> bool {
        match self.last_attempt {
            Some(last)
                if now.duration_since(last) < self.cooldown
                    && self.failures > self.max_failures =>
            {
                false
            }
            _ => true,
        }
    }

    pub fn record_attempt(&mut self, now: Instant) {
        self.last_attempt = Some(now);
    }

    pub fn record_failure(&mut self) {
        self.failures += 1;
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}
