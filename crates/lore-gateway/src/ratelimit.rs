use std::num::NonZeroU32;

use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};

/// Per-user limiter for the retrieval-test endpoints: 30 requests/minute,
/// process-local (multi-replica deployments get the limit per replica).
pub struct RetrievalTestLimiter {
    limiter: RateLimiter<i64, DefaultKeyedStateStore<i64>, DefaultClock>,
}

impl Default for RetrievalTestLimiter {
    fn default() -> Self {
        Self::new(30)
    }
}

impl RetrievalTestLimiter {
    pub fn new(per_minute: u32) -> Self {
        let quota = Quota::per_minute(NonZeroU32::new(per_minute.max(1)).unwrap());
        Self {
            limiter: RateLimiter::keyed(quota),
        }
    }

    pub fn check(&self, user_id: i64) -> bool {
        self.limiter.check_key(&user_id).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_applies_per_user() {
        let limiter = RetrievalTestLimiter::new(2);
        assert!(limiter.check(1));
        assert!(limiter.check(1));
        assert!(!limiter.check(1));
        // another user is unaffected
        assert!(limiter.check(2));
    }
}
