//! Fixed-window counter record used by the local stores.

/// Outcome of applying one increase to a [`Counter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The counter was absent or expired and started a new window.
    Created,
    /// The counter was live and its expiry moved later.
    Extended,
    /// The counter was live and kept its previous expiry.
    Kept,
}

/// A counter value together with its absolute expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Counter {
    /// Hits recorded in the current window
    pub count: u64,
    /// Expiry in milliseconds since the Unix epoch
    pub expire_at_ms: u64,
}

impl Counter {
    /// Whether the counter has expired at `now_ms`.
    ///
    /// A default (never written) counter is always expired.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expire_at_ms
    }

    /// Count as observed at `now_ms`; an expired counter reads as zero.
    pub fn live_count(&self, now_ms: u64) -> u64 {
        if self.is_expired(now_ms) {
            0
        } else {
            self.count
        }
    }

    /// Apply an increase of `step` with a window of `ttl_ms` at time `now_ms`.
    pub fn hit(&mut self, now_ms: u64, ttl_ms: u64, step: u64) -> Transition {
        let desired = now_ms.saturating_add(ttl_ms);

        if self.is_expired(now_ms) {
            self.count = step;
            self.expire_at_ms = desired;
            return Transition::Created;
        }

        self.count = self.count.saturating_add(step);
        if desired > self.expire_at_ms {
            self.expire_at_ms = desired;
            Transition::Extended
        } else {
            Transition::Kept
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_counter_starts_window() {
        let mut counter = Counter::default();
        assert_eq!(counter.live_count(1_000), 0);

        assert_eq!(counter.hit(1_000, 60_000, 1), Transition::Created);
        assert_eq!(counter.count, 1);
        assert_eq!(counter.expire_at_ms, 61_000);
    }

    #[test]
    fn test_live_counter_accumulates() {
        let mut counter = Counter::default();
        counter.hit(0, 10_000, 1);
        counter.hit(1_000, 10_000, 5);

        assert_eq!(counter.count, 6);
        assert_eq!(counter.live_count(5_000), 6);
    }

    #[test]
    fn test_shorter_window_never_shortens_expiry() {
        let mut counter = Counter::default();
        counter.hit(0, 3_600_000, 1);

        assert_eq!(counter.hit(1_000, 60_000, 1), Transition::Kept);
        assert_eq!(counter.expire_at_ms, 3_600_000);
    }

    #[test]
    fn test_longer_window_extends_expiry() {
        let mut counter = Counter::default();
        counter.hit(0, 60_000, 1);

        assert_eq!(counter.hit(30_000, 60_000, 1), Transition::Extended);
        assert_eq!(counter.expire_at_ms, 90_000);
        assert_eq!(counter.count, 2);
    }

    #[test]
    fn test_expired_counter_resets_to_step() {
        let mut counter = Counter::default();
        counter.hit(0, 60_000, 1);
        counter.hit(1_000, 60_000, 1);

        assert_eq!(counter.live_count(61_000), 0);
        assert_eq!(counter.hit(61_000, 60_000, 3), Transition::Created);
        assert_eq!(counter.count, 3);
        assert_eq!(counter.expire_at_ms, 121_000);
    }
}
