//! Session-wide prefetch window set by `qos`.
//!
//! The window bounds how many messages (and bytes) the session may hold
//! outstanding across all of its consumers, on top of per-consumer credit.
//! Zero limits mean unlimited.

/// Prefetch limits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrefetchLimits {
    /// Maximum number of outstanding messages (0 = unlimited).
    pub count: u32,
    /// Maximum outstanding bytes (0 = unlimited).
    pub size: u64,
}

impl PrefetchLimits {
    pub fn new(count: u32, size: u64) -> Self {
        Self { count, size }
    }

    pub fn is_unlimited(&self) -> bool {
        self.count == 0 && self.size == 0
    }
}

/// Outstanding deliveries measured against [`PrefetchLimits`].
#[derive(Debug, Clone, Default)]
pub struct PrefetchWindow {
    limits: PrefetchLimits,
    outstanding_count: u32,
    outstanding_size: u64,
}

impl PrefetchWindow {
    pub fn new(limits: PrefetchLimits) -> Self {
        Self {
            limits,
            ..Self::default()
        }
    }

    pub fn limits(&self) -> PrefetchLimits {
        self.limits
    }

    /// Replace the limits; outstanding deliveries are kept.
    pub fn set_limits(&mut self, limits: PrefetchLimits) {
        self.limits = limits;
    }

    /// Whether one more message of `size` bytes fits in the window.
    ///
    /// A single message larger than the byte limit is still admitted into an
    /// empty window so it cannot block the consumer forever.
    pub fn admits(&self, size: u64) -> bool {
        if self.limits.count > 0 && self.outstanding_count >= self.limits.count {
            return false;
        }
        if self.limits.size > 0
            && self.outstanding_count > 0
            && self.outstanding_size.saturating_add(size) > self.limits.size
        {
            return false;
        }
        true
    }

    pub fn record_delivery(&mut self, size: u64) {
        self.outstanding_count = self.outstanding_count.saturating_add(1);
        self.outstanding_size = self.outstanding_size.saturating_add(size);
    }

    /// A delivery left the outstanding set (acknowledged, released or rejected).
    pub fn record_completion(&mut self, size: u64) {
        self.outstanding_count = self.outstanding_count.saturating_sub(1);
        self.outstanding_size = self.outstanding_size.saturating_sub(size);
    }

    pub fn outstanding_count(&self) -> u32 {
        self.outstanding_count
    }

    pub fn outstanding_size(&self) -> u64 {
        self.outstanding_size
    }

    pub fn reset(&mut self) {
        self.outstanding_count = 0;
        self.outstanding_size = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_by_default() {
        let mut window = PrefetchWindow::default();
        assert!(window.limits().is_unlimited());
        for _ in 0..1000 {
            assert!(window.admits(1 << 20));
            window.record_delivery(1 << 20);
        }
    }

    #[test]
    fn test_count_limit() {
        let mut window = PrefetchWindow::new(PrefetchLimits::new(2, 0));
        window.record_delivery(10);
        assert!(window.admits(10));
        window.record_delivery(10);
        assert!(!window.admits(10));

        window.record_completion(10);
        assert!(window.admits(10));
    }

    #[test]
    fn test_size_limit_admits_first_oversized() {
        let mut window = PrefetchWindow::new(PrefetchLimits::new(0, 100));
        assert!(window.admits(500));
        window.record_delivery(500);
        assert!(!window.admits(1));
        window.record_completion(500);
        assert_eq!(window.outstanding_size(), 0);
        assert!(window.admits(60));
        window.record_delivery(60);
        assert!(!window.admits(60));
    }

    #[test]
    fn test_set_limits_keeps_outstanding() {
        let mut window = PrefetchWindow::default();
        window.record_delivery(1);
        window.record_delivery(1);
        window.set_limits(PrefetchLimits::new(1, 0));
        assert_eq!(window.outstanding_count(), 2);
        assert!(!window.admits(1));
        window.reset();
        assert!(window.admits(1));
    }
}
