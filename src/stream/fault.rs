//! Classification of transport signals into healthy and unhealthy.

use std::time::Duration;

use tokio::time::Instant;

/// Counts consecutive transport faults since the last successful open.
#[derive(Clone, Debug)]
pub struct FaultDetector {
    faults: u32,
    threshold: u32,
}

impl FaultDetector {
    pub fn new(threshold: u32) -> Self {
        Self {
            faults: 0,
            threshold,
        }
    }

    /// Records one error signal and returns the updated count.
    pub fn record_fault(&mut self) -> u32 {
        self.faults = self.faults.saturating_add(1);
        self.faults
    }

    pub fn reset(&mut self) {
        self.faults = 0;
    }

    pub fn faults(&self) -> u32 {
        self.faults
    }

    /// True once the fault count is strictly above the threshold.
    pub fn is_breached(&self) -> bool {
        self.faults > self.threshold
    }
}

/// Tracks the optional window in which some event must be received.
#[derive(Clone, Debug)]
pub struct InactivityWatch {
    window: Option<Duration>,
    deadline: Option<Instant>,
}

impl InactivityWatch {
    pub fn new(window: Option<Duration>) -> Self {
        Self {
            window: window.filter(|window| !window.is_zero()),
            deadline: None,
        }
    }

    /// Re-arms the window from `now`. No-op when inactivity checks are off.
    pub fn touch(&mut self, now: Instant) {
        self.deadline = self.window.map(|window| now + window);
    }

    pub fn clear(&mut self) {
        self.deadline = None;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breach_requires_count_above_threshold() {
        let mut detector = FaultDetector::new(3);
        for expected in 1..=3 {
            assert_eq!(detector.record_fault(), expected);
            assert!(!detector.is_breached());
        }
        detector.record_fault();
        assert!(detector.is_breached());

        detector.reset();
        assert_eq!(detector.faults(), 0);
        assert!(!detector.is_breached());
    }

    #[test]
    fn zero_threshold_breaches_on_first_fault() {
        let mut detector = FaultDetector::new(0);
        detector.record_fault();
        assert!(detector.is_breached());
    }

    #[test]
    fn inactivity_watch_rearms_from_last_touch() {
        let start = Instant::now();
        let mut watch = InactivityWatch::new(Some(Duration::from_secs(30)));
        assert_eq!(watch.deadline(), None);

        watch.touch(start);
        assert_eq!(watch.deadline(), Some(start + Duration::from_secs(30)));

        let later = start + Duration::from_secs(10);
        watch.touch(later);
        assert_eq!(watch.deadline(), Some(later + Duration::from_secs(30)));

        watch.clear();
        assert_eq!(watch.deadline(), None);
    }

    #[test]
    fn zero_window_disables_inactivity_checks() {
        let mut watch = InactivityWatch::new(Some(Duration::ZERO));
        watch.touch(Instant::now());
        assert_eq!(watch.deadline(), None);
    }
}
