//! Load progress reporting
//!
//! A [`ProgressTracker`] wraps the caller's callback and guarantees that the
//! percentages it delivers never decrease within one load call chain, even
//! when the loader falls back and restarts a phase. Phases report into a
//! sub-range of the overall bar through [`ProgressTracker::scaled`].

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Progress callback: `(percent in [0, 100], stage description)`
pub type ProgressCallback = Arc<dyn Fn(f64, &str) + Send + Sync>;

struct Shared {
    callback: Option<ProgressCallback>,
    last: Mutex<f64>,
}

/// Monotonic progress reporter mapped onto a sub-range of the overall bar
#[derive(Clone)]
pub struct ProgressTracker {
    shared: Arc<Shared>,
    start: f64,
    end: f64,
}

impl ProgressTracker {
    pub fn new(callback: Option<ProgressCallback>) -> Self {
        Self {
            shared: Arc::new(Shared {
                callback,
                last: Mutex::new(0.0),
            }),
            start: 0.0,
            end: 100.0,
        }
    }

    /// Tracker that reports nowhere
    pub fn silent() -> Self {
        Self::new(None)
    }

    /// Tracker whose 0..100 maps onto `start..end` of this tracker's range
    pub fn scaled(&self, start: f64, end: f64) -> Self {
        let span = self.end - self.start;
        Self {
            shared: Arc::clone(&self.shared),
            start: self.start + span * start.clamp(0.0, 100.0) / 100.0,
            end: self.start + span * end.clamp(0.0, 100.0) / 100.0,
        }
    }

    /// Report `percent` of this tracker's range
    pub fn report(&self, percent: f64, stage: &str) {
        let percent = if percent.is_finite() {
            percent.clamp(0.0, 100.0)
        } else {
            0.0
        };
        let overall = self.start + (self.end - self.start) * percent / 100.0;

        // Held across the callback so concurrent reporters cannot reorder deliveries.
        let mut last = self.shared.last.lock();
        let value = overall.max(*last);
        *last = value;
        if let Some(callback) = &self.shared.callback {
            callback(value, stage);
        }
    }

    /// Report a stage change without moving the bar
    pub fn stage(&self, stage: &str) {
        let last = self.shared.last.lock();
        if let Some(callback) = &self.shared.callback {
            callback(*last, stage);
        }
    }

    /// Mark this tracker's range as complete
    pub fn complete(&self, stage: &str) {
        self.report(100.0, stage);
    }

    /// Highest overall percentage delivered so far
    pub fn current(&self) -> f64 {
        *self.shared.last.lock()
    }

    pub fn has_callback(&self) -> bool {
        self.shared.callback.is_some()
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::silent()
    }
}

impl fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("start", &self.start)
            .field("end", &self.end)
            .field("current", &self.current())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording() -> (ProgressTracker, Arc<Mutex<Vec<(f64, String)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let tracker = ProgressTracker::new(Some(Arc::new(move |p: f64, s: &str| {
            sink.lock().push((p, s.to_string()));
        })));
        (tracker, seen)
    }

    #[test]
    fn test_never_decreases() {
        let (tracker, seen) = recording();
        tracker.report(40.0, "downloading");
        tracker.report(20.0, "retrying");
        tracker.report(150.0, "done");

        let values: Vec<f64> = seen.lock().iter().map(|(p, _)| *p).collect();
        assert_eq!(values, vec![40.0, 40.0, 100.0]);
    }

    #[test]
    fn test_scaled_range() {
        let (tracker, seen) = recording();
        let download = tracker.scaled(10.0, 70.0);
        download.report(50.0, "downloading");
        assert_eq!(seen.lock().last().unwrap().0, 40.0);

        let nested = download.scaled(50.0, 100.0);
        nested.complete("downloaded");
        assert_eq!(seen.lock().last().unwrap().0, 70.0);
    }

    #[test]
    fn test_restarted_phase_stays_monotonic() {
        let (tracker, seen) = recording();
        tracker.scaled(0.0, 80.0).report(100.0, "isolated attempt");
        // fallback restarts its own sub-range lower down
        tracker.scaled(0.0, 80.0).report(10.0, "inline attempt");
        tracker.stage("waiting");

        let values: Vec<f64> = seen.lock().iter().map(|(p, _)| *p).collect();
        assert!(values.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(seen.lock().last().unwrap().1, "waiting");
    }

    #[test]
    fn test_silent_tracker() {
        let tracker = ProgressTracker::silent();
        tracker.report(30.0, "x");
        assert!(!tracker.has_callback());
        assert_eq!(tracker.current(), 30.0);
    }
}
