// src/progress.rs
//
// Counters and the progress publication channel. The worker publishes a
// CountersSnapshot after every count-affecting event and periodically by
// frame position; pollers read the latest value from the watch receiver
// instead of being called back from the worker.

use crate::types::VehicleClass;
use serde::Serialize;
use tokio::sync::watch;

/// Per-job vehicle counts. Monotonically non-decreasing for the job's
/// duration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub total: u32,
    pub cars: u32,
    pub bikes: u32,
    pub trucks: u32,
}

impl Counters {
    pub fn count(&mut self, class: VehicleClass) {
        self.total += 1;
        match class {
            VehicleClass::Car => self.cars += 1,
            VehicleClass::Bike => self.bikes += 1,
            VehicleClass::Truck => self.trucks += 1,
        }
    }
}

/// The externally-published aggregate for a job. `progress_percent` never
/// reaches 100 here; completion is signaled by the job status, not by the
/// snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CountersSnapshot {
    pub total: u32,
    pub cars: u32,
    pub bikes: u32,
    pub trucks: u32,
    pub progress_percent: u32,
}

impl CountersSnapshot {
    pub fn new(counters: Counters, progress_percent: u32) -> Self {
        Self {
            total: counters.total,
            cars: counters.cars,
            bikes: counters.bikes,
            trucks: counters.trucks,
            progress_percent,
        }
    }
}

/// Raw-frame position over total frame count, capped at 99. Unknown totals
/// report a constant 50.
pub fn progress_percent(frame_idx: u64, total_frames: u64) -> u32 {
    if total_frames == 0 {
        return 50;
    }
    (((frame_idx * 100) / total_frames) as u32).min(99)
}

/// One-way push side of the progress channel. The worker holds the sender;
/// snapshots are cheap copies and the channel keeps only the latest.
pub struct ProgressPublisher {
    tx: watch::Sender<CountersSnapshot>,
    last_progress: u32,
}

impl ProgressPublisher {
    pub fn channel() -> (Self, watch::Receiver<CountersSnapshot>) {
        let (tx, rx) = watch::channel(CountersSnapshot::default());
        (
            Self {
                tx,
                last_progress: 0,
            },
            rx,
        )
    }

    /// Publish the latest counters at the given raw-frame position. The
    /// reported percentage never moves backwards even if the position
    /// estimate does.
    pub fn publish(&mut self, counters: Counters, frame_idx: u64, total_frames: u64) {
        self.last_progress = self
            .last_progress
            .max(progress_percent(frame_idx, total_frames));
        // Receiver may be gone when nobody polls; publishing stays one-way.
        let _ = self
            .tx
            .send(CountersSnapshot::new(counters, self.last_progress));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_capped_at_99() {
        assert_eq!(progress_percent(0, 100), 0);
        assert_eq!(progress_percent(50, 100), 50);
        assert_eq!(progress_percent(100, 100), 99);
        assert_eq!(progress_percent(250, 100), 99);
    }

    #[test]
    fn test_unknown_total_reports_midpoint() {
        assert_eq!(progress_percent(42, 0), 50);
    }

    #[test]
    fn test_counters_count_by_class() {
        let mut counters = Counters::default();
        counters.count(VehicleClass::Car);
        counters.count(VehicleClass::Car);
        counters.count(VehicleClass::Truck);
        assert_eq!(counters.total, 3);
        assert_eq!(counters.cars, 2);
        assert_eq!(counters.trucks, 1);
        assert_eq!(counters.bikes, 0);
    }

    #[test]
    fn test_publisher_monotonic_progress() {
        let (mut publisher, rx) = ProgressPublisher::channel();
        let counters = Counters::default();

        publisher.publish(counters, 30, 100);
        assert_eq!(rx.borrow().progress_percent, 30);

        // A smaller position must not move the published percentage back
        publisher.publish(counters, 10, 100);
        assert_eq!(rx.borrow().progress_percent, 30);

        publisher.publish(counters, 99, 100);
        assert_eq!(rx.borrow().progress_percent, 99);
        publisher.publish(counters, 100, 100);
        assert_eq!(rx.borrow().progress_percent, 99);
    }

    #[test]
    fn test_publisher_survives_dropped_receiver() {
        let (mut publisher, rx) = ProgressPublisher::channel();
        drop(rx);
        publisher.publish(Counters::default(), 5, 10);
    }
}
