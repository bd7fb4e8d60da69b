use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use tokio::sync::watch;

use crate::types::{BloodPressure, Reading, SleepSummary};

/// Last-known-good values for one ring.
///
/// Every field is optional: `None` means nothing valid has been seen since the
/// link came up.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RingSnapshot {
    /// Battery percentage
    pub battery_percent: Option<u8>,
    /// Step count
    pub steps: Option<u32>,
    /// Distance in meters
    pub distance_m: Option<u32>,
    /// Calories in kcal
    pub calories_kcal: Option<u32>,
    /// Heart rate in bpm
    pub heart_rate_bpm: Option<u8>,
    /// Latest blood pressure result
    pub blood_pressure: Option<BloodPressure>,
    /// Latest SpO2 result in percent
    pub spo2_percent: Option<f32>,
    /// Stress score
    pub stress: Option<u8>,
    /// Sleep totals
    pub sleep: Option<SleepSummary>,
    /// When any field last changed
    pub last_updated: Option<SystemTime>,
}

impl RingSnapshot {
    /// Fold one reading into the snapshot
    pub fn apply(&mut self, reading: &Reading) {
        match *reading {
            Reading::Battery(level) => self.battery_percent = Some(level),
            Reading::Steps(steps) => self.steps = Some(steps),
            Reading::Distance(meters) => self.distance_m = Some(meters),
            Reading::Calories(kcal) => self.calories_kcal = Some(kcal),
            Reading::HeartRate(bpm) => self.heart_rate_bpm = Some(bpm),
            Reading::BloodPressure(bp) => self.blood_pressure = Some(bp),
            Reading::SpO2(percent) => self.spo2_percent = Some(percent),
            Reading::Stress(score) => self.stress = Some(score),
            Reading::Sleep(summary) => self.sleep = Some(summary),
        }
    }

    /// Whether nothing has been recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Holder of the current [`RingSnapshot`].
///
/// Writes come only from the session's notification loop, in packet order;
/// readers get copies or a change stream.
#[derive(Debug)]
pub struct RingStateStore {
    tx: watch::Sender<RingSnapshot>,
}

impl RingStateStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(RingSnapshot::default());
        Self { tx }
    }

    /// Apply readings in order. Subscribers are notified once per call.
    pub fn apply(&self, readings: &[Reading]) {
        if readings.is_empty() {
            return;
        }
        self.tx.send_modify(|snapshot| {
            for reading in readings {
                snapshot.apply(reading);
            }
            snapshot.last_updated = Some(SystemTime::now());
        });
    }

    /// Clear every field
    pub fn reset(&self) {
        self.tx.send_if_modified(|snapshot| {
            if snapshot.is_empty() {
                return false;
            }
            *snapshot = RingSnapshot::default();
            true
        });
    }

    /// Copy of the current snapshot
    #[must_use]
    pub fn snapshot(&self) -> RingSnapshot {
        self.tx.borrow().clone()
    }

    /// Change stream of snapshots
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<RingSnapshot> {
        self.tx.subscribe()
    }
}

impl Default for RingStateStore {
    fn default() -> Self {
        Self::new()
    }
}
